//! Client side of the message relay.
//!
//! Bindings and the outbound queue belong to one connection. [`Relay::close`]
//! drops both, so anything bound before a reconnect must bind again.

use crate::error::RelayError;
use callbridge::{Envelope, EnvelopeType, MAX_FRAME_BYTES};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};

pub type BindingId = u64;

type Callback = Arc<dyn Fn(&Envelope) + Send + Sync>;

struct Binding {
    id: BindingId,
    kind: EnvelopeType,
    callback: Callback,
}

struct Inner {
    bindings: Mutex<Vec<Binding>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    connected: watch::Sender<bool>,
    next_id: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to the relay connection. Clones share bindings and the connection.
#[derive(Clone)]
pub struct Relay {
    inner: Arc<Inner>,
}

impl Relay {
    pub fn new() -> Self {
        let (connected, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                bindings: Mutex::new(Vec::new()),
                outbound: Mutex::new(None),
                connected,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Open a connection scope. The returned receiver yields the serialized
    /// frames to write to the transport.
    pub fn connect(&self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.inner.outbound) = Some(tx);
        self.inner.connected.send_replace(true);
        debug!("relay connected");
        rx
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    /// Observe connect/close transitions. Code waiting on relay-delivered
    /// envelopes should select on this to notice a closed connection.
    pub fn watch_connection(&self) -> watch::Receiver<bool> {
        self.inner.connected.subscribe()
    }

    pub fn bind(
        &self,
        kind: EnvelopeType,
        callback: impl Fn(&Envelope) + Send + Sync + 'static,
    ) -> BindingId {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.bindings).push(Binding {
            id,
            kind,
            callback: Arc::new(callback),
        });
        id
    }

    /// Remove one binding. Returns false if it was already gone.
    pub fn unbind(&self, id: BindingId) -> bool {
        let mut bindings = lock(&self.inner.bindings);
        let before = bindings.len();
        bindings.retain(|b| b.id != id);
        bindings.len() != before
    }

    pub fn binding_count(&self) -> usize {
        lock(&self.inner.bindings).len()
    }

    pub fn send(&self, envelope: &Envelope) -> Result<(), RelayError> {
        let outbound = lock(&self.inner.outbound);
        let Some(tx) = outbound.as_ref() else {
            return Err(RelayError::NotConnected);
        };
        let frame = match envelope.to_json() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(kind = %envelope.kind(), error = %e, "failed to serialize envelope");
                return Ok(());
            }
        };
        trace!(kind = %envelope.kind(), "relay send");
        tx.send(frame).map_err(|_| RelayError::Closed)
    }

    /// Deliver one inbound frame to every binding for its type, in bind order.
    /// Malformed frames are logged and dropped.
    pub fn dispatch(&self, frame: &str) {
        if frame.len() > MAX_FRAME_BYTES {
            warn!(bytes = frame.len(), "dropping oversized relay frame");
            return;
        }
        let envelope = match Envelope::parse(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "dropping malformed relay frame");
                return;
            }
        };

        let kind = envelope.kind();
        let callbacks: Vec<Callback> = lock(&self.inner.bindings)
            .iter()
            .filter(|b| b.kind == kind)
            .map(|b| b.callback.clone())
            .collect();
        if callbacks.is_empty() {
            debug!(kind = %kind, "no binding for relay envelope");
        }
        for callback in callbacks {
            callback(&envelope);
        }
    }

    /// End the connection scope: clears every binding and the outbound queue.
    pub fn close(&self) {
        let had_connection = lock(&self.inner.outbound).take().is_some();
        lock(&self.inner.bindings).clear();
        self.inner.connected.send_replace(false);
        if had_connection {
            debug!("relay closed");
        }
    }
}

impl Default for Relay {
    fn default() -> Self {
        Self::new()
    }
}

/// Pump a WebSocket for `relay`: inbound text frames are dispatched, queued
/// outbound frames are written. Returns once either side closes; the relay is
/// closed on the way out.
pub async fn drive_websocket<S>(
    relay: &Relay,
    mut ws: WebSocketStream<S>,
    mut outbound: mpsc::UnboundedReceiver<String>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            incoming = ws.next() => match incoming {
                Some(Ok(Message::Text(text))) => relay.dispatch(text.as_str()),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "relay websocket read failed");
                    break;
                }
            },
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = ws.send(Message::text(frame)).await {
                        debug!(error = %e, "relay websocket write failed");
                        break;
                    }
                }
                None => {
                    let _ = ws.close(None).await;
                    break;
                }
            },
        }
    }
    relay.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use callbridge::protocol::{CallControl, ConversationView};

    fn accept(conversation_id: &str) -> Envelope {
        Envelope::CallAccept(CallControl {
            conversation_id: conversation_id.to_string(),
            contact_id: "bob".to_string(),
        })
    }

    #[test]
    fn send_requires_connection() {
        let relay = Relay::new();
        assert_eq!(relay.send(&accept("c1")), Err(RelayError::NotConnected));

        let mut rx = relay.connect();
        relay.send(&accept("c1")).unwrap();
        let frame = rx.try_recv().unwrap();
        assert_eq!(Envelope::parse(&frame).unwrap(), accept("c1"));
    }

    #[test]
    fn dispatch_reaches_bindings_in_order() {
        let relay = Relay::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let seen = seen.clone();
            relay.bind(EnvelopeType::CallAccept, move |e| {
                seen.lock()
                    .unwrap()
                    .push(format!("{tag}:{}", e.conversation_id()))
            });
        }
        let other = seen.clone();
        relay.bind(EnvelopeType::ConversationView, move |_| {
            other.lock().unwrap().push("view".to_string())
        });

        relay.dispatch(&accept("c1").to_json().unwrap());
        relay.dispatch(&accept("c2").to_json().unwrap());

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["first:c1", "second:c1", "first:c2", "second:c2"]
        );
    }

    #[test]
    fn malformed_frames_are_dropped() {
        let relay = Relay::new();
        let hits = Arc::new(Mutex::new(0));
        let h = hits.clone();
        relay.bind(EnvelopeType::CallAccept, move |_| *h.lock().unwrap() += 1);

        relay.dispatch("not json");
        relay.dispatch(r#"{"type":"CallAccept"}"#);
        relay.dispatch(r#"{"type":"Teleport","data":{}}"#);
        relay.dispatch(r#"{"type":"CallAccept","data":{"conversationId":"c1"}}"#);
        relay.dispatch(&"x".repeat(MAX_FRAME_BYTES + 1));

        assert_eq!(*hits.lock().unwrap(), 0);
    }

    #[test]
    fn unbind_removes_only_that_binding() {
        let relay = Relay::new();
        let a = relay.bind(EnvelopeType::CallAccept, |_| {});
        let _b = relay.bind(EnvelopeType::CallAccept, |_| {});
        assert!(relay.unbind(a));
        assert!(!relay.unbind(a));
        assert_eq!(relay.binding_count(), 1);
    }

    #[test]
    fn close_clears_bindings_and_disconnects() {
        let relay = Relay::new();
        let _rx = relay.connect();
        let mut watch = relay.watch_connection();
        relay.bind(EnvelopeType::ConversationView, |_| {});

        relay.close();

        assert_eq!(relay.binding_count(), 0);
        assert!(!relay.is_connected());
        assert!(watch.has_changed().unwrap());
        assert!(!*watch.borrow_and_update());
        let view = Envelope::ConversationView(ConversationView {
            conversation_id: "c1".to_string(),
        });
        assert_eq!(relay.send(&view), Err(RelayError::NotConnected));
    }
}
