//! Event demultiplexer.
//!
//! The daemon takes a single handler table, installed once. [`SignalHub`]
//! builds that table with one publishing hook per [`SignalKind`] and fans
//! every decoded signal out to any number of in-process subscribers.

use crate::daemon::{HandlerTable, NativeDaemon, RawArgs};
use crate::error::DaemonError;
use callbridge::{Signal, SignalKind};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;

type Callback = Arc<dyn Fn(&Signal) + Send + Sync>;
type Topic = Mutex<Vec<(u64, Callback)>>;

struct HubInner {
    topics: HashMap<SignalKind, Topic>,
    next_id: AtomicU64,
}

fn lock(topic: &Topic) -> MutexGuard<'_, Vec<(u64, Callback)>> {
    topic.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fan-out registry for daemon signals. Cheap to clone; clones share
/// subscribers.
#[derive(Clone)]
pub struct SignalHub {
    inner: Arc<HubInner>,
}

impl SignalHub {
    pub fn new() -> Self {
        let topics = SignalKind::ALL
            .into_iter()
            .map(|kind| (kind, Mutex::new(Vec::new())))
            .collect();
        Self {
            inner: Arc::new(HubInner {
                topics,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register this hub's handler table with the daemon. The daemon accepts
    /// this exactly once per process.
    pub fn attach<D: NativeDaemon + ?Sized>(&self, daemon: &D) -> Result<(), DaemonError> {
        daemon.register(self.handler_table())?;
        tracing::debug!(signals = SignalKind::ALL.len(), "signal hub attached to daemon");
        Ok(())
    }

    /// Build the native handler table: every known signal name decodes and
    /// publishes; anything else is logged and dropped.
    pub fn handler_table(&self) -> HandlerTable {
        let mut table = HandlerTable::new(|name, args| {
            tracing::warn!(signal = %name, args = args.len(), "no handler bound for daemon signal");
        });
        for kind in SignalKind::ALL {
            let hub = self.clone();
            table.on(kind.as_str(), move |args| hub.publish_raw(kind, args));
        }
        table
    }

    fn publish_raw(&self, kind: SignalKind, args: RawArgs) {
        match Signal::decode(kind, &args) {
            Ok(signal) => self.publish(&signal),
            Err(e) => {
                tracing::warn!(signal = %kind, error = %e, "dropping undecodable daemon signal");
            }
        }
    }

    /// Deliver a signal to every subscriber of its kind, in subscription order.
    pub fn publish(&self, signal: &Signal) {
        let Some(topic) = self.inner.topics.get(&signal.kind()) else {
            return;
        };
        // Snapshot so callbacks may subscribe or unsubscribe while running.
        let subscribers: Vec<Callback> = lock(topic).iter().map(|(_, cb)| cb.clone()).collect();
        tracing::trace!(signal = %signal.kind(), subscribers = subscribers.len(), "publish");
        for callback in subscribers {
            callback(signal);
        }
    }

    /// Call `callback` for every future signal of `kind` until the returned
    /// guard is dropped.
    pub fn subscribe(
        &self,
        kind: SignalKind,
        callback: impl Fn(&Signal) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        if let Some(topic) = self.inner.topics.get(&kind) {
            lock(topic).push((id, Arc::new(callback)));
        }
        Subscription {
            hub: Arc::downgrade(&self.inner),
            kind,
            id,
        }
    }

    /// Buffer every future signal of `kind` into an ordered stream.
    pub fn stream(&self, kind: SignalKind) -> SignalStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(kind, move |signal| {
            let _ = tx.send(signal.clone());
        });
        SignalStream {
            rx,
            _subscription: subscription,
        }
    }

    pub fn subscriber_count(&self, kind: SignalKind) -> usize {
        self.inner
            .topics
            .get(&kind)
            .map(|topic| lock(topic).len())
            .unwrap_or(0)
    }
}

impl Default for SignalHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Subscription guard. Dropping it removes the callback.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    hub: Weak<HubInner>,
    kind: SignalKind,
    id: u64,
}

impl Subscription {
    pub fn kind(&self) -> SignalKind {
        self.kind
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.hub.upgrade()
            && let Some(topic) = inner.topics.get(&self.kind)
        {
            lock(topic).retain(|(id, _)| *id != self.id);
        }
    }
}

/// Signals of one kind in emission order, buffered from the moment the
/// stream was created.
pub struct SignalStream {
    rx: mpsc::UnboundedReceiver<Signal>,
    _subscription: Subscription,
}

impl SignalStream {
    pub fn kind(&self) -> SignalKind {
        self._subscription.kind()
    }

    pub async fn recv(&mut self) -> Option<Signal> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Signal> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callbridge::signal::{
        ConversationMessage, NameLookupState, NameRegistrationState, RegistrationState, StringMap,
    };
    use serde_json::json;

    fn sample(kind: SignalKind) -> Signal {
        let a = "acc1".to_string();
        let c = "c1".to_string();
        match kind {
            SignalKind::AccountsChanged => Signal::AccountsChanged,
            SignalKind::AccountDetailsChanged => Signal::AccountDetailsChanged {
                account_id: a,
                details: StringMap::new(),
            },
            SignalKind::RegistrationStateChanged => Signal::RegistrationStateChanged {
                account_id: a,
                state: RegistrationState::Registered,
                code: 0,
                detail: String::new(),
            },
            SignalKind::NameRegistrationEnded => Signal::NameRegistrationEnded {
                account_id: a,
                state: NameRegistrationState::Success,
                username: "alice".to_string(),
            },
            SignalKind::RegisteredNameFound => Signal::RegisteredNameFound {
                account_id: a,
                query: "alice".to_string(),
                state: NameLookupState::Found,
                address: "addr".to_string(),
                username: "alice".to_string(),
            },
            SignalKind::KnownDevicesChanged => Signal::KnownDevicesChanged {
                account_id: a,
                devices: StringMap::new(),
            },
            SignalKind::IncomingAccountMessage => Signal::IncomingAccountMessage {
                account_id: a,
                message_id: "1".to_string(),
                from: "bob".to_string(),
                payloads: StringMap::new(),
            },
            SignalKind::AccountMessageStatusChanged => Signal::AccountMessageStatusChanged {
                account_id: a,
                conversation_id: c,
                peer: "bob".to_string(),
                message_id: "m1".to_string(),
                status: 3,
            },
            SignalKind::ContactAdded => Signal::ContactAdded {
                account_id: a,
                contact_id: "bob".to_string(),
                confirmed: true,
            },
            SignalKind::ContactRemoved => Signal::ContactRemoved {
                account_id: a,
                contact_id: "bob".to_string(),
                banned: false,
            },
            SignalKind::ConversationReady => Signal::ConversationReady {
                account_id: a,
                conversation_id: c,
            },
            SignalKind::ConversationRemoved => Signal::ConversationRemoved {
                account_id: a,
                conversation_id: c,
            },
            SignalKind::ConversationRequestReceived => Signal::ConversationRequestReceived {
                account_id: a,
                conversation_id: c,
                metadata: StringMap::new(),
            },
            SignalKind::ConversationLoaded => Signal::ConversationLoaded {
                request_id: 1,
                account_id: a,
                conversation_id: c,
                messages: vec![],
            },
            SignalKind::ConversationMemberEvent => Signal::ConversationMemberEvent {
                account_id: a,
                conversation_id: c,
                member_uri: "bob".to_string(),
                event: 0,
            },
            SignalKind::MessageReceived => Signal::MessageReceived {
                account_id: a,
                conversation_id: c,
                message: ConversationMessage::text("bob", "hi"),
            },
            SignalKind::ComposingStatusChanged => Signal::ComposingStatusChanged {
                account_id: a,
                conversation_id: c,
                from: "bob".to_string(),
                status: 1,
            },
        }
    }

    #[test]
    fn every_kind_reaches_every_subscriber_once_in_order() {
        for kind in SignalKind::ALL {
            let hub = SignalHub::new();
            let table = hub.handler_table();
            let log = Arc::new(Mutex::new(Vec::new()));

            let _subs: Vec<Subscription> = (0..3)
                .map(|i| {
                    let log = log.clone();
                    hub.subscribe(kind, move |_| log.lock().unwrap().push(i))
                })
                .collect();

            let signal = sample(kind);
            table.dispatch(kind.as_str(), signal.encode());

            assert_eq!(*log.lock().unwrap(), vec![0, 1, 2], "kind {kind}");
        }
    }

    #[test]
    fn other_kinds_are_not_delivered() {
        let hub = SignalHub::new();
        let hits = Arc::new(Mutex::new(0));
        let h = hits.clone();
        let _sub = hub.subscribe(SignalKind::ContactAdded, move |_| *h.lock().unwrap() += 1);

        hub.publish(&sample(SignalKind::ContactRemoved));
        assert_eq!(*hits.lock().unwrap(), 0);

        hub.publish(&sample(SignalKind::ContactAdded));
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[test]
    fn unknown_and_undecodable_signals_are_dropped() {
        let hub = SignalHub::new();
        let table = hub.handler_table();
        let hits = Arc::new(Mutex::new(0));
        let h = hits.clone();
        let _sub = hub.subscribe(SignalKind::NameRegistrationEnded, move |_| {
            *h.lock().unwrap() += 1
        });

        table.dispatch("DeviceRevocationEnded", vec![json!("acc1")]);
        table.dispatch("NameRegistrationEnded", vec![json!("acc1")]);
        assert_eq!(*hits.lock().unwrap(), 0);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let hub = SignalHub::new();
        let sub = hub.subscribe(SignalKind::AccountsChanged, |_| {});
        let _other = hub.subscribe(SignalKind::AccountsChanged, |_| {});
        assert_eq!(hub.subscriber_count(SignalKind::AccountsChanged), 2);
        drop(sub);
        assert_eq!(hub.subscriber_count(SignalKind::AccountsChanged), 1);
    }

    #[test]
    fn subscribing_from_inside_a_callback_does_not_deadlock() {
        let hub = SignalHub::new();
        let late = Arc::new(Mutex::new(Vec::new()));
        let (h, l) = (hub.clone(), late.clone());
        let _sub = hub.subscribe(SignalKind::AccountsChanged, move |_| {
            l.lock()
                .unwrap()
                .push(h.subscribe(SignalKind::AccountsChanged, |_| {}));
        });

        hub.publish(&Signal::AccountsChanged);
        // The subscriber added during publish does not see the signal that added it.
        assert_eq!(late.lock().unwrap().len(), 1);
        assert_eq!(hub.subscriber_count(SignalKind::AccountsChanged), 2);
    }

    #[tokio::test]
    async fn stream_preserves_emission_order() {
        let hub = SignalHub::new();
        let mut stream = hub.stream(SignalKind::ConversationReady);

        for i in 0..5 {
            hub.publish(&Signal::ConversationReady {
                account_id: "acc1".to_string(),
                conversation_id: format!("c{i}"),
            });
        }

        for i in 0..5 {
            match stream.recv().await {
                Some(Signal::ConversationReady {
                    conversation_id, ..
                }) => assert_eq!(conversation_id, format!("c{i}")),
                other => panic!("unexpected: {other:?}"),
            }
        }
        assert!(stream.try_recv().is_none());
        assert_eq!(stream.kind(), SignalKind::ConversationReady);
    }
}
