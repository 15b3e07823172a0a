use anyhow::{Context, Result, bail};
use callbridge::Envelope;
use callbridge_call::testing::{FakeMedia, FakePeerFactory};
use callbridge_call::{CallHandle, CallManager, CallSession, CallStatus, Relay, drive_websocket};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// A bare socket speaking envelopes, for conversation traffic.
pub struct WsClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsClient {
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .with_context(|| format!("failed to connect {url}"))?;
        Ok(Self { ws })
    }

    pub async fn send(&mut self, envelope: &Envelope) -> Result<()> {
        self.send_raw(&envelope.to_json()?).await
    }

    pub async fn send_raw(&mut self, frame: &str) -> Result<()> {
        self.ws.send(Message::text(frame.to_string())).await?;
        Ok(())
    }

    /// Next envelope within `timeout`, skipping control frames.
    pub async fn recv(&mut self, timeout: Duration) -> Result<Envelope> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let next = tokio::time::timeout_at(deadline, self.ws.next())
                .await
                .context("timed out waiting for an envelope")?;
            match next {
                Some(Ok(Message::Text(text))) => return Ok(Envelope::parse(text.as_str())?),
                Some(Ok(Message::Close(_))) | None => bail!("socket closed"),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    /// True when nothing but control frames arrives for `quiet`.
    pub async fn is_silent(&mut self, quiet: Duration) -> bool {
        self.recv(quiet).await.is_err()
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

/// A browser-side call stack: relay, call manager and scripted media,
/// wired to the server over a real WebSocket.
pub struct CallClient {
    pub handle: CallHandle,
    pub relay: Relay,
    pub factory: FakePeerFactory,
    pub media: FakeMedia,
    status: watch::Receiver<Option<CallSession>>,
    tasks: Vec<JoinHandle<()>>,
}

impl CallClient {
    pub async fn connect(url: &str, name: &str) -> Result<Self> {
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .with_context(|| format!("failed to connect {url}"))?;

        let relay = Relay::new();
        let outbound = relay.connect();
        let factory = FakePeerFactory::new(name);
        let media = FakeMedia::new();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let manager = CallManager::new(factory.clone(), media.clone(), relay.clone(), peer_tx);
        let (envelopes, _bindings) = manager.bind();
        let (handle, commands, status_tx) = CallHandle::channel(16);
        let status = handle.status();

        let driver_relay = relay.clone();
        let driver = tokio::spawn(async move {
            drive_websocket(&driver_relay, ws, outbound).await;
        });
        let runner = tokio::spawn(manager.run(envelopes, peer_rx, commands, status_tx));

        Ok(Self {
            handle,
            relay,
            factory,
            media,
            status,
            tasks: vec![driver, runner],
        })
    }

    pub fn session(&self) -> Option<CallSession> {
        self.status.borrow().clone()
    }

    /// Wait until the session reaches `status`.
    pub async fn wait_for(&mut self, status: CallStatus, timeout: Duration) -> Result<CallSession> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let reached = self
                .status
                .borrow_and_update()
                .as_ref()
                .filter(|s| s.status == status)
                .cloned();
            if let Some(session) = reached {
                return Ok(session);
            }
            let changed = tokio::time::timeout_at(deadline, self.status.changed()).await;
            let have = self.session().map(|s| s.status);
            changed
                .with_context(|| format!("timed out waiting for {status:?}, have {have:?}"))?
                .context("call manager stopped")?;
        }
    }

    /// Drop the WebSocket as if the page lost its connection.
    pub fn disconnect(&self) {
        self.relay.close();
    }
}

impl Drop for CallClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
