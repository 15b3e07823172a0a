use anyhow::{Context, Result};
use callbridge_daemon::{AccountDetails, DaemonBridge, LoopbackDaemon, NativeDaemon};
use callbridge_server::{RunningServer, ServerConfig, spawn_server};
use std::net::SocketAddr;
use std::sync::Arc;

/// A test server on a random port, backed by a fresh loopback daemon.
pub struct TestServer {
    pub daemon: Arc<LoopbackDaemon>,
    server: RunningServer<LoopbackDaemon>,
}

/// An account created on the test daemon with its name registered.
#[derive(Debug, Clone)]
pub struct TestAccount {
    pub alias: String,
    pub id: String,
    pub uri: String,
}

impl TestServer {
    pub async fn spawn() -> Result<Self> {
        Self::spawn_with(ServerConfig {
            listen: SocketAddr::from(([127, 0, 0, 1], 0)),
            allow_origins: vec!["*".to_string()],
            request_timeout_secs: Some(5),
            ..ServerConfig::default()
        })
        .await
    }

    pub async fn spawn_with(config: ServerConfig) -> Result<Self> {
        super::init_tracing();
        let daemon = Arc::new(LoopbackDaemon::new());
        let server = spawn_server(config, daemon.clone()).await?;
        Ok(Self { daemon, server })
    }

    pub fn bridge(&self) -> &DaemonBridge<LoopbackDaemon> {
        &self.server.bridge
    }

    pub fn ws_url(&self, account: &TestAccount) -> String {
        self.server.ws_url(&account.id)
    }

    pub fn url_for_id(&self, account_id: &str) -> String {
        self.server.ws_url(account_id)
    }

    pub fn connected_sockets(&self) -> usize {
        self.server.relay.socket_count()
    }

    /// Wait until `count` sockets are registered. A client's handshake can
    /// complete before the server has registered its socket.
    pub async fn wait_for_sockets(&self, count: usize) -> Result<()> {
        if super::eventually(super::WAIT, || self.connected_sockets() == count).await {
            Ok(())
        } else {
            anyhow::bail!(
                "expected {count} sockets, have {}",
                self.connected_sockets()
            )
        }
    }

    /// Create an account and register `alias` as its name.
    pub async fn account(&self, alias: &str) -> Result<TestAccount> {
        let bridge = self.bridge();
        let id = bridge
            .add_account(&AccountDetails::new_jami(alias))
            .await
            .with_context(|| format!("add account {alias}"))?;
        bridge
            .register_name(&id, "", alias)
            .await
            .with_context(|| format!("register name {alias}"))?;
        let uri = self
            .daemon
            .account_details(&id)?
            .uri()
            .context("account has no uri")?
            .to_string();
        Ok(TestAccount {
            alias: alias.to_string(),
            id,
            uri,
        })
    }

    /// Start a conversation owned by `owner` with `members` added.
    pub fn conversation(&self, owner: &TestAccount, members: &[&TestAccount]) -> Result<String> {
        let conversation_id = self.daemon.start_conversation(&owner.id)?;
        for member in members {
            self.daemon
                .add_conversation_member(&owner.id, &conversation_id, &member.uri)?;
        }
        Ok(conversation_id)
    }

    pub async fn shutdown(self) {
        self.server.shutdown().await;
    }
}
