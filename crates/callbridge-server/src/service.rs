use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::http::{HeaderValue, Method};
use axum::routing::get;
use callbridge_daemon::{AccountDetails, DaemonBridge, NativeDaemon, SignalHub};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::forward;
use crate::hub::RelayHub;
use crate::ws::{self, AppState};

/// A server bound and serving in the background.
pub struct RunningServer<D: NativeDaemon> {
    pub addr: SocketAddr,
    pub bridge: DaemonBridge<D>,
    pub relay: Arc<RelayHub>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl<D: NativeDaemon> RunningServer<D> {
    /// Stop accepting connections and wait for the server task to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.task).await;
    }

    pub fn ws_url(&self, account_id: &str) -> String {
        format!("ws://{}/ws?accountId={account_id}", self.addr)
    }
}

impl<D: NativeDaemon> Drop for RunningServer<D> {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Attach to `daemon`, bind `config.listen` and serve in a background task.
///
/// The daemon's single handler registration is consumed here.
pub async fn spawn_server<D: NativeDaemon>(
    config: ServerConfig,
    daemon: Arc<D>,
) -> Result<RunningServer<D>> {
    let signals = SignalHub::new();
    signals
        .attach(daemon.as_ref())
        .context("failed to register daemon signal handlers")?;

    let relay = Arc::new(RelayHub::new());
    let subscriptions = forward::forward_signals(&signals, relay.clone());
    let bridge = DaemonBridge::new(daemon.clone(), signals, config.bridge_config());

    let cors = build_cors(&config.allow_origins)?;
    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    let addr = listener.local_addr()?;

    let state = Arc::new(AppState {
        daemon,
        relay: relay.clone(),
        config,
    });
    let app = Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/healthz", get(|| async { "ok" }))
        .layer(cors)
        .with_state(state);

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        // Signal forwarding lives as long as the server.
        let _subscriptions = subscriptions;
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await;
        if let Err(e) = result {
            warn!("server error: {e}");
        }
    });
    info!("callbridge server listening addr={addr}");

    Ok(RunningServer {
        addr,
        bridge,
        relay,
        shutdown: Some(shutdown_tx),
        task,
    })
}

/// Create the configured startup accounts and register their aliases as
/// names. A name that is already taken is logged and skipped.
pub async fn create_accounts<D: NativeDaemon>(
    bridge: &DaemonBridge<D>,
    aliases: &[String],
) -> Result<Vec<(String, String)>> {
    let mut created = Vec::with_capacity(aliases.len());
    for alias in aliases {
        let account_id = bridge
            .add_account(&AccountDetails::new_jami(alias))
            .await
            .with_context(|| format!("failed to create account {alias}"))?;
        match bridge.register_name(&account_id, "", alias).await {
            Ok(()) => info!(account_id = %account_id, alias = %alias, "account ready"),
            Err(e) => warn!(account_id = %account_id, alias = %alias, "name not registered: {e}"),
        }
        created.push((alias.clone(), account_id));
    }
    Ok(created)
}

fn build_cors(origins: &[String]) -> Result<CorsLayer> {
    if origins.iter().any(|o| o == "*") {
        return Ok(CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::OPTIONS])
            .allow_headers(Any));
    }

    let mut headers = Vec::with_capacity(origins.len());
    for origin in origins {
        headers.push(
            HeaderValue::from_str(origin)
                .with_context(|| format!("invalid allowed origin: {origin}"))?,
        );
    }

    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(headers))
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any))
}

#[cfg(test)]
mod tests {
    use super::*;
    use callbridge_daemon::LoopbackDaemon;

    fn local_config() -> ServerConfig {
        ServerConfig {
            listen: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..ServerConfig::default()
        }
    }

    #[test]
    fn cors_rejects_invalid_origin() {
        assert!(build_cors(&["*".to_string()]).is_ok());
        assert!(build_cors(&["http://localhost:3000".to_string()]).is_ok());
        assert!(build_cors(&["bad\norigin".to_string()]).is_err());
    }

    #[tokio::test]
    async fn daemon_can_only_be_served_once() {
        let daemon = Arc::new(LoopbackDaemon::new());
        let server = spawn_server(local_config(), daemon.clone()).await.unwrap();
        assert!(spawn_server(local_config(), daemon).await.is_err());
        server.shutdown().await;
    }

    #[tokio::test]
    async fn startup_accounts_get_names() {
        let daemon = Arc::new(LoopbackDaemon::new());
        let server = spawn_server(local_config(), daemon.clone()).await.unwrap();

        let created = create_accounts(&server.bridge, &["alice".to_string()])
            .await
            .unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].0, "alice");

        let found = server.bridge.lookup_name(None, "alice").await.unwrap();
        assert!(found.is_found());
        server.shutdown().await;
    }
}
