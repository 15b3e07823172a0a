use std::sync::Arc;

use anyhow::Result;
use callbridge_daemon::LoopbackDaemon;
use callbridge_server::{Cli, service};
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "callbridge_server=info,callbridge_daemon=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.resolve()?;
    let aliases = config.accounts.clone();

    let daemon = Arc::new(LoopbackDaemon::new());
    let server = service::spawn_server(config, daemon).await?;

    for (alias, account_id) in service::create_accounts(&server.bridge, &aliases).await? {
        tracing::info!(
            "account {alias} id={account_id} url={}",
            server.ws_url(&account_id)
        );
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    server.shutdown().await;
    Ok(())
}
