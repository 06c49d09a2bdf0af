use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use pappy::{
    config::{Config, ConfigArgs},
    gateway::BotApiGateway,
    ledger::Ledger,
    logging::init_logging,
    webapp::{router, AppState},
};

/// Serves the mini app API over HTTP.
#[derive(Parser)]
#[command(name = "pappy-webapp-serve", version)]
struct ServeArgs {
    #[command(flatten)]
    config: ConfigArgs,

    #[arg(long, env = "HTTP_BIND", default_value = "127.0.0.1:8080")]
    bind: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let args = ServeArgs::parse();
    let config = Config::from_args(args.config)?;
    let ledger = Ledger::open(&config.db_path)
        .with_context(|| format!("open {}", config.db_path.display()))?;
    let messenger = Arc::new(BotApiGateway::new(&config.bot_token, config.group_id));
    let state = AppState::new(Arc::new(config), ledger, messenger);

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("bind {}", args.bind))?;
    info!(addr = %args.bind, "mini app api listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;
    Ok(())
}
