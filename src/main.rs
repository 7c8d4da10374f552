use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use image_context_proxy::api;
use image_context_proxy::app::App;
use image_context_proxy::models::Config;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "image-context-proxy")]
#[command(about = "Session-scoped image injection proxy for chat completions")]
struct CliArgs {
    /// Listen address, overriding BIND_ADDR.
    #[arg(long, value_name = "ADDR")]
    bind: Option<SocketAddr>,

    /// Upstream provider (openai or gemini), overriding LLM_PROVIDER.
    #[arg(long, value_name = "PROVIDER")]
    provider: Option<String>,
}

impl CliArgs {
    fn lookup(&self, key: &str) -> Option<String> {
        let overridden = match key {
            "BIND_ADDR" => self.bind.map(|addr| addr.to_string()),
            "LLM_PROVIDER" => self.provider.clone(),
            _ => None,
        };
        overridden.or_else(|| std::env::var(key).ok())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "image_context_proxy=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = CliArgs::parse();
    dotenvy::dotenv().ok();

    let config = Config::from_lookup(|key| args.lookup(key)).context("Invalid configuration")?;
    let addr = config.bind_addr;

    info!("Starting image-context-proxy");

    let app = match App::from_config(config).await {
        Ok(app) => Arc::new(app),
        Err(e) => {
            error!("Failed to initialize application: {}", e);
            std::process::exit(1);
        }
    };

    let shutdown = CancellationToken::new();
    let sweeper = app.spawn_sweeper(shutdown.clone());

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Shutdown requested");
        signal.cancel();
    });

    let served = api::serve(addr, app, shutdown.clone()).await;
    shutdown.cancel();
    sweeper.await.ok();

    served.with_context(|| format!("Server on {} failed", addr))?;
    info!("Stopped");
    Ok(())
}
