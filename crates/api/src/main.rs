//! Mnemos API server binary.
//!
//! Usage:
//!   mnemos-api --config mnemos.toml
//!   mnemos-api --port 8080 --bind 0.0.0.0
//!
//! # Environment Variables
//!
//! - `MNEMOS_CONFIG` - Config file path
//! - `MNEMOS_BIND_ADDR` - Server bind address (default: 127.0.0.1)
//! - `MNEMOS_LLM_API_KEY` / `OPENAI_API_KEY` - Classifier API key
//! - `MNEMOS_EMBEDDING_API_KEY` - Embedding API key for the `openai` provider

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use mnemos_api::{serve, AppConfig, AppState};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "mnemos-api")]
#[command(version)]
#[command(about = "Memory detection, storage and retrieval service")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "MNEMOS_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address (overrides the config file)
    #[arg(short, long, env = "MNEMOS_BIND_ADDR")]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "info,mnemos_api=debug,mnemos_memory=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => {
            tracing::info!(path = %path.display(), "Loading configuration");
            AppConfig::from_file(path)?
        }
        None => {
            tracing::info!("Using default configuration");
            AppConfig::default()
        }
    };
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }

    if config.server.bind == "0.0.0.0" {
        tracing::warn!(
            "Server binding to 0.0.0.0 exposes the API to all network interfaces. \
             The API has no authentication; put it behind a trusted proxy."
        );
    }

    let state = AppState::from_config(&config).await?;
    tracing::info!(
        memories = state.memory.store().len(),
        classifier = %state.memory.stats().classifier,
        "Memory service ready"
    );

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    serve(Arc::new(state), addr, &config.server.cors_origins).await?;

    Ok(())
}
