use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use parley_core::provider::ModelClient;
use parley_llm::{ClientConfig, OpenAiCompatClient};
use parley_server::ServerConfig;
use parley_settings::{load_settings_with_report, require_api_key, settings_path};
use parley_store::{Database, SessionStore};
use parley_telemetry::{init_telemetry, TelemetryConfig};

#[derive(Debug, Parser)]
#[command(name = "parley", about = "Chat assistant backend with streaming relay")]
struct Args {
    /// Settings file; defaults to ~/.parley/settings.json
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config_path = args.config.unwrap_or_else(settings_path);
    let loaded = load_settings_with_report(&config_path)
        .with_context(|| format!("failed to load settings from {}", config_path.display()))?;
    let settings = &loaded.settings;

    init_telemetry(&TelemetryConfig::from_level_str(
        &settings.logging.level,
        settings.logging.json,
    ));
    loaded.log_ignored();

    tracing::info!(model = %settings.llm.model, "starting parley server");

    let api_key = require_api_key(settings).context("upstream API key is not configured")?;

    let db = Database::open(&settings.storage.database_path).with_context(|| {
        format!(
            "failed to open database at {}",
            settings.storage.database_path.display()
        )
    })?;
    let store = SessionStore::new(db);

    let client: Arc<dyn ModelClient> = Arc::new(
        OpenAiCompatClient::new(ClientConfig::from_settings(&settings.llm, api_key))
            .context("failed to build upstream client")?,
    );

    let config = ServerConfig::from_settings(&settings.server);
    let handle = parley_server::start(config, store, client)
        .await
        .context("failed to start server")?;

    tracing::info!(port = handle.port, "parley server ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}
