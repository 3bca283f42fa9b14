use anyhow::{Context, Result};
use llm_bridge::config::{LoggingSettings, Settings};
use llm_bridge::Application;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::new().context("failed to load settings")?;
    init_tracing(&settings.logging);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting LLM Bridge");

    let app = Application::with_settings(settings)?;
    app.run().await?;

    Ok(())
}

/// `RUST_LOG` wins over the configured level
fn init_tracing(logging: &LoggingSettings) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.pretty().init();
    }
}
