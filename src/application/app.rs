use crate::application::context::AppContext;
use crate::config::{ProxySettings, Settings};
use crate::proxy::{StartedServer, StopOutcome};
use crate::Result;
use tracing::{info, instrument, warn};

/// Main application struct that coordinates all components
pub struct Application {
    context: AppContext,
}

impl Application {
    /// Load settings from the config files and environment
    #[instrument]
    pub fn new() -> Result<Self> {
        Self::with_settings(Settings::new()?)
    }

    pub fn with_settings(settings: Settings) -> Result<Self> {
        info!(environment = %settings.application.environment, "Building application");
        Ok(Self {
            context: AppContext::build(settings)?,
        })
    }

    pub fn context(&self) -> &AppContext {
        &self.context
    }

    pub fn settings(&self) -> &Settings {
        &self.context.settings
    }

    /// Start the pipeline, the health monitor and the listener
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<StartedServer> {
        self.context.pipeline.start();
        if self.context.settings.intelligence.health.enabled {
            self.context.health.start();
        }
        self.start_proxy(None).await
    }

    /// Start the listener with `settings`, or with the configured defaults
    pub async fn start_proxy(&self, settings: Option<ProxySettings>) -> Result<StartedServer> {
        if let Some(settings) = &settings {
            *self.context.proxy_settings.write() = settings.clone();
        }
        let started = self.context.server.start(settings).await?;
        info!(port = started.port, url = %started.url, "Proxy listening");
        Ok(started)
    }

    #[instrument(skip(self))]
    pub async fn stop(&self) -> StopOutcome {
        let outcome = self.context.server.stop().await;
        self.context.health.stop();
        self.context.pipeline.stop();
        outcome
    }

    /// Serve until Ctrl-C, then shut everything down
    #[instrument(skip(self))]
    pub async fn run(self) -> Result<()> {
        self.start().await?;

        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C, shutting down");
        }
        info!("Shutdown requested");

        match self.stop().await {
            StopOutcome::Stopped { port } => info!(port, "Application stopped"),
            StopOutcome::NotRunning => info!("Application stopped; proxy was not running"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ephemeral_settings() -> Settings {
        let mut settings = Settings::default();
        settings.proxy.server_port = 0;
        settings.intelligence.health.enabled = false;
        settings
    }

    #[tokio::test]
    async fn test_start_and_stop_roundtrip() {
        let app = Application::with_settings(ephemeral_settings()).unwrap();

        let started = app.start().await.unwrap();
        assert!(started.port > 0);
        assert!(app.context().pipeline.is_running());
        assert!(app.context().server.is_running().await);

        assert_eq!(app.stop().await, StopOutcome::Stopped { port: started.port });
        assert!(!app.context().pipeline.is_running());
        assert_eq!(app.stop().await, StopOutcome::NotRunning);
    }

    #[tokio::test]
    async fn test_start_proxy_updates_shared_settings() {
        let app = Application::with_settings(ephemeral_settings()).unwrap();
        let settings = ProxySettings {
            server_port: 0,
            max_retries: 1,
            ..Default::default()
        };

        app.start_proxy(Some(settings)).await.unwrap();
        assert_eq!(app.context().proxy_settings.read().max_retries, 1);
        app.stop().await;
    }
}
