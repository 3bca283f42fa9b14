//! Listener lifecycle: start, port fallback and graceful stop

use crate::config::{ConfigValidationError, ProxyMode, ProxySettings};
use crate::diagnostics::{ErrorContext, ErrorInfo, ErrorType, Severity};
use crate::events::AppEvent;
use crate::proxy::service::{ProxyComponents, ProxyService};
use crate::proxy::types::ProxyError;
use std::io;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Proxy server is already running on port {port}")]
    AlreadyRunning { port: u16 },

    #[error("Failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("Invalid proxy configuration: {}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    InvalidConfig(Vec<ConfigValidationError>),

    #[error(transparent)]
    Proxy(#[from] ProxyError),
}

/// Address the listener ended up on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedServer {
    pub port: u16,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped { port: u16 },
    NotRunning,
}

struct Running {
    port: u16,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Owns at most one running listener at a time
pub struct ProxyServer {
    components: ProxyComponents,
    defaults: ProxySettings,
    running: Mutex<Option<Running>>,
}

impl ProxyServer {
    pub fn new(components: ProxyComponents, defaults: ProxySettings) -> Self {
        Self {
            components,
            defaults,
            running: Mutex::new(None),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub async fn port(&self) -> Option<u16> {
        self.running.lock().await.as_ref().map(|r| r.port)
    }

    /// Bind and serve. Without settings the server runs in dynamic mode
    /// on the default host and port.
    #[instrument(skip_all)]
    pub async fn start(&self, settings: Option<ProxySettings>) -> Result<StartedServer, ServerError> {
        let mut running = self.running.lock().await;
        if let Some(current) = running.as_ref() {
            return Err(ServerError::AlreadyRunning { port: current.port });
        }

        let settings = settings.unwrap_or_else(|| ProxySettings {
            mode: ProxyMode::Dynamic,
            ..self.defaults.clone()
        });
        settings.validate().map_err(ServerError::InvalidConfig)?;

        self.components.forwarder.upstream().reconfigure(&settings)?;
        let dynamic = settings.is_dynamic();
        let host = settings.server_host.clone();
        let router = ProxyService::new(settings.clone(), self.components.clone())?.into_router();

        let listener = self.bind(&host, settings.server_port).await?;
        let port = listener
            .local_addr()
            .map_err(|source| ServerError::Bind {
                port: settings.server_port,
                source,
            })?
            .port();
        let url = format!("http://{host}:{port}");

        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = served {
                warn!(error = %e, "Proxy listener terminated with an error");
            }
        });

        info!(port, url = %url, dynamic, "Proxy server started");
        self.components.events.publish(AppEvent::Started {
            port,
            url: url.clone(),
            dynamic,
        });
        *running = Some(Running {
            port,
            shutdown,
            task,
        });

        Ok(StartedServer { port, url })
    }

    /// Close the listener and wait for in-flight connections to drain
    #[instrument(skip_all)]
    pub async fn stop(&self) -> StopOutcome {
        let Some(running) = self.running.lock().await.take() else {
            return StopOutcome::NotRunning;
        };

        let _ = running.shutdown.send(());
        if let Err(e) = running.task.await {
            warn!(error = %e, "Proxy listener task did not shut down cleanly");
        }

        info!(port = running.port, "Proxy server stopped");
        self.components.events.publish(AppEvent::Stopped);
        StopOutcome::Stopped { port: running.port }
    }

    /// Bind `port`, moving up one port at a time while it is taken
    async fn bind(&self, host: &str, port: u16) -> Result<TcpListener, ServerError> {
        let mut candidate = port;
        loop {
            match TcpListener::bind((host, candidate)).await {
                Ok(listener) => return Ok(listener),
                Err(source) if source.kind() == io::ErrorKind::AddrInUse => {
                    let next_port = candidate.checked_add(1);
                    warn!(port = candidate, ?next_port, "Port in use");
                    self.components.errors.report(
                        ErrorInfo::new(
                            ErrorType::Network,
                            Severity::Info,
                            format!("Port {candidate} is already in use"),
                        )
                        .with_context(ErrorContext::PortBinding {
                            port: candidate,
                            next_port,
                        })
                        .silent(),
                    );
                    candidate = next_port.ok_or(ServerError::Bind {
                        port: candidate,
                        source,
                    })?;
                }
                Err(source) => {
                    return Err(ServerError::Bind {
                        port: candidate,
                        source,
                    })
                }
            }
        }
    }
}
