use crate::config::ConfigValidationError;
use crate::diagnostics::logger::LoggerError;
use crate::proxy::server::ServerError;
use crate::proxy::types::ProxyError;
use thiserror::Error;

/// LLM Bridge application error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {}", join_problems(.0))]
    InvalidConfig(Vec<ConfigValidationError>),

    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    #[error("Error log unavailable: {0}")]
    ErrorLog(#[from] LoggerError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Application error: {message}")]
    Application { message: String },

    #[error("Not found: {resource}")]
    NotFound { resource: String },
}

impl Error {
    pub fn application(message: impl Into<String>) -> Self {
        Self::Application {
            message: message.into(),
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }
}

fn join_problems(problems: &[ConfigValidationError]) -> String {
    problems
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, Error>;
