//! Canonical error records flowing through the intelligence pipeline

use chrono::{DateTime, Utc};
use derive_more::Display;
use nutype::nutype;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Error taxonomy shared by every component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum ErrorType {
    #[display("network")]
    Network,
    #[display("config")]
    Config,
    #[display("validation")]
    Validation,
    #[display("system")]
    System,
    #[display("permission")]
    Permission,
    #[display("api")]
    Api,
    #[display("file")]
    File,
    #[display("process")]
    Process,
    #[display("unknown")]
    Unknown,
}

impl ErrorType {
    pub const ALL: [ErrorType; 9] = [
        ErrorType::Network,
        ErrorType::Config,
        ErrorType::Validation,
        ErrorType::System,
        ErrorType::Permission,
        ErrorType::Api,
        ErrorType::File,
        ErrorType::Process,
        ErrorType::Unknown,
    ];
}

/// Ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[display("info")]
    Info,
    #[display("warning")]
    Warning,
    #[display("error")]
    Error,
    #[display("critical")]
    Critical,
}

impl Severity {
    /// Weight used when averaging severities into a confidence score
    pub fn weight(self) -> f64 {
        match self {
            Severity::Info => 0.25,
            Severity::Warning => 0.5,
            Severity::Error => 0.75,
            Severity::Critical => 1.0,
        }
    }
}

/// Stable hash of type + message + top stack frame
#[nutype(
    validate(predicate = |s: &str| s.len() == 16 && s.chars().all(|c| c.is_ascii_hexdigit())),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, AsRef, Display)
)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn compute(error_type: ErrorType, message: &str, stack: Option<&str>) -> Self {
        let top_frame = stack
            .and_then(|s| s.lines().map(str::trim).find(|line| !line.is_empty()))
            .unwrap_or_default();

        let mut hasher = Sha256::new();
        hasher.update(error_type.to_string().as_bytes());
        hasher.update([0u8]);
        hasher.update(message.as_bytes());
        hasher.update([0u8]);
        hasher.update(top_frame.as_bytes());
        let digest = hex::encode(hasher.finalize());

        match Self::try_new(digest[..16].to_string()) {
            Ok(fingerprint) => fingerprint,
            // sha256 hex output always satisfies the predicate
            Err(_) => unreachable!("hex digest prefix is 16 hex characters"),
        }
    }
}

/// Code and message of the fault that caused a record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginalError {
    pub code: Option<String>,
    pub message: String,
}

impl OriginalError {
    pub fn new(code: Option<impl Into<String>>, message: impl Into<String>) -> Self {
        Self {
            code: code.map(Into::into),
            message: message.into(),
        }
    }
}

/// Well-known context payloads attached to an error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorContext {
    Request {
        request_id: String,
        method: String,
        path: String,
        service: Option<String>,
        model: Option<String>,
        status: Option<u16>,
        attempts: Option<u32>,
        retry_after_secs: Option<u64>,
    },
    Network {
        url: String,
        code: Option<String>,
        attempts: u32,
    },
    Config {
        field: Option<String>,
    },
    PortBinding {
        port: u16,
        next_port: Option<u16>,
    },
    Recovery {
        strategy: String,
        fingerprint: String,
    },
    Generic(BTreeMap<String, serde_json::Value>),
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self::Generic(BTreeMap::new())
    }
}

impl ErrorContext {
    /// HTTP status carried by the context, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            ErrorContext::Request { status, .. } => *status,
            ErrorContext::Generic(map) => map
                .get("status")
                .and_then(serde_json::Value::as_u64)
                .and_then(|s| u16::try_from(s).ok()),
            _ => None,
        }
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            ErrorContext::Request {
                retry_after_secs, ..
            } => *retry_after_secs,
            _ => None,
        }
    }

    pub fn service(&self) -> Option<&str> {
        match self {
            ErrorContext::Request { service, .. } => service.as_deref(),
            _ => None,
        }
    }
}

/// A button the UI may offer next to an error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuggestedAction {
    pub label: String,
    pub action: String,
}

impl SuggestedAction {
    pub fn new(label: &str, action: &str) -> Self {
        Self {
            label: label.to_string(),
            action: action.to_string(),
        }
    }
}

/// Host metadata stamped on every record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemMetadata {
    pub os: String,
    pub arch: String,
    pub pid: u32,
    pub version: String,
}

impl SystemMetadata {
    pub fn current() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            pid: std::process::id(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Raw failure description handed to the error handler
#[derive(Debug, Clone, Default)]
pub struct ErrorInfo {
    pub error_type: Option<ErrorType>,
    pub severity: Option<Severity>,
    pub message: String,
    pub detail: Option<String>,
    pub stack: Option<String>,
    pub context: ErrorContext,
    pub original: Option<OriginalError>,
    pub suggestion: Option<String>,
    /// Persist and analyse, but never notify the UI
    pub silent: bool,
}

impl ErrorInfo {
    pub fn new(error_type: ErrorType, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            error_type: Some(error_type),
            severity: Some(severity),
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_original(mut self, original: OriginalError) -> Self {
        self.original = Some(original);
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }
}

/// The unit flowing through the intelligence pipeline; read-only once built
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalErrorRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub error_type: ErrorType,
    pub severity: Severity,
    pub message: String,
    pub detail: Option<String>,
    pub stack: Option<String>,
    pub context: ErrorContext,
    pub fingerprint: Fingerprint,
    pub original_error: Option<OriginalError>,
    pub suggestion: Option<String>,
    pub actions: Vec<SuggestedAction>,
    pub system: SystemMetadata,
    pub silent: bool,
}

impl CanonicalErrorRecord {
    /// Normalize raw failure info into a record stamped at `timestamp`
    pub fn from_info(info: ErrorInfo, timestamp: DateTime<Utc>) -> Self {
        let error_type = info.error_type.unwrap_or(ErrorType::Unknown);
        let fingerprint = Fingerprint::compute(error_type, &info.message, info.stack.as_deref());

        Self {
            id: Uuid::now_v7(),
            timestamp,
            error_type,
            severity: info.severity.unwrap_or(Severity::Error),
            message: info.message,
            detail: info.detail,
            stack: info.stack,
            context: info.context,
            fingerprint,
            original_error: info.original,
            suggestion: info.suggestion,
            actions: Vec::new(),
            system: SystemMetadata::current(),
            silent: info.silent,
        }
    }

    /// All text an indicator may match against, lowercased
    pub fn searchable_text(&self) -> String {
        let mut text = self.message.to_lowercase();
        for part in [self.detail.as_deref(), self.stack.as_deref()]
            .into_iter()
            .flatten()
        {
            text.push('\n');
            text.push_str(&part.to_lowercase());
        }
        if let Some(original) = &self.original_error {
            if let Some(code) = &original.code {
                text.push('\n');
                text.push_str(&code.to_lowercase());
            }
            text.push('\n');
            text.push_str(&original.message.to_lowercase());
        }
        if let Some(status) = self.context.status() {
            text.push('\n');
            text.push_str(&status.to_string());
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_stable_and_uses_top_frame_only() {
        let a = Fingerprint::compute(
            ErrorType::Network,
            "connect failed",
            Some("  at forward (proxy.rs:10)\n  at handle (server.rs:20)"),
        );
        let b = Fingerprint::compute(
            ErrorType::Network,
            "connect failed",
            Some("\n  at forward (proxy.rs:10)\n  at other (x.rs:1)"),
        );
        let c = Fingerprint::compute(ErrorType::Api, "connect failed", None);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_ref().len(), 16);
    }

    #[test]
    fn test_record_defaults() {
        let record = CanonicalErrorRecord::from_info(
            ErrorInfo {
                message: "mystery".to_string(),
                ..Default::default()
            },
            Utc::now(),
        );

        assert_eq!(record.error_type, ErrorType::Unknown);
        assert_eq!(record.severity, Severity::Error);
        assert!(!record.silent);
        assert_eq!(record.system.pid, std::process::id());
    }

    #[test]
    fn test_searchable_text_includes_status_and_code() {
        let info = ErrorInfo::new(ErrorType::Api, Severity::Warning, "Upstream Rejected")
            .with_original(OriginalError::new(Some("HTTP_429"), "Too Many Requests"))
            .with_context(ErrorContext::Request {
                request_id: "r1".to_string(),
                method: "POST".to_string(),
                path: "/proxy/openai/gpt-4o/chat".to_string(),
                service: Some("openai".to_string()),
                model: Some("gpt-4o".to_string()),
                status: Some(429),
                attempts: Some(1),
                retry_after_secs: Some(20),
            });
        let record = CanonicalErrorRecord::from_info(info, Utc::now());
        let text = record.searchable_text();

        assert!(text.contains("upstream rejected"));
        assert!(text.contains("http_429"));
        assert!(text.contains("429"));
        assert_eq!(record.context.retry_after_secs(), Some(20));
        assert_eq!(record.context.service(), Some("openai"));
    }

    #[test]
    fn test_record_serializes_type_field() {
        let record = CanonicalErrorRecord::from_info(
            ErrorInfo::new(ErrorType::Config, Severity::Critical, "bad config"),
            Utc::now(),
        );
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["type"], "config");
        assert_eq!(json["severity"], "critical");
        assert_eq!(json["context"]["kind"], "generic");
    }
}
