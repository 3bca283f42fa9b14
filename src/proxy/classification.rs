//! Declarative failure classification
//!
//! Each rule maps a transport code, an HTTP status or message substrings onto
//! an error type, a severity, the status returned to the client and a
//! suggestion. Rules are checked in order; the first match wins.

use crate::diagnostics::{ErrorType, Severity};
use crate::proxy::types::ProxyError;
use axum::http::StatusCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Matcher {
    Code(&'static str),
    Status(u16),
    StatusRange(u16, u16),
    MessageContains(&'static [&'static str]),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassificationRule {
    pub matcher: Matcher,
    pub code: &'static str,
    pub error_type: ErrorType,
    pub severity: Severity,
    pub status: u16,
    pub suggestion: &'static str,
}

const fn rule(
    matcher: Matcher,
    code: &'static str,
    error_type: ErrorType,
    severity: Severity,
    status: u16,
    suggestion: &'static str,
) -> ClassificationRule {
    ClassificationRule {
        matcher,
        code,
        error_type,
        severity,
        status,
        suggestion,
    }
}

pub const RULES: &[ClassificationRule] = &[
    rule(
        Matcher::Code("ECONNREFUSED"),
        "ECONNREFUSED",
        ErrorType::Network,
        Severity::Error,
        503,
        "The upstream service refused the connection. Check that it is running and reachable.",
    ),
    rule(
        Matcher::Code("ETIMEDOUT"),
        "ETIMEDOUT",
        ErrorType::Network,
        Severity::Error,
        504,
        "The upstream service did not answer in time. Try again or raise the request timeout.",
    ),
    rule(
        Matcher::Code("ECONNRESET"),
        "ECONNRESET",
        ErrorType::Network,
        Severity::Error,
        502,
        "The connection to the upstream service was reset. Try the request again.",
    ),
    rule(
        Matcher::Code("ENOTFOUND"),
        "ENOTFOUND",
        ErrorType::Network,
        Severity::Error,
        502,
        "The upstream host name could not be resolved. Check the base URL and your DNS.",
    ),
    rule(
        Matcher::Code("EUNKNOWN"),
        "UPSTREAM_UNREACHABLE",
        ErrorType::Network,
        Severity::Error,
        502,
        "The upstream service could not be reached. Check the network and proxy settings.",
    ),
    rule(
        Matcher::Code("OVERLOADED"),
        "OVERLOADED",
        ErrorType::System,
        Severity::Warning,
        503,
        "The proxy is at capacity. Retry shortly.",
    ),
    rule(
        Matcher::Code("NOT_CONFIGURED"),
        "NOT_CONFIGURED",
        ErrorType::Config,
        Severity::Error,
        500,
        "The proxy configuration is incomplete. Set the target URL and API key.",
    ),
    rule(
        Matcher::Status(401),
        "UNAUTHORIZED",
        ErrorType::Api,
        Severity::Error,
        401,
        "Authentication failed. Check that the API key is present and valid.",
    ),
    rule(
        Matcher::Status(403),
        "FORBIDDEN",
        ErrorType::Api,
        Severity::Error,
        403,
        "The API key is not allowed to use this model or endpoint.",
    ),
    rule(
        Matcher::Status(429),
        "RATE_LIMITED",
        ErrorType::Api,
        Severity::Warning,
        429,
        "Rate limit reached. Wait before retrying or lower the request rate.",
    ),
    rule(
        Matcher::Status(404),
        "NOT_FOUND",
        ErrorType::Validation,
        Severity::Warning,
        404,
        "The requested service, model or path does not exist.",
    ),
    rule(
        Matcher::Status(413),
        "REQUEST_TOO_LARGE",
        ErrorType::Validation,
        Severity::Warning,
        413,
        "The request body is too large. Shorten the conversation or attachments.",
    ),
    rule(
        Matcher::StatusRange(400, 499),
        "BAD_REQUEST",
        ErrorType::Validation,
        Severity::Warning,
        400,
        "The request was rejected as invalid. Check the payload and parameters.",
    ),
    rule(
        Matcher::StatusRange(500, 599),
        "UPSTREAM_ERROR",
        ErrorType::Api,
        Severity::Error,
        502,
        "The upstream service failed. Try again later.",
    ),
    rule(
        Matcher::MessageContains(&["unauthorized", "invalid api key", "authentication"]),
        "UNAUTHORIZED",
        ErrorType::Api,
        Severity::Error,
        401,
        "Authentication failed. Check that the API key is present and valid.",
    ),
    rule(
        Matcher::MessageContains(&["rate limit", "too many requests"]),
        "RATE_LIMITED",
        ErrorType::Api,
        Severity::Warning,
        429,
        "Rate limit reached. Wait before retrying or lower the request rate.",
    ),
    rule(
        Matcher::MessageContains(&["timed out", "timeout"]),
        "ETIMEDOUT",
        ErrorType::Network,
        Severity::Error,
        504,
        "The upstream service did not answer in time. Try again or raise the request timeout.",
    ),
    rule(
        Matcher::MessageContains(&["invalid", "validation", "missing field", "expected"]),
        "BAD_REQUEST",
        ErrorType::Validation,
        Severity::Warning,
        400,
        "The request was rejected as invalid. Check the payload and parameters.",
    ),
];

const FALLBACK: ClassificationRule = rule(
    Matcher::MessageContains(&[]),
    "INTERNAL_ERROR",
    ErrorType::Unknown,
    Severity::Error,
    500,
    "An unexpected error occurred. Check the proxy logs for details.",
);

/// Raw evidence about a failure
#[derive(Debug, Clone, Copy, Default)]
pub struct FailureSignal<'a> {
    pub code: Option<&'a str>,
    pub status: Option<u16>,
    pub message: &'a str,
}

impl Matcher {
    fn matches(&self, signal: &FailureSignal<'_>, lowered: &str) -> bool {
        match self {
            Matcher::Code(code) => signal.code.is_some_and(|c| c.eq_ignore_ascii_case(code)),
            Matcher::Status(status) => signal.status == Some(*status),
            Matcher::StatusRange(low, high) => {
                signal.status.is_some_and(|s| (*low..=*high).contains(&s))
            }
            Matcher::MessageContains(needles) => needles.iter().any(|n| lowered.contains(n)),
        }
    }
}

/// Outcome of classifying a failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub code: &'static str,
    pub error_type: ErrorType,
    pub severity: Severity,
    pub status: StatusCode,
    pub suggestion: &'static str,
}

impl From<&ClassificationRule> for Classification {
    fn from(rule: &ClassificationRule) -> Self {
        Self {
            code: rule.code,
            error_type: rule.error_type,
            severity: rule.severity,
            status: StatusCode::from_u16(rule.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            suggestion: rule.suggestion,
        }
    }
}

pub fn classify(signal: &FailureSignal<'_>) -> Classification {
    let lowered = signal.message.to_lowercase();
    RULES
        .iter()
        .find(|rule| rule.matcher.matches(signal, &lowered))
        .unwrap_or(&FALLBACK)
        .into()
}

impl ProxyError {
    fn signal(&self) -> (Option<String>, Option<u16>) {
        match self {
            ProxyError::MissingApiKey | ProxyError::InvalidApiKey => (None, Some(401)),
            ProxyError::UnknownService { .. } | ProxyError::RouteNotFound { .. } => {
                (None, Some(404))
            }
            ProxyError::InvalidRequestBody(_)
            | ProxyError::Conversion(_)
            | ProxyError::UnsupportedRoute { .. } => (None, Some(400)),
            ProxyError::RequestTooLarge { .. } => (None, Some(413)),
            ProxyError::Upstream { status, .. } => (None, Some(*status)),
            ProxyError::Transport { code, .. } => (Some(code.to_string()), None),
            ProxyError::RetriesExhausted { last, .. } => last.signal(),
            ProxyError::Overloaded { .. } => (Some("OVERLOADED".to_string()), None),
            ProxyError::NotConfigured(_) => (Some("NOT_CONFIGURED".to_string()), None),
            ProxyError::Internal(_) => (None, None),
        }
    }

    /// Classify through the rule table; exhausted retries are always network errors
    pub fn classify(&self) -> Classification {
        let (code, status) = self.signal();
        let message = self.to_string();
        let mut classification = classify(&FailureSignal {
            code: code.as_deref(),
            status,
            message: &message,
        });

        if let ProxyError::RetriesExhausted { .. } = self {
            classification.error_type = ErrorType::Network;
            classification.severity = Severity::Error;
        }
        classification
    }
}
