//! Canonical error records and the sinks they are delivered to
//!
//! Every failure in the proxy becomes a [`CanonicalErrorRecord`] through the
//! [`ErrorHandler`], which persists it, notifies the UI, keeps it in a
//! bounded history and feeds it to the intelligence pipeline.

pub mod handler;
pub mod history;
pub mod logger;
pub mod notifier;
pub mod record;

pub use handler::{ErrorHandler, SharedRecord};
pub use history::ErrorHistory;
pub use logger::{ErrorLogger, JsonLinesErrorLogger, TracingErrorLogger};
pub use notifier::ErrorNotifier;
pub use record::{
    CanonicalErrorRecord, ErrorContext, ErrorInfo, ErrorType, Fingerprint, OriginalError,
    Severity,
};
