//! Error intelligence: prediction, context analysis, recovery and health
//!
//! Records handled by the [`ErrorHandler`](crate::diagnostics::ErrorHandler)
//! are fed to the stages here by the [`IntelligencePipeline`]. The
//! [`HealthMonitor`] runs on its own timers and is also poked by critical
//! predictions.

pub mod context_analyzer;
pub mod health;
pub mod pipeline;
pub mod predictor;
pub mod recovery;

pub use context_analyzer::{ContextAnalysis, ContextAnalyzer, RiskLevel};
pub use health::{HealthMonitor, HealthSnapshot, HealthStatus, SysinfoSource};
pub use pipeline::IntelligencePipeline;
pub use predictor::{ErrorPredictor, Prediction, PredictionRisk};
pub use recovery::{AutoRecoveryManager, RecoveryReport};
