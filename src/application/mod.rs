//! Process-level wiring and lifecycle
//!
//! [`AppContext`] builds every long-lived component once; [`Application`]
//! starts them, waits for Ctrl-C and stops them again.

pub mod app;
pub mod context;

pub use app::Application;
pub use context::AppContext;
