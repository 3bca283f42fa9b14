//! LLM Bridge - an API-translation proxy with error intelligence
//!
//! The proxy accepts requests in one vendor wire format, routes them to a
//! configured backend and translates bodies both ways. Every failure on the
//! way becomes a canonical error record that is predicted on, analyzed and,
//! where possible, recovered from in the background.

pub mod application;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod intelligence;
pub mod providers;
pub mod proxy;

pub use application::{AppContext, Application};
pub use error::{Error, Result};
