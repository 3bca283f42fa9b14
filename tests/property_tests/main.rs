//! Property-based tests for the wire-format converter
//!
//! Run with: cargo test --test property_tests

mod format_passthrough;
