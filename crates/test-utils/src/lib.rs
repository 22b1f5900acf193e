//! Shared test utilities for the catapult crates.
//!
//! This crate provides:
//! - [`MockEngine`]: a scriptable in-memory ComfyUI that records every call
//! - [`fixtures`]: workflows, tickets, history entries and event frames
//!
//! # Example
//!
//! ```rust,ignore
//! use catapult_test_utils::{fixtures, MockEngine};
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let engine = Arc::new(MockEngine::new());
//!     engine.set_history("p1", fixtures::history_entry("p1", &["9"], &["9"]));
//!     // ... start a Catapult on `engine` ...
//! }
//! ```

#![forbid(unsafe_code)]
// Test utilities panic on misuse; that is what a test wants.
#![allow(clippy::unwrap_used)]

pub mod engine;
pub mod fixtures;

pub use engine::{EngineCall, MockEngine};

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("catapult_jobs=debug".parse().unwrap()),
        )
        .with_test_writer()
        .try_init();
}
