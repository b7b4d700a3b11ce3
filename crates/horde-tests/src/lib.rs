//! Integration test infrastructure for the Horde build scheduler.
//!
//! Wires the scheduler to the in-memory stores and provides graph fixtures
//! and helpers for driving batches and steps the way an agent would.
//!
//! # Usage
//!
//! ```ignore
//! use horde_tests::TestContext;
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let ctx = TestContext::new().await;
//!     // Use ctx.service, ctx.task_source, ctx.sink, etc.
//! }
//! ```

pub mod context;
pub mod fixtures;
pub mod helpers;

pub use context::TestContext;
pub use fixtures::*;
pub use helpers::*;

/// Initialize test logging (call once per test binary).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,horde_tests=debug")),
        )
        .with_test_writer()
        .try_init();
}
