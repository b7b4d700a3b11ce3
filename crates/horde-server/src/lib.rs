//! Horde scheduler server.
//!
//! Loads configuration, wires the in-memory stores into the scheduler and
//! runs the task source until shutdown.

pub mod app;
pub mod config;
pub mod telemetry;

pub use app::Server;
pub use config::ServerConfig;
