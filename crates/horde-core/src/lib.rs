//! Horde Core
//!
//! Graph and job model for the build scheduler: identifiers, the immutable
//! build graph, the job state machine, label aggregation and the port traits
//! implemented by storage and notification adapters.

pub mod error;
pub mod events;
pub mod graph;
pub mod ids;
pub mod job;
pub mod label;
pub mod ports;

pub use error::{Error, Result};
pub use ids::*;
