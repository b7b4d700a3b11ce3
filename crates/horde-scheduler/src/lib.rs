//! Job scheduling for the Horde build system.
//!
//! The [`collection::JobCollection`] applies job transitions with optimistic
//! concurrency, the [`task_source::TaskSource`] hands ready batches to agents,
//! and the [`service::JobService`] drives the job lifecycle on top of both.

pub mod collection;
pub mod config;
pub mod graph_builder;
pub mod service;
pub mod task_source;

#[cfg(test)]
mod test_support;

pub use collection::JobCollection;
pub use config::SchedulerConfig;
pub use graph_builder::{
    GraphBuilder, GraphError, NewArtifact, NewGroup, NewLabel, NewNode, SETUP_NODE_NAME,
};
pub use service::{JobService, StartJobRequest};
pub use task_source::{TaskAssignment, TaskSource, TickSummary};
