//! In-memory storage layer for the Horde build scheduler.
//!
//! Jobs and graphs are held in process memory; templates, changes and agent
//! pools come from static configuration.

pub mod pools;
pub mod providers;
pub mod repositories;

pub use pools::{PoolConfig, StaticPoolDirectory};
pub use providers::{ChangeContents, MemoryCommitSource, MemoryTemplateProvider};
pub use repositories::*;
