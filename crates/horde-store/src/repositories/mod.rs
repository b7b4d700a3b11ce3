//! Repository implementations.

mod graph;
mod job;

pub use graph::MemoryGraphRepository;
pub use job::MemoryJobRepository;
