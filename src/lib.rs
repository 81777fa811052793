//! Update orchestration for Docker containers and Swarm services.
//!
//! Scans find newer images, policies decide whether an update waits for
//! approval or runs straight away, and the engine applies it with a
//! snapshot to roll back to. Containers on other hosts are updated by an
//! agent running there.

pub mod config;
pub mod controller;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod events;
pub mod graph;
pub mod guard;
pub mod hooks;
pub mod policy;
pub mod queue;
pub mod remote;
pub mod runtime;
pub mod snapshot;
pub mod store;
pub mod types;
pub mod worker;

#[cfg(test)]
pub mod testing;

pub use controller::{Controller, ScanReport};
pub use error::{EngineError, Result};
