//! Hearthlink agent runtime.
//!
//! The concurrency and lifecycle core of a local agent: a dependency
//! container that builds long-lived singletons, an event bus that decouples
//! producers from consumers, a durable memory store, and a model manager
//! that loads, serves and hot-swaps models while calls are in flight. The
//! orchestrator ties them together in a single reactive loop.
//!
//! # Composition
//!
//! [`runtime::Runtime`] is the composition root. It registers, in dependency
//! order:
//!
//! - [`bus::EventBus`]: topic-based publish/subscribe, sequential delivery
//!   per topic
//! - [`memory::MemoryStore`]: interaction and task records in SQLite
//! - [`models::ModelManager`]: discovery, single-flight loads, leases, swap
//! - [`orchestrator::Orchestrator`]: trigger handling, context, inference,
//!   write-back

pub mod bus;
pub mod cli;
pub mod config;
pub mod container;
pub mod memory;
pub mod models;
pub mod orchestrator;
pub mod runtime;
pub mod shutdown;
pub mod telemetry;

pub use config::Config;
pub use runtime::{Runtime, RuntimeError, RuntimeOverrides};
