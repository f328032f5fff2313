//! turnstress -- concurrent STUN/TURN relay load tester.
//!
//! This crate drives many simulated client sessions against a relay server,
//! either through one relay allocation per session or through a pair of
//! allocations relaying to each other, and reports throughput, loss,
//! latency and achieved concurrency.

pub mod config;
pub mod credentials;
pub mod monitor;
pub mod orchestrator;
pub mod probe;
pub mod relay;
pub mod stats;

pub use config::RunConfig;
pub use orchestrator::{Orchestrator, RunError};
pub use stats::RunSummary;
