//! In-memory simulated cluster
//!
//! A deterministic stand-in for the storage controller and the share mount
//! layer. Used by the binary for dry runs and by every test in the crate.
//! Calls never suspend, so paused-time tests advance the clock freely.

pub mod cluster;

pub use cluster::{InMemoryCluster, SimOp};
