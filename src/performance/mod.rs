//! Performance Module
//!
//! Rolling per-node controller utilization feeding the per-pool
//! utilization figure of the pool stats.

pub mod sampler;

pub use sampler::*;
