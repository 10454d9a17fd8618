//! Pool Stats Module
//!
//! Turns the catalog, live capacity and node utilization into the ranked
//! pool records handed to the external scheduler.

pub mod aggregator;

pub use aggregator::*;
