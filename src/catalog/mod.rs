//! Storage Service Catalog Module
//!
//! Periodically rebuilt map of backing flexvols to exported pools, enriched
//! with capacity and capability metadata. Readers always see a complete
//! published generation; refreshes swap the whole map at once.

pub mod events;
pub mod ssc;

pub use events::*;
pub use ssc::*;
