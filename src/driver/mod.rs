//! Driver Module
//!
//! The volume backend surface: startup and periodic tasks, storage-assisted
//! migration, backing file deletion, group workflows, image cache copies and
//! backend stats.
//!
//! # Startup
//!
//! ```text
//!   connect ──▶ bootstrap (catalog refresh, FlexGroup check)
//!                   │
//!                   ▼
//!          start_periodic_tasks
//!            ├── housekeeping      every 10 min, first run immediately
//!            └── catalog refresh   every hour
//! ```

pub mod backend;
pub mod tasks;
pub mod types;

pub use backend::{CmodeNfsBackend, VolumeBackend};
pub use tasks::spawn_periodic;
pub use types::*;
