//! Consistency-Group Snapshot Module
//!
//! Write-order consistent snapshots across several flexvols, per-member
//! clones out of the snapshot, and teardown that defers deletion of busy
//! snapshots instead of retrying inline.
//!
//! # Lifecycle
//!
//! ```text
//! create_group_snapshot ──► clone_member (each, concurrently) ──► teardown
//!                                                                  │
//!                                      not busy ◄──── busy poll ───┤
//!                                          │                       │ still busy
//!                                   delete_snapshot     mark_snapshot_for_deletion
//! ```

pub mod coordinator;

pub use coordinator::*;
