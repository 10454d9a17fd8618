//! Remote Copy Module
//!
//! Starts controller-side file copy jobs between flexvols, polls them to a
//! terminal state under a hard deadline, and cleans up after timeouts.
//!
//! # Job lifecycle
//!
//! ```text
//!   running ──complete──▶ complete
//!      │
//!      ├──failure / destroy──▶ destroyed
//!      │
//!      └──timeout──▶ [cancel] ──▶ destroyed | abandoned
//! ```
//!
//! No transition leaves `complete`, `destroyed` or `abandoned`.

pub mod job;
pub mod orchestrator;

pub use job::*;
pub use orchestrator::*;
