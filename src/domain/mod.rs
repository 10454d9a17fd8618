//! Domain Module
//!
//! Collaborator ports, naming conventions and cleanup fallback chains
//! shared by every component.

pub mod fallback;
pub mod naming;
pub mod ports;
