//! Catalog Events
//!
//! Events emitted by the catalog so other components can react to a newly
//! published generation.

use serde::{Deserialize, Serialize};

/// Events emitted by the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CatalogEvent {
    /// A container was left out of the generation being built
    ContainerDropped { container: String, reason: String },

    /// A new generation was published
    Refreshed {
        generation: u64,
        published: usize,
        dropped: usize,
    },
}

impl CatalogEvent {
    /// Generation number for refresh events
    pub fn generation(&self) -> Option<u64> {
        match self {
            CatalogEvent::Refreshed { generation, .. } => Some(*generation),
            CatalogEvent::ContainerDropped { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_generation() {
        let event = CatalogEvent::Refreshed {
            generation: 3,
            published: 2,
            dropped: 1,
        };
        assert_eq!(event.generation(), Some(3));

        let event = CatalogEvent::ContainerDropped {
            container: "vol1".into(),
            reason: "timeout".into(),
        };
        assert_eq!(event.generation(), None);
    }
}
