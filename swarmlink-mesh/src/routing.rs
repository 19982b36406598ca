//! Distance-vector routing entries for the mesh overlay.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A known path to a mesh peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshRoute {
    pub target: String,
    /// Direct connection the message leaves through.
    pub next_hop: String,
    /// Hop count to the target.
    pub distance: u32,
    pub last_updated: DateTime<Utc>,
}

impl MeshRoute {
    pub fn new(target: impl Into<String>, next_hop: impl Into<String>, distance: u32) -> Self {
        Self {
            target: target.into(),
            next_hop: next_hop.into(),
            distance,
            last_updated: Utc::now(),
        }
    }

    /// Whether `candidate` should replace this entry.
    pub fn is_improved_by(&self, candidate: &MeshRoute) -> bool {
        candidate.distance <= self.distance
    }
}
