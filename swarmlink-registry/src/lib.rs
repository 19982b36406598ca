//! # Swarmlink Registry & Coordination Services
//!
//! The process-wide protocol catalog (constructors, metadata, weakly-held
//! live instances), the adaptive coordination-mode selector, and the
//! in-process bridge that lets protocols exchange traffic.

pub mod bridge;
pub mod registry;
pub mod selector;

pub use bridge::{BridgeStatus, MeshAdapter, ProtocolAdapter, ProtocolBridge, TransformFn};
pub use registry::{
    CoordinationType, ProtocolConstructor, ProtocolMetadata, ProtocolRegistry, RegistryStats,
};
pub use selector::{AdaptiveModeSelector, ModeDecision, ModeStats, SelectionContext};
