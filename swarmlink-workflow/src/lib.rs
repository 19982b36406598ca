//! # Swarmlink Workflow Layer
//!
//! Coordinates a named set of agents over a chosen protocol: mesh nodes
//! execute distributed per capability, the router fans out sub-tasks to
//! hosted workers, and consensus clusters vote before executing locally.

pub mod agent;
pub mod workflow;

pub use agent::Agent;
pub use workflow::{CoordinatedWorkflow, WorkflowConfig};
