//! # Swarmlink Consensus
//!
//! Decentralized coordination: proposals broadcast to the cluster, votes
//! returned to the proposer, and a threshold function per consensus
//! variant — simple majority, Byzantine super-majority, Raft (leader-only
//! declaration plus randomized-timer elections), and proof-of-work (first
//! verified reply decides).

pub mod engine;
pub mod types;

pub use engine::{ConsensusProtocol, PROTOCOL_NAME};
pub use types::{
    solve_work, Blake3WorkVerifier, ConsensusConfig, ConsensusStats, ConsensusType, Proposal,
    ProposalStatus, ResourceVotePolicy, ThresholdContext, Vote, VotePolicy, WorkVerifier,
};
