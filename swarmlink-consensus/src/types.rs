//! Core types for the consensus protocol: proposals, votes, the consensus
//! variants with their threshold arithmetic, and the pluggable vote and
//! work-verification policies.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Consensus variants with different agreement rules.
///
/// The threshold function lives on the variant so new rules slot in
/// without conditional ladders spread across the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusType {
    /// Accept or reject at floor(N/2)+1.
    SimpleMajority,
    /// Accept at ceil(threshold·N); reject once acceptance is unreachable.
    Byzantine,
    /// Only the elected leader declares outcomes, by simple majority.
    Raft,
    /// First verified work reply decides.
    ProofOfWork,
}

/// Inputs the threshold function needs beyond raw counts.
#[derive(Debug, Clone, Copy)]
pub struct ThresholdContext {
    /// Active-node snapshot (proposer included) taken at proposal creation.
    pub total_nodes: usize,
    /// Byzantine super-majority fraction (default 0.67).
    pub byzantine_threshold: f64,
    /// Whether the evaluating node currently holds the Raft leader role.
    pub is_leader: bool,
}

impl ConsensusType {
    /// Evaluate the tally. `Some(outcome)` once the variant's threshold is
    /// reached, `None` while the vote is still open.
    ///
    /// Proof-of-work assumes the engine only records verified votes, so
    /// the first recorded vote decides.
    pub fn decision(
        &self,
        accepts: usize,
        rejects: usize,
        votes: usize,
        ctx: &ThresholdContext,
    ) -> Option<bool> {
        let total = ctx.total_nodes;
        match self {
            Self::SimpleMajority => {
                let required = total / 2 + 1;
                if accepts >= required {
                    Some(true)
                } else if rejects >= required {
                    Some(false)
                } else {
                    None
                }
            }
            Self::Byzantine => {
                let required = (total as f64 * ctx.byzantine_threshold).ceil() as usize;
                if accepts >= required {
                    Some(true)
                } else {
                    let outstanding = total.saturating_sub(votes);
                    if accepts + outstanding < required {
                        Some(false)
                    } else {
                        None
                    }
                }
            }
            Self::Raft => {
                if !ctx.is_leader {
                    return None;
                }
                let required = total / 2 + 1;
                if accepts >= required {
                    Some(true)
                } else if rejects >= required {
                    Some(false)
                } else {
                    None
                }
            }
            Self::ProofOfWork => {
                if votes > 0 {
                    Some(accepts > 0)
                } else {
                    None
                }
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SimpleMajority => "simple_majority",
            Self::Byzantine => "byzantine",
            Self::Raft => "raft",
            Self::ProofOfWork => "proof_of_work",
        }
    }
}

/// Status of a consensus proposal. Terminal states are never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Proposed,
    Voting,
    Accepted,
    Rejected,
    Expired,
}

impl ProposalStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Accepted | Self::Rejected | Self::Expired)
    }
}

/// A vote on a proposal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    pub voter_id: String,
    pub proposal_id: Uuid,
    /// true = accept, false = reject.
    pub value: bool,
    pub timestamp: DateTime<Utc>,
    /// Proof-of-work nonce or future cryptographic material.
    pub signature: Option<String>,
}

/// A candidate decision submitted for consensus.
#[derive(Debug, Clone)]
pub struct Proposal {
    pub id: Uuid,
    pub proposer_id: String,
    pub content: Value,
    pub status: ProposalStatus,
    pub votes: HashMap<String, Vote>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub consensus_type: ConsensusType,
    /// Active-node count (self included) when the proposal was created;
    /// caps the vote set and anchors the threshold arithmetic.
    pub active_at_creation: usize,
}

impl Proposal {
    pub fn new(
        proposer_id: impl Into<String>,
        content: Value,
        consensus_type: ConsensusType,
        active_at_creation: usize,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            proposer_id: proposer_id.into(),
            content,
            status: ProposalStatus::Proposed,
            votes: HashMap::new(),
            created_at: now,
            expires_at: now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(30)),
            consensus_type,
            active_at_creation,
        }
    }

    pub fn add_vote(&mut self, vote: Vote) {
        self.votes.insert(vote.voter_id.clone(), vote);
    }

    /// (accepts, rejects) tally.
    pub fn vote_counts(&self) -> (usize, usize) {
        let accepts = self.votes.values().filter(|vote| vote.value).count();
        (accepts, self.votes.len() - accepts)
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

/// Local policy deciding how this node votes on incoming proposals.
pub trait VotePolicy: Send + Sync {
    fn decide(&self, proposal: &Proposal) -> bool;
}

/// Default policy: accept when the declared resource demand fits, or when
/// complexity stays manageable; accept anything else.
pub struct ResourceVotePolicy;

impl VotePolicy for ResourceVotePolicy {
    fn decide(&self, proposal: &Proposal) -> bool {
        let content = &proposal.content;
        if let Some(required) = content.get("resource_required").and_then(Value::as_f64) {
            let available = content
                .get("resource_available")
                .and_then(Value::as_f64)
                .unwrap_or(100.0);
            return required <= available;
        }
        if let Some(complexity) = content.get("complexity").and_then(Value::as_f64) {
            return complexity < 0.8;
        }
        true
    }
}

/// Verifies the work attached to a proof-of-work vote.
pub trait WorkVerifier: Send + Sync {
    fn verify(&self, proposal_id: &Uuid, vote: &Vote) -> bool;
}

/// Default verifier: the vote's signature must be a nonce whose blake3
/// digest over `proposal_id ‖ nonce` clears a leading-zero-bit difficulty.
pub struct Blake3WorkVerifier {
    difficulty_bits: u32,
}

impl Blake3WorkVerifier {
    pub fn new(difficulty_bits: u32) -> Self {
        Self { difficulty_bits }
    }
}

impl WorkVerifier for Blake3WorkVerifier {
    fn verify(&self, proposal_id: &Uuid, vote: &Vote) -> bool {
        match vote.signature.as_deref() {
            Some(nonce) => {
                leading_zero_bits(&work_digest(proposal_id, nonce)) >= self.difficulty_bits
            }
            None => false,
        }
    }
}

fn work_digest(proposal_id: &Uuid, nonce: &str) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(proposal_id.as_bytes());
    hasher.update(nonce.as_bytes());
    *hasher.finalize().as_bytes()
}

fn leading_zero_bits(digest: &[u8; 32]) -> u32 {
    let mut bits = 0;
    for byte in digest {
        if *byte == 0 {
            bits += 8;
        } else {
            bits += byte.leading_zeros();
            break;
        }
    }
    bits
}

/// Brute-force a nonce satisfying the default verifier at `difficulty_bits`.
pub fn solve_work(proposal_id: &Uuid, difficulty_bits: u32) -> String {
    let mut counter: u64 = 0;
    loop {
        let nonce = counter.to_string();
        if leading_zero_bits(&work_digest(proposal_id, &nonce)) >= difficulty_bits {
            return nonce;
        }
        counter += 1;
    }
}

/// Consensus tuning knobs.
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    /// Minimum cluster size (self included) before `propose` is allowed.
    pub min_nodes: usize,
    /// Default wait for a proposal to reach consensus.
    pub proposal_timeout: Duration,
    /// Base Raft election timeout; actual timers randomize in [base, 2·base].
    pub election_timeout: Duration,
    /// Leader heartbeat cadence; must undercut the election timeout.
    pub leader_heartbeat_interval: Duration,
    /// Peer-liveness heartbeat cadence.
    pub heartbeat_interval: Duration,
    /// Byzantine super-majority fraction.
    pub byzantine_threshold: f64,
    /// Expiry-scan cadence.
    pub expiry_interval: Duration,
    /// Terminal proposals older than this are dropped.
    pub proposal_retention: Duration,
    /// Difficulty of the default proof-of-work puzzle.
    pub pow_difficulty_bits: u32,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            min_nodes: 3,
            proposal_timeout: Duration::from_secs(30),
            election_timeout: Duration::from_secs(10),
            leader_heartbeat_interval: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(10),
            byzantine_threshold: 0.67,
            expiry_interval: Duration::from_secs(1),
            proposal_retention: Duration::from_secs(3600),
            pow_difficulty_bits: 8,
        }
    }
}

/// Snapshot returned by `ConsensusProtocol::stats`.
#[derive(Debug, Clone, Serialize)]
pub struct ConsensusStats {
    pub consensus_type: &'static str,
    pub current_leader: Option<String>,
    pub current_term: u64,
    pub active_proposals: usize,
    pub total_proposals: usize,
    pub proposals_created: u64,
    pub proposals_accepted: u64,
    pub proposals_rejected: u64,
    pub proposals_expired: u64,
    /// Peer votes received and recorded by this node.
    pub votes_cast: u64,
    pub elections_held: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(total: usize) -> ThresholdContext {
        ThresholdContext {
            total_nodes: total,
            byzantine_threshold: 0.67,
            is_leader: false,
        }
    }

    #[test]
    fn simple_majority_thresholds() {
        let kind = ConsensusType::SimpleMajority;
        assert_eq!(kind.decision(2, 0, 2, &ctx(5)), None);
        assert_eq!(kind.decision(3, 0, 3, &ctx(5)), Some(true));
        assert_eq!(kind.decision(1, 3, 4, &ctx(5)), Some(false));
    }

    #[test]
    fn byzantine_accepts_at_super_majority() {
        let kind = ConsensusType::Byzantine;
        // ceil(0.67 * 5) = 4
        assert_eq!(kind.decision(3, 1, 4, &ctx(5)), None);
        assert_eq!(kind.decision(4, 1, 5, &ctx(5)), Some(true));
    }

    #[test]
    fn byzantine_rejects_when_acceptance_unreachable() {
        let kind = ConsensusType::Byzantine;
        // 1 accept, 3 rejects, 1 outstanding: max accepts = 2 < 4.
        assert_eq!(kind.decision(1, 3, 4, &ctx(5)), Some(false));
        // 3 accepts, 1 reject, 1 outstanding: could still reach 4.
        assert_eq!(kind.decision(3, 1, 4, &ctx(5)), None);
    }

    #[test]
    fn raft_requires_leader_role() {
        let kind = ConsensusType::Raft;
        assert_eq!(kind.decision(3, 0, 3, &ctx(5)), None);
        let leader_ctx = ThresholdContext {
            is_leader: true,
            ..ctx(5)
        };
        assert_eq!(kind.decision(3, 0, 3, &leader_ctx), Some(true));
    }

    #[test]
    fn proof_of_work_first_vote_decides() {
        let kind = ConsensusType::ProofOfWork;
        assert_eq!(kind.decision(0, 0, 0, &ctx(5)), None);
        assert_eq!(kind.decision(1, 0, 1, &ctx(5)), Some(true));
        assert_eq!(kind.decision(0, 1, 1, &ctx(5)), Some(false));
    }

    #[test]
    fn default_policy_votes_on_resources_then_complexity() {
        let proposal = |content: Value| {
            Proposal::new("n1", content, ConsensusType::SimpleMajority, 3, Duration::from_secs(30))
        };
        let policy = ResourceVotePolicy;

        assert!(policy.decide(&proposal(
            json!({"resource_required": 80, "resource_available": 100})
        )));
        assert!(!policy.decide(&proposal(
            json!({"resource_required": 150, "resource_available": 100})
        )));
        assert!(policy.decide(&proposal(json!({"complexity": 0.5}))));
        assert!(!policy.decide(&proposal(json!({"complexity": 0.9}))));
        assert!(policy.decide(&proposal(json!({"action": "noop"}))));
    }

    #[test]
    fn solved_work_verifies_and_junk_does_not() {
        let proposal_id = Uuid::new_v4();
        let verifier = Blake3WorkVerifier::new(8);
        let nonce = solve_work(&proposal_id, 8);

        let vote = |signature: Option<String>| Vote {
            voter_id: "n2".to_string(),
            proposal_id,
            value: true,
            timestamp: Utc::now(),
            signature,
        };

        assert!(verifier.verify(&proposal_id, &vote(Some(nonce))));
        assert!(!verifier.verify(&proposal_id, &vote(Some("not-work".to_string()))));
        assert!(!verifier.verify(&proposal_id, &vote(None)));
    }
}
