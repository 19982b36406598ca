//! Decentralized consensus engine.
//!
//! Proposals are broadcast to the cluster; peers vote through a local
//! policy and return votes straight to the proposer, which finalizes once
//! the consensus variant's threshold is met. Raft mode adds leader election
//! with randomized timers and leader heartbeats.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use swarmlink_protocol::{
    HandlerFn, MessageBus, MessageType, NetworkStatus, NodeStatus, Protocol, ProtocolCore,
    ProtocolError, ProtocolMessage,
};

use crate::types::{
    solve_work, Blake3WorkVerifier, ConsensusConfig, ConsensusStats, ConsensusType, Proposal,
    ProposalStatus, ResourceVotePolicy, ThresholdContext, Vote, VotePolicy, WorkVerifier,
};

pub const PROTOCOL_NAME: &str = "consensus";

type DecisionSender = oneshot::Sender<Result<bool, ProtocolError>>;

#[derive(Default)]
struct Metrics {
    proposals_created: AtomicU64,
    proposals_accepted: AtomicU64,
    proposals_rejected: AtomicU64,
    proposals_expired: AtomicU64,
    votes_cast: AtomicU64,
    elections_held: AtomicU64,
}

/// In-flight Raft election bookkeeping.
struct ElectionState {
    term: u64,
    granted: HashSet<String>,
    /// Active-node snapshot (self included) when the election started.
    snapshot: usize,
}

struct ConsensusInner {
    core: Arc<ProtocolCore>,
    config: ConsensusConfig,
    consensus_type: ConsensusType,
    proposals: DashMap<Uuid, Proposal>,
    waiters: DashMap<Uuid, DecisionSender>,
    forward_waiters: DashMap<Uuid, DecisionSender>,
    term: AtomicU64,
    leader: RwLock<Option<String>>,
    last_leader_contact: Mutex<Instant>,
    election: Mutex<Option<ElectionState>>,
    vote_policy: RwLock<Arc<dyn VotePolicy>>,
    work_verifier: RwLock<Arc<dyn WorkVerifier>>,
    metrics: Metrics,
}

/// Decentralized consensus protocol node.
pub struct ConsensusProtocol {
    inner: Arc<ConsensusInner>,
}

impl ConsensusProtocol {
    pub fn new(
        node_id: impl Into<String>,
        bus: Arc<MessageBus>,
        consensus_type: ConsensusType,
    ) -> Arc<Self> {
        Self::with_config(node_id, bus, consensus_type, ConsensusConfig::default())
    }

    pub fn with_config(
        node_id: impl Into<String>,
        bus: Arc<MessageBus>,
        consensus_type: ConsensusType,
        config: ConsensusConfig,
    ) -> Arc<Self> {
        let core = ProtocolCore::new(node_id, PROTOCOL_NAME, bus);
        let verifier = Blake3WorkVerifier::new(config.pow_difficulty_bits);
        let inner = Arc::new(ConsensusInner {
            core,
            config,
            consensus_type,
            proposals: DashMap::new(),
            waiters: DashMap::new(),
            forward_waiters: DashMap::new(),
            term: AtomicU64::new(0),
            leader: RwLock::new(None),
            last_leader_contact: Mutex::new(Instant::now()),
            election: Mutex::new(None),
            vote_policy: RwLock::new(Arc::new(ResourceVotePolicy)),
            work_verifier: RwLock::new(Arc::new(verifier)),
            metrics: Metrics::default(),
        });
        ConsensusInner::register_handlers(&inner);
        Arc::new(Self { inner })
    }

    /// Replace the local voting policy.
    pub fn set_vote_policy(&self, policy: Arc<dyn VotePolicy>) {
        *self.inner.vote_policy.write() = policy;
    }

    /// Replace the proof-of-work verification predicate.
    pub fn set_work_verifier(&self, verifier: Arc<dyn WorkVerifier>) {
        *self.inner.work_verifier.write() = verifier;
    }

    /// Submit a decision for consensus; resolves to the cluster's verdict.
    ///
    /// Fails with `InsufficientNodes` before any message is sent when the
    /// active cluster is below `min_nodes`. In Raft mode a non-leader
    /// forwards the content to the known leader.
    pub async fn propose(
        &self,
        content: Value,
        timeout: Option<Duration>,
    ) -> Result<bool, ProtocolError> {
        let inner = &self.inner;
        if !inner.core.is_running() {
            return Err(ProtocolError::NotRunning);
        }

        let available = inner.core.active_nodes().len() + 1;
        if available < inner.config.min_nodes {
            return Err(ProtocolError::InsufficientNodes {
                available,
                required: inner.config.min_nodes,
            });
        }

        let wait = timeout.unwrap_or(inner.config.proposal_timeout);

        if inner.consensus_type == ConsensusType::Raft {
            let leader = inner.leader.read().clone();
            if let Some(leader) = leader {
                if leader != inner.core.node_id() {
                    return inner.forward_to_leader(&leader, content, wait).await;
                }
            }
            // No leader yet: proceed locally; without a leader the proposal
            // can only expire, never fabricate acceptance.
        }

        let proposal = Proposal::new(
            inner.core.node_id(),
            content,
            inner.consensus_type,
            available,
            wait,
        );
        let proposal_id = proposal.id;
        let broadcast = inner.serialize_proposal(&proposal);

        inner.proposals.insert(proposal_id, proposal);
        inner.metrics.proposals_created.fetch_add(1, Ordering::Relaxed);

        let (tx, rx) = oneshot::channel();
        inner.waiters.insert(proposal_id, tx);

        info!(
            event = "proposal_created",
            protocol = PROTOCOL_NAME,
            node = inner.core.node_id(),
            proposal_id = %proposal_id,
            consensus_type = inner.consensus_type.as_str(),
            "proposal broadcast to cluster"
        );
        inner.core.broadcast_all(
            ProtocolMessage::new(MessageType::Consensus, inner.core.node_id())
                .with_field("action", json!("propose"))
                .with_field("proposal", broadcast),
        );

        // The proposer backs its own proposal; proof-of-work peers must
        // present work instead, so the proposer abstains there.
        if inner.consensus_type != ConsensusType::ProofOfWork {
            let self_vote = Vote {
                voter_id: inner.core.node_id().to_string(),
                proposal_id,
                value: true,
                timestamp: Utc::now(),
                signature: None,
            };
            inner.record_vote(proposal_id, self_vote, false);
        }

        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ProtocolError::ShuttingDown),
            Err(_) => {
                inner.waiters.remove(&proposal_id);
                inner.expire_proposal(proposal_id);
                Err(ProtocolError::timeout(format!(
                    "consensus not reached for proposal {proposal_id}"
                )))
            }
        }
    }

    /// Current Raft leader, if one is known.
    pub fn leader(&self) -> Option<String> {
        self.inner.leader.read().clone()
    }

    /// Current Raft term.
    pub fn term(&self) -> u64 {
        self.inner.term.load(Ordering::SeqCst)
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> ConsensusStats {
        let inner = &self.inner;
        let active_proposals = inner
            .proposals
            .iter()
            .filter(|proposal| !proposal.status.is_terminal())
            .count();
        ConsensusStats {
            consensus_type: inner.consensus_type.as_str(),
            current_leader: inner.leader.read().clone(),
            current_term: inner.term.load(Ordering::SeqCst),
            active_proposals,
            total_proposals: inner.proposals.len(),
            proposals_created: inner.metrics.proposals_created.load(Ordering::Relaxed),
            proposals_accepted: inner.metrics.proposals_accepted.load(Ordering::Relaxed),
            proposals_rejected: inner.metrics.proposals_rejected.load(Ordering::Relaxed),
            proposals_expired: inner.metrics.proposals_expired.load(Ordering::Relaxed),
            votes_cast: inner.metrics.votes_cast.load(Ordering::Relaxed),
            elections_held: inner.metrics.elections_held.load(Ordering::Relaxed),
        }
    }

    /// Status of a proposal, if still tracked.
    pub fn proposal_status(&self, proposal_id: Uuid) -> Option<ProposalStatus> {
        self.inner
            .proposals
            .get(&proposal_id)
            .map(|proposal| proposal.status)
    }

    /// Ids of every proposal currently tracked.
    pub fn tracked_proposal_ids(&self) -> Vec<Uuid> {
        self.inner
            .proposals
            .iter()
            .map(|proposal| proposal.id)
            .collect()
    }
}

impl ConsensusInner {
    fn register_handlers(inner: &Arc<Self>) {
        let weak = Arc::downgrade(inner);
        inner
            .core
            .register_handler(MessageType::Consensus, consensus_handler(weak));
    }

    fn serialize_proposal(&self, proposal: &Proposal) -> Value {
        json!({
            "id": proposal.id,
            "proposer_id": proposal.proposer_id,
            "content": proposal.content,
            "consensus_type": proposal.consensus_type,
            "created_at": proposal.created_at,
            "expires_at": proposal.expires_at,
        })
    }

    fn deserialize_proposal(&self, data: &Value) -> Option<Proposal> {
        let id = data.get("id")?.as_str().and_then(|raw| Uuid::parse_str(raw).ok())?;
        let proposer_id = data.get("proposer_id")?.as_str()?.to_string();
        let consensus_type: ConsensusType =
            serde_json::from_value(data.get("consensus_type")?.clone()).ok()?;
        let created_at = serde_json::from_value(data.get("created_at")?.clone()).ok()?;
        let expires_at = serde_json::from_value(data.get("expires_at")?.clone()).ok()?;
        Some(Proposal {
            id,
            proposer_id,
            content: data.get("content").cloned().unwrap_or(Value::Null),
            status: ProposalStatus::Voting,
            votes: std::collections::HashMap::new(),
            created_at,
            expires_at,
            consensus_type,
            active_at_creation: self.core.active_nodes().len() + 1,
        })
    }

    /// Peer side: store the proposal, consult the local policy, and send
    /// the vote straight back to the proposer.
    fn handle_proposal(&self, message: &ProtocolMessage) {
        let Some(data) = message.content.get("proposal") else {
            return;
        };
        let Some(proposal) = self.deserialize_proposal(data) else {
            warn!(
                event = "proposal_malformed",
                protocol = PROTOCOL_NAME,
                node = self.core.node_id(),
                peer = %message.sender,
                "undecodable proposal"
            );
            return;
        };
        if proposal.proposer_id == self.core.node_id()
            || self.proposals.contains_key(&proposal.id)
        {
            return;
        }

        let proposal_id = proposal.id;
        let proposer = proposal.proposer_id.clone();
        let value = self.vote_policy.read().decide(&proposal);
        let signature = if proposal.consensus_type == ConsensusType::ProofOfWork {
            Some(solve_work(&proposal_id, self.config.pow_difficulty_bits))
        } else {
            None
        };
        self.proposals.insert(proposal_id, proposal);

        debug!(
            event = "vote_sent",
            protocol = PROTOCOL_NAME,
            node = self.core.node_id(),
            proposal_id = %proposal_id,
            value,
            "voting on proposal"
        );
        let vote_message = ProtocolMessage::new(MessageType::Consensus, self.core.node_id())
            .with_target(&proposer)
            .with_field("action", json!("vote"))
            .with_field(
                "vote",
                json!({
                    "proposal_id": proposal_id,
                    "value": value,
                    "timestamp": Utc::now(),
                    "signature": signature,
                }),
            );
        if let Err(err) = self.core.send_direct(&proposer, vote_message) {
            debug!(
                event = "vote_undeliverable",
                protocol = PROTOCOL_NAME,
                node = self.core.node_id(),
                proposal_id = %proposal_id,
                error = %err,
                "proposer unreachable"
            );
        }
    }

    /// Proposer side: record an incoming vote and evaluate the threshold.
    fn handle_vote(&self, message: &ProtocolMessage) {
        let Some(data) = message.content.get("vote") else {
            return;
        };
        let Some(proposal_id) = data
            .get("proposal_id")
            .and_then(Value::as_str)
            .and_then(|raw| Uuid::parse_str(raw).ok())
        else {
            return;
        };
        let value = data.get("value").and_then(Value::as_bool).unwrap_or(false);
        let vote = Vote {
            voter_id: message.sender.clone(),
            proposal_id,
            value,
            timestamp: data
                .get("timestamp")
                .and_then(|ts| serde_json::from_value(ts.clone()).ok())
                .unwrap_or_else(Utc::now),
            signature: data
                .get("signature")
                .and_then(Value::as_str)
                .map(str::to_string),
        };
        self.record_vote(proposal_id, vote, true);
    }

    /// Record a vote; `remote` votes count toward the votes-cast metric.
    fn record_vote(&self, proposal_id: Uuid, vote: Vote, remote: bool) {
        let decision = {
            let Some(mut proposal) = self.proposals.get_mut(&proposal_id) else {
                warn!(
                    event = "vote_unknown_proposal",
                    protocol = PROTOCOL_NAME,
                    node = self.core.node_id(),
                    proposal_id = %proposal_id,
                    peer = %vote.voter_id,
                    "vote for unknown proposal"
                );
                return;
            };

            if proposal.consensus_type == ConsensusType::ProofOfWork
                && !self.work_verifier.read().verify(&proposal_id, &vote)
            {
                warn!(
                    event = "work_rejected",
                    protocol = PROTOCOL_NAME,
                    node = self.core.node_id(),
                    proposal_id = %proposal_id,
                    peer = %vote.voter_id,
                    "unverifiable proof-of-work vote ignored"
                );
                return;
            }

            // The vote set never grows past the creation-time snapshot.
            if proposal.votes.len() >= proposal.active_at_creation
                && !proposal.votes.contains_key(&vote.voter_id)
            {
                warn!(
                    event = "vote_capped",
                    protocol = PROTOCOL_NAME,
                    node = self.core.node_id(),
                    proposal_id = %proposal_id,
                    peer = %vote.voter_id,
                    "vote beyond the creation snapshot dropped"
                );
                return;
            }

            proposal.add_vote(vote);
            if remote {
                self.metrics.votes_cast.fetch_add(1, Ordering::Relaxed);
            }
            if proposal.status == ProposalStatus::Proposed {
                proposal.status = ProposalStatus::Voting;
            }
            if proposal.status.is_terminal() {
                None
            } else {
                let (accepts, rejects) = proposal.vote_counts();
                let ctx = ThresholdContext {
                    total_nodes: proposal.active_at_creation,
                    byzantine_threshold: self.config.byzantine_threshold,
                    is_leader: self.leader.read().as_deref() == Some(self.core.node_id()),
                };
                proposal
                    .consensus_type
                    .decision(accepts, rejects, proposal.votes.len(), &ctx)
            }
        };

        if let Some(accepted) = decision {
            self.finalize_proposal(proposal_id, accepted);
        }
    }

    fn finalize_proposal(&self, proposal_id: Uuid, accepted: bool) {
        let tally = {
            let Some(mut proposal) = self.proposals.get_mut(&proposal_id) else {
                return;
            };
            if proposal.status.is_terminal() {
                return;
            }
            proposal.status = if accepted {
                ProposalStatus::Accepted
            } else {
                ProposalStatus::Rejected
            };
            proposal.vote_counts()
        };

        if accepted {
            self.metrics.proposals_accepted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.metrics.proposals_rejected.fetch_add(1, Ordering::Relaxed);
        }
        info!(
            event = "proposal_finalized",
            protocol = PROTOCOL_NAME,
            node = self.core.node_id(),
            proposal_id = %proposal_id,
            accepted,
            accepts = tally.0,
            rejects = tally.1,
            "consensus reached"
        );

        if let Some((_, waiter)) = self.waiters.remove(&proposal_id) {
            let _ = waiter.send(Ok(accepted));
        }

        self.core.broadcast_all(
            ProtocolMessage::new(MessageType::Consensus, self.core.node_id())
                .with_field("action", json!("result"))
                .with_field("proposal_id", json!(proposal_id))
                .with_field(
                    "status",
                    json!(if accepted { "accepted" } else { "rejected" }),
                )
                .with_field("votes", json!({ "accept": tally.0, "reject": tally.1 })),
        );
    }

    /// Peer side: mirror the proposer's final verdict locally.
    fn handle_result(&self, message: &ProtocolMessage) {
        let Some(proposal_id) = message
            .content_str("proposal_id")
            .and_then(|raw| Uuid::parse_str(raw).ok())
        else {
            return;
        };
        let accepted = message.content_str("status") == Some("accepted");
        if let Some(mut proposal) = self.proposals.get_mut(&proposal_id) {
            if !proposal.status.is_terminal() {
                proposal.status = if accepted {
                    ProposalStatus::Accepted
                } else {
                    ProposalStatus::Rejected
                };
            }
        }
    }

    fn expire_proposal(&self, proposal_id: Uuid) {
        let expired = {
            let Some(mut proposal) = self.proposals.get_mut(&proposal_id) else {
                return;
            };
            if proposal.status.is_terminal() {
                false
            } else {
                proposal.status = ProposalStatus::Expired;
                true
            }
        };
        if expired {
            self.metrics.proposals_expired.fetch_add(1, Ordering::Relaxed);
            if let Some((_, waiter)) = self.waiters.remove(&proposal_id) {
                let _ = waiter.send(Err(ProtocolError::timeout("proposal expired")));
            }
        }
    }

    /// One expiry pass: time out overdue proposals, retire old ones.
    fn expire_once(&self) {
        let overdue: Vec<Uuid> = self
            .proposals
            .iter()
            .filter(|proposal| !proposal.status.is_terminal() && proposal.is_expired())
            .map(|proposal| proposal.id)
            .collect();
        for proposal_id in overdue {
            debug!(
                event = "proposal_expired",
                protocol = PROTOCOL_NAME,
                node = self.core.node_id(),
                proposal_id = %proposal_id,
                "proposal passed its deadline"
            );
            self.expire_proposal(proposal_id);
        }

        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.proposal_retention)
                .unwrap_or_else(|_| chrono::Duration::seconds(3600));
        let stale: Vec<Uuid> = self
            .proposals
            .iter()
            .filter(|proposal| proposal.status.is_terminal() && proposal.created_at < cutoff)
            .map(|proposal| proposal.id)
            .collect();
        for proposal_id in stale {
            self.proposals.remove(&proposal_id);
            self.waiters.remove(&proposal_id);
        }
    }

    async fn forward_to_leader(
        &self,
        leader: &str,
        content: Value,
        wait: Duration,
    ) -> Result<bool, ProtocolError> {
        let forward_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.forward_waiters.insert(forward_id, tx);

        debug!(
            event = "proposal_forwarded",
            protocol = PROTOCOL_NAME,
            node = self.core.node_id(),
            peer = leader,
            "forwarding proposal to leader"
        );
        let message = ProtocolMessage::new(MessageType::Consensus, self.core.node_id())
            .with_target(leader)
            .with_field("action", json!("forward_propose"))
            .with_field("forward_id", json!(forward_id))
            .with_field("content", content);
        if let Err(err) = self.core.send_direct(leader, message) {
            self.forward_waiters.remove(&forward_id);
            return Err(err);
        }

        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ProtocolError::ShuttingDown),
            Err(_) => {
                self.forward_waiters.remove(&forward_id);
                Err(ProtocolError::timeout("no outcome from leader"))
            }
        }
    }

    /// Leader side of a forwarded proposal: run it and report back.
    fn handle_forward_propose(inner: &Arc<Self>, message: &ProtocolMessage) {
        let forward_id = message
            .content_str("forward_id")
            .and_then(|raw| Uuid::parse_str(raw).ok());
        let content = message.content.get("content").cloned().unwrap_or(Value::Null);
        let asker = message.sender.clone();
        let inner = Arc::clone(inner);

        tokio::spawn(async move {
            let protocol = ConsensusProtocol {
                inner: Arc::clone(&inner),
            };
            let outcome = protocol.propose(content, None).await;
            let mut reply = ProtocolMessage::new(MessageType::Consensus, inner.core.node_id())
                .with_target(&asker)
                .with_field("action", json!("forward_result"));
            if let Some(forward_id) = forward_id {
                reply = reply.with_field("forward_id", json!(forward_id));
            }
            reply = match outcome {
                Ok(accepted) => reply.with_field("accepted", json!(accepted)),
                Err(err) => reply.with_field("error", json!(err.to_string())),
            };
            let _ = inner.core.send_direct(&asker, reply);
        });
    }

    fn handle_forward_result(&self, message: &ProtocolMessage) {
        let Some(forward_id) = message
            .content_str("forward_id")
            .and_then(|raw| Uuid::parse_str(raw).ok())
        else {
            return;
        };
        let Some((_, waiter)) = self.forward_waiters.remove(&forward_id) else {
            return;
        };
        let outcome = match message.content.get("accepted").and_then(Value::as_bool) {
            Some(accepted) => Ok(accepted),
            None => Err(ProtocolError::failed(
                message
                    .content_str("error")
                    .unwrap_or("leader reported no outcome"),
            )),
        };
        let _ = waiter.send(outcome);
    }

    /// Grant a vote only for strictly greater terms, adopting the term.
    fn handle_vote_request(&self, message: &ProtocolMessage) {
        let request_term = message
            .content
            .get("term")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let current = self.term.load(Ordering::SeqCst);
        if request_term <= current {
            return;
        }
        self.term.store(request_term, Ordering::SeqCst);
        *self.leader.write() = None;
        *self.election.lock() = None;
        // Granting resets the timer so grantees do not immediately duel.
        *self.last_leader_contact.lock() = Instant::now();

        let candidate = message
            .content_str("candidate_id")
            .unwrap_or(&message.sender)
            .to_string();
        let response = ProtocolMessage::new(MessageType::Consensus, self.core.node_id())
            .with_target(&candidate)
            .with_field("action", json!("vote_response"))
            .with_field("term", json!(request_term))
            .with_field("vote_granted", json!(true));
        let _ = self.core.send_direct(&candidate, response);
    }

    fn handle_vote_response(&self, message: &ProtocolMessage) {
        let response_term = message
            .content
            .get("term")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let granted = message
            .content
            .get("vote_granted")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !granted {
            return;
        }

        let won = {
            let mut election = self.election.lock();
            let Some(state) = election.as_mut() else {
                return;
            };
            if state.term != response_term {
                return;
            }
            state.granted.insert(message.sender.clone());
            // Strict majority over the snapshot taken at election start.
            if state.granted.len() > state.snapshot / 2 {
                *election = None;
                true
            } else {
                false
            }
        };

        if won {
            let term = self.term.load(Ordering::SeqCst);
            *self.leader.write() = Some(self.core.node_id().to_string());
            *self.last_leader_contact.lock() = Instant::now();
            info!(
                event = "leader_elected",
                protocol = PROTOCOL_NAME,
                node = self.core.node_id(),
                term,
                "won leader election"
            );
            self.send_leader_heartbeat();
        }
    }

    fn handle_leader_heartbeat(&self, message: &ProtocolMessage) {
        let term = message
            .content
            .get("term")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let current = self.term.load(Ordering::SeqCst);
        if term < current {
            return;
        }
        self.term.store(term, Ordering::SeqCst);
        let leader = message
            .content_str("leader_id")
            .unwrap_or(&message.sender)
            .to_string();
        *self.leader.write() = Some(leader);
        *self.election.lock() = None;
        *self.last_leader_contact.lock() = Instant::now();
    }

    fn send_leader_heartbeat(&self) {
        let term = self.term.load(Ordering::SeqCst);
        self.core.broadcast_all(
            ProtocolMessage::new(MessageType::Consensus, self.core.node_id())
                .with_field("action", json!("leader_heartbeat"))
                .with_field("term", json!(term))
                .with_field("leader_id", json!(self.core.node_id())),
        );
    }

    fn start_election(&self) {
        let term = self.term.fetch_add(1, Ordering::SeqCst) + 1;
        *self.leader.write() = None;
        self.metrics.elections_held.fetch_add(1, Ordering::Relaxed);
        let snapshot = self.core.active_nodes().len() + 1;

        info!(
            event = "election_started",
            protocol = PROTOCOL_NAME,
            node = self.core.node_id(),
            term,
            snapshot,
            "starting leader election"
        );

        let mut granted = HashSet::new();
        granted.insert(self.core.node_id().to_string());

        if snapshot == 1 {
            // Single-node cluster: the self vote is the majority.
            *self.election.lock() = None;
            *self.leader.write() = Some(self.core.node_id().to_string());
            return;
        }

        *self.election.lock() = Some(ElectionState {
            term,
            granted,
            snapshot,
        });
        *self.last_leader_contact.lock() = Instant::now();

        self.core.broadcast_all(
            ProtocolMessage::new(MessageType::Consensus, self.core.node_id())
                .with_field("action", json!("request_vote"))
                .with_field("term", json!(term))
                .with_field("candidate_id", json!(self.core.node_id())),
        );
    }

    fn spawn_expiry_loop(inner: &Arc<Self>, token: CancellationToken) {
        let weak = Arc::downgrade(inner);
        let interval = inner.config.expiry_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        let pass = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                            inner.expire_once();
                        }));
                        if pass.is_err() {
                            error!(
                                event = "expiry_crash",
                                protocol = PROTOCOL_NAME,
                                "expiry pass panicked, backing off"
                            );
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        });
    }

    fn spawn_heartbeat_loop(inner: &Arc<Self>, token: CancellationToken) {
        let weak = Arc::downgrade(inner);
        let interval = inner.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        inner.core.broadcast_all(inner.core.heartbeat_message());
                    }
                }
            }
        });
    }

    fn spawn_election_loop(inner: &Arc<Self>, token: CancellationToken) {
        let weak = Arc::downgrade(inner);
        let base = inner.config.election_timeout;
        let heartbeat_every = inner.config.leader_heartbeat_interval;
        tokio::spawn(async move {
            let check = (base / 8).max(Duration::from_millis(25));
            let mut ticker = tokio::time::interval(check);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut current_timeout = randomized_timeout(base);
            let mut last_heartbeat_sent = Instant::now()
                .checked_sub(heartbeat_every)
                .unwrap_or_else(Instant::now);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        let is_leader =
                            inner.leader.read().as_deref() == Some(inner.core.node_id());
                        if is_leader {
                            if last_heartbeat_sent.elapsed() >= heartbeat_every {
                                inner.send_leader_heartbeat();
                                last_heartbeat_sent = Instant::now();
                            }
                        } else {
                            let silent = inner.last_leader_contact.lock().elapsed();
                            if silent > current_timeout {
                                inner.start_election();
                                current_timeout = randomized_timeout(base);
                            }
                        }
                    }
                }
            }
        });
    }

    fn release_waiters(&self) {
        for table in [&self.waiters, &self.forward_waiters] {
            let ids: Vec<Uuid> = table.iter().map(|entry| *entry.key()).collect();
            for id in ids {
                if let Some((_, waiter)) = table.remove(&id) {
                    let _ = waiter.send(Err(ProtocolError::ShuttingDown));
                }
            }
        }
    }
}

/// Election timers randomize in [base, 2·base] so candidates rarely duel.
fn randomized_timeout(base: Duration) -> Duration {
    let base_ms = base.as_millis().max(1) as u64;
    Duration::from_millis(rand::thread_rng().gen_range(base_ms..=base_ms * 2))
}

fn consensus_handler(inner: Weak<ConsensusInner>) -> HandlerFn {
    Arc::new(move |message| {
        let inner = inner.clone();
        async move {
            let Some(inner) = inner.upgrade() else {
                return Ok(());
            };
            match message.content_str("action") {
                Some("propose") => inner.handle_proposal(&message),
                Some("vote") => inner.handle_vote(&message),
                Some("result") => inner.handle_result(&message),
                Some("forward_propose") => {
                    ConsensusInner::handle_forward_propose(&inner, &message)
                }
                Some("forward_result") => inner.handle_forward_result(&message),
                Some("request_vote") => inner.handle_vote_request(&message),
                Some("vote_response") => inner.handle_vote_response(&message),
                Some("leader_heartbeat") => inner.handle_leader_heartbeat(&message),
                other => {
                    debug!(
                        event = "consensus_unknown_action",
                        protocol = PROTOCOL_NAME,
                        node = inner.core.node_id(),
                        action = other.unwrap_or("none"),
                        "unrecognized consensus action"
                    );
                }
            }
            Ok(())
        }
        .boxed()
    })
}

#[async_trait::async_trait]
impl Protocol for ConsensusProtocol {
    fn node_id(&self) -> &str {
        self.inner.core.node_id()
    }

    fn protocol_name(&self) -> &'static str {
        PROTOCOL_NAME
    }

    async fn start(&self) -> Result<(), ProtocolError> {
        let (receiver, token) = self.inner.core.begin_start()?;
        ProtocolCore::spawn_dispatch_loop(self.inner.core.clone(), receiver, token.clone());
        ConsensusInner::spawn_expiry_loop(&self.inner, token.clone());
        ConsensusInner::spawn_heartbeat_loop(&self.inner, token.clone());
        if self.inner.consensus_type == ConsensusType::Raft {
            ConsensusInner::spawn_election_loop(&self.inner, token);
        }
        self.inner
            .core
            .broadcast_all(self.inner.core.discovery_request());
        info!(
            event = "protocol_started",
            protocol = PROTOCOL_NAME,
            node = self.inner.core.node_id(),
            consensus_type = self.inner.consensus_type.as_str(),
            "consensus protocol started"
        );
        Ok(())
    }

    async fn stop(&self) -> Result<(), ProtocolError> {
        if !self.inner.core.begin_stop() {
            return Ok(());
        }
        self.inner.release_waiters();
        info!(
            event = "protocol_stopped",
            protocol = PROTOCOL_NAME,
            node = self.inner.core.node_id(),
            "consensus protocol stopped"
        );
        Ok(())
    }

    async fn send(&self, message: ProtocolMessage) -> Result<(), ProtocolError> {
        let target = message
            .target
            .clone()
            .ok_or_else(|| ProtocolError::Internal("send requires a target".to_string()))?;
        self.inner.core.send_direct(&target, message)
    }

    async fn broadcast(&self, message: ProtocolMessage) -> Result<(), ProtocolError> {
        self.inner.core.broadcast_all(message);
        Ok(())
    }

    fn register_handler(&self, kind: MessageType, handler: HandlerFn) {
        self.inner.core.register_handler(kind, handler);
    }

    fn register_capability(&self, capability: &str) {
        self.inner.core.register_capability(capability);
    }

    fn unregister_capability(&self, capability: &str) {
        self.inner.core.unregister_capability(capability);
    }

    fn update_status(&self, status: NodeStatus) {
        self.inner.core.update_status(status);
    }

    fn active_nodes(&self) -> Vec<String> {
        self.inner.core.active_nodes()
    }

    fn nodes_with_capability(&self, capability: &str) -> Vec<String> {
        self.inner.core.nodes_with_capability(capability)
    }

    fn network_status(&self) -> NetworkStatus {
        self.inner.core.network_status()
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}
