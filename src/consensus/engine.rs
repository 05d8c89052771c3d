//! Consensus engine
//!
//! Each active proposal lives in its own slot guarded by a per-proposal
//! mutex. Votes and the timeout task race to finalize a proposal; the
//! `finalized` flag is claimed with a compare-exchange so exactly one of
//! them sends the outcome.

use dashmap::DashMap;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::resolution::evaluate;
use super::types::{
    ConsensusMethod, ConsensusOutcome, ConsensusProposal, DecisionSummary, ProposalStatus, Vote,
};
use crate::agent::{
    AgentDescriptor, AgentMessage, Capability, MessageKind, MessagePayload, MessagePriority,
};
use crate::config::ConsensusConfig;
use crate::error::{ConcordError, Result};
use crate::hub::CommunicationHub;
use crate::observability::{tags, MetricKind, MetricsSink};

struct ProposalSlot {
    state: Mutex<ConsensusProposal>,
    finalized: AtomicBool,
    started: Instant,
    outcome: watch::Sender<Option<ConsensusOutcome>>,
    timeout_task: StdMutex<Option<AbortHandle>>,
}

impl ProposalSlot {
    fn set_timeout_task(&self, handle: AbortHandle) {
        let mut guard = self.timeout_task.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(handle);
    }

    fn take_timeout_task(&self) -> Option<AbortHandle> {
        let mut guard = self.timeout_task.lock().unwrap_or_else(|e| e.into_inner());
        guard.take()
    }
}

/// Caller's view of a proposal
///
/// Stays usable after the proposal has been finalized and removed from the
/// engine.
#[derive(Debug, Clone)]
pub struct ProposalHandle {
    proposal_id: String,
    outcome: watch::Receiver<Option<ConsensusOutcome>>,
}

impl ProposalHandle {
    pub fn proposal_id(&self) -> &str {
        &self.proposal_id
    }

    /// Outcome if the proposal has already been finalized
    pub fn try_outcome(&self) -> Option<ConsensusOutcome> {
        self.outcome.borrow().clone()
    }

    /// Wait until the proposal is approved, rejected or timed out
    pub async fn outcome(&self) -> Result<ConsensusOutcome> {
        let mut rx = self.outcome.clone();
        let closed = || ConcordError::ChannelClosed(format!("proposal {}", self.proposal_id));
        let value = rx.wait_for(Option::is_some).await.map_err(|_| closed())?;
        let outcome = value.as_ref().cloned();
        outcome.ok_or_else(closed)
    }
}

/// Engine counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsensusStats {
    pub proposals_initiated: u64,
    pub approved: u64,
    pub rejected: u64,
    pub timed_out: u64,
    pub votes_recorded: u64,
    pub votes_ignored: u64,
    pub active: usize,
}

#[derive(Default)]
struct Counters {
    initiated: AtomicU64,
    approved: AtomicU64,
    rejected: AtomicU64,
    timed_out: AtomicU64,
    votes_recorded: AtomicU64,
    votes_ignored: AtomicU64,
}

pub struct ConsensusEngine {
    config: ConsensusConfig,
    hub: Arc<CommunicationHub>,
    metrics: Arc<dyn MetricsSink>,
    proposals: DashMap<String, Arc<ProposalSlot>>,
    counters: Counters,
    listener: StdMutex<Option<JoinHandle<()>>>,
}

impl ConsensusEngine {
    pub fn new(
        config: ConsensusConfig,
        hub: Arc<CommunicationHub>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            hub,
            metrics,
            proposals: DashMap::new(),
            counters: Counters::default(),
            listener: StdMutex::new(None),
        })
    }

    pub fn engine_id(&self) -> &str {
        &self.config.engine_id
    }

    /// Register the engine's hub endpoint and start consuming vote messages
    pub fn start(self: &Arc<Self>) {
        let descriptor = AgentDescriptor::new(&self.config.engine_id, "consensus_engine")
            .subscribe(MessageKind::ConsensusVote);
        let mut inbox = self.hub.register(descriptor);
        let engine: Weak<Self> = Arc::downgrade(self);

        let task = tokio::spawn(async move {
            while let Some(message) = inbox.recv().await {
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                match message.payload {
                    MessagePayload::ConsensusVote { proposal_id, vote } => {
                        engine.submit_vote(&proposal_id, &message.sender, vote).await;
                    }
                    other => debug!("Consensus endpoint ignored {} message", other.kind()),
                }
            }
            debug!("Consensus vote listener stopped");
        });

        let mut guard = self.listener.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = guard.replace(task) {
            previous.abort();
        }
        info!("Consensus engine listening as {}", self.config.engine_id);
    }

    /// Unregister the endpoint; pending proposals still finalize by timeout
    pub fn stop(&self) {
        self.hub.unregister(&self.config.engine_id);
        let mut guard = self.listener.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(task) = guard.take() {
            task.abort();
        }
    }

    /// Create a proposal, send it to every eligible agent and arm its timeout
    ///
    /// Eligible agents are those offering any of `required_capabilities`,
    /// minus the initiator. `timeout` falls back to the configured default.
    pub async fn initiate(
        self: &Arc<Self>,
        initiator: &str,
        proposal_type: &str,
        content: Value,
        required_capabilities: &[Capability],
        method: ConsensusMethod,
        timeout: Option<Duration>,
    ) -> ProposalHandle {
        let timeout = timeout.unwrap_or_else(|| self.config.default_timeout());
        let proposal_id = Uuid::new_v4().to_string();

        let eligible: BTreeSet<String> = required_capabilities
            .iter()
            .flat_map(|cap| self.hub.registry().agents_with(*cap))
            .filter(|id| id != initiator && id != &self.config.engine_id)
            .collect();

        let proposal = ConsensusProposal {
            id: proposal_id.clone(),
            initiator: initiator.to_string(),
            proposal_type: proposal_type.to_string(),
            content: content.clone(),
            required_capabilities: required_capabilities.to_vec(),
            method,
            timeout,
            created_at: chrono::Utc::now(),
            votes: Default::default(),
            status: ProposalStatus::Pending,
            eligible_agents: eligible.iter().cloned().collect(),
        };

        let (tx, rx) = watch::channel(None);
        let slot = Arc::new(ProposalSlot {
            state: Mutex::new(proposal),
            finalized: AtomicBool::new(false),
            started: Instant::now(),
            outcome: tx,
            timeout_task: StdMutex::new(None),
        });
        self.proposals.insert(proposal_id.clone(), slot.clone());
        self.counters.initiated.fetch_add(1, Ordering::Relaxed);

        info!(
            "Proposal {} ({}, {}) from {} sent to {} agents, timeout {:?}",
            proposal_id,
            proposal_type,
            method,
            initiator,
            eligible.len(),
            timeout
        );

        for agent_id in &eligible {
            let message = AgentMessage::to(
                &self.config.engine_id,
                agent_id,
                MessagePayload::ConsensusProposal {
                    proposal_id: proposal_id.clone(),
                    proposal_type: proposal_type.to_string(),
                    content: content.clone(),
                    method,
                    timeout,
                },
            )
            .with_priority(MessagePriority::High)
            .with_correlation(&proposal_id)
            .expecting_response(timeout);
            self.hub.send(message).await;
        }

        let engine = Arc::downgrade(self);
        let expiring = proposal_id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(engine) = engine.upgrade() {
                engine.expire(&expiring).await;
            }
        });
        slot.set_timeout_task(timer.abort_handle());

        ProposalHandle {
            proposal_id,
            outcome: rx,
        }
    }

    /// Record a vote (last vote per agent wins) and re-evaluate
    ///
    /// Votes for unknown or already finalized proposals are ignored.
    pub async fn submit_vote(&self, proposal_id: &str, agent_id: &str, vote: Vote) -> bool {
        let Some(slot) = self.slot(proposal_id) else {
            debug!(
                "Vote from {} for unknown proposal {} ignored",
                agent_id, proposal_id
            );
            self.counters.votes_ignored.fetch_add(1, Ordering::Relaxed);
            return false;
        };

        let finished = {
            let mut proposal = slot.state.lock().await;
            if proposal.status.is_terminal() {
                self.counters.votes_ignored.fetch_add(1, Ordering::Relaxed);
                return false;
            }

            debug!(
                "Vote {:?} from {} on proposal {}",
                vote.choice, agent_id, proposal_id
            );
            proposal.votes.insert(agent_id.to_string(), vote);
            self.counters.votes_recorded.fetch_add(1, Ordering::Relaxed);

            match evaluate(proposal.method, &proposal.votes, self.config.quorum) {
                Some(status) => self.finalize(&slot, &mut proposal, status),
                None => None,
            }
        };

        if let Some(outcome) = finished {
            self.announce(&slot, outcome).await;
        }
        true
    }

    /// Timeout path; a no-op if votes already decided the proposal
    async fn expire(&self, proposal_id: &str) {
        let Some(slot) = self.slot(proposal_id) else {
            return;
        };

        let finished = {
            let mut proposal = slot.state.lock().await;
            if proposal.status.is_terminal() {
                return;
            }
            warn!(
                "Proposal {} timed out with {} votes",
                proposal_id,
                proposal.votes.len()
            );
            self.finalize(&slot, &mut proposal, ProposalStatus::Timeout)
        };

        if let Some(outcome) = finished {
            self.announce(&slot, outcome).await;
        }
    }

    /// Claim the proposal and publish its outcome; runs under the slot lock
    fn finalize(
        &self,
        slot: &ProposalSlot,
        proposal: &mut ConsensusProposal,
        status: ProposalStatus,
    ) -> Option<ConsensusOutcome> {
        if slot
            .finalized
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }

        proposal.status = status;
        self.proposals.remove(&proposal.id);

        if let Some(timer) = slot.take_timeout_task() {
            if status != ProposalStatus::Timeout {
                timer.abort();
            }
        }

        let elapsed = slot.started.elapsed();
        let outcome = ConsensusOutcome {
            proposal_id: proposal.id.clone(),
            proposal_type: proposal.proposal_type.clone(),
            status,
            votes: proposal.votes.clone(),
            summary: DecisionSummary::build(proposal.method, &proposal.votes, elapsed),
        };

        let counter = match status {
            ProposalStatus::Approved => &self.counters.approved,
            ProposalStatus::Rejected => &self.counters.rejected,
            _ => &self.counters.timed_out,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        let metric_tags = tags(&[
            ("proposal_type", proposal.proposal_type.as_str()),
            ("status", status.as_str()),
            ("method", proposal.method.as_str()),
        ]);
        self.metrics.record_metric(
            MetricKind::Counter,
            "consensus_decisions_total",
            1.0,
            &metric_tags,
        );
        self.metrics.record_metric(
            MetricKind::Histogram,
            "consensus_decision_seconds",
            elapsed.as_secs_f64(),
            &metric_tags,
        );

        info!(
            "Proposal {} {} after {:.2}s ({} votes)",
            proposal.id,
            status,
            elapsed.as_secs_f64(),
            proposal.votes.len()
        );

        slot.outcome.send_replace(Some(outcome.clone()));
        Some(outcome)
    }

    /// Tell the initiator how its proposal ended
    async fn announce(&self, slot: &ProposalSlot, outcome: ConsensusOutcome) {
        let initiator = slot.state.lock().await.initiator.clone();
        if !self.hub.registry().is_registered(&initiator) {
            debug!(
                "Initiator {} of proposal {} is not a hub member, outcome left on its handle",
                initiator, outcome.proposal_id
            );
            return;
        }

        let payload = match outcome.status {
            ProposalStatus::Timeout => MessagePayload::ConsensusTimedOut {
                proposal_id: outcome.proposal_id.clone(),
                partial_votes: outcome.votes,
            },
            status => MessagePayload::ConsensusDecision {
                proposal_id: outcome.proposal_id.clone(),
                status,
                votes: outcome.votes,
                summary: outcome.summary,
            },
        };
        let message = AgentMessage::to(&self.config.engine_id, &initiator, payload)
            .with_priority(MessagePriority::High)
            .with_correlation(&outcome.proposal_id);
        self.hub.send(message).await;
    }

    fn slot(&self, proposal_id: &str) -> Option<Arc<ProposalSlot>> {
        self.proposals.get(proposal_id).map(|s| s.value().clone())
    }

    pub fn active_count(&self) -> usize {
        self.proposals.len()
    }

    /// Ids of pending proposals, sorted
    pub fn active_proposals(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.proposals.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Snapshot of a pending proposal
    pub async fn proposal(&self, proposal_id: &str) -> Option<ConsensusProposal> {
        let slot = self.slot(proposal_id)?;
        let proposal = slot.state.lock().await;
        Some(proposal.clone())
    }

    pub fn stats(&self) -> ConsensusStats {
        ConsensusStats {
            proposals_initiated: self.counters.initiated.load(Ordering::Relaxed),
            approved: self.counters.approved.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            votes_recorded: self.counters.votes_recorded.load(Ordering::Relaxed),
            votes_ignored: self.counters.votes_ignored.load(Ordering::Relaxed),
            active: self.proposals.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::consensus::VoteChoice;
    use crate::observability::{HubMetrics, NoopSink};
    use serde_json::json;

    fn setup() -> (Arc<CommunicationHub>, Arc<ConsensusEngine>) {
        let hub = Arc::new(CommunicationHub::new(HubConfig::default(), Arc::new(NoopSink)));
        let engine =
            ConsensusEngine::new(ConsensusConfig::default(), hub.clone(), Arc::new(NoopSink));
        (hub, engine)
    }

    async fn propose(
        engine: &Arc<ConsensusEngine>,
        method: ConsensusMethod,
        timeout: Duration,
    ) -> ProposalHandle {
        engine
            .initiate(
                "coordinator",
                "investment_approval",
                json!({"amount": 1_000_000}),
                &[Capability::RiskAssessment],
                method,
                Some(timeout),
            )
            .await
    }

    #[tokio::test]
    async fn test_majority_resolves_after_quorum() {
        let (_hub, engine) = setup();
        let handle = propose(&engine, ConsensusMethod::Majority, Duration::from_secs(60)).await;
        let id = handle.proposal_id().to_string();

        assert!(engine.submit_vote(&id, "a", Vote::approve()).await);
        assert!(engine.submit_vote(&id, "b", Vote::reject()).await);
        assert!(handle.try_outcome().is_none());
        assert_eq!(engine.active_count(), 1);

        assert!(engine.submit_vote(&id, "c", Vote::approve()).await);
        let outcome = handle.outcome().await.unwrap();
        assert_eq!(outcome.status, ProposalStatus::Approved);
        assert_eq!(outcome.summary.counts.approve, 2);
        assert_eq!(engine.active_count(), 0);

        // Late vote is a no-op
        assert!(!engine.submit_vote(&id, "d", Vote::reject()).await);
        assert_eq!(engine.stats().votes_ignored, 1);
    }

    #[tokio::test]
    async fn test_last_vote_wins() {
        let (_hub, engine) = setup();
        let handle = propose(&engine, ConsensusMethod::Majority, Duration::from_secs(60)).await;
        let id = handle.proposal_id().to_string();

        engine.submit_vote(&id, "a", Vote::approve()).await;
        engine.submit_vote(&id, "a", Vote::reject()).await;
        let proposal = engine.proposal(&id).await.unwrap();
        assert_eq!(proposal.votes.len(), 1);
        assert_eq!(proposal.votes["a"].choice, VoteChoice::Reject);
    }

    #[tokio::test]
    async fn test_timeout_without_votes() {
        let (_hub, engine) = setup();
        let handle = propose(&engine, ConsensusMethod::Majority, Duration::from_millis(30)).await;
        let id = handle.proposal_id().to_string();

        let outcome = handle.outcome().await.unwrap();
        assert_eq!(outcome.status, ProposalStatus::Timeout);
        assert!(outcome.votes.is_empty());
        assert!(engine.proposal(&id).await.is_none());
        assert!(!engine.submit_vote(&id, "a", Vote::approve()).await);
        assert_eq!(engine.stats().timed_out, 1);
    }

    #[tokio::test]
    async fn test_vote_driven_finalization_disarms_timeout() {
        let hub = Arc::new(CommunicationHub::new(HubConfig::default(), Arc::new(NoopSink)));
        let metrics = Arc::new(HubMetrics::new());
        let engine = ConsensusEngine::new(ConsensusConfig::default(), hub, metrics.clone());

        let handle = propose(&engine, ConsensusMethod::Unanimous, Duration::from_millis(40)).await;
        engine
            .submit_vote(handle.proposal_id(), "a", Vote::approve())
            .await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(handle.try_outcome().unwrap().status, ProposalStatus::Approved);
        let stats = engine.stats();
        assert_eq!(stats.approved, 1);
        assert_eq!(stats.timed_out, 0);
        assert_eq!(metrics.counter("consensus_decisions_total"), 1.0);
    }

    #[tokio::test]
    async fn test_unknown_proposal_vote_ignored() {
        let (_hub, engine) = setup();
        assert!(!engine.submit_vote("missing", "a", Vote::approve()).await);
    }
}
