//! Consensus data types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::agent::Capability;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusMethod {
    /// At least one approval and no rejection
    Unanimous,
    /// Strictly more approvals than rejections, once quorum is met
    Majority,
    /// Approval rate of at least 0.67, once quorum is met
    Supermajority,
    /// Confidence-weighted comparison of approvals and rejections
    Weighted,
}

impl ConsensusMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsensusMethod::Unanimous => "unanimous",
            ConsensusMethod::Majority => "majority",
            ConsensusMethod::Supermajority => "supermajority",
            ConsensusMethod::Weighted => "weighted",
        }
    }
}

impl std::fmt::Display for ConsensusMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ConsensusMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unanimous" => Ok(ConsensusMethod::Unanimous),
            "majority" => Ok(ConsensusMethod::Majority),
            "supermajority" => Ok(ConsensusMethod::Supermajority),
            "weighted" => Ok(ConsensusMethod::Weighted),
            other => Err(format!("unknown consensus method: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteChoice {
    Approve,
    Reject,
    Abstain,
}

fn default_confidence() -> f64 {
    0.5
}

/// One agent's vote on a proposal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub choice: VoteChoice,
    /// Self-reported confidence, used by the weighted method
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub rationale: Option<String>,
    #[serde(default)]
    pub suggested_modifications: Vec<String>,
}

impl Vote {
    pub fn new(choice: VoteChoice) -> Self {
        Self {
            choice,
            confidence: default_confidence(),
            rationale: None,
            suggested_modifications: Vec::new(),
        }
    }

    pub fn approve() -> Self {
        Self::new(VoteChoice::Approve)
    }

    pub fn reject() -> Self {
        Self::new(VoteChoice::Reject)
    }

    pub fn abstain() -> Self {
        Self::new(VoteChoice::Abstain)
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn with_rationale(mut self, rationale: &str) -> Self {
        self.rationale = Some(rationale.to_string());
        self
    }

    pub fn with_modification(mut self, modification: &str) -> Self {
        self.suggested_modifications.push(modification.to_string());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Pending,
    Approved,
    Rejected,
    Timeout,
}

impl ProposalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalStatus::Pending => "pending",
            ProposalStatus::Approved => "approved",
            ProposalStatus::Rejected => "rejected",
            ProposalStatus::Timeout => "timeout",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProposalStatus::Pending)
    }
}

impl std::fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsensusProposal {
    pub id: String,
    pub initiator: String,
    pub proposal_type: String,
    pub content: serde_json::Value,
    pub required_capabilities: Vec<Capability>,
    pub method: ConsensusMethod,
    pub timeout: Duration,
    pub created_at: DateTime<Utc>,
    /// agent id -> latest vote
    pub votes: BTreeMap<String, Vote>,
    pub status: ProposalStatus,
    /// Agents the proposal was sent to
    pub eligible_agents: Vec<String>,
}

/// Approve / reject / abstain counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteCounts {
    pub approve: usize,
    pub reject: usize,
    pub abstain: usize,
}

impl VoteCounts {
    pub fn tally<'a, I>(votes: I) -> Self
    where
        I: IntoIterator<Item = &'a Vote>,
    {
        votes.into_iter().fold(Self::default(), |mut counts, vote| {
            match vote.choice {
                VoteChoice::Approve => counts.approve += 1,
                VoteChoice::Reject => counts.reject += 1,
                VoteChoice::Abstain => counts.abstain += 1,
            }
            counts
        })
    }

    pub fn total(&self) -> usize {
        self.approve + self.reject + self.abstain
    }
}

/// One agent's stated reasoning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rationale {
    pub choice: VoteChoice,
    pub confidence: f64,
    pub rationale: Option<String>,
}

/// Derived summary sent with a final decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionSummary {
    pub counts: VoteCounts,
    pub total_participants: usize,
    pub method: ConsensusMethod,
    pub rationales: BTreeMap<String, Rationale>,
    pub decision_time_secs: f64,
}

impl DecisionSummary {
    pub fn build(
        method: ConsensusMethod,
        votes: &BTreeMap<String, Vote>,
        elapsed: Duration,
    ) -> Self {
        Self {
            counts: VoteCounts::tally(votes.values()),
            total_participants: votes.len(),
            method,
            rationales: votes
                .iter()
                .map(|(agent_id, vote)| {
                    (
                        agent_id.clone(),
                        Rationale {
                            choice: vote.choice,
                            confidence: vote.confidence,
                            rationale: vote.rationale.clone(),
                        },
                    )
                })
                .collect(),
            decision_time_secs: elapsed.as_secs_f64(),
        }
    }
}

/// Final state of a proposal, delivered through its handle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsensusOutcome {
    pub proposal_id: String,
    pub proposal_type: String,
    pub status: ProposalStatus,
    pub votes: BTreeMap<String, Vote>,
    pub summary: DecisionSummary,
}

impl ConsensusOutcome {
    pub fn is_approved(&self) -> bool {
        self.status == ProposalStatus::Approved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vote_defaults() {
        let vote: Vote = serde_json::from_str(r#"{"choice":"approve"}"#).unwrap();
        assert_eq!(vote.choice, VoteChoice::Approve);
        assert_eq!(vote.confidence, 0.5);
        assert!(vote.rationale.is_none());
        assert!(vote.suggested_modifications.is_empty());
    }

    #[test]
    fn test_tally() {
        let votes = [Vote::approve(), Vote::approve(), Vote::reject(), Vote::abstain()];
        let counts = VoteCounts::tally(votes.iter());
        assert_eq!(
            counts,
            VoteCounts {
                approve: 2,
                reject: 1,
                abstain: 1
            }
        );
        assert_eq!(counts.total(), 4);
    }

    #[test]
    fn test_summary_keeps_rationales() {
        let mut votes = BTreeMap::new();
        votes.insert(
            "risk_001".to_string(),
            Vote::reject().with_rationale("exposure above limit"),
        );
        let summary =
            DecisionSummary::build(ConsensusMethod::Majority, &votes, Duration::from_millis(1500));
        assert_eq!(summary.total_participants, 1);
        assert_eq!(summary.counts.reject, 1);
        assert_eq!(
            summary.rationales["risk_001"].rationale.as_deref(),
            Some("exposure above limit")
        );
        assert!((summary.decision_time_secs - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_method_parse() {
        assert_eq!(
            "SuperMajority".parse::<ConsensusMethod>().unwrap(),
            ConsensusMethod::Supermajority
        );
        assert!("quorum".parse::<ConsensusMethod>().is_err());
    }
}
