//! Closed message model exchanged through the hub

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

use super::types::Capability;
use crate::consensus::{ConsensusMethod, DecisionSummary, ProposalStatus, Vote};

/// Message kinds; also the unit of agent subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Request,
    Response,
    Notification,
    Alert,
    ConsensusProposal,
    ConsensusVote,
    StatusUpdate,
}

impl MessageKind {
    pub const ALL: [MessageKind; 7] = [
        MessageKind::Request,
        MessageKind::Response,
        MessageKind::Notification,
        MessageKind::Alert,
        MessageKind::ConsensusProposal,
        MessageKind::ConsensusVote,
        MessageKind::StatusUpdate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Request => "request",
            MessageKind::Response => "response",
            MessageKind::Notification => "notification",
            MessageKind::Alert => "alert",
            MessageKind::ConsensusProposal => "consensus_proposal",
            MessageKind::ConsensusVote => "consensus_vote",
            MessageKind::StatusUpdate => "status_update",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Message priority (Critical sorts first)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Critical,
    High,
    Medium,
    Low,
}

impl MessagePriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessagePriority::Critical => "critical",
            MessagePriority::High => "high",
            MessagePriority::Medium => "medium",
            MessagePriority::Low => "low",
        }
    }
}

impl std::fmt::Display for MessagePriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result carried by a capability response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResponseOutcome {
    Completed { result: serde_json::Value },
    Failed { reason: String },
}

/// Typed message bodies. The variant determines the message kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePayload {
    CapabilityRequest {
        capability: Capability,
        parameters: serde_json::Value,
    },
    CapabilityResponse {
        capability: Capability,
        outcome: ResponseOutcome,
    },
    ConsensusProposal {
        proposal_id: String,
        proposal_type: String,
        content: serde_json::Value,
        method: ConsensusMethod,
        timeout: Duration,
    },
    ConsensusVote {
        proposal_id: String,
        vote: Vote,
    },
    /// Final decision sent to the proposal initiator
    ConsensusDecision {
        proposal_id: String,
        status: ProposalStatus,
        votes: BTreeMap<String, Vote>,
        summary: DecisionSummary,
    },
    /// Proposal expired before resolving
    ConsensusTimedOut {
        proposal_id: String,
        partial_votes: BTreeMap<String, Vote>,
    },
    Notification {
        topic: String,
        body: serde_json::Value,
    },
    Alert {
        message: String,
        details: serde_json::Value,
    },
    StatusUpdate {
        status: String,
        detail: serde_json::Value,
    },
}

impl MessagePayload {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessagePayload::CapabilityRequest { .. } => MessageKind::Request,
            MessagePayload::CapabilityResponse { .. } => MessageKind::Response,
            MessagePayload::ConsensusProposal { .. } => MessageKind::ConsensusProposal,
            MessagePayload::ConsensusVote { .. } => MessageKind::ConsensusVote,
            MessagePayload::ConsensusDecision { .. } => MessageKind::Response,
            MessagePayload::ConsensusTimedOut { .. } => MessageKind::Notification,
            MessagePayload::Notification { .. } => MessageKind::Notification,
            MessagePayload::Alert { .. } => MessageKind::Alert,
            MessagePayload::StatusUpdate { .. } => MessageKind::StatusUpdate,
        }
    }
}

/// Envelope routed by the hub
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    pub id: String,
    pub sender: String,
    /// `None` broadcasts to every subscribed agent except the sender
    pub receiver: Option<String>,
    pub priority: MessagePriority,
    pub payload: MessagePayload,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Option<String>,
    pub requires_response: bool,
    pub response_timeout: Option<Duration>,
}

impl AgentMessage {
    pub fn new(sender: &str, receiver: Option<&str>, payload: MessagePayload) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender: sender.to_string(),
            receiver: receiver.map(str::to_string),
            priority: MessagePriority::Medium,
            payload,
            timestamp: Utc::now(),
            correlation_id: None,
            requires_response: false,
            response_timeout: None,
        }
    }

    pub fn to(sender: &str, receiver: &str, payload: MessagePayload) -> Self {
        Self::new(sender, Some(receiver), payload)
    }

    pub fn broadcast(sender: &str, payload: MessagePayload) -> Self {
        Self::new(sender, None, payload)
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_correlation(mut self, correlation_id: &str) -> Self {
        self.correlation_id = Some(correlation_id.to_string());
        self
    }

    pub fn expecting_response(mut self, timeout: Duration) -> Self {
        self.requires_response = true;
        self.response_timeout = Some(timeout);
        self
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    pub fn is_broadcast(&self) -> bool {
        self.receiver.is_none()
    }

    /// Copy of a broadcast message targeted at one receiver
    pub fn addressed_to(&self, receiver: &str) -> Self {
        Self {
            receiver: Some(receiver.to_string()),
            ..self.clone()
        }
    }

    /// Build a reply routed back to the sender, correlated with this message
    pub fn reply(&self, sender: &str, payload: MessagePayload) -> Self {
        let correlation = self.correlation_id.as_deref().unwrap_or(&self.id);
        Self::to(sender, &self.sender, payload)
            .with_priority(self.priority)
            .with_correlation(correlation)
    }
}
