//! Loopback agent
//!
//! Answers capability requests by echoing its inputs and votes on proposals
//! with a fixed stance. Used by the CLI demo and by tests to stand in for
//! real domain agents.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use uuid::Uuid;

use super::message::{AgentMessage, MessageKind, MessagePayload, ResponseOutcome};
use super::traits::Agent;
use super::types::{AgentDescriptor, Capability, CapabilityInfo, Decision};
use crate::consensus::Vote;
use crate::error::Result;

pub struct LoopbackAgent {
    descriptor: AgentDescriptor,
    vote: Option<Vote>,
    failing: HashSet<Capability>,
    silent: bool,
    latency: Duration,
    requests_handled: AtomicU64,
    proposals_seen: AtomicU64,
}

impl LoopbackAgent {
    pub fn new(id: &str, capabilities: &[Capability]) -> Self {
        let descriptor = capabilities
            .iter()
            .fold(AgentDescriptor::new(id, "loopback"), |d, cap| {
                d.with_capability(*cap)
            })
            .subscribe(MessageKind::Request)
            .subscribe(MessageKind::ConsensusProposal)
            .subscribe(MessageKind::Notification)
            .subscribe(MessageKind::Alert);

        Self {
            descriptor,
            vote: Some(Vote::approve()),
            failing: HashSet::new(),
            silent: false,
            latency: Duration::ZERO,
            requests_handled: AtomicU64::new(0),
            proposals_seen: AtomicU64::new(0),
        }
    }

    /// Declare every capability with the given confidence
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        let caps = self.descriptor.capability_set();
        for cap in caps {
            self.descriptor = self
                .descriptor
                .with_capability_info(CapabilityInfo::new(cap, confidence));
        }
        self
    }

    pub fn with_vote(mut self, vote: Vote) -> Self {
        self.vote = Some(vote);
        self
    }

    /// Receive proposals but never vote
    pub fn without_vote(mut self) -> Self {
        self.vote = None;
        self
    }

    /// Answer requests for `capability` with a failure
    pub fn failing(mut self, capability: Capability) -> Self {
        self.failing.insert(capability);
        self
    }

    /// Accept requests but never answer them
    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_subscription(mut self, kind: MessageKind) -> Self {
        self.descriptor = self.descriptor.subscribe(kind);
        self
    }

    pub fn requests_handled(&self) -> u64 {
        self.requests_handled.load(Ordering::Relaxed)
    }

    pub fn proposals_seen(&self) -> u64 {
        self.proposals_seen.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Agent for LoopbackAgent {
    fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    async fn process_message(&self, message: AgentMessage) -> Result<Option<AgentMessage>> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match &message.payload {
            MessagePayload::CapabilityRequest {
                capability,
                parameters,
            } => {
                self.requests_handled.fetch_add(1, Ordering::Relaxed);
                if self.silent {
                    return Ok(None);
                }

                let outcome = if self.failing.contains(capability)
                    || !self.descriptor.can_handle(*capability)
                {
                    ResponseOutcome::Failed {
                        reason: format!("capability {} unavailable", capability),
                    }
                } else {
                    ResponseOutcome::Completed {
                        result: json!({
                            "agent_id": self.descriptor.id,
                            "capability": capability,
                            "parameters": parameters,
                        }),
                    }
                };

                Ok(Some(message.reply(
                    &self.descriptor.id,
                    MessagePayload::CapabilityResponse {
                        capability: *capability,
                        outcome,
                    },
                )))
            }
            MessagePayload::ConsensusProposal { proposal_id, .. } => {
                self.proposals_seen.fetch_add(1, Ordering::Relaxed);
                Ok(self.vote.as_ref().map(|vote| {
                    message.reply(
                        &self.descriptor.id,
                        MessagePayload::ConsensusVote {
                            proposal_id: proposal_id.clone(),
                            vote: vote.clone(),
                        },
                    )
                }))
            }
            _ => Ok(None),
        }
    }

    async fn make_decision(&self, context: serde_json::Value) -> Result<Decision> {
        let decision_type = context
            .get("decision_type")
            .and_then(|v| v.as_str())
            .unwrap_or("general")
            .to_string();
        let confidence = self
            .descriptor
            .capabilities
            .first()
            .map(|c| c.confidence_level)
            .unwrap_or(0.7);

        Ok(Decision {
            decision_id: Uuid::new_v4().to_string(),
            agent_id: self.descriptor.id.clone(),
            decision_type,
            recommendation: "PROCEED".to_string(),
            confidence_score: confidence,
            supporting_data: context,
            risk_assessment: None,
            financial_impact: None,
            timestamp: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::VoteChoice;

    fn request(capability: Capability) -> AgentMessage {
        AgentMessage::to(
            "coordinator",
            "loop_1",
            MessagePayload::CapabilityRequest {
                capability,
                parameters: json!({"entity": "acme"}),
            },
        )
        .with_correlation("req-1")
    }

    #[tokio::test]
    async fn test_echoes_capability_request() {
        let agent = LoopbackAgent::new("loop_1", &[Capability::Reporting]);
        let reply = agent
            .process_message(request(Capability::Reporting))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(reply.receiver.as_deref(), Some("coordinator"));
        assert_eq!(reply.correlation_id.as_deref(), Some("req-1"));
        match reply.payload {
            MessagePayload::CapabilityResponse {
                outcome: ResponseOutcome::Completed { result },
                ..
            } => {
                assert_eq!(result["agent_id"], "loop_1");
                assert_eq!(result["parameters"]["entity"], "acme");
            }
            other => panic!("unexpected payload {:?}", other),
        }
        assert_eq!(agent.requests_handled(), 1);
    }

    #[tokio::test]
    async fn test_failing_capability_reports_failure() {
        let agent = LoopbackAgent::new("loop_1", &[Capability::Reporting])
            .failing(Capability::Reporting);
        let reply = agent
            .process_message(request(Capability::Reporting))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            reply.payload,
            MessagePayload::CapabilityResponse {
                outcome: ResponseOutcome::Failed { .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_silent_agent_never_replies() {
        let agent = LoopbackAgent::new("loop_1", &[Capability::Reporting]).silent();
        let reply = agent
            .process_message(request(Capability::Reporting))
            .await
            .unwrap();
        assert!(reply.is_none());
        assert_eq!(agent.requests_handled(), 1);
    }

    #[tokio::test]
    async fn test_votes_on_proposal() {
        let agent = LoopbackAgent::new("loop_1", &[Capability::RiskAssessment])
            .with_vote(Vote::reject().with_confidence(0.9));
        let proposal = AgentMessage::to(
            "consensus_engine",
            "loop_1",
            MessagePayload::ConsensusProposal {
                proposal_id: "p-1".into(),
                proposal_type: "investment_approval".into(),
                content: json!({}),
                method: crate::consensus::ConsensusMethod::Majority,
                timeout: Duration::from_secs(60),
            },
        );

        let reply = agent.process_message(proposal).await.unwrap().unwrap();
        assert_eq!(reply.receiver.as_deref(), Some("consensus_engine"));
        match reply.payload {
            MessagePayload::ConsensusVote { proposal_id, vote } => {
                assert_eq!(proposal_id, "p-1");
                assert_eq!(vote.choice, VoteChoice::Reject);
                assert_eq!(vote.confidence, 0.9);
            }
            other => panic!("unexpected payload {:?}", other),
        }
        assert_eq!(agent.proposals_seen(), 1);
    }

    #[tokio::test]
    async fn test_make_decision_uses_context() {
        let agent = LoopbackAgent::new("loop_1", &[Capability::Reporting]).with_confidence(0.4);
        let decision = agent
            .make_decision(json!({"decision_type": "workflow_initiation"}))
            .await
            .unwrap();
        assert_eq!(decision.decision_type, "workflow_initiation");
        assert_eq!(decision.confidence_score, 0.4);
        assert_eq!(decision.agent_id, "loop_1");
    }
}
