//! Communication hub: registry, routing and request/response plumbing

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::inbox::Inbox;
use super::pending::PendingResponses;
use super::registry::{AgentHealth, AgentRegistry, DropReason};
use super::router::{DeliveryReport, MessageRouter, RouterStats};
use super::selector::{self, Selection};
use crate::agent::{
    AgentDescriptor, AgentMessage, Capability, MessageKind, MessagePayload, MessagePriority,
    ResponseOutcome,
};
use crate::config::HubConfig;
use crate::observability::{tags, MetricKind, MetricsSink};

/// Result of a capability request
#[derive(Debug, Clone, PartialEq)]
pub enum CapabilityOutcome {
    Completed {
        agent_id: String,
        result: Value,
        elapsed: Duration,
    },
    Failed {
        agent_id: String,
        reason: String,
    },
    NoAgentAvailable,
    TimedOut {
        agent_id: String,
        timeout: Duration,
    },
}

impl CapabilityOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, CapabilityOutcome::Completed { .. })
    }

    fn label(&self) -> &'static str {
        match self {
            CapabilityOutcome::Completed { .. } => "completed",
            CapabilityOutcome::Failed { .. } => "failed",
            CapabilityOutcome::NoAgentAvailable => "no_agent",
            CapabilityOutcome::TimedOut { .. } => "timeout",
        }
    }
}

/// Hub-wide counters
#[derive(Debug, Clone)]
pub struct HubStatistics {
    pub registered_agents: usize,
    pub capability_counts: BTreeMap<Capability, usize>,
    pub pending_responses: usize,
    pub requests_completed: u64,
    pub requests_failed: u64,
    pub requests_timed_out: u64,
    pub requests_unserved: u64,
    pub router: RouterStats,
}

#[derive(Default)]
struct RequestCounters {
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    unserved: AtomicU64,
}

impl RequestCounters {
    fn count(&self, outcome: &CapabilityOutcome) {
        let counter = match outcome {
            CapabilityOutcome::Completed { .. } => &self.completed,
            CapabilityOutcome::Failed { .. } => &self.failed,
            CapabilityOutcome::TimedOut { .. } => &self.timed_out,
            CapabilityOutcome::NoAgentAvailable => &self.unserved,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// In-process message hub shared by agents and engines
pub struct CommunicationHub {
    config: HubConfig,
    registry: Arc<AgentRegistry>,
    router: MessageRouter,
    pending: PendingResponses,
    metrics: Arc<dyn MetricsSink>,
    requests: RequestCounters,
}

impl CommunicationHub {
    pub fn new(config: HubConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        let registry = Arc::new(AgentRegistry::new(config.inbox_capacity));
        let router = MessageRouter::new(registry.clone(), config.history_capacity, metrics.clone());
        Self {
            config,
            registry,
            router,
            pending: PendingResponses::new(),
            metrics,
            requests: RequestCounters::default(),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    /// Register an agent (or replace its registration) and return its inbox
    pub fn register(&self, descriptor: AgentDescriptor) -> Inbox {
        self.registry.register(descriptor)
    }

    pub fn unregister(&self, agent_id: &str) -> bool {
        self.registry.unregister(agent_id)
    }

    /// Send a message through the hub
    ///
    /// Responses correlated with a pending request go straight to the
    /// waiting requester; everything else is routed to inboxes.
    pub async fn send(&self, message: AgentMessage) -> DeliveryReport {
        if message.kind() != MessageKind::Response || self.pending.is_empty() {
            return self.router.deliver(message).await;
        }

        let started = Instant::now();
        let record = message.clone();
        match self.pending.resolve(message) {
            Some(unclaimed) => self.router.deliver(unclaimed).await,
            None => {
                let report = DeliveryReport {
                    delivered: record.receiver.iter().cloned().collect(),
                    dropped: Vec::new(),
                };
                self.router.record(record, &report, started.elapsed()).await;
                report
            }
        }
    }

    /// Choose the best agent currently offering `capability`
    ///
    /// Only agents that accept requests are considered.
    pub fn select(&self, capability: Capability) -> Selection {
        let candidates = self
            .registry
            .agents_with(capability)
            .into_iter()
            .filter(|agent_id| self.registry.accepts(agent_id, MessageKind::Request))
            .filter_map(|agent_id| self.registry.candidate(&agent_id, capability));
        selector::select(candidates)
    }

    /// Request a capability with the configured deadline
    pub async fn request_capability(
        &self,
        requester: &str,
        capability: Capability,
        parameters: Value,
    ) -> CapabilityOutcome {
        self.request_capability_with_timeout(
            requester,
            capability,
            parameters,
            self.config.request_timeout(),
        )
        .await
    }

    /// Send a capability request to the selected agent and wait for its
    /// correlated response until `timeout`
    pub async fn request_capability_with_timeout(
        &self,
        requester: &str,
        capability: Capability,
        parameters: Value,
        timeout: Duration,
    ) -> CapabilityOutcome {
        self.pending.sweep_expired(Instant::now());

        let outcome = match self.select(capability) {
            Selection::NoneAvailable => {
                warn!("No agent available for {} (requested by {})", capability, requester);
                CapabilityOutcome::NoAgentAvailable
            }
            Selection::Selected { agent_id, score } => {
                debug!(
                    "Selected {} for {} with score {:.3}",
                    agent_id, capability, score
                );
                self.exchange(requester, &agent_id, capability, parameters, timeout)
                    .await
            }
        };

        self.requests.count(&outcome);
        self.metrics.record_metric(
            MetricKind::Counter,
            "hub_capability_requests_total",
            1.0,
            &tags(&[
                ("capability", capability.as_str()),
                ("outcome", outcome.label()),
            ]),
        );
        outcome
    }

    async fn exchange(
        &self,
        requester: &str,
        agent_id: &str,
        capability: Capability,
        parameters: Value,
        timeout: Duration,
    ) -> CapabilityOutcome {
        let correlation_id = Uuid::new_v4().to_string();
        let rx = self.pending.insert(&correlation_id, requester, timeout);
        let request = AgentMessage::to(
            requester,
            agent_id,
            MessagePayload::CapabilityRequest {
                capability,
                parameters,
            },
        )
        .with_priority(MessagePriority::High)
        .with_correlation(&correlation_id)
        .expecting_response(timeout);

        let started = Instant::now();
        let report = self.router.deliver(request).await;
        if !report.is_delivered() {
            self.pending.remove(&correlation_id);
            let reason = report.first_drop().unwrap_or(DropReason::UnknownReceiver);
            return CapabilityOutcome::Failed {
                agent_id: agent_id.to_string(),
                reason: format!("request not delivered: {}", reason),
            };
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => {
                let elapsed = started.elapsed();
                match response.payload {
                    MessagePayload::CapabilityResponse {
                        outcome: ResponseOutcome::Completed { result },
                        ..
                    } => {
                        info!(
                            "{} answered {} for {} in {:?}",
                            response.sender, capability, requester, elapsed
                        );
                        CapabilityOutcome::Completed {
                            agent_id: response.sender,
                            result,
                            elapsed,
                        }
                    }
                    MessagePayload::CapabilityResponse {
                        outcome: ResponseOutcome::Failed { reason },
                        ..
                    } => {
                        warn!("{} failed {}: {}", response.sender, capability, reason);
                        CapabilityOutcome::Failed {
                            agent_id: response.sender,
                            reason,
                        }
                    }
                    other => CapabilityOutcome::Failed {
                        agent_id: response.sender,
                        reason: format!("unexpected {} payload in response", other.kind()),
                    },
                }
            }
            // Waiter dropped once its deadline had passed
            Ok(Err(_)) if started.elapsed() >= timeout => CapabilityOutcome::TimedOut {
                agent_id: agent_id.to_string(),
                timeout,
            },
            Ok(Err(_)) => CapabilityOutcome::Failed {
                agent_id: agent_id.to_string(),
                reason: "response channel closed".to_string(),
            },
            Err(_) => {
                self.pending.remove(&correlation_id);
                warn!(
                    "Request {} for {} to {} timed out after {:?}",
                    correlation_id, capability, agent_id, timeout
                );
                CapabilityOutcome::TimedOut {
                    agent_id: agent_id.to_string(),
                    timeout,
                }
            }
        }
    }

    pub fn record_activity(&self, agent_id: &str, elapsed: Duration, success: Option<bool>) {
        self.registry.record_activity(agent_id, elapsed, success);
    }

    pub fn health_report(&self) -> Vec<AgentHealth> {
        self.registry.health_report()
    }

    pub fn pending_responses(&self) -> usize {
        self.pending.len()
    }

    pub async fn statistics(&self) -> HubStatistics {
        HubStatistics {
            registered_agents: self.registry.agent_count(),
            capability_counts: self.registry.capability_counts(),
            pending_responses: self.pending.len(),
            requests_completed: self.requests.completed.load(Ordering::Relaxed),
            requests_failed: self.requests.failed.load(Ordering::Relaxed),
            requests_timed_out: self.requests.timed_out.load(Ordering::Relaxed),
            requests_unserved: self.requests.unserved.load(Ordering::Relaxed),
            router: self.router.stats().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{spawn_agent, LoopbackAgent};
    use crate::observability::NoopSink;
    use serde_json::json;

    fn hub() -> Arc<CommunicationHub> {
        Arc::new(CommunicationHub::new(HubConfig::default(), Arc::new(NoopSink)))
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let hub = hub();
        let _agent = spawn_agent(
            hub.clone(),
            Arc::new(LoopbackAgent::new("reporter", &[Capability::Reporting])),
        );

        let outcome = hub
            .request_capability("coordinator", Capability::Reporting, json!({"period": "q3"}))
            .await;
        match outcome {
            CapabilityOutcome::Completed { agent_id, result, .. } => {
                assert_eq!(agent_id, "reporter");
                assert_eq!(result["parameters"]["period"], "q3");
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        let stats = hub.statistics().await;
        assert_eq!(stats.requests_completed, 1);
        assert_eq!(stats.pending_responses, 0);
    }

    #[tokio::test]
    async fn test_no_agent_available() {
        let hub = hub();
        let outcome = hub
            .request_capability("coordinator", Capability::Reconciliation, json!({}))
            .await;
        assert_eq!(outcome, CapabilityOutcome::NoAgentAvailable);
        assert_eq!(hub.statistics().await.requests_unserved, 1);
    }

    #[tokio::test]
    async fn test_request_times_out_and_clears_pending() {
        let hub = hub();
        let _agent = spawn_agent(
            hub.clone(),
            Arc::new(LoopbackAgent::new("sleepy", &[Capability::Reporting]).silent()),
        );

        let outcome = hub
            .request_capability_with_timeout(
                "coordinator",
                Capability::Reporting,
                json!({}),
                Duration::from_millis(50),
            )
            .await;
        assert!(matches!(outcome, CapabilityOutcome::TimedOut { .. }));
        assert_eq!(hub.pending_responses(), 0);
    }

    #[tokio::test]
    async fn test_huge_timeout_does_not_overflow() {
        let config = HubConfig {
            request_timeout_secs: u64::MAX,
            ..HubConfig::default()
        };
        let hub = Arc::new(CommunicationHub::new(config, Arc::new(NoopSink)));
        let _agent = spawn_agent(
            hub.clone(),
            Arc::new(LoopbackAgent::new("reporter", &[Capability::Reporting])),
        );

        let outcome = hub
            .request_capability("coordinator", Capability::Reporting, json!({}))
            .await;
        assert!(outcome.is_completed());
        assert_eq!(hub.pending_responses(), 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_overdue_request_reports_timeout_after_later_sweep() {
        let hub = hub();
        let _mute = spawn_agent(
            hub.clone(),
            Arc::new(LoopbackAgent::new("mute", &[Capability::Reconciliation]).silent()),
        );
        let _reporter = spawn_agent(
            hub.clone(),
            Arc::new(LoopbackAgent::new("reporter", &[Capability::Reporting])),
        );

        let overdue = {
            let hub = hub.clone();
            tokio::spawn(async move {
                hub.request_capability_with_timeout(
                    "coordinator",
                    Capability::Reconciliation,
                    json!({}),
                    Duration::from_millis(100),
                )
                .await
            })
        };
        while hub.pending_responses() == 0 {
            tokio::task::yield_now().await;
        }

        // Block the only worker thread past the first deadline so its timer
        // cannot fire before the next request sweeps the table
        std::thread::sleep(Duration::from_millis(150));
        let second = hub
            .request_capability("coordinator", Capability::Reporting, json!({}))
            .await;
        assert!(second.is_completed());

        assert_eq!(
            overdue.await.unwrap(),
            CapabilityOutcome::TimedOut {
                agent_id: "mute".into(),
                timeout: Duration::from_millis(100),
            }
        );
        let stats = hub.statistics().await;
        assert_eq!(stats.requests_timed_out, 1);
        assert_eq!(stats.requests_failed, 0);
    }

    #[tokio::test]
    async fn test_selection_skips_agents_not_accepting_requests() {
        let hub = hub();
        let _deaf = hub.register(
            AgentDescriptor::new("analyst_a", "reporting")
                .with_capability_info(crate::agent::CapabilityInfo::new(Capability::Reporting, 1.0)),
        );
        let _worker = spawn_agent(
            hub.clone(),
            Arc::new(LoopbackAgent::new("analyst_b", &[Capability::Reporting]).with_confidence(0.5)),
        );

        assert_eq!(hub.select(Capability::Reporting).agent_id(), Some("analyst_b"));
        let outcome = hub
            .request_capability("coordinator", Capability::Reporting, json!({}))
            .await;
        assert!(outcome.is_completed());
    }

    #[tokio::test]
    async fn test_failed_response_is_reported() {
        let hub = hub();
        let _agent = spawn_agent(
            hub.clone(),
            Arc::new(
                LoopbackAgent::new("broken", &[Capability::Reporting])
                    .failing(Capability::Reporting),
            ),
        );

        let outcome = hub
            .request_capability("coordinator", Capability::Reporting, json!({}))
            .await;
        assert!(matches!(outcome, CapabilityOutcome::Failed { ref agent_id, .. } if agent_id == "broken"));

        // Failure feeds the agent's success rate
        tokio::task::yield_now().await;
        let stats = hub.registry().snapshot("broken").unwrap().stats;
        assert_eq!(stats.decisions_made, 1);
        assert_eq!(stats.decisions_succeeded, 0);
    }
}
