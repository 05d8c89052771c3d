//! Message Router
//!
//! Delivers point-to-point and broadcast messages into agent inboxes and
//! keeps routing statistics plus a capped history of routed messages.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::registry::{AgentRegistry, DropReason, SubscriptionCheck};
use crate::agent::{AgentMessage, MessageKind};
use crate::observability::{smooth_duration, tags, MetricKind, MetricsSink};

/// Per-receiver outcome of one `deliver` call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryReport {
    pub delivered: Vec<String>,
    pub dropped: Vec<(String, DropReason)>,
}

impl DeliveryReport {
    pub fn is_delivered(&self) -> bool {
        !self.delivered.is_empty()
    }

    pub fn first_drop(&self) -> Option<DropReason> {
        self.dropped.first().map(|(_, reason)| *reason)
    }
}

/// Routing statistics
#[derive(Debug, Default, Clone)]
pub struct RouterStats {
    /// Messages handed to the router
    pub messages_routed: u64,
    /// Inbox copies delivered
    pub copies_delivered: u64,
    /// Inbox copies dropped
    pub copies_dropped: u64,
    pub by_kind: HashMap<MessageKind, u64>,
    pub by_receiver: HashMap<String, u64>,
    /// Smoothed routing latency
    pub avg_routing_latency: Option<Duration>,
}

pub struct MessageRouter {
    registry: Arc<AgentRegistry>,
    history: RwLock<VecDeque<AgentMessage>>,
    history_capacity: usize,
    stats: RwLock<RouterStats>,
    metrics: Arc<dyn MetricsSink>,
}

impl MessageRouter {
    pub fn new(
        registry: Arc<AgentRegistry>,
        history_capacity: usize,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            registry,
            history: RwLock::new(VecDeque::with_capacity(history_capacity.min(1024))),
            history_capacity,
            stats: RwLock::new(RouterStats::default()),
            metrics,
        }
    }

    /// Route a message to its receiver, or to every subscriber when it has none
    pub async fn deliver(&self, message: AgentMessage) -> DeliveryReport {
        let started = Instant::now();
        let mut report = DeliveryReport::default();

        match message.receiver.clone() {
            Some(receiver) => {
                let copy = message.clone();
                match self
                    .registry
                    .enqueue(&receiver, copy, SubscriptionCheck::AllowResponses)
                {
                    Ok(()) => report.delivered.push(receiver),
                    Err(reason) => {
                        log_drop(&message, &receiver, reason);
                        report.dropped.push((receiver, reason));
                    }
                }
            }
            None => {
                let targets = self.registry.subscribers(message.kind(), &message.sender);
                debug!(
                    "Broadcasting {} {} from {} to {} agents",
                    message.kind(),
                    message.id,
                    message.sender,
                    targets.len()
                );
                for agent_id in targets {
                    let copy = message.addressed_to(&agent_id);
                    match self.registry.enqueue(&agent_id, copy, SubscriptionCheck::Strict) {
                        Ok(()) => report.delivered.push(agent_id),
                        // Unsubscribed or vanished since the snapshot; skip quietly
                        Err(DropReason::NotSubscribed) | Err(DropReason::UnknownReceiver) => {}
                        Err(reason) => {
                            log_drop(&message, &agent_id, reason);
                            report.dropped.push((agent_id, reason));
                        }
                    }
                }
            }
        }

        self.record(message, &report, started.elapsed()).await;
        report
    }

    /// Account for a message without enqueueing it (e.g. a response handed
    /// straight to its waiter)
    pub async fn record(&self, message: AgentMessage, report: &DeliveryReport, elapsed: Duration) {
        {
            let mut stats = self.stats.write().await;
            stats.messages_routed += 1;
            stats.copies_delivered += report.delivered.len() as u64;
            stats.copies_dropped += report.dropped.len() as u64;
            *stats.by_kind.entry(message.kind()).or_insert(0) += 1;
            for receiver in &report.delivered {
                *stats.by_receiver.entry(receiver.clone()).or_insert(0) += 1;
            }
            stats.avg_routing_latency = Some(smooth_duration(stats.avg_routing_latency, elapsed));
        }

        self.metrics.record_metric(
            MetricKind::Counter,
            "hub_messages_processed_total",
            1.0,
            &tags(&[
                ("kind", message.kind().as_str()),
                ("priority", message.priority.as_str()),
            ]),
        );

        let mut history = self.history.write().await;
        if history.len() >= self.history_capacity {
            history.pop_front();
        }
        history.push_back(message);
    }

    pub async fn stats(&self) -> RouterStats {
        self.stats.read().await.clone()
    }

    /// Most recent routed messages, oldest first
    pub async fn history(&self, limit: usize) -> Vec<AgentMessage> {
        let history = self.history.read().await;
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    pub async fn history_len(&self) -> usize {
        self.history.read().await.len()
    }
}

fn log_drop(message: &AgentMessage, receiver: &str, reason: DropReason) {
    match reason {
        // Late responses for requesters that are not hub members
        DropReason::UnknownReceiver if message.kind() == MessageKind::Response => debug!(
            "Dropped {} {} for unregistered {}",
            message.kind(),
            message.id,
            receiver
        ),
        DropReason::NotSubscribed | DropReason::InboxClosed => debug!(
            "Dropped {} {} for {}: {}",
            message.kind(),
            message.id,
            receiver,
            reason
        ),
        _ => warn!(
            "Dropped {} {} from {} to {}: {}",
            message.kind(),
            message.id,
            message.sender,
            receiver,
            reason
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentDescriptor, Capability, MessagePayload};
    use crate::observability::{MockMetricsSink, NoopSink};
    use serde_json::json;

    fn router(capacity: usize) -> (Arc<AgentRegistry>, MessageRouter) {
        let registry = Arc::new(AgentRegistry::new(capacity));
        let router = MessageRouter::new(registry.clone(), 3, Arc::new(NoopSink));
        (registry, router)
    }

    fn alert(sender: &str) -> AgentMessage {
        AgentMessage::broadcast(
            sender,
            MessagePayload::Alert {
                message: "liquidity buffer low".into(),
                details: json!({"ratio": 0.08}),
            },
        )
    }

    #[tokio::test]
    async fn test_point_to_point_unknown_receiver() {
        let (_registry, router) = router(10);
        let msg = AgentMessage::to(
            "ops",
            "ghost",
            MessagePayload::Notification {
                topic: "t".into(),
                body: json!(null),
            },
        );
        let report = router.deliver(msg).await;
        assert!(!report.is_delivered());
        assert_eq!(report.first_drop(), Some(DropReason::UnknownReceiver));
        assert_eq!(router.stats().await.copies_dropped, 1);
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender_and_unsubscribed() {
        let (registry, router) = router(10);
        let mut a = registry.register(AgentDescriptor::new("a", "t").subscribe(MessageKind::Alert));
        let mut b = registry.register(AgentDescriptor::new("b", "t").subscribe(MessageKind::Alert));
        let mut quiet = registry.register(
            AgentDescriptor::new("quiet", "t").with_capability(Capability::Reporting),
        );

        let msg = alert("a");
        let report = router.deliver(msg.clone()).await;
        assert_eq!(report.delivered, vec!["b".to_string()]);
        assert!(report.dropped.is_empty());

        let copy = b.try_recv().unwrap();
        assert_eq!(copy.receiver.as_deref(), Some("b"));
        assert_eq!(copy.id, msg.id);
        assert!(a.try_recv().is_none());
        assert!(quiet.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_history_is_capped() {
        let (_registry, router) = router(10);
        for _ in 0..5 {
            router.deliver(alert("ops")).await;
        }
        assert_eq!(router.history_len().await, 3);
        assert_eq!(router.history(2).await.len(), 2);

        let stats = router.stats().await;
        assert_eq!(stats.messages_routed, 5);
        assert_eq!(stats.by_kind.get(&MessageKind::Alert), Some(&5));
        assert!(stats.avg_routing_latency.is_some());
    }

    #[tokio::test]
    async fn test_full_inbox_is_reported() {
        let (registry, router) = router(1);
        let _a = registry.register(AgentDescriptor::new("a", "t").subscribe(MessageKind::Alert));

        assert!(router.deliver(alert("ops")).await.is_delivered());
        let report = router.deliver(alert("ops")).await;
        assert_eq!(report.dropped, vec![("a".to_string(), DropReason::InboxFull)]);
    }

    #[tokio::test]
    async fn test_emits_processed_metric() {
        let mut sink = MockMetricsSink::new();
        sink.expect_record_metric()
            .withf(|kind, name, _, tags| {
                *kind == MetricKind::Counter
                    && name == "hub_messages_processed_total"
                    && tags.get("kind").map(String::as_str) == Some("alert")
                    && tags.get("priority").map(String::as_str) == Some("medium")
            })
            .times(1)
            .return_const(());

        let registry = Arc::new(AgentRegistry::new(4));
        let router = MessageRouter::new(registry, 10, Arc::new(sink));
        router.deliver(alert("ops")).await;
    }
}
