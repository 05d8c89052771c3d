//! Pending response table keyed by correlation id

use dashmap::DashMap;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::debug;

use crate::agent::AgentMessage;

struct PendingEntry {
    requester: String,
    /// `None` when the timeout is too large to represent
    deadline: Option<Instant>,
    tx: oneshot::Sender<AgentMessage>,
}

#[derive(Default)]
pub struct PendingResponses {
    entries: DashMap<String, PendingEntry>,
}

impl PendingResponses {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for a response to `correlation_id` addressed to `requester`
    pub fn insert(
        &self,
        correlation_id: &str,
        requester: &str,
        timeout: Duration,
    ) -> oneshot::Receiver<AgentMessage> {
        let (tx, rx) = oneshot::channel();
        self.entries.insert(
            correlation_id.to_string(),
            PendingEntry {
                requester: requester.to_string(),
                deadline: Instant::now().checked_add(timeout),
                tx,
            },
        );
        rx
    }

    /// Hand a response to its waiter
    ///
    /// Returns the message back when nothing is waiting for it.
    pub fn resolve(&self, message: AgentMessage) -> Option<AgentMessage> {
        let Some(correlation_id) = message.correlation_id.clone() else {
            return Some(message);
        };

        let matches_requester = |_: &String, entry: &PendingEntry| {
            message.receiver.as_deref() == Some(entry.requester.as_str())
        };
        let Some((_, entry)) = self.entries.remove_if(&correlation_id, matches_requester) else {
            return Some(message);
        };

        if entry.tx.send(message).is_err() {
            debug!("Waiter for {} went away before its response", correlation_id);
        }
        None
    }

    pub fn remove(&self, correlation_id: &str) -> bool {
        self.entries.remove(correlation_id).is_some()
    }

    /// Drop entries past their deadline whose waiter has gone away
    ///
    /// A waiter that is still listening owns its entry until its own timer
    /// fires, so it observes a timeout rather than a closed channel.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            let expired = entry.deadline.is_some_and(|deadline| deadline <= now);
            !expired || !entry.tx.is_closed()
        });
        let swept = before.saturating_sub(self.entries.len());
        if swept > 0 {
            debug!("Swept {} expired pending responses", swept);
        }
        swept
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
