//! Bounded per-agent inbox

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::agent::AgentMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    Full,
    Closed,
}

/// Create a bounded inbox for `agent_id`
pub fn channel(agent_id: &str, capacity: usize) -> (InboxSender, Inbox) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        InboxSender { tx },
        Inbox {
            agent_id: agent_id.to_string(),
            rx,
        },
    )
}

/// Producer half, owned by the agent's registration
#[derive(Debug)]
pub struct InboxSender {
    tx: mpsc::Sender<AgentMessage>,
}

impl InboxSender {
    /// Enqueue without waiting; a full inbox rejects the message
    pub fn try_push(&self, message: AgentMessage) -> Result<(), PushError> {
        self.tx.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => PushError::Full,
            TrySendError::Closed(_) => PushError::Closed,
        })
    }

    /// Messages waiting to be consumed
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half handed to the agent on registration
///
/// Closes once the agent is unregistered and every buffered message has been
/// received.
#[derive(Debug)]
pub struct Inbox {
    agent_id: String,
    rx: mpsc::Receiver<AgentMessage>,
}

impl Inbox {
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub async fn recv(&mut self) -> Option<AgentMessage> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<AgentMessage> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::MessagePayload;
    use serde_json::json;

    fn note(n: u64) -> AgentMessage {
        AgentMessage::to(
            "ops",
            "a",
            MessagePayload::Notification {
                topic: "seq".into(),
                body: json!(n),
            },
        )
    }

    #[test]
    fn test_full_inbox_rejects() {
        let (tx, mut rx) = channel("a", 2);
        assert!(tx.try_push(note(1)).is_ok());
        assert!(tx.try_push(note(2)).is_ok());
        assert_eq!(tx.len(), 2);
        assert_eq!(tx.try_push(note(3)), Err(PushError::Full));

        assert!(rx.try_recv().is_some());
        assert_eq!(tx.len(), 1);
    }

    #[test]
    fn test_dropped_receiver_closes() {
        let (tx, rx) = channel("a", 4);
        drop(rx);
        assert!(tx.is_closed());
        assert_eq!(tx.try_push(note(1)), Err(PushError::Closed));
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let (tx, mut rx) = channel("a", 8);
        for n in 0..5 {
            tx.try_push(note(n)).unwrap();
        }
        drop(tx);

        let mut seen = Vec::new();
        while let Some(msg) = rx.recv().await {
            if let MessagePayload::Notification { body, .. } = msg.payload {
                seen.push(body.as_u64().unwrap());
            }
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }
}
