//! Agent runtime: drains an agent's inbox and routes its replies

use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::message::{MessagePayload, ResponseOutcome};
use super::traits::Agent;
use crate::hub::CommunicationHub;

/// Handle to a running agent loop
pub struct AgentHandle {
    agent_id: String,
    task: JoinHandle<()>,
}

impl AgentHandle {
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Unregister the agent and wait for its loop to drain
    pub async fn stop(self, hub: &CommunicationHub) {
        info!("Stopping agent {}", self.agent_id);
        hub.unregister(&self.agent_id);
        if let Err(e) = self.task.await {
            warn!("Agent {} loop ended abnormally: {}", self.agent_id, e);
        }
    }
}

/// Register `agent` with the hub and spawn its message loop
///
/// The loop ends when the agent is unregistered (its inbox closes).
/// Capability requests that make the agent return an error are answered
/// with a failed response so the requester does not wait for its deadline.
pub fn spawn_agent(hub: Arc<CommunicationHub>, agent: Arc<dyn Agent>) -> AgentHandle {
    let agent_id = agent.id().to_string();
    let mut inbox = hub.register(agent.descriptor().clone());
    info!(
        "Starting agent {} ({}) with capabilities {:?}",
        agent_id,
        agent.descriptor().role,
        agent.descriptor().capability_set()
    );

    let loop_id = agent_id.clone();
    let task = tokio::spawn(async move {
        while let Some(message) = inbox.recv().await {
            let started = Instant::now();
            let request = match &message.payload {
                MessagePayload::CapabilityRequest { capability, .. } => {
                    Some((message.clone(), *capability))
                }
                _ => None,
            };

            let outcome = agent.process_message(message).await;
            let elapsed = started.elapsed();

            match outcome {
                Ok(Some(reply)) => {
                    let success = match &reply.payload {
                        MessagePayload::CapabilityResponse {
                            outcome: ResponseOutcome::Failed { .. },
                            ..
                        } => Some(false),
                        MessagePayload::CapabilityResponse { .. } => Some(true),
                        _ => None,
                    };
                    hub.record_activity(&loop_id, elapsed, success);
                    hub.send(reply).await;
                }
                Ok(None) => {
                    hub.record_activity(&loop_id, elapsed, None);
                }
                Err(e) => {
                    warn!("Agent {} failed to process message: {}", loop_id, e);
                    match request {
                        Some((request, capability)) => {
                            hub.record_activity(&loop_id, elapsed, Some(false));
                            let reply = request.reply(
                                &loop_id,
                                MessagePayload::CapabilityResponse {
                                    capability,
                                    outcome: ResponseOutcome::Failed {
                                        reason: e.to_string(),
                                    },
                                },
                            );
                            hub.send(reply).await;
                        }
                        None => hub.record_activity(&loop_id, elapsed, None),
                    }
                }
            }
        }
        debug!("Agent {} inbox closed, loop exiting", loop_id);
    });

    AgentHandle { agent_id, task }
}
