//! Core agent trait

use async_trait::async_trait;

use super::message::AgentMessage;
use super::types::{AgentDescriptor, Decision};
use crate::error::Result;

/// Capability-providing agent
///
/// The hub never inspects agent logic. Agents receive messages from their
/// inbox through an `AgentRuntime` and may return a reply, which the runtime
/// routes back through the hub.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Static description: id, role, capabilities, subscriptions
    fn descriptor(&self) -> &AgentDescriptor;

    /// Agent unique ID
    fn id(&self) -> &str {
        &self.descriptor().id
    }

    /// Handle one inbound message
    ///
    /// # Returns
    /// An optional reply (capability response, consensus vote, ...).
    async fn process_message(&self, message: AgentMessage) -> Result<Option<AgentMessage>>;

    /// Produce a recommendation for the given context
    async fn make_decision(&self, context: serde_json::Value) -> Result<Decision>;
}
