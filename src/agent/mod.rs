//! Agent model
//!
//! Provides the pieces every capability provider shares:
//! - Closed message model routed by the hub
//! - Capability declarations and agent descriptors
//! - The `Agent` trait and the runtime loop that drives it
//! - A scriptable loopback agent for demos and tests

mod loopback;
mod message;
mod runtime;
mod traits;
mod types;

pub use loopback::LoopbackAgent;
pub use message::{AgentMessage, MessageKind, MessagePayload, MessagePriority, ResponseOutcome};
pub use runtime::{spawn_agent, AgentHandle};
pub use traits::Agent;
pub use types::{AgentDescriptor, Capability, CapabilityInfo, Decision};
