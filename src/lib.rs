pub mod agent;
pub mod bootstrap;
pub mod cli;
pub mod config;
pub mod consensus;
pub mod error;
pub mod hub;
pub mod observability;
pub mod workflow;

pub use agent::{
    spawn_agent, Agent, AgentDescriptor, AgentHandle, AgentMessage, Capability, LoopbackAgent,
    MessageKind, MessagePayload, MessagePriority,
};
pub use bootstrap::CoordinationRuntime;
pub use config::AppConfig;
pub use consensus::{
    ConsensusEngine, ConsensusMethod, ConsensusOutcome, ProposalHandle, ProposalStatus, Vote,
};
pub use error::{ConcordError, Result};
pub use hub::{CapabilityOutcome, CommunicationHub, Selection};
pub use observability::{HubMetrics, MetricsSink};
pub use workflow::{TemplateCatalog, WorkflowEngine, WorkflowStatus, WorkflowStatusReport};
