//! Message hub
//!
//! Registry and capability index, routing into bounded per-agent inboxes,
//! capability selection and correlated request/response handling.

mod hub;
mod inbox;
mod pending;
mod registry;
mod router;
mod selector;

pub use hub::{CapabilityOutcome, CommunicationHub, HubStatistics};
pub use inbox::{Inbox, InboxSender, PushError};
pub use pending::PendingResponses;
pub use registry::{
    AgentHealth, AgentRegistry, AgentSnapshot, AgentStats, DropReason, HealthState,
    SubscriptionCheck,
};
pub use router::{DeliveryReport, MessageRouter, RouterStats};
pub use selector::{select, CandidateStats, Selection};
