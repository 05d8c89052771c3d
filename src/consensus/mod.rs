//! Consensus engine
//!
//! Application-level voting among capability-matching agents. Proposals
//! resolve by unanimous, majority, supermajority or confidence-weighted
//! rules, or time out.

mod engine;
mod resolution;
mod types;

pub use engine::{ConsensusEngine, ConsensusStats, ProposalHandle};
pub use resolution::evaluate;
pub use types::{
    ConsensusMethod, ConsensusOutcome, ConsensusProposal, DecisionSummary, ProposalStatus,
    Rationale, Vote, VoteChoice, VoteCounts,
};
