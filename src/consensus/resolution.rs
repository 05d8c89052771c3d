//! Vote resolution rules

use std::collections::BTreeMap;

use super::types::{ConsensusMethod, ProposalStatus, Vote, VoteChoice, VoteCounts};

const SUPERMAJORITY_APPROVE: f64 = 0.67;
const SUPERMAJORITY_REJECT: f64 = 0.34;

/// Decide a proposal from its current votes
///
/// Returns `Some(Approved | Rejected)` once the method's rule is satisfied,
/// `None` while the proposal should stay pending. Abstentions count toward
/// quorum but never toward either side.
pub fn evaluate(
    method: ConsensusMethod,
    votes: &BTreeMap<String, Vote>,
    quorum: usize,
) -> Option<ProposalStatus> {
    let counts = VoteCounts::tally(votes.values());

    match method {
        ConsensusMethod::Unanimous => {
            if counts.reject > 0 {
                Some(ProposalStatus::Rejected)
            } else if counts.approve > 0 {
                Some(ProposalStatus::Approved)
            } else {
                None
            }
        }
        ConsensusMethod::Majority => {
            if counts.total() < quorum {
                return None;
            }
            if counts.approve > counts.reject {
                Some(ProposalStatus::Approved)
            } else if counts.reject > counts.approve {
                Some(ProposalStatus::Rejected)
            } else {
                None
            }
        }
        ConsensusMethod::Supermajority => {
            if counts.total() < quorum {
                return None;
            }
            let decided = counts.approve + counts.reject;
            let approval_rate = if decided == 0 {
                0.0
            } else {
                counts.approve as f64 / decided as f64
            };
            if approval_rate >= SUPERMAJORITY_APPROVE {
                Some(ProposalStatus::Approved)
            } else if approval_rate < SUPERMAJORITY_REJECT {
                Some(ProposalStatus::Rejected)
            } else {
                None
            }
        }
        ConsensusMethod::Weighted => {
            let weight = |choice: VoteChoice| -> f64 {
                votes
                    .values()
                    .filter(|v| v.choice == choice)
                    .map(|v| vote_weight(v.confidence))
                    .sum()
            };
            let approve = weight(VoteChoice::Approve);
            let reject = weight(VoteChoice::Reject);

            if approve + reject <= 0.0 {
                None
            } else if approve > reject {
                Some(ProposalStatus::Approved)
            } else {
                // Ties resolve rejected
                Some(ProposalStatus::Rejected)
            }
        }
    }
}

/// Confidence as a weight in 0..=1; deserialized votes are not clamped
fn vote_weight(confidence: f64) -> f64 {
    if confidence.is_nan() {
        0.0
    } else {
        confidence.clamp(0.0, 1.0)
    }
}
