//! Capability selector
//!
//! Scores candidate agents for a capability and picks one. Scoring is a pure
//! function of the candidate's counters so the same inputs always select the
//! same agent.

use std::time::Duration;

/// Inputs used to score one agent for one capability
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateStats {
    pub agent_id: String,
    /// Declared confidence for the capability
    pub confidence: f64,
    /// `None` when the agent has no decision history
    pub success_rate: Option<f64>,
    pub queue_len: usize,
    /// `None` when the agent has not processed anything yet
    pub avg_response_time: Option<Duration>,
}

impl CandidateStats {
    /// confidence × (0.5 + 0.5 × success) × load factor × latency factor
    pub fn score(&self) -> f64 {
        let success = self.success_rate.unwrap_or(1.0);
        let mut score = self.confidence * (0.5 + 0.5 * success);

        let load = 1.0 - self.queue_len as f64 / 100.0;
        score *= load.max(0.1);

        if let Some(avg) = self.avg_response_time {
            let latency = 1.0 - avg.as_secs_f64() / 60.0;
            score *= latency.max(0.1);
        }

        score
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    Selected { agent_id: String, score: f64 },
    NoneAvailable,
}

impl Selection {
    pub fn agent_id(&self) -> Option<&str> {
        match self {
            Selection::Selected { agent_id, .. } => Some(agent_id),
            Selection::NoneAvailable => None,
        }
    }
}

/// Pick the highest scoring candidate
///
/// Equal scores go to the lowest agent id. Candidates scoring zero are never
/// selected.
pub fn select<I>(candidates: I) -> Selection
where
    I: IntoIterator<Item = CandidateStats>,
{
    let mut best: Option<(String, f64)> = None;

    for candidate in candidates {
        let score = candidate.score();
        if score.is_nan() || score <= 0.0 {
            continue;
        }
        let better = match &best {
            None => true,
            Some((best_id, best_score)) => {
                score > *best_score || (score == *best_score && candidate.agent_id < *best_id)
            }
        };
        if better {
            best = Some((candidate.agent_id, score));
        }
    }

    match best {
        Some((agent_id, score)) => Selection::Selected { agent_id, score },
        None => Selection::NoneAvailable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, confidence: f64) -> CandidateStats {
        CandidateStats {
            agent_id: id.to_string(),
            confidence,
            success_rate: None,
            queue_len: 0,
            avg_response_time: None,
        }
    }

    #[test]
    fn test_score_without_history() {
        assert!((candidate("a", 0.8).score() - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_score_applies_every_factor() {
        let stats = CandidateStats {
            agent_id: "a".into(),
            confidence: 0.8,
            success_rate: Some(0.5),
            queue_len: 50,
            avg_response_time: Some(Duration::from_secs(30)),
        };
        // 0.8 * 0.75 * 0.5 * 0.5
        assert!((stats.score() - 0.15).abs() < 1e-9);
    }

    #[test]
    fn test_factors_are_floored() {
        let stats = CandidateStats {
            agent_id: "a".into(),
            confidence: 1.0,
            success_rate: Some(1.0),
            queue_len: 500,
            avg_response_time: Some(Duration::from_secs(600)),
        };
        assert!((stats.score() - 0.01).abs() < 1e-9);
    }

    #[test]
    fn test_highest_score_wins() {
        let selection = select(vec![candidate("a", 0.6), candidate("b", 0.9)]);
        assert_eq!(selection.agent_id(), Some("b"));
    }

    #[test]
    fn test_ties_go_to_lowest_id_regardless_of_order() {
        let forward = select(vec![candidate("beta", 0.7), candidate("alpha", 0.7)]);
        let reverse = select(vec![candidate("alpha", 0.7), candidate("beta", 0.7)]);
        assert_eq!(forward.agent_id(), Some("alpha"));
        assert_eq!(forward, reverse);
    }

    #[test]
    fn test_none_available() {
        assert_eq!(select(Vec::new()), Selection::NoneAvailable);
        assert_eq!(select(vec![candidate("zero", 0.0)]), Selection::NoneAvailable);
    }
}
