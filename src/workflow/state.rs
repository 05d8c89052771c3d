//! Workflow state machine

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::template::WorkflowTemplate;
use crate::consensus::{DecisionSummary, ProposalStatus};
use crate::error::{ConcordError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    InProgress,
    WaitingForInput,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::InProgress => "in_progress",
            WorkflowStatus::WaitingForInput => "waiting_for_input",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }

    /// Status only moves forward; terminal states are final
    pub fn can_transition_to(&self, next: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        match (self, next) {
            (Pending, InProgress | Failed | Cancelled) => true,
            (InProgress, WaitingForInput | Completed | Failed | Cancelled) => true,
            (WaitingForInput, InProgress | Failed | Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a successful step produced
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepResult {
    Capability {
        agent_id: String,
        result: Value,
        elapsed_ms: u64,
    },
    /// Proposal resolved before the step finished
    Consensus {
        proposal_id: String,
        status: ProposalStatus,
        summary: DecisionSummary,
    },
    /// Proposal sent; the step did not wait for its resolution
    ConsensusPending { proposal_id: String },
}

#[derive(Debug, Clone)]
pub struct Workflow {
    pub id: String,
    pub workflow_type: String,
    pub template: Arc<WorkflowTemplate>,
    pub parameters: Value,
    pub initiator: String,
    pub status: WorkflowStatus,
    /// Index of the first step of the unit being executed
    pub current_step: usize,
    pub completed_steps: Vec<String>,
    pub step_results: BTreeMap<String, StepResult>,
    /// step name -> proposal id
    pub consensus_proposals: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub estimated_completion: DateTime<Utc>,
    pub error: Option<String>,
}

impl Workflow {
    pub fn new(
        id: String,
        template: Arc<WorkflowTemplate>,
        parameters: Value,
        initiator: &str,
    ) -> Self {
        let now = Utc::now();
        let estimate = chrono::Duration::from_std(template.estimated_duration())
            .unwrap_or_else(|_| chrono::Duration::zero());
        Self {
            id,
            workflow_type: template.workflow_type.clone(),
            template,
            parameters,
            initiator: initiator.to_string(),
            status: WorkflowStatus::Pending,
            current_step: 0,
            completed_steps: Vec::new(),
            step_results: BTreeMap::new(),
            consensus_proposals: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
            estimated_completion: now.checked_add_signed(estimate).unwrap_or(now),
            error: None,
        }
    }

    pub fn transition(&mut self, next: WorkflowStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(ConcordError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        let now = Utc::now();
        self.status = next;
        self.updated_at = now;
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(())
    }

    pub fn record_success(&mut self, step: &str, result: StepResult) {
        self.completed_steps.push(step.to_string());
        self.step_results.insert(step.to_string(), result);
        self.updated_at = Utc::now();
    }

    pub fn total_steps(&self) -> usize {
        self.template.steps.len()
    }

    /// Completed steps as a percentage of all steps
    pub fn progress(&self) -> f64 {
        let total = self.total_steps();
        if total == 0 {
            return 0.0;
        }
        self.completed_steps.len() as f64 / total as f64 * 100.0
    }

    /// Wall time from creation to completion
    pub fn execution_time(&self) -> Option<std::time::Duration> {
        self.completed_at
            .and_then(|done| (done - self.created_at).to_std().ok())
    }

    pub fn report(&self) -> WorkflowStatusReport {
        WorkflowStatusReport {
            workflow_id: self.id.clone(),
            workflow_type: self.workflow_type.clone(),
            status: self.status,
            current_step: self.current_step,
            total_steps: self.total_steps(),
            completed_steps: self.completed_steps.clone(),
            progress_percent: self.progress(),
            consensus_proposals: self.consensus_proposals.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
            estimated_completion: self.estimated_completion,
            error: self.error.clone(),
        }
    }
}

/// Caller-facing view returned by `WorkflowEngine::status`
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowStatusReport {
    pub workflow_id: String,
    pub workflow_type: String,
    pub status: WorkflowStatus,
    pub current_step: usize,
    pub total_steps: usize,
    pub completed_steps: Vec<String>,
    pub progress_percent: f64,
    pub consensus_proposals: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub estimated_completion: DateTime<Utc>,
    pub error: Option<String>,
}
