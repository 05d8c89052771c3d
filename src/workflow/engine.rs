//! Workflow engine
//!
//! Runs template steps in plan order. Capability steps go through the hub's
//! selector and request path; consensus steps go through the consensus
//! engine. Each workflow runs in its own task and is guarded by its own lock.

use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::plan::{plan, ExecutionUnit};
use super::state::{StepResult, Workflow, WorkflowStatus, WorkflowStatusReport};
use super::template::{StepSpec, TemplateCatalog, DEFAULT_CONSENSUS_CAPABILITIES};
use crate::agent::Capability;
use crate::config::{ConsensusStepMode, WorkflowConfig};
use crate::consensus::{ConsensusEngine, ConsensusMethod};
use crate::error::{ConcordError, Result};
use crate::hub::{CapabilityOutcome, CommunicationHub};
use crate::observability::{smooth_duration, tags, MetricKind, MetricsSink};

struct ActiveWorkflow {
    state: Arc<RwLock<Workflow>>,
    task: Option<AbortHandle>,
}

/// Running totals over finished workflows
#[derive(Debug, Clone, Default)]
struct WorkflowMetrics {
    completed: u64,
    failed: u64,
    cancelled: u64,
    avg_execution_time: Option<Duration>,
}

impl WorkflowMetrics {
    fn success_rate(&self) -> f64 {
        let finished = self.completed + self.failed;
        if finished == 0 {
            0.0
        } else {
            self.completed as f64 / finished as f64
        }
    }
}

/// Snapshot returned by `WorkflowEngine::coordination_metrics`
#[derive(Debug, Clone, Serialize)]
pub struct CoordinationMetrics {
    pub active_workflows: usize,
    pub workflows_completed: u64,
    pub workflows_failed: u64,
    pub workflows_cancelled: u64,
    pub avg_execution_secs: f64,
    pub success_rate: f64,
    pub workflows_by_type: BTreeMap<String, u64>,
    pub active_proposals: usize,
    pub registered_agents: usize,
}

pub struct WorkflowEngine {
    config: WorkflowConfig,
    catalog: TemplateCatalog,
    hub: Arc<CommunicationHub>,
    consensus: Arc<ConsensusEngine>,
    sink: Arc<dyn MetricsSink>,
    active: DashMap<String, ActiveWorkflow>,
    history: RwLock<VecDeque<Workflow>>,
    metrics: RwLock<WorkflowMetrics>,
    initiated_by_type: DashMap<String, u64>,
}

impl WorkflowEngine {
    pub fn new(
        config: WorkflowConfig,
        catalog: TemplateCatalog,
        hub: Arc<CommunicationHub>,
        consensus: Arc<ConsensusEngine>,
        sink: Arc<dyn MetricsSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            catalog,
            hub,
            consensus,
            sink,
            active: DashMap::new(),
            history: RwLock::new(VecDeque::new()),
            metrics: RwLock::new(WorkflowMetrics::default()),
            initiated_by_type: DashMap::new(),
        })
    }

    pub fn templates(&self) -> &TemplateCatalog {
        &self.catalog
    }

    /// Create a workflow and start running it in the background
    ///
    /// Returns the workflow id immediately. Must be called from within a
    /// tokio runtime.
    pub fn initiate(
        self: &Arc<Self>,
        workflow_type: &str,
        parameters: Value,
        initiator: &str,
    ) -> Result<String> {
        let template = self.catalog.get(workflow_type).ok_or_else(|| {
            error!("Unknown workflow type: {}", workflow_type);
            ConcordError::not_found("workflow template", workflow_type)
        })?;

        let workflow_id = format!("{}_{}", workflow_type, Uuid::new_v4().simple());
        *self
            .initiated_by_type
            .entry(workflow_type.to_string())
            .or_insert(0) += 1;
        let state = Arc::new(RwLock::new(Workflow::new(
            workflow_id.clone(),
            template,
            parameters,
            initiator,
        )));
        self.active.insert(
            workflow_id.clone(),
            ActiveWorkflow {
                state: state.clone(),
                task: None,
            },
        );

        let engine = self.clone();
        let run_id = workflow_id.clone();
        let task = tokio::spawn(async move {
            engine.run(&run_id, state).await;
        });
        // The task may already have finished and archived itself
        if let Some(mut entry) = self.active.get_mut(&workflow_id) {
            entry.task = Some(task.abort_handle());
        }

        info!(
            "Initiated workflow {} of type {} for {}",
            workflow_id, workflow_type, initiator
        );
        Ok(workflow_id)
    }

    async fn run(&self, workflow_id: &str, state: Arc<RwLock<Workflow>>) {
        let (template, parameters) = {
            let mut wf = state.write().await;
            if wf.transition(WorkflowStatus::InProgress).is_err() {
                return;
            }
            (wf.template.clone(), wf.parameters.clone())
        };

        for unit in plan(&template) {
            {
                let mut wf = state.write().await;
                if wf.status.is_terminal() {
                    return;
                }
                wf.current_step = unit.first_index();
            }

            let indices = unit.indices();
            debug!(
                "Workflow {} running steps {:?}",
                workflow_id,
                indices
                    .iter()
                    .map(|i| template.steps[*i].name())
                    .collect::<Vec<_>>()
            );

            let results = join_all(indices.iter().map(|&i| {
                let step = &template.steps[i];
                let state = &state;
                let parameters = &parameters;
                async move {
                    let outcome = self.execute_step(workflow_id, state, step, parameters).await;
                    (step.name().to_string(), outcome)
                }
            }))
            .await;

            let mut wf = state.write().await;
            if wf.status.is_terminal() {
                return;
            }

            let mut failures = Vec::new();
            for (name, outcome) in results {
                match outcome {
                    Ok(result) => wf.record_success(&name, result),
                    Err(reason) => {
                        warn!("Workflow {} step {} failed: {}", workflow_id, name, reason);
                        failures.push((name, reason));
                    }
                }
            }

            if !failures.is_empty() {
                let message = match (&unit, failures.as_slice()) {
                    (ExecutionUnit::Single(_), [(step, reason)]) => ConcordError::StepFailure {
                        step: step.clone(),
                        reason: reason.clone(),
                    }
                    .to_string(),
                    _ => format!(
                        "Parallel steps failed: {}",
                        failures
                            .iter()
                            .map(|(name, _)| name.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    ),
                };
                error!("Workflow {} failed: {}", workflow_id, message);
                wf.error = Some(message);
                if wf.transition(WorkflowStatus::Failed).is_ok() {
                    let finished = wf.clone();
                    drop(wf);
                    self.finish(finished).await;
                }
                return;
            }
        }

        let mut wf = state.write().await;
        if wf.transition(WorkflowStatus::Completed).is_ok() {
            info!(
                "Workflow {} completed ({} steps)",
                workflow_id,
                wf.completed_steps.len()
            );
            let finished = wf.clone();
            drop(wf);
            self.finish(finished).await;
        }
    }

    async fn execute_step(
        &self,
        workflow_id: &str,
        state: &Arc<RwLock<Workflow>>,
        step: &StepSpec,
        parameters: &Value,
    ) -> std::result::Result<StepResult, String> {
        info!("Executing step {} for workflow {}", step.name(), workflow_id);
        match step {
            StepSpec::Capability { capability, .. } => {
                let outcome = self
                    .hub
                    .request_capability(&self.config.coordinator_id, *capability, parameters.clone())
                    .await;
                match outcome {
                    CapabilityOutcome::Completed {
                        agent_id,
                        result,
                        elapsed,
                    } => Ok(StepResult::Capability {
                        agent_id,
                        result,
                        elapsed_ms: elapsed.as_millis() as u64,
                    }),
                    CapabilityOutcome::Failed { agent_id, reason } => {
                        Err(format!("{} failed {}: {}", agent_id, capability, reason))
                    }
                    CapabilityOutcome::NoAgentAvailable => {
                        Err(format!("no agent available for {}", capability))
                    }
                    CapabilityOutcome::TimedOut { agent_id, timeout } => Err(format!(
                        "{} did not answer {} within {:?}",
                        agent_id, capability, timeout
                    )),
                }
            }
            StepSpec::Consensus {
                name,
                method,
                capabilities,
            } => {
                self.consensus_step(workflow_id, state, name, *method, capabilities.as_deref())
                    .await
            }
        }
    }

    async fn consensus_step(
        &self,
        workflow_id: &str,
        state: &Arc<RwLock<Workflow>>,
        step_name: &str,
        method: Option<ConsensusMethod>,
        capabilities: Option<&[Capability]>,
    ) -> std::result::Result<StepResult, String> {
        let content = {
            let wf = state.read().await;
            json!({
                "workflow_id": workflow_id,
                "step_name": step_name,
                "workflow_parameters": wf.parameters,
                "previous_results": serde_json::to_value(&wf.step_results).unwrap_or(Value::Null),
            })
        };

        let handle = self
            .consensus
            .initiate(
                &self.config.coordinator_id,
                &format!("workflow_{}", step_name),
                content,
                capabilities.unwrap_or(&DEFAULT_CONSENSUS_CAPABILITIES[..]),
                method.unwrap_or(ConsensusMethod::Majority),
                Some(self.config.consensus_timeout()),
            )
            .await;
        let proposal_id = handle.proposal_id().to_string();
        state
            .write()
            .await
            .consensus_proposals
            .insert(step_name.to_string(), proposal_id.clone());

        if self.config.consensus_step_mode == ConsensusStepMode::FireAndForget {
            return Ok(StepResult::ConsensusPending { proposal_id });
        }

        {
            let mut wf = state.write().await;
            if wf.status == WorkflowStatus::InProgress {
                let _ = wf.transition(WorkflowStatus::WaitingForInput);
            }
        }
        debug!(
            "Workflow {} waiting on proposal {} for {}",
            workflow_id, proposal_id, step_name
        );

        let outcome = handle.outcome().await.map_err(|e| e.to_string())?;

        {
            let mut wf = state.write().await;
            if wf.status == WorkflowStatus::WaitingForInput {
                let _ = wf.transition(WorkflowStatus::InProgress);
            }
        }

        if outcome.is_approved() {
            Ok(StepResult::Consensus {
                proposal_id,
                status: outcome.status,
                summary: outcome.summary,
            })
        } else {
            Err(format!("proposal {} ended {}", proposal_id, outcome.status))
        }
    }

    /// Move a terminal workflow into history and update metrics
    ///
    /// Called only by whoever performed the terminal transition.
    async fn finish(&self, workflow: Workflow) {
        let status = workflow.status;
        let workflow_type = workflow.workflow_type.clone();
        let execution_time = workflow.execution_time();

        {
            let mut metrics = self.metrics.write().await;
            match status {
                WorkflowStatus::Completed => {
                    metrics.completed += 1;
                    if let Some(elapsed) = execution_time {
                        metrics.avg_execution_time =
                            Some(smooth_duration(metrics.avg_execution_time, elapsed));
                    }
                }
                WorkflowStatus::Failed => metrics.failed += 1,
                _ => metrics.cancelled += 1,
            }
        }

        let metric_tags = tags(&[
            ("workflow_type", workflow_type.as_str()),
            ("status", status.as_str()),
        ]);
        self.sink
            .record_metric(MetricKind::Counter, "workflows_finished_total", 1.0, &metric_tags);
        if let Some(elapsed) = execution_time {
            self.sink.record_metric(
                MetricKind::Histogram,
                "workflow_duration_seconds",
                elapsed.as_secs_f64(),
                &metric_tags,
            );
        }

        let workflow_id = workflow.id.clone();
        {
            let mut history = self.history.write().await;
            if history.len() >= self.config.history_capacity.max(1) {
                history.pop_front();
            }
            history.push_back(workflow);
        }
        self.active.remove(&workflow_id);
    }

    /// Status of an active or archived workflow
    pub async fn status(&self, workflow_id: &str) -> Option<WorkflowStatusReport> {
        self.workflow(workflow_id).await.map(|wf| wf.report())
    }

    /// Full snapshot, including step results
    pub async fn workflow(&self, workflow_id: &str) -> Option<Workflow> {
        let active = self.active.get(workflow_id).map(|e| e.state.clone());
        if let Some(state) = active {
            return Some(state.read().await.clone());
        }

        let history = self.history.read().await;
        history.iter().rev().find(|wf| wf.id == workflow_id).cloned()
    }

    /// Stop a running workflow
    ///
    /// Returns false for unknown or already finished workflows.
    pub async fn cancel(&self, workflow_id: &str) -> bool {
        let Some((state, task)) = self
            .active
            .get(workflow_id)
            .map(|e| (e.state.clone(), e.task.clone()))
        else {
            debug!("Cancel ignored, workflow {} is not active", workflow_id);
            return false;
        };

        let finished = {
            let mut wf = state.write().await;
            if wf.transition(WorkflowStatus::Cancelled).is_err() {
                return false;
            }
            wf.error = Some("cancelled".to_string());
            wf.clone()
        };

        if let Some(task) = task {
            task.abort();
        }
        warn!("Workflow {} cancelled", workflow_id);
        self.finish(finished).await;
        true
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub async fn history_len(&self) -> usize {
        self.history.read().await.len()
    }

    pub async fn coordination_metrics(&self) -> CoordinationMetrics {
        let metrics = self.metrics.read().await.clone();
        CoordinationMetrics {
            active_workflows: self.active.len(),
            workflows_completed: metrics.completed,
            workflows_failed: metrics.failed,
            workflows_cancelled: metrics.cancelled,
            avg_execution_secs: metrics
                .avg_execution_time
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0),
            success_rate: metrics.success_rate(),
            workflows_by_type: self
                .initiated_by_type
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            active_proposals: self.consensus.active_count(),
            registered_agents: self.hub.registry().agent_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{spawn_agent, Capability, LoopbackAgent};
    use crate::config::{ConsensusConfig, HubConfig};
    use crate::observability::NoopSink;

    fn engine(config: WorkflowConfig) -> (Arc<CommunicationHub>, Arc<WorkflowEngine>) {
        let sink: Arc<dyn MetricsSink> = Arc::new(NoopSink);
        let hub = Arc::new(CommunicationHub::new(HubConfig::default(), sink.clone()));
        let consensus = ConsensusEngine::new(ConsensusConfig::default(), hub.clone(), sink.clone());
        consensus.start();
        let workflows = WorkflowEngine::new(
            config,
            TemplateCatalog::builtin(),
            hub.clone(),
            consensus,
            sink,
        );
        (hub, workflows)
    }

    async fn wait_terminal(engine: &WorkflowEngine, id: &str) -> WorkflowStatusReport {
        for _ in 0..200 {
            if let Some(report) = engine.status(id).await {
                if report.status.is_terminal() {
                    return report;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("workflow {} did not finish", id);
    }

    #[tokio::test]
    async fn test_unknown_type_is_not_found() {
        let (_hub, engine) = engine(WorkflowConfig::default());
        let err = engine.initiate("moon_landing", json!({}), "ops").unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(engine.active_count(), 0);
    }

    #[tokio::test]
    async fn test_collections_campaign_completes() {
        let (hub, engine) = engine(WorkflowConfig::default());
        let _agents = vec![
            spawn_agent(
                hub.clone(),
                Arc::new(LoopbackAgent::new(
                    "collector",
                    &[Capability::CollectionsOptimization, Capability::RiskAssessment],
                )),
            ),
            spawn_agent(
                hub.clone(),
                Arc::new(LoopbackAgent::new(
                    "planner",
                    &[Capability::CashForecasting, Capability::ComplianceCheck],
                )),
            ),
        ];

        let id = engine
            .initiate("collections_campaign", json!({"region": "emea"}), "ops")
            .unwrap();
        assert!(id.starts_with("collections_campaign_"));

        let report = wait_terminal(&engine, &id).await;
        assert_eq!(report.status, WorkflowStatus::Completed);
        assert_eq!(report.completed_steps.len(), 5);
        assert_eq!(report.progress_percent, 100.0);

        let metrics = engine.coordination_metrics().await;
        assert_eq!(metrics.workflows_completed, 1);
        assert_eq!(metrics.success_rate, 1.0);
        assert_eq!(metrics.active_workflows, 0);
        assert_eq!(metrics.workflows_by_type.get("collections_campaign"), Some(&1));
    }

    #[tokio::test]
    async fn test_missing_capability_fails_workflow() {
        let (_hub, engine) = engine(WorkflowConfig::default());
        let id = engine
            .initiate("collections_campaign", json!({}), "ops")
            .unwrap();

        let report = wait_terminal(&engine, &id).await;
        assert_eq!(report.status, WorkflowStatus::Failed);
        assert!(report.completed_steps.is_empty());
        assert!(report.error.unwrap().contains("collections_analysis"));
        assert_eq!(engine.coordination_metrics().await.workflows_failed, 1);
    }

    #[tokio::test]
    async fn test_cancel_running_workflow() {
        let (hub, engine) = engine(WorkflowConfig::default());
        let _slow = spawn_agent(
            hub.clone(),
            Arc::new(
                LoopbackAgent::new("slow", &[Capability::CollectionsOptimization])
                    .with_latency(Duration::from_secs(30)),
            ),
        );

        let id = engine
            .initiate("collections_campaign", json!({}), "ops")
            .unwrap();
        assert!(engine.cancel(&id).await);
        assert!(!engine.cancel(&id).await);

        let report = engine.status(&id).await.unwrap();
        assert_eq!(report.status, WorkflowStatus::Cancelled);
        assert_eq!(engine.active_count(), 0);
        assert_eq!(engine.coordination_metrics().await.workflows_cancelled, 1);
    }

    #[tokio::test]
    async fn test_unknown_status_and_cancel() {
        let (_hub, engine) = engine(WorkflowConfig::default());
        assert!(engine.status("nope").await.is_none());
        assert!(!engine.cancel("nope").await);
    }
}
