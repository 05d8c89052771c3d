//! Workflow templates
//!
//! Templates are immutable once loaded. Five treasury templates are built
//! in; more can be loaded from TOML:
//!
//! ```toml
//! [[templates]]
//! workflow_type = "month_end_close"
//! name = "Month End Close"
//! description = "Reconcile and report"
//! parallel_steps = ["reconcile", "forecast"]
//! priority = "high"
//! estimated_duration_secs = 3600
//!
//! [[templates.steps]]
//! name = "reconcile"
//! capability = "reconciliation"
//!
//! [[templates.steps]]
//! name = "forecast"
//! capability = "cash_forecasting"
//!
//! [[templates.steps]]
//! name = "sign_off"
//! requires_consensus = true
//! method = "supermajority"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::agent::{Capability, MessagePriority};
use crate::consensus::ConsensusMethod;
use crate::error::{ConcordError, Result};

/// Capabilities polled by a consensus step that does not name its own
pub const DEFAULT_CONSENSUS_CAPABILITIES: [Capability; 3] = [
    Capability::RiskAssessment,
    Capability::InvestmentAnalysis,
    Capability::ComplianceCheck,
];

/// One template step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawStep", into = "RawStep")]
pub enum StepSpec {
    /// Delegate to the best agent offering `capability`
    Capability { name: String, capability: Capability },
    /// Put the workflow's progress to a vote
    Consensus {
        name: String,
        method: Option<ConsensusMethod>,
        capabilities: Option<Vec<Capability>>,
    },
}

impl StepSpec {
    pub fn capability(name: &str, capability: Capability) -> Self {
        StepSpec::Capability {
            name: name.to_string(),
            capability,
        }
    }

    pub fn consensus(name: &str, method: Option<ConsensusMethod>) -> Self {
        StepSpec::Consensus {
            name: name.to_string(),
            method,
            capabilities: None,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            StepSpec::Capability { name, .. } | StepSpec::Consensus { name, .. } => name,
        }
    }

    pub fn is_consensus(&self) -> bool {
        matches!(self, StepSpec::Consensus { .. })
    }
}

/// Flat on-disk shape of a step
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawStep {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    capability: Option<Capability>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    requires_consensus: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    method: Option<ConsensusMethod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    capabilities: Option<Vec<Capability>>,
}

impl TryFrom<RawStep> for StepSpec {
    type Error = String;

    fn try_from(raw: RawStep) -> std::result::Result<Self, Self::Error> {
        match (raw.requires_consensus, raw.capability) {
            (true, None) => Ok(StepSpec::Consensus {
                name: raw.name,
                method: raw.method,
                capabilities: raw.capabilities,
            }),
            (true, Some(_)) => Err(format!(
                "step {} cannot both require consensus and name a capability",
                raw.name
            )),
            (false, Some(capability)) => Ok(StepSpec::Capability {
                name: raw.name,
                capability,
            }),
            (false, None) => Err(format!(
                "step {} needs a capability or requires_consensus = true",
                raw.name
            )),
        }
    }
}

impl From<StepSpec> for RawStep {
    fn from(step: StepSpec) -> Self {
        match step {
            StepSpec::Capability { name, capability } => RawStep {
                name,
                capability: Some(capability),
                requires_consensus: false,
                method: None,
                capabilities: None,
            },
            StepSpec::Consensus {
                name,
                method,
                capabilities,
            } => RawStep {
                name,
                capability: None,
                requires_consensus: true,
                method,
                capabilities,
            },
        }
    }
}

fn default_priority() -> MessagePriority {
    MessagePriority::Medium
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub workflow_type: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<StepSpec>,
    /// Steps eligible for concurrent execution with contiguous neighbours
    #[serde(default)]
    pub parallel_steps: Vec<String>,
    #[serde(default = "default_priority")]
    pub priority: MessagePriority,
    #[serde(default)]
    pub estimated_duration_secs: u64,
}

impl WorkflowTemplate {
    pub fn estimated_duration(&self) -> Duration {
        Duration::from_secs(self.estimated_duration_secs)
    }

    pub fn is_parallel(&self, step_name: &str) -> bool {
        self.parallel_steps.iter().any(|s| s == step_name)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| ConcordError::InvalidTemplate {
            template: self.workflow_type.clone(),
            reason,
        };

        if self.workflow_type.trim().is_empty() {
            return Err(invalid("workflow_type must not be empty".to_string()));
        }
        if self.steps.is_empty() {
            return Err(invalid("template has no steps".to_string()));
        }

        let mut names = HashSet::new();
        for step in &self.steps {
            if !names.insert(step.name()) {
                return Err(invalid(format!("duplicate step name {}", step.name())));
            }
        }
        for parallel in &self.parallel_steps {
            if !names.contains(parallel.as_str()) {
                return Err(invalid(format!("parallel step {} is not a step", parallel)));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct TemplateFile {
    #[serde(default)]
    templates: Vec<WorkflowTemplate>,
}

/// Templates by workflow type
#[derive(Debug, Clone, Default)]
pub struct TemplateCatalog {
    templates: BTreeMap<String, Arc<WorkflowTemplate>>,
}

impl TemplateCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The five treasury workflows
    pub fn builtin() -> Self {
        use Capability::*;
        use StepSpec as S;

        let templates = vec![
            WorkflowTemplate {
                workflow_type: "daily_cash_management".into(),
                name: "Daily Cash Management".into(),
                description: "Comprehensive daily cash position management".into(),
                steps: vec![
                    S::capability("cash_position_analysis", CashForecasting),
                    S::capability("risk_assessment", RiskAssessment),
                    S::capability("liquidity_optimization", LiquidityManagement),
                    S::capability("compliance_check", ComplianceCheck),
                    S::capability("reporting", Reporting),
                ],
                parallel_steps: vec!["cash_position_analysis".into(), "risk_assessment".into()],
                priority: MessagePriority::High,
                estimated_duration_secs: 2 * 3600,
            },
            WorkflowTemplate {
                workflow_type: "payment_optimization".into(),
                name: "Payment Optimization".into(),
                description: "Optimize payment scheduling and cash flow".into(),
                steps: vec![
                    S::capability("payment_analysis", PaymentPrioritization),
                    S::capability("liquidity_impact", LiquidityManagement),
                    S::capability("risk_assessment", RiskAssessment),
                    S::capability("compliance_approval", ComplianceCheck),
                    S::capability("execution_planning", CashForecasting),
                ],
                parallel_steps: vec!["payment_analysis".into(), "liquidity_impact".into()],
                priority: MessagePriority::Medium,
                estimated_duration_secs: 5400,
            },
            WorkflowTemplate {
                workflow_type: "investment_planning".into(),
                name: "Investment Planning".into(),
                description: "Strategic investment allocation and optimization".into(),
                steps: vec![
                    S::capability("cash_forecast", CashForecasting),
                    S::capability("investment_analysis", InvestmentAnalysis),
                    S::capability("risk_assessment", RiskAssessment),
                    S::capability("compliance_review", ComplianceCheck),
                    S::consensus("consensus_decision", None),
                ],
                parallel_steps: vec!["investment_analysis".into(), "risk_assessment".into()],
                priority: MessagePriority::Medium,
                estimated_duration_secs: 3 * 3600,
            },
            WorkflowTemplate {
                workflow_type: "collections_campaign".into(),
                name: "Collections Campaign".into(),
                description: "Optimize collections strategy and execution".into(),
                steps: vec![
                    S::capability("collections_analysis", CollectionsOptimization),
                    S::capability("risk_profiling", RiskAssessment),
                    S::capability("cash_impact_forecast", CashForecasting),
                    S::capability("compliance_review", ComplianceCheck),
                    S::capability("execution_coordination", CollectionsOptimization),
                ],
                parallel_steps: Vec::new(),
                priority: MessagePriority::Medium,
                estimated_duration_secs: 2 * 3600,
            },
            WorkflowTemplate {
                workflow_type: "crisis_response".into(),
                name: "Crisis Response".into(),
                description: "Emergency treasury crisis management".into(),
                steps: vec![
                    S::capability("situation_assessment", RiskAssessment),
                    S::capability("liquidity_analysis", LiquidityManagement),
                    S::capability("scenario_planning", ScenarioAnalysis),
                    S::consensus("emergency_consensus", Some(ConsensusMethod::Supermajority)),
                    S::capability("crisis_execution", LiquidityManagement),
                ],
                parallel_steps: vec!["situation_assessment".into(), "liquidity_analysis".into()],
                priority: MessagePriority::Critical,
                estimated_duration_secs: 3600,
            },
        ];

        Self {
            templates: templates
                .into_iter()
                .map(|t| (t.workflow_type.clone(), Arc::new(t)))
                .collect(),
        }
    }

    /// Parse and validate a `[[templates]]` TOML document
    pub fn from_toml(source: &str) -> Result<Self> {
        let file: TemplateFile = toml::from_str(source)?;
        let mut catalog = Self::empty();
        for template in file.templates {
            catalog.insert(template)?;
        }
        Ok(catalog)
    }

    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let source = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&source)
    }

    /// Add a validated template, replacing any with the same type
    pub fn insert(&mut self, template: WorkflowTemplate) -> Result<()> {
        template.validate()?;
        self.templates
            .insert(template.workflow_type.clone(), Arc::new(template));
        Ok(())
    }

    /// Templates in `other` override ours
    pub fn merge(mut self, other: TemplateCatalog) -> Self {
        self.templates.extend(other.templates);
        self
    }

    pub fn get(&self, workflow_type: &str) -> Option<Arc<WorkflowTemplate>> {
        self.templates.get(workflow_type).cloned()
    }

    pub fn types(&self) -> Vec<&str> {
        self.templates.keys().map(String::as_str).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkflowTemplate> {
        self.templates.values().map(|t| t.as_ref())
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}
