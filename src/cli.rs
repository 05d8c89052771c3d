use clap::{Parser, Subcommand};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::agent::{spawn_agent, AgentHandle, Capability, LoopbackAgent};
use crate::bootstrap::CoordinationRuntime;
use crate::consensus::{ConsensusMethod, Vote};
use crate::error::{ConcordError, Result};
use crate::hub::CommunicationHub;
use crate::workflow::{StepSpec, TemplateCatalog, WorkflowStatus};

#[derive(Parser)]
#[command(name = "concord")]
#[command(version = "0.1.0")]
#[command(about = "Multi-agent coordination: message hub, consensus and workflows", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Directory holding default.toml and environment overrides
    #[arg(short, long, default_value = "config", env = "CONCORD_CONFIG_DIR")]
    pub config: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List workflow templates
    Templates,
    /// Run a workflow against in-process loopback agents
    Run {
        /// Workflow type, e.g. daily_cash_management
        workflow_type: String,
        /// Workflow parameters as JSON
        #[arg(long, default_value = "{}")]
        params: String,
        /// Give up waiting after this many seconds
        #[arg(long, default_value = "60")]
        timeout_secs: u64,
        /// Print metrics in Prometheus text format when done
        #[arg(long)]
        prometheus: bool,
    },
    /// Put a proposal to a vote among loopback agents
    Propose {
        /// Proposal type, e.g. investment_approval
        proposal_type: String,
        /// majority, unanimous, supermajority or weighted
        #[arg(long, default_value = "majority")]
        method: String,
        /// Number of voters that reject
        #[arg(long, default_value = "0")]
        rejecting: usize,
        /// Total number of voters
        #[arg(long, default_value = "3")]
        voters: usize,
        /// Proposal content as JSON
        #[arg(long, default_value = "{}")]
        content: String,
    },
}

fn parse_json(raw: &str, what: &str) -> Result<Value> {
    serde_json::from_str(raw)
        .map_err(|e| ConcordError::InvalidConfig(format!("{} is not valid JSON: {}", what, e)))
}

/// Print the template catalog
pub fn list_templates(catalog: &TemplateCatalog) {
    let mut templates: Vec<_> = catalog.iter().collect();
    templates.sort_by(|a, b| a.workflow_type.cmp(&b.workflow_type));

    println!("\n=== Workflow Templates ({}) ===\n", templates.len());
    for template in templates {
        println!(
            "{} - {} (~{} min)",
            template.workflow_type,
            template.name,
            template.estimated_duration_secs / 60
        );
        for step in &template.steps {
            let marker = if template.is_parallel(step.name()) { "||" } else { "  " };
            match step {
                StepSpec::Capability { name, capability } => {
                    println!("  {} {:<28} {}", marker, name, capability)
                }
                StepSpec::Consensus { name, method, .. } => println!(
                    "  {} {:<28} consensus ({})",
                    marker,
                    name,
                    method.unwrap_or(ConsensusMethod::Majority)
                ),
            }
        }
        println!();
    }
}

/// One loopback agent per capability
pub fn spawn_loopback_agents(hub: &Arc<CommunicationHub>) -> Vec<AgentHandle> {
    Capability::ALL
        .iter()
        .map(|cap| {
            let id = format!("{}_agent", cap);
            spawn_agent(hub.clone(), Arc::new(LoopbackAgent::new(&id, &[*cap])))
        })
        .collect()
}

/// Run one workflow to a terminal state and print its report
pub async fn run_workflow(
    runtime: &CoordinationRuntime,
    workflow_type: &str,
    params: &str,
    timeout: Duration,
) -> Result<WorkflowStatus> {
    let parameters = parse_json(params, "--params")?;
    let agents = spawn_loopback_agents(&runtime.hub);
    info!("Spawned {} loopback agents", agents.len());

    let workflow_id = runtime
        .workflows
        .initiate(workflow_type, parameters, "cli")?;
    println!("Started workflow {}", workflow_id);

    let deadline = tokio::time::Instant::now().checked_add(timeout);
    let report = loop {
        let report = runtime
            .workflows
            .status(&workflow_id)
            .await
            .ok_or_else(|| ConcordError::not_found("workflow", workflow_id.as_str()))?;
        if report.status.is_terminal() {
            break report;
        }
        if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
            warn!("Workflow {} still {} at deadline, cancelling", workflow_id, report.status);
            runtime.workflows.cancel(&workflow_id).await;
            return Err(ConcordError::Timeout {
                what: format!("workflow {}", workflow_id),
                elapsed_ms: timeout.as_millis() as u64,
            });
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    for agent in agents {
        agent.stop(&runtime.hub).await;
    }
    Ok(report.status)
}

/// Run one consensus round and print the outcome
pub async fn run_proposal(
    runtime: &CoordinationRuntime,
    proposal_type: &str,
    method: &str,
    voters: usize,
    rejecting: usize,
    content: &str,
) -> Result<()> {
    let method: ConsensusMethod = method.parse().map_err(ConcordError::InvalidConfig)?;
    let content = parse_json(content, "--content")?;

    let agents: Vec<_> = (0..voters)
        .map(|i| {
            let vote = if i < rejecting {
                Vote::reject()
            } else {
                Vote::approve()
            };
            let agent = LoopbackAgent::new(&format!("voter_{:02}", i), &[Capability::RiskAssessment])
                .with_vote(vote.with_confidence(0.8));
            spawn_agent(runtime.hub.clone(), Arc::new(agent))
        })
        .collect();

    let handle = runtime
        .consensus
        .initiate("cli", proposal_type, content, &[Capability::RiskAssessment], method, None)
        .await;
    let outcome = handle.outcome().await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);

    for agent in agents {
        agent.stop(&runtime.hub).await;
    }
    Ok(())
}
