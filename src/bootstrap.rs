//! Wires the hub, consensus engine and workflow engine together

use std::sync::Arc;
use tracing::info;

use crate::config::AppConfig;
use crate::consensus::ConsensusEngine;
use crate::error::{ConcordError, Result};
use crate::hub::CommunicationHub;
use crate::observability::{HubMetrics, MetricsSink};
use crate::workflow::{TemplateCatalog, WorkflowEngine};

/// Running coordination core
pub struct CoordinationRuntime {
    pub hub: Arc<CommunicationHub>,
    pub consensus: Arc<ConsensusEngine>,
    pub workflows: Arc<WorkflowEngine>,
    pub metrics: Arc<HubMetrics>,
}

impl CoordinationRuntime {
    /// Build every component from `config` and start the consensus endpoint
    ///
    /// Templates from `workflow.templates_file` are merged over the built-in
    /// catalog. Must be called from within a tokio runtime.
    pub fn start(config: &AppConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|errors| ConcordError::InvalidConfig(errors.join("; ")))?;

        let metrics = Arc::new(HubMetrics::new());
        let sink: Arc<dyn MetricsSink> = metrics.clone();

        let hub = Arc::new(CommunicationHub::new(config.hub.clone(), sink.clone()));
        let consensus = ConsensusEngine::new(config.consensus.clone(), hub.clone(), sink.clone());
        consensus.start();

        let mut catalog = TemplateCatalog::builtin();
        if let Some(path) = &config.workflow.templates_file {
            let extra = TemplateCatalog::load_file(path)?;
            info!("Loaded {} workflow templates from {}", extra.len(), path);
            catalog = catalog.merge(extra);
        }

        let workflows = WorkflowEngine::new(
            config.workflow.clone(),
            catalog,
            hub.clone(),
            consensus.clone(),
            sink,
        );

        info!(
            "Coordination core started (engine={}, coordinator={})",
            config.consensus.engine_id, config.workflow.coordinator_id
        );
        Ok(Self {
            hub,
            consensus,
            workflows,
            metrics,
        })
    }

    pub fn shutdown(&self) {
        self.consensus.stop();
        self.metrics.log_summary();
        info!("Coordination core stopped");
    }
}
