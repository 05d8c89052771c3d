//! Workflow engine
//!
//! Named templates of capability and consensus steps, grouped into
//! sequential and parallel units and driven to completion or failure.

mod engine;
mod plan;
mod state;
mod template;

pub use engine::{CoordinationMetrics, WorkflowEngine};
pub use plan::{plan, ExecutionUnit};
pub use state::{StepResult, Workflow, WorkflowStatus, WorkflowStatusReport};
pub use template::{StepSpec, TemplateCatalog, WorkflowTemplate, DEFAULT_CONSENSUS_CAPABILITIES};
