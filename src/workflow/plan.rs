//! Execution plan: template steps grouped into sequential units

use super::template::WorkflowTemplate;

/// A unit the engine runs before moving on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionUnit {
    /// One step, by index
    Single(usize),
    /// A maximal contiguous run of parallel-marked steps, run concurrently
    Parallel(Vec<usize>),
}

impl ExecutionUnit {
    pub fn first_index(&self) -> usize {
        match self {
            ExecutionUnit::Single(i) => *i,
            ExecutionUnit::Parallel(indices) => indices.first().copied().unwrap_or_default(),
        }
    }

    pub fn indices(&self) -> Vec<usize> {
        match self {
            ExecutionUnit::Single(i) => vec![*i],
            ExecutionUnit::Parallel(indices) => indices.clone(),
        }
    }
}

/// Group a template's steps into execution units
///
/// A parallel-marked step with no parallel-marked neighbour runs alone.
pub fn plan(template: &WorkflowTemplate) -> Vec<ExecutionUnit> {
    let mut units = Vec::new();
    let mut run: Vec<usize> = Vec::new();

    for (index, step) in template.steps.iter().enumerate() {
        if template.is_parallel(step.name()) {
            run.push(index);
            continue;
        }
        flush(&mut run, &mut units);
        units.push(ExecutionUnit::Single(index));
    }
    flush(&mut run, &mut units);

    units
}

fn flush(run: &mut Vec<usize>, units: &mut Vec<ExecutionUnit>) {
    match run.len() {
        0 => {}
        1 => units.push(ExecutionUnit::Single(run[0])),
        _ => units.push(ExecutionUnit::Parallel(std::mem::take(run))),
    }
    run.clear();
}
