//! The RunNode fixpoint driver.

use super::RunState;
use crate::engine::EngineContext;
use crate::errors::{Result, SchedulingError};
use crate::events::EngineEvent;
use crate::exec::{gather_inputs, prepare_run, ExecOutcome, PrepareOptions};
use crate::graph::{ExecutionGraph, GraphId};
use crate::jobs::JobHandle;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

/// Options of a scheduler run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Recompute the target even if its outputs are done.
    #[serde(default)]
    pub force: bool,
}

impl RunOptions {
    /// Options for a forced re-run.
    #[must_use]
    pub fn forced() -> Self {
        Self { force: true }
    }
}

/// What a run did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Names of the nodes executed, in order.
    pub executed: Vec<String>,
    /// Tasks dispatched across all nodes.
    pub tasks: usize,
    /// Resolutions applied.
    pub resolutions: usize,
    /// True if the run ended because its job was stopped.
    pub stopped: bool,
}

/// Drives graphs to completion under one `multiexec` job.
pub struct Scheduler<'a> {
    pub(super) ctx: &'a EngineContext,
    pub(super) job: &'a JobHandle,
}

impl<'a> Scheduler<'a> {
    /// Creates a scheduler acting for `job`.
    #[must_use]
    pub fn new(ctx: &'a EngineContext, job: &'a JobHandle) -> Self {
        Self { ctx, job }
    }

    /// Runs `target` and every needed ancestor.
    ///
    /// # Errors
    ///
    /// Returns a scheduling error if the graph cannot be completed, a
    /// conflict error if another job claims the same nodes, or the first
    /// task error.
    pub async fn run(
        &self,
        graph: ExecutionGraph,
        target: GraphId,
        options: RunOptions,
    ) -> Result<RunSummary> {
        let mut state = RunState::new(self.ctx.datasets.as_ref(), graph, target, options.force)?;
        self.commit(&state)?;
        info!(
            job_id = self.job.id(),
            target = %state.graph().display_name(state.target()),
            needed = state.needed_len(),
            "scheduler run started"
        );
        self.drive(&mut state).await
    }

    pub(super) fn commit(&self, state: &RunState) -> Result<()> {
        self.ctx
            .conflicts
            .commit(self.ctx.jobs.store().as_ref(), self.job.id(), &state.needed_node_ids())
    }

    /// Executes needed nodes until the target is ready.
    pub(super) async fn drive(&self, state: &mut RunState) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        let token = self.job.token().clone();

        while state.needed_len() > 0 {
            if token.is_cancelled() {
                summary.stopped = true;
                return Ok(summary);
            }
            let mut progressed = false;

            for id in state.candidates() {
                if token.is_cancelled() {
                    summary.stopped = true;
                    return Ok(summary);
                }
                let Some(node) = state.graph().operator(&id).cloned() else {
                    state.mark_ready(&id);
                    progressed = true;
                    continue;
                };
                let operator = self.ctx.operators.get(&node.op)?;
                let inputs = gather_inputs(
                    self.ctx.datasets.as_ref(),
                    state.graph(),
                    state.hashes(),
                    &node,
                    false,
                )?;

                if let Some(subgraph) = operator.resolve(&node, &inputs.datasets, &inputs.items)? {
                    state.record_resolution(&id, self.ctx.config.max_resolutions_per_node)?;
                    let added = state.incorporate(self.ctx, self.ctx.datasets.as_ref(), subgraph)?;
                    info!(node = %node.name, added = added.len(), "node resolved");
                    self.ctx.events.try_emit(
                        EngineEvent::NodeResolved,
                        Some(json!({"node": node.name, "added": added.len()})),
                    );
                    summary.resolutions += 1;
                    progressed = true;
                    break;
                }

                let options = PrepareOptions {
                    force: state.forces(&id),
                    ..PrepareOptions::default()
                };
                let hash = state.hash(&id)?.to_string();
                let Some(prepared) = prepare_run(
                    self.ctx.datasets.as_ref(),
                    operator.as_ref(),
                    &node,
                    &hash,
                    &inputs,
                    &options,
                )?
                else {
                    debug!(node = %node.name, "outputs became ready");
                    state.mark_ready(&id);
                    progressed = true;
                    continue;
                };

                self.ctx.events.try_emit(
                    EngineEvent::NodeStarted,
                    Some(json!({"node": node.name, "tasks": prepared.tasks.len()})),
                );
                match self
                    .ctx
                    .executor
                    .execute(&node, operator.as_ref(), prepared, token.clone())
                    .await?
                {
                    ExecOutcome::Stopped => {
                        info!(node = %node.name, "run stopped");
                        summary.stopped = true;
                        return Ok(summary);
                    }
                    ExecOutcome::Completed { tasks, .. } => {
                        self.ctx.events.try_emit(
                            EngineEvent::NodeCompleted,
                            Some(json!({"node": node.name, "tasks": tasks})),
                        );
                        summary.executed.push(node.name.clone());
                        summary.tasks += tasks;
                        state.mark_ready(&id);
                        progressed = true;
                    }
                }
                let completed = summary.executed.len();
                self.job.progress(completed, completed + state.needed_len());
            }

            if !progressed {
                return Err(SchedulingError::unsatisfiable(state.needed_names()).into());
            }
        }

        Ok(summary)
    }
}
