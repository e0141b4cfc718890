//! The incremental planner.
//!
//! Produces a chosen subset of an incremental node's output keys, running
//! each incremental ancestor only for the keys that subset depends on.

use super::{RunState, Scheduler};
use crate::datasets::{computed_keys, output_hash_key, resolve_output_datasets};
use crate::errors::{ConfigurationError, PipegraphError, Result, SchedulingError};
use crate::events::EngineEvent;
use crate::exec::{gather_inputs, prepare_run, ExecOutcome, PrepareOptions};
use crate::graph::{ExecutionGraph, GraphId, GraphNode, Node, VirtualNode, VirtualParent};
use crate::operators::InputKeys;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, info};

/// Which output keys an incremental run should produce at its target.
///
/// Keys already computed at the target are never wanted again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "value", rename_all = "snake_case")]
pub enum WantedKeys {
    /// A random sample of this many missing keys.
    Count(usize),
    /// These keys, where missing.
    Keys(Vec<String>),
    /// Every missing key.
    All,
}

/// What an incremental run did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncrementalSummary {
    /// Keys produced at the target, sorted.
    pub wanted: Vec<String>,
    /// Names of the nodes executed, in order.
    pub executed: Vec<String>,
    /// Tasks dispatched across all nodes.
    pub tasks: usize,
    /// True if the run ended because its job was stopped.
    pub stopped: bool,
}

type KeyMap = HashMap<GraphId, Vec<String>>;

impl Scheduler<'_> {
    /// Produces `wanted` keys at the incremental node `target`.
    ///
    /// Non-incremental ancestors that are not ready run in full first.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the target is not incremental, a
    /// scheduling error if key propagation cannot complete, or the first task
    /// error.
    pub async fn incremental(
        &self,
        graph: ExecutionGraph,
        target: GraphId,
        wanted: &WantedKeys,
    ) -> Result<IncrementalSummary> {
        let store = self.ctx.datasets.as_ref();
        let mut state = RunState::new(store, graph, target.clone(), false)?;
        let target_node = state
            .graph()
            .operator(&target)
            .cloned()
            .ok_or_else(|| PipegraphError::config(format!("{target} is not an operator node")))?;
        if !self.ctx.operators.get(&target_node.op)?.is_incremental() {
            return Err(ConfigurationError::new("can only incrementally run incremental nodes")
                .with_node(target_node.name)
                .into());
        }

        let mut summary = IncrementalSummary::default();
        if state.is_ready(&target) {
            debug!(node = %target_node.name, "target already complete");
            return Ok(summary);
        }
        self.commit(&state)?;

        let (incremental, frontier) = self.partition(&state)?;
        if !frontier.is_empty() {
            info!(
                node = %target_node.name,
                count = frontier.len(),
                "running non-incremental ancestors"
            );
        }
        for id in frontier {
            if state.is_ready(&id) {
                continue;
            }
            state.retarget(id);
            let run = self.drive(&mut state).await?;
            summary.executed.extend(run.executed);
            summary.tasks += run.tasks;
            if run.stopped {
                summary.stopped = true;
                return Ok(summary);
            }
        }
        state.retarget(target.clone());

        let keys = self.output_keys(&state, &incremental)?;
        let total = keys.get(&target).cloned().unwrap_or_default();
        summary.wanted = self.wanted_keys(&state, &target_node, &total, wanted)?;
        info!(
            node = %target_node.name,
            total = total.len(),
            wanted = summary.wanted.len(),
            "incremental plan"
        );
        if summary.wanted.is_empty() {
            return Ok(summary);
        }

        let needed = self.needed_keys(&state, &incremental, &target, &summary.wanted)?;
        self.execute_incremental(&mut state, &incremental, &needed, &mut summary)
            .await?;
        Ok(summary)
    }

    /// Splits the not-ready ancestry of the target into incremental nodes
    /// and the frontier of non-incremental nodes that must run in full.
    fn partition(&self, state: &RunState) -> Result<(BTreeSet<GraphId>, Vec<GraphId>)> {
        let mut incremental = BTreeSet::new();
        let mut frontier = Vec::new();
        let mut seen = HashSet::from([state.target().clone()]);
        let mut stack = vec![state.target().clone()];

        while let Some(id) = stack.pop() {
            if state.is_ready(&id) {
                continue;
            }
            let Some(GraphNode::Operator(node)) = state.graph().get(&id) else {
                continue;
            };
            if !self.ctx.operators.get(&node.op)?.is_incremental() {
                frontier.push(id);
                continue;
            }
            for parent in node.graph_parents().into_values() {
                if seen.insert(parent.clone()) {
                    stack.push(parent);
                }
            }
            incremental.insert(id);
        }
        frontier.sort();
        Ok((incremental, frontier))
    }

    /// Keys available on one parent edge, or `None` if the parent is an
    /// incremental node whose keys are not known yet.
    fn parent_keys(
        &self,
        state: &RunState,
        incremental: &BTreeSet<GraphId>,
        keys: &KeyMap,
        parent: &VirtualParent,
    ) -> Result<Option<Vec<String>>> {
        if let Some(known) = keys.get(&parent.graph_id) {
            return Ok(Some(known.clone()));
        }
        if incremental.contains(&parent.graph_id) {
            return Ok(None);
        }

        let store = self.ctx.datasets.as_ref();
        let ds = if parent.graph_id.is_operator() {
            let key = output_hash_key(state.hash(&parent.graph_id)?, &parent.output);
            store.find_by_hash(&key).ok_or_else(|| {
                PipegraphError::config(format!(
                    "dataset for parent node {}[{}] is missing",
                    state.graph().display_name(&parent.graph_id),
                    parent.output
                ))
            })?
        } else {
            store
                .get(parent.graph_id.id)
                .ok_or_else(|| PipegraphError::not_found("dataset", parent.graph_id.id))?
        };
        Ok(Some(store.list_items(ds.id)?.into_iter().map(|item| item.key).collect()))
    }

    /// Propagates key lists forward from materialized parents to a fixpoint.
    fn output_keys(&self, state: &RunState, incremental: &BTreeSet<GraphId>) -> Result<KeyMap> {
        let mut keys = KeyMap::new();

        loop {
            let pending: Vec<GraphId> =
                incremental.iter().filter(|id| !keys.contains_key(*id)).cloned().collect();
            if pending.is_empty() {
                return Ok(keys);
            }

            let mut progressed = false;
            for id in &pending {
                let node = run_operator(state, id)?;
                let Some(input_keys) = self.input_keys(state, incremental, &keys, node)? else {
                    continue;
                };
                let produced = self.ctx.operators.get(&node.op)?.output_keys(node, &input_keys);
                debug!(node = %node.name, keys = produced.len(), "output keys");
                keys.insert(id.clone(), produced);
                progressed = true;
            }

            if !progressed {
                let names = pending.iter().map(|id| state.graph().display_name(id)).collect();
                return Err(SchedulingError::unsatisfiable(names).into());
            }
        }
    }

    fn input_keys(
        &self,
        state: &RunState,
        incremental: &BTreeSet<GraphId>,
        keys: &KeyMap,
        node: &VirtualNode,
    ) -> Result<Option<InputKeys>> {
        let mut input_keys = InputKeys::new();
        for (name, plist) in &node.parents {
            let mut lists = Vec::with_capacity(plist.len());
            for parent in plist {
                match self.parent_keys(state, incremental, keys, parent)? {
                    Some(list) => lists.push(list),
                    None => return Ok(None),
                }
            }
            input_keys.insert(name.clone(), lists);
        }
        Ok(Some(input_keys))
    }

    /// Chooses the keys to produce at the target among those it lacks.
    fn wanted_keys(
        &self,
        state: &RunState,
        target: &VirtualNode,
        total: &[String],
        wanted: &WantedKeys,
    ) -> Result<Vec<String>> {
        let store = self.ctx.datasets.as_ref();
        let hash = state.hash(&target.graph_id())?;
        let outputs = resolve_output_datasets(store, target, hash, false)?;
        let existing = computed_keys(store, &outputs)?;
        let missing: Vec<String> =
            total.iter().filter(|k| !existing.contains(*k)).cloned().collect();

        let mut chosen: Vec<String> = match wanted {
            WantedKeys::Count(n) => missing
                .choose_multiple(&mut rand::thread_rng(), *n)
                .cloned()
                .collect(),
            WantedKeys::Keys(list) => {
                let missing: HashSet<&String> = missing.iter().collect();
                list.iter()
                    .filter(|k| missing.contains(k))
                    .cloned()
                    .collect::<BTreeSet<String>>()
                    .into_iter()
                    .collect()
            }
            WantedKeys::All => missing,
        };
        chosen.sort();
        Ok(chosen)
    }

    /// Propagates wanted keys backward until no node gains a key.
    fn needed_keys(
        &self,
        state: &RunState,
        incremental: &BTreeSet<GraphId>,
        target: &GraphId,
        wanted: &[String],
    ) -> Result<HashMap<GraphId, BTreeSet<String>>> {
        let mut needed: HashMap<GraphId, BTreeSet<String>> = HashMap::new();
        needed.insert(target.clone(), wanted.iter().cloned().collect());

        loop {
            let mut changed = false;
            for id in incremental {
                let outputs: Vec<String> = match needed.get(id) {
                    Some(keys) if !keys.is_empty() => keys.iter().cloned().collect(),
                    _ => continue,
                };
                let node = run_operator(state, id)?;
                let inputs = self.ctx.operators.get(&node.op)?.needed_inputs(node, &outputs);
                for (name, per_parent) in inputs {
                    let Some(plist) = node.parents.get(&name) else {
                        continue;
                    };
                    for (parent, keys) in plist.iter().zip(per_parent) {
                        if !incremental.contains(&parent.graph_id) {
                            continue;
                        }
                        let entry = needed.entry(parent.graph_id.clone()).or_default();
                        for key in keys {
                            changed |= entry.insert(key);
                        }
                    }
                }
            }
            if !changed {
                return Ok(needed);
            }
        }
    }

    /// Runs incremental nodes in topological order, each limited to its
    /// needed keys.
    async fn execute_incremental(
        &self,
        state: &mut RunState,
        incremental: &BTreeSet<GraphId>,
        needed: &HashMap<GraphId, BTreeSet<String>>,
        summary: &mut IncrementalSummary,
    ) -> Result<()> {
        let store = self.ctx.datasets.as_ref();
        let token = self.job.token().clone();
        let mut processed: HashSet<GraphId> = HashSet::new();

        while processed.len() < incremental.len() {
            let mut progressed = false;

            for id in incremental {
                if processed.contains(id) {
                    continue;
                }
                let node = run_operator(state, id)?.clone();
                let parents_processed = node
                    .parents
                    .values()
                    .flatten()
                    .all(|p| !incremental.contains(&p.graph_id) || processed.contains(&p.graph_id));
                if !parents_processed {
                    continue;
                }
                if token.is_cancelled() {
                    summary.stopped = true;
                    return Ok(());
                }
                processed.insert(id.clone());
                progressed = true;

                let hash = state.hash(id)?.to_string();
                let keys = needed.get(id).cloned().unwrap_or_default();
                if keys.is_empty() {
                    resolve_output_datasets(store, &node, &hash, true)?;
                    continue;
                }

                let operator = self.ctx.operators.get(&node.op)?;
                let inputs = gather_inputs(store, state.graph(), state.hashes(), &node, true)?;
                let options = PrepareOptions {
                    incremental: true,
                    limit_output_keys: Some(keys),
                    ..PrepareOptions::default()
                };
                let prepared =
                    prepare_run(store, operator.as_ref(), &node, &hash, &inputs, &options)?;
                let Some(prepared) = prepared else {
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
                        summary.stopped = true;
                        return Ok(());
                    }
                    ExecOutcome::Completed { tasks, done } => {
                        self.ctx.events.try_emit(
                            EngineEvent::NodeCompleted,
                            Some(json!({"node": node.name, "tasks": tasks})),
                        );
                        summary.executed.push(node.name.clone());
                        summary.tasks += tasks;
                        if done {
                            state.mark_ready(id);
                        }
                    }
                }
            }

            if !progressed {
                let names = incremental
                    .iter()
                    .filter(|id| !processed.contains(*id))
                    .map(|id| state.graph().display_name(id))
                    .collect();
                return Err(SchedulingError::unsatisfiable(names).into());
            }
        }
        Ok(())
    }
}

fn run_operator<'g>(state: &'g RunState, id: &GraphId) -> Result<&'g VirtualNode> {
    state
        .graph()
        .operator(id)
        .ok_or_else(|| {
            PipegraphError::Internal(format!("{id} is not an operator in the run graph"))
        })
}
