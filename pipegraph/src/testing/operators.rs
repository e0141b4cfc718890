//! Instrumented operators for testing.

use crate::catalog::{InputSpec, OutputSpec};
use crate::datasets::{Dataset, DatasetStore, Item};
use crate::errors::{PipegraphError, Result};
use crate::exec::Task;
use crate::graph::{ExecutionGraph, VirtualNode};
use crate::operators::{
    materialize_non_default_inputs, Executable, InputItems, Operator, OperatorConfig,
    PrepareContext, Runnable,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Records which task keys ran for which node.
#[derive(Debug, Clone, Default)]
pub struct ExecutionLog {
    entries: Arc<Mutex<Vec<(String, String)>>>,
}

impl ExecutionLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one task execution.
    pub fn record(&self, node: &str, key: &str) {
        self.entries.lock().push((node.to_string(), key.to_string()));
    }

    /// Sorted keys executed for a node.
    #[must_use]
    pub fn keys_for(&self, node: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .lock()
            .iter()
            .filter(|(n, _)| n == node)
            .map(|(_, k)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Number of tasks executed for a node.
    #[must_use]
    pub fn count(&self, node: &str) -> usize {
        self.entries.lock().iter().filter(|(n, _)| n == node).count()
    }

    /// Number of tasks executed overall.
    #[must_use]
    pub fn total(&self) -> usize {
        self.entries.lock().len()
    }

    /// Forgets every entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// Blocks tasks until the test lets them through.
#[derive(Debug, Clone)]
pub struct Gate {
    entered: Arc<Semaphore>,
    released: Arc<Semaphore>,
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

impl Gate {
    /// Creates a closed gate.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entered: Arc::new(Semaphore::new(0)),
            released: Arc::new(Semaphore::new(0)),
        }
    }

    /// Waits until one more task has reached the gate.
    pub async fn wait_entered(&self) {
        if let Ok(permit) = self.entered.acquire().await {
            permit.forget();
        }
    }

    /// Lets `n` waiting or future tasks through.
    pub fn release(&self, n: usize) {
        self.released.add_permits(n);
    }

    /// Lets every task through from now on.
    pub fn open(&self) {
        self.released.close();
    }

    async fn pass(&self) {
        self.entered.add_permits(1);
        if let Ok(permit) = self.released.acquire().await {
            permit.forget();
        }
    }
}

/// One-to-one operator that writes an item per task key to every output.
///
/// Input `input` is variable and the single output is `output` of type
/// `table`.
#[derive(Debug, Clone)]
pub struct RecordingOperator {
    id: String,
    incremental: bool,
    log: ExecutionLog,
    fail_on: Option<String>,
    gate: Option<Gate>,
}

impl RecordingOperator {
    /// Creates an operator with type id `id`.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            incremental: false,
            log: ExecutionLog::new(),
            fail_on: None,
            gate: None,
        }
    }

    /// Declares the operator incremental.
    #[must_use]
    pub fn incremental(mut self) -> Self {
        self.incremental = true;
        self
    }

    /// Records executions into `log`.
    #[must_use]
    pub fn with_log(mut self, log: ExecutionLog) -> Self {
        self.log = log;
        self
    }

    /// The log executions are recorded in.
    #[must_use]
    pub fn log(&self) -> &ExecutionLog {
        &self.log
    }
}

impl Operator for RecordingOperator {
    fn config(&self) -> OperatorConfig {
        OperatorConfig::new(self.id.clone(), self.id.clone())
    }

    fn inputs(&self, _params: &str) -> Vec<InputSpec> {
        vec![InputSpec::new("input").variable()]
    }

    fn outputs(
        &self,
        _params: &str,
        _input_types: &BTreeMap<String, Vec<String>>,
    ) -> Vec<OutputSpec> {
        vec![OutputSpec::new("output", "table")]
    }

    fn prepare(&self, runnable: &Runnable, ctx: &PrepareContext) -> Result<Box<dyn Executable>> {
        Ok(Box::new(RecordingExecutable {
            node: runnable.name.clone(),
            outputs: runnable.output_datasets.values().cloned().collect(),
            store: ctx.datasets.clone(),
            log: self.log.clone(),
            fail_on: self.fail_on.clone(),
            gate: self.gate.clone(),
        }))
    }

    fn is_incremental(&self) -> bool {
        self.incremental
    }
}

struct RecordingExecutable {
    node: String,
    outputs: Vec<Dataset>,
    store: Arc<dyn DatasetStore>,
    log: ExecutionLog,
    fail_on: Option<String>,
    gate: Option<Gate>,
}

#[async_trait]
impl Executable for RecordingExecutable {
    async fn apply(&self, task: &Task) -> Result<()> {
        if let Some(gate) = &self.gate {
            gate.pass().await;
        }
        if self.fail_on.as_deref() == Some(task.key.as_str()) {
            return Err(PipegraphError::Internal(format!("cannot process {}", task.key)));
        }
        self.log.record(&self.node, &task.key);
        for ds in &self.outputs {
            self.store.add_item(ds.id, Item::new(task.key.clone()))?;
        }
        Ok(())
    }
}

/// A [`RecordingOperator`] whose task for one key fails.
#[derive(Debug, Clone)]
pub struct FailingOperator(RecordingOperator);

impl FailingOperator {
    /// Creates an operator failing the task with key `key`.
    #[must_use]
    pub fn new(id: impl Into<String>, key: impl Into<String>, log: ExecutionLog) -> Self {
        let mut inner = RecordingOperator::new(id).with_log(log);
        inner.fail_on = Some(key.into());
        Self(inner)
    }
}

impl Operator for FailingOperator {
    fn config(&self) -> OperatorConfig {
        self.0.config()
    }

    fn inputs(&self, params: &str) -> Vec<InputSpec> {
        self.0.inputs(params)
    }

    fn outputs(
        &self,
        params: &str,
        input_types: &BTreeMap<String, Vec<String>>,
    ) -> Vec<OutputSpec> {
        self.0.outputs(params, input_types)
    }

    fn prepare(&self, runnable: &Runnable, ctx: &PrepareContext) -> Result<Box<dyn Executable>> {
        self.0.prepare(runnable, ctx)
    }
}

/// A [`RecordingOperator`] whose tasks wait at a [`Gate`].
#[derive(Debug, Clone)]
pub struct GatedOperator(RecordingOperator);

impl GatedOperator {
    /// Creates an operator whose tasks pass `gate` before running.
    #[must_use]
    pub fn new(id: impl Into<String>, gate: Gate, log: ExecutionLog) -> Self {
        let mut inner = RecordingOperator::new(id).with_log(log);
        inner.gate = Some(gate);
        Self(inner)
    }
}

impl Operator for GatedOperator {
    fn config(&self) -> OperatorConfig {
        self.0.config()
    }

    fn inputs(&self, params: &str) -> Vec<InputSpec> {
        self.0.inputs(params)
    }

    fn outputs(
        &self,
        params: &str,
        input_types: &BTreeMap<String, Vec<String>>,
    ) -> Vec<OutputSpec> {
        self.0.outputs(params, input_types)
    }

    fn prepare(&self, runnable: &Runnable, ctx: &PrepareContext) -> Result<Box<dyn Executable>> {
        self.0.prepare(runnable, ctx)
    }
}

/// A [`RecordingOperator`] that only reads items from the default storage
/// provider, resolving into a `materialize` step otherwise.
#[derive(Debug, Clone)]
pub struct DefaultProviderOperator(RecordingOperator);

impl DefaultProviderOperator {
    /// Creates the operator.
    #[must_use]
    pub fn new(id: impl Into<String>, log: ExecutionLog) -> Self {
        Self(RecordingOperator::new(id).with_log(log))
    }
}

impl Operator for DefaultProviderOperator {
    fn config(&self) -> OperatorConfig {
        self.0.config()
    }

    fn inputs(&self, params: &str) -> Vec<InputSpec> {
        self.0.inputs(params)
    }

    fn outputs(
        &self,
        params: &str,
        input_types: &BTreeMap<String, Vec<String>>,
    ) -> Vec<OutputSpec> {
        self.0.outputs(params, input_types)
    }

    fn prepare(&self, runnable: &Runnable, ctx: &PrepareContext) -> Result<Box<dyn Executable>> {
        self.0.prepare(runnable, ctx)
    }

    fn resolve(
        &self,
        node: &VirtualNode,
        _parent_datasets: &BTreeMap<String, Vec<Dataset>>,
        items: &InputItems,
    ) -> Result<Option<ExecutionGraph>> {
        Ok(materialize_non_default_inputs(node, items))
    }
}
