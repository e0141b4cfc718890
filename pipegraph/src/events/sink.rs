//! Event sinks.

use parking_lot::RwLock;
use serde_json::Value;
use std::fmt;
use tracing::{debug, info, warn};

/// Events emitted while driving a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineEvent {
    /// A scheduler or incremental run began.
    RunStarted,
    /// The target node became ready.
    RunCompleted,
    /// The run ended because its job was stopped.
    RunStopped,
    /// The run ended with an error.
    RunFailed,
    /// A node rewrote itself into a subgraph.
    NodeResolved,
    /// A node's tasks are about to be dispatched.
    NodeStarted,
    /// A node's tasks all finished.
    NodeCompleted,
    /// A task failed on its executor.
    TaskFailed,
}

impl EngineEvent {
    /// Returns the dotted event name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RunStarted => "run.started",
            Self::RunCompleted => "run.completed",
            Self::RunStopped => "run.stopped",
            Self::RunFailed => "run.failed",
            Self::NodeResolved => "node.resolved",
            Self::NodeStarted => "node.started",
            Self::NodeCompleted => "node.completed",
            Self::TaskFailed => "task.failed",
        }
    }
}

impl fmt::Display for EngineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives run events from the engine.
///
/// Called inline from the scheduler, so implementations must not block and
/// must never fail; a sink that cannot deliver an event logs and drops it.
pub trait EventSink: Send + Sync {
    /// Delivers one event with its JSON payload.
    fn try_emit(&self, event: EngineEvent, data: Option<Value>);
}

/// Drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

impl EventSink for NoOpEventSink {
    fn try_emit(&self, _event: EngineEvent, _data: Option<Value>) {}
}

/// Forwards events to `tracing`. Failures are logged at `WARN` whatever
/// the configured level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingEventSink {
    verbose: bool,
}

impl LoggingEventSink {
    /// Logs at `INFO`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Logs at `DEBUG`.
    #[must_use]
    pub fn debug() -> Self {
        Self { verbose: true }
    }
}

impl EventSink for LoggingEventSink {
    fn try_emit(&self, event: EngineEvent, data: Option<Value>) {
        let data = data.unwrap_or(Value::Null);
        match event {
            EngineEvent::RunFailed | EngineEvent::TaskFailed => {
                warn!(event = %event, %data, "engine event");
            }
            _ if self.verbose => debug!(event = %event, %data, "engine event"),
            _ => info!(event = %event, %data, "engine event"),
        }
    }
}

/// A sink that keeps every event in memory, for tests.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<(EngineEvent, Option<Value>)>>,
}

impl CollectingEventSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<(EngineEvent, Option<Value>)> {
        self.events.read().clone()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Counts events of one kind.
    #[must_use]
    pub fn count(&self, event: EngineEvent) -> usize {
        self.events.read().iter().filter(|(e, _)| *e == event).count()
    }

    /// Returns the `node` field of every event of one kind, in order.
    #[must_use]
    pub fn nodes_for(&self, event: EngineEvent) -> Vec<String> {
        self.events
            .read()
            .iter()
            .filter(|(e, _)| *e == event)
            .filter_map(|(_, data)| {
                data.as_ref()
                    .and_then(|d| d.get("node"))
                    .and_then(|n| n.as_str())
                    .map(String::from)
            })
            .collect()
    }

    /// Clears all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }
}

impl EventSink for CollectingEventSink {
    fn try_emit(&self, event: EngineEvent, data: Option<Value>) {
        self.events.write().push((event, data));
    }
}
