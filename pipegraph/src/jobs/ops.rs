//! Live job operations.
//!
//! A [`JobOp`] holds the in-memory progress of a running job. Its encoded
//! form is what gets persisted into [`Job::op`](super::Job::op).

use serde_json::{json, Value};
use std::collections::VecDeque;

/// Progress state attached to a running job.
pub trait JobOp: Send {
    /// Appends console lines pushed by a worker.
    fn update(&mut self, lines: &[String]);

    /// Records that `completed` of `total` units of work have finished.
    fn progress(&mut self, _completed: usize, _total: usize) {}

    /// Serializes the current state.
    fn encode(&self) -> Value;
}

/// Keeps the last lines of a job's console output.
#[derive(Debug, Clone)]
pub struct TailJobOp {
    lines: VecDeque<String>,
    capacity: usize,
}

impl TailJobOp {
    /// Creates a tail holding at most `capacity` lines.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// The kept lines, oldest first.
    pub fn lines(&self) -> impl Iterator<Item = &String> {
        self.lines.iter()
    }
}

impl JobOp for TailJobOp {
    fn update(&mut self, lines: &[String]) {
        for line in lines {
            if self.lines.len() == self.capacity {
                self.lines.pop_front();
            }
            self.lines.push_back(line.clone());
        }
    }

    fn encode(&self) -> Value {
        json!({ "lines": self.lines })
    }
}

/// Progress of one node's task execution.
pub struct ExecJobOp {
    node: String,
    completed: usize,
    total: usize,
    tail: TailJobOp,
    operator: Option<Box<dyn JobOp>>,
}

impl ExecJobOp {
    /// Creates the op, optionally wrapping operator-specific state.
    #[must_use]
    pub fn new(
        node: impl Into<String>,
        tail_lines: usize,
        operator: Option<Box<dyn JobOp>>,
    ) -> Self {
        Self {
            node: node.into(),
            completed: 0,
            total: 0,
            tail: TailJobOp::new(tail_lines),
            operator,
        }
    }

    fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let pct = self.completed as f64 * 100.0 / self.total as f64;
        pct
    }
}

impl JobOp for ExecJobOp {
    fn update(&mut self, lines: &[String]) {
        self.tail.update(lines);
        if let Some(op) = &mut self.operator {
            op.update(lines);
        }
    }

    fn progress(&mut self, completed: usize, total: usize) {
        self.completed = completed;
        self.total = total;
    }

    fn encode(&self) -> Value {
        json!({
            "node": self.node,
            "completed": self.completed,
            "total": self.total,
            "percent": self.percent(),
            "lines": self.tail.lines,
            "operator": self.operator.as_ref().map(|op| op.encode()),
        })
    }
}

/// Progress of a multi-node run.
#[derive(Debug, Clone)]
pub struct RunJobOp {
    planned: usize,
    completed: usize,
    tail: TailJobOp,
}

impl RunJobOp {
    /// Creates the op.
    #[must_use]
    pub fn new(tail_lines: usize) -> Self {
        Self {
            planned: 0,
            completed: 0,
            tail: TailJobOp::new(tail_lines),
        }
    }
}

impl JobOp for RunJobOp {
    fn update(&mut self, lines: &[String]) {
        self.tail.update(lines);
    }

    fn progress(&mut self, completed: usize, total: usize) {
        self.completed = completed;
        self.planned = total;
    }

    fn encode(&self) -> Value {
        json!({
            "nodes_planned": self.planned,
            "nodes_completed": self.completed,
            "lines": self.tail.lines,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn lines(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_tail_is_bounded() {
        let mut tail = TailJobOp::new(2);
        tail.update(&lines(&["a", "b", "c"]));
        assert_eq!(tail.lines().cloned().collect::<Vec<_>>(), lines(&["b", "c"]));
        assert_eq!(tail.encode(), json!({"lines": ["b", "c"]}));
    }

    #[test]
    fn test_exec_op_percent_and_operator_state() {
        let mut op = ExecJobOp::new("resize", 10, Some(Box::new(TailJobOp::new(1))));
        assert_eq!(op.encode()["percent"], 100.0);

        op.progress(1, 4);
        op.update(&lines(&["epoch 1", "epoch 2"]));
        let state = op.encode();
        assert_eq!(state["percent"], 25.0);
        assert_eq!(state["lines"], json!(["epoch 1", "epoch 2"]));
        assert_eq!(state["operator"], json!({"lines": ["epoch 2"]}));
    }

    #[test]
    fn test_run_op_counts_nodes() {
        let mut op = RunJobOp::new(5);
        op.progress(2, 3);
        let state = op.encode();
        assert_eq!(state["nodes_planned"], 3);
        assert_eq!(state["nodes_completed"], 2);
    }
}
