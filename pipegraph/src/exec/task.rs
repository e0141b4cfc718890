//! The unit of dispatch.

use crate::operators::InputItems;
use serde::{Deserialize, Serialize};

/// Work for one output key, sent to a container as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Output key the task produces.
    pub key: String,
    /// Input items for this key, per input name and parent.
    #[serde(default)]
    pub items: InputItems,
    /// Operator-specific metadata.
    #[serde(default)]
    pub metadata: String,
}

impl Task {
    /// Creates a task with no items.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            items: InputItems::new(),
            metadata: String::new(),
        }
    }

    /// Sets the input items.
    #[must_use]
    pub fn with_items(mut self, items: InputItems) -> Self {
        self.items = items;
        self
    }
}
