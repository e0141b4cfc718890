//! Graph node identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The two kinds of node an execution graph can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// A configured or resolved operator.
    Operator,
    /// A raw dataset leaf.
    Dataset,
}

/// A stable identifier of a node in an [`ExecutionGraph`](super::ExecutionGraph).
///
/// `virtual_key` is empty for configured operators and datasets; resolution
/// gives dynamically created variants of an operator a non-empty key. Two ids
/// are equal iff all three fields match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GraphId {
    /// Operator or dataset.
    pub kind: NodeKind,
    /// Catalog id of the operator node or dataset.
    pub id: i64,
    /// Distinguishes resolved variants of the same operator node.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub virtual_key: String,
}

impl GraphId {
    /// Identifier of a configured operator node.
    #[must_use]
    pub fn operator(id: i64) -> Self {
        Self {
            kind: NodeKind::Operator,
            id,
            virtual_key: String::new(),
        }
    }

    /// Identifier of a dataset leaf.
    #[must_use]
    pub fn dataset(id: i64) -> Self {
        Self {
            kind: NodeKind::Dataset,
            id,
            virtual_key: String::new(),
        }
    }

    /// Identifier of a resolved variant of operator node `id`.
    #[must_use]
    pub fn virtual_operator(id: i64, key: impl Into<String>) -> Self {
        Self {
            kind: NodeKind::Operator,
            id,
            virtual_key: key.into(),
        }
    }

    /// Returns true if this id was created by resolution.
    #[must_use]
    pub fn is_virtual(&self) -> bool {
        !self.virtual_key.is_empty()
    }

    /// Returns true for operator nodes.
    #[must_use]
    pub fn is_operator(&self) -> bool {
        self.kind == NodeKind::Operator
    }
}

impl fmt::Display for GraphId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            NodeKind::Operator => "operator",
            NodeKind::Dataset => "dataset",
        };
        if self.virtual_key.is_empty() {
            write!(f, "{kind}-{}", self.id)
        } else {
            write!(f, "{kind}-{}[{}]", self.id, self.virtual_key)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_uses_all_fields() {
        assert_eq!(GraphId::operator(3), GraphId::operator(3));
        assert_ne!(GraphId::operator(3), GraphId::dataset(3));
        assert_ne!(GraphId::operator(3), GraphId::virtual_operator(3, "m"));
        assert_ne!(
            GraphId::virtual_operator(3, "a"),
            GraphId::virtual_operator(3, "b")
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(GraphId::operator(3).to_string(), "operator-3");
        assert_eq!(GraphId::dataset(5).to_string(), "dataset-5");
        assert_eq!(
            GraphId::virtual_operator(3, "materialize-input-0").to_string(),
            "operator-3[materialize-input-0]"
        );
    }

    #[test]
    fn test_virtual_flag() {
        assert!(!GraphId::operator(1).is_virtual());
        assert!(GraphId::virtual_operator(1, "x").is_virtual());
        assert!(GraphId::virtual_operator(1, "x").is_operator());
    }
}
