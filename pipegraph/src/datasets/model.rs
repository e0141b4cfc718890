//! Dataset and item records.

use serde::{Deserialize, Serialize};

/// Whether a dataset was imported or produced by an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    /// Raw data added by a user.
    Data,
    /// Output of an operator node.
    Computed,
}

/// A dataset record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    /// Store id.
    pub id: i64,
    /// Display name.
    pub name: String,
    /// Raw or computed.
    pub kind: DatasetKind,
    /// Data type of every item.
    pub data_type: String,
    /// Content hash key for computed datasets.
    #[serde(default)]
    pub hash: Option<String>,
    /// True once every task of the producing execution succeeded.
    #[serde(default)]
    pub done: bool,
}

/// One keyed item of a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    /// Item key, unique within its dataset.
    pub key: String,
    /// File extension of the stored data.
    #[serde(default)]
    pub ext: String,
    /// Storage format.
    #[serde(default)]
    pub format: String,
    /// Serialized metadata.
    #[serde(default)]
    pub metadata: String,
    /// Storage provider. `None` is the default provider.
    #[serde(default)]
    pub provider: Option<String>,
}

impl Item {
    /// Creates an item stored under the default provider.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ext: String::new(),
            format: String::new(),
            metadata: String::new(),
            provider: None,
        }
    }

    /// Sets the extension and format.
    #[must_use]
    pub fn with_format(mut self, ext: impl Into<String>, format: impl Into<String>) -> Self {
        self.ext = ext.into();
        self.format = format.into();
        self
    }

    /// Sets the metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = metadata.into();
        self
    }

    /// Sets a non-default storage provider.
    #[must_use]
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    /// Returns true if the item lives under the default provider.
    #[must_use]
    pub fn is_default_provider(&self) -> bool {
        self.provider.is_none()
    }
}
