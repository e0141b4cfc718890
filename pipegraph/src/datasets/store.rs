//! The dataset store interface and its in-memory implementation.

use super::{Dataset, DatasetKind, Item};
use crate::errors::{PipegraphError, Result};
use crate::graph::{GraphId, NodeKind};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info};

/// Persistence for datasets, their items, and node references to them.
///
/// Every method is serialized by the implementation; callers never hold a
/// lock across calls.
pub trait DatasetStore: Send + Sync {
    /// Returns the dataset with hash key `hash`, creating it if absent.
    ///
    /// Creation is atomic with the lookup, so concurrent callers with the
    /// same hash receive the same dataset.
    fn create_dataset(
        &self,
        name: &str,
        kind: DatasetKind,
        data_type: &str,
        hash: Option<&str>,
    ) -> Dataset;

    /// Looks up a dataset by id.
    fn get(&self, id: i64) -> Option<Dataset>;

    /// Looks up a dataset by exact hash key.
    fn find_by_hash(&self, hash: &str) -> Option<Dataset>;

    /// Lists every dataset, ordered by id.
    fn list(&self) -> Vec<Dataset>;

    /// Lists the items of a dataset, ordered by key.
    ///
    /// # Errors
    ///
    /// Returns a not-found error for unknown datasets.
    fn list_items(&self, id: i64) -> Result<Vec<Item>>;

    /// Adds an item, replacing any item with the same key.
    ///
    /// # Errors
    ///
    /// Returns a not-found error for unknown datasets.
    fn add_item(&self, id: i64, item: Item) -> Result<()>;

    /// Removes every item.
    ///
    /// # Errors
    ///
    /// Returns a not-found error for unknown datasets.
    fn clear(&self, id: i64) -> Result<()>;

    /// Sets the done flag.
    ///
    /// # Errors
    ///
    /// Returns a not-found error for unknown datasets.
    fn set_done(&self, id: i64, done: bool) -> Result<()>;

    /// Records that graph node `owner` produces this dataset.
    ///
    /// # Errors
    ///
    /// Returns a not-found error for unknown datasets.
    fn add_ref(&self, id: i64, owner: &GraphId) -> Result<()>;

    /// Drops a reference. A computed dataset left without references is
    /// deleted; returns true in that case.
    ///
    /// # Errors
    ///
    /// Returns a not-found error for unknown datasets.
    fn remove_ref(&self, id: i64, owner: &GraphId) -> Result<bool>;

    /// Datasets referenced by `owner`, ordered by id.
    fn refs_of(&self, owner: &GraphId) -> Vec<i64>;

    /// Drops every reference held by any graph node derived from operator
    /// node `node_id`. Returns the number of datasets deleted as a result.
    fn remove_node_refs(&self, node_id: i64) -> usize;

    /// Deletes a dataset and its items.
    ///
    /// # Errors
    ///
    /// Returns a not-found error for unknown datasets.
    fn delete(&self, id: i64) -> Result<()>;
}

#[derive(Debug, Default)]
struct Inner {
    datasets: BTreeMap<i64, Dataset>,
    items: HashMap<i64, BTreeMap<String, Item>>,
    by_hash: HashMap<String, i64>,
    refs: HashMap<i64, BTreeSet<GraphId>>,
    next_id: i64,
}

impl Inner {
    fn dataset_mut(&mut self, id: i64) -> Result<&mut Dataset> {
        self.datasets
            .get_mut(&id)
            .ok_or_else(|| PipegraphError::not_found("dataset", id))
    }

    fn remove(&mut self, id: i64) -> Option<Dataset> {
        let ds = self.datasets.remove(&id)?;
        self.items.remove(&id);
        self.refs.remove(&id);
        if let Some(hash) = &ds.hash {
            self.by_hash.remove(hash);
        }
        Some(ds)
    }

    /// Returns true if the dataset was garbage collected.
    fn drop_ref(&mut self, id: i64, owner: &GraphId) -> bool {
        let now_empty = match self.refs.get_mut(&id) {
            Some(owners) => {
                owners.remove(owner);
                owners.is_empty()
            }
            None => true,
        };
        let computed = self
            .datasets
            .get(&id)
            .is_some_and(|ds| ds.kind == DatasetKind::Computed);
        if now_empty && computed {
            if let Some(ds) = self.remove(id) {
                info!(dataset_id = id, name = %ds.name, "deleted unreferenced dataset");
                return true;
            }
        }
        false
    }
}

/// A [`DatasetStore`] kept in memory behind a single mutex.
#[derive(Debug, Default)]
pub struct InMemoryDatasetStore {
    inner: Mutex<Inner>,
}

impl InMemoryDatasetStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl DatasetStore for InMemoryDatasetStore {
    fn create_dataset(
        &self,
        name: &str,
        kind: DatasetKind,
        data_type: &str,
        hash: Option<&str>,
    ) -> Dataset {
        let mut inner = self.inner.lock();
        if let Some(existing) = hash
            .and_then(|h| inner.by_hash.get(h).copied())
            .and_then(|id| inner.datasets.get(&id))
        {
            return existing.clone();
        }

        inner.next_id += 1;
        let ds = Dataset {
            id: inner.next_id,
            name: name.to_string(),
            kind,
            data_type: data_type.to_string(),
            hash: hash.map(String::from),
            done: false,
        };
        if let Some(h) = hash {
            inner.by_hash.insert(h.to_string(), ds.id);
        }
        inner.datasets.insert(ds.id, ds.clone());
        inner.items.insert(ds.id, BTreeMap::new());
        debug!(dataset_id = ds.id, name, "created dataset");
        ds
    }

    fn get(&self, id: i64) -> Option<Dataset> {
        self.inner.lock().datasets.get(&id).cloned()
    }

    fn find_by_hash(&self, hash: &str) -> Option<Dataset> {
        let inner = self.inner.lock();
        inner
            .by_hash
            .get(hash)
            .and_then(|id| inner.datasets.get(id))
            .cloned()
    }

    fn list(&self) -> Vec<Dataset> {
        self.inner.lock().datasets.values().cloned().collect()
    }

    fn list_items(&self, id: i64) -> Result<Vec<Item>> {
        let inner = self.inner.lock();
        inner
            .items
            .get(&id)
            .map(|items| items.values().cloned().collect())
            .ok_or_else(|| PipegraphError::not_found("dataset", id))
    }

    fn add_item(&self, id: i64, item: Item) -> Result<()> {
        let mut inner = self.inner.lock();
        inner
            .items
            .get_mut(&id)
            .ok_or_else(|| PipegraphError::not_found("dataset", id))?
            .insert(item.key.clone(), item);
        Ok(())
    }

    fn clear(&self, id: i64) -> Result<()> {
        let mut inner = self.inner.lock();
        inner
            .items
            .get_mut(&id)
            .ok_or_else(|| PipegraphError::not_found("dataset", id))?
            .clear();
        Ok(())
    }

    fn set_done(&self, id: i64, done: bool) -> Result<()> {
        self.inner.lock().dataset_mut(id)?.done = done;
        Ok(())
    }

    fn add_ref(&self, id: i64, owner: &GraphId) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.dataset_mut(id)?;
        inner.refs.entry(id).or_default().insert(owner.clone());
        Ok(())
    }

    fn remove_ref(&self, id: i64, owner: &GraphId) -> Result<bool> {
        let mut inner = self.inner.lock();
        inner.dataset_mut(id)?;
        Ok(inner.drop_ref(id, owner))
    }

    fn refs_of(&self, owner: &GraphId) -> Vec<i64> {
        let inner = self.inner.lock();
        let mut ids: Vec<i64> = inner
            .refs
            .iter()
            .filter(|(_, owners)| owners.contains(owner))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    fn remove_node_refs(&self, node_id: i64) -> usize {
        let mut inner = self.inner.lock();
        let held: Vec<(i64, GraphId)> = inner
            .refs
            .iter()
            .flat_map(|(id, owners)| {
                owners
                    .iter()
                    .filter(|o| o.kind == NodeKind::Operator && o.id == node_id)
                    .map(move |o| (*id, o.clone()))
            })
            .collect();

        held.into_iter()
            .filter(|(id, owner)| inner.drop_ref(*id, owner))
            .count()
    }

    fn delete(&self, id: i64) -> Result<()> {
        self.inner
            .lock()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| PipegraphError::not_found("dataset", id))
    }
}
