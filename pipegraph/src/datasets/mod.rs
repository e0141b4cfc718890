//! Datasets, their items, and the store the engine persists them in.
//!
//! Computed datasets are content-addressed: the hash key of an operator's
//! output is `"{nodeHash}[{outputName}]"`, and at most one dataset exists per
//! key. References from graph nodes keep computed datasets alive.

mod model;
mod outputs;
mod store;

pub use model::{Dataset, DatasetKind, Item};
pub use outputs::{computed_keys, output_hash_key, resolve_output_datasets, OutputDatasets};
pub use store::{DatasetStore, InMemoryDatasetStore};
