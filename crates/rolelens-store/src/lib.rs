pub mod error;
pub mod file_store;
pub mod memory_store;

use async_trait::async_trait;
use rolelens_schema::ClassificationRecord;
use serde::{Deserialize, Serialize};

pub use error::StoreError;
pub use file_store::{FileStore, OutputLayout, LOCK_FILE, MANIFEST_FILE};
pub use memory_store::MemoryStore;

pub const DEFAULT_GROUP: &str = "conversations";

/// Keyed persistence for classification records. `put` replaces the whole
/// record and keeps the manifest in step with what is on disk.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn put(&self, record: &ClassificationRecord) -> Result<(), StoreError>;
    async fn get(&self, id: &str) -> Result<Option<ClassificationRecord>, StoreError>;
    /// Ids known to the manifest, in manifest order.
    async fn list_ids(&self) -> Result<Vec<String>, StoreError>;
    /// Storage keys actually present, whether or not the manifest knows them.
    async fn list_raw(&self) -> Result<Vec<String>, StoreError>;
}

/// Differences between the manifest and the raw storage listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsistencyReport {
    pub records: usize,
    /// Files on disk that no manifest entry points at.
    pub orphaned_files: Vec<String>,
    /// Manifest entries whose file does not exist.
    pub missing_files: Vec<String>,
    /// Manifest entries whose file exists but does not hold the record.
    pub missing_records: Vec<String>,
}

impl ConsistencyReport {
    pub fn is_clean(&self) -> bool {
        self.orphaned_files.is_empty()
            && self.missing_files.is_empty()
            && self.missing_records.is_empty()
    }
}
