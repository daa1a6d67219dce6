use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use rolelens_schema::ClassificationRecord;
use tokio::sync::RwLock;

use crate::{RecordStore, StoreError};

/// Volatile store for tests and dry runs. Keeps insertion order like the
/// manifest does.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    puts: AtomicUsize,
}

#[derive(Debug, Default)]
struct Inner {
    order: Vec<String>,
    records: HashMap<String, ClassificationRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = ClassificationRecord>) -> Self {
        let mut inner = Inner::default();
        for record in records {
            inner.insert(record);
        }
        Self {
            inner: RwLock::new(inner),
            puts: AtomicUsize::new(0),
        }
    }

    /// Number of `put` calls since construction.
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.order.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Inner {
    fn insert(&mut self, record: ClassificationRecord) {
        let id = record.id().to_string();
        if self.records.insert(id.clone(), record).is_none() {
            self.order.push(id);
        }
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn put(&self, record: &ClassificationRecord) -> Result<(), StoreError> {
        if record.id().is_empty() {
            return Err(StoreError::InvalidId(String::new()));
        }
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.inner.write().await.insert(record.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<ClassificationRecord>, StoreError> {
        Ok(self.inner.read().await.records.get(id).cloned())
    }

    async fn list_ids(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.inner.read().await.order.clone())
    }

    async fn list_raw(&self) -> Result<Vec<String>, StoreError> {
        self.list_ids().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rolelens_schema::{Conversation, Message};

    fn record(id: &str, text: &str) -> ClassificationRecord {
        ClassificationRecord::unclassified(Conversation::new(id, vec![Message::user(text)]))
    }

    #[tokio::test]
    async fn put_overwrites_in_place() {
        let store = MemoryStore::new();
        store.put(&record("a", "one")).await.unwrap();
        store.put(&record("b", "two")).await.unwrap();
        store.put(&record("a", "three")).await.unwrap();

        assert_eq!(store.list_ids().await.unwrap(), vec!["a", "b"]);
        let a = store.get("a").await.unwrap().unwrap();
        assert_eq!(a.conversation.messages[0].content, "three");
        assert_eq!(store.put_count(), 3);
    }

    #[tokio::test]
    async fn seeded_records_do_not_count_as_puts() {
        let store = MemoryStore::with_records([record("a", "x")]);
        assert_eq!(store.put_count(), 0);
        assert_eq!(store.len().await, 1);
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_id_is_rejected() {
        let store = MemoryStore::new();
        assert!(store.put(&record("", "x")).await.is_err());
        assert!(store.is_empty().await);
    }
}
