use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;
use uuid::Uuid;
use vmctl_common::{ResourceKey, VmResource, VmSpec};

use super::{plan_status_update, plan_update, KeyStream, ResourceStore, StoreError, WriteOutcome};

const EVENT_BUFFER: usize = 1024;

/// Process-local store used by tests and `--store memory` runs.
pub struct MemoryStore {
    records: RwLock<BTreeMap<ResourceKey, VmResource>>,
    events: broadcast::Sender<ResourceKey>,
    pending_status_conflicts: AtomicUsize,
    gets: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            records: RwLock::new(BTreeMap::new()),
            events,
            pending_status_conflicts: AtomicUsize::new(0),
            gets: AtomicUsize::new(0),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `record` verbatim (uid and version are filled in when unset)
    /// and notifies watchers.
    pub async fn insert(&self, mut record: VmResource) -> VmResource {
        if record.metadata.uid.is_nil() {
            record.metadata.uid = Uuid::new_v4();
        }
        record.metadata.resource_version = record.metadata.resource_version.max(1);
        record.metadata.generation = record.metadata.generation.max(1);
        let key = record.key();
        self.records.write().await.insert(key.clone(), record.clone());
        self.notify(key);
        record
    }

    /// The next `n` status writes fail with `Conflict` without touching the record.
    pub fn fail_next_status_updates_with_conflict(&self, n: usize) {
        self.pending_status_conflicts.store(n, Ordering::SeqCst);
    }

    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    fn notify(&self, key: ResourceKey) {
        // No receivers is fine: nobody is watching yet.
        let _ = self.events.send(key);
    }

    fn take_injected_conflict(&self) -> bool {
        self.pending_status_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get(&self, key: &ResourceKey) -> Result<VmResource, StoreError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.records
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    async fn create(&self, key: &ResourceKey, spec: VmSpec) -> Result<VmResource, StoreError> {
        spec.validate().map_err(|e| StoreError::Invalid(e.to_string()))?;
        let mut records = self.records.write().await;
        if records.contains_key(key) {
            return Err(StoreError::AlreadyExists(key.clone()));
        }
        let mut record = VmResource::new(key.clone(), spec);
        record.metadata.uid = Uuid::new_v4();
        record.metadata.resource_version = 1;
        record.metadata.generation = 1;
        records.insert(key.clone(), record.clone());
        drop(records);
        self.notify(key.clone());
        Ok(record)
    }

    async fn update(&self, record: &VmResource) -> Result<Option<VmResource>, StoreError> {
        let key = record.key();
        let mut records = self.records.write().await;
        let current = records
            .get(&key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        let result = match plan_update(current, record)? {
            WriteOutcome::Unchanged(current) => return Ok(Some(current)),
            WriteOutcome::Changed(next) => {
                records.insert(key.clone(), next.clone());
                Some(next)
            }
            WriteOutcome::Removed => {
                records.remove(&key);
                None
            }
        };
        drop(records);
        self.notify(key);
        Ok(result)
    }

    async fn update_status(&self, record: &VmResource) -> Result<VmResource, StoreError> {
        let key = record.key();
        if self.take_injected_conflict() {
            return Err(StoreError::Conflict {
                key,
                expected: record.metadata.resource_version,
            });
        }
        let mut records = self.records.write().await;
        let current = records
            .get(&key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        match plan_status_update(current, record)? {
            WriteOutcome::Changed(next) => {
                records.insert(key.clone(), next.clone());
                drop(records);
                self.notify(key);
                Ok(next)
            }
            WriteOutcome::Unchanged(current) => Ok(current),
            WriteOutcome::Removed => Err(StoreError::Invalid(
                "status writes never remove records".to_string(),
            )),
        }
    }

    async fn request_delete(&self, key: &ResourceKey) -> Result<Option<VmResource>, StoreError> {
        let mut records = self.records.write().await;
        let current = records
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        if current.metadata.finalizers.is_empty() {
            records.remove(key);
            drop(records);
            self.notify(key.clone());
            return Ok(None);
        }
        if current.metadata.is_being_deleted() {
            return Ok(Some(current.clone()));
        }
        current.metadata.deletion_timestamp = Some(Utc::now());
        current.metadata.resource_version += 1;
        let marked = current.clone();
        drop(records);
        self.notify(key.clone());
        Ok(Some(marked))
    }

    async fn list(&self) -> Result<Vec<VmResource>, StoreError> {
        Ok(self.records.read().await.values().cloned().collect())
    }

    async fn watch(&self) -> Result<KeyStream, StoreError> {
        let stream = BroadcastStream::new(self.events.subscribe()).filter_map(|event| async move {
            match event {
                Ok(key) => Some(key),
                Err(lagged) => {
                    // Missed keys are picked up by the periodic resync.
                    warn!(error = %lagged, "memory store watcher lagged");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}
