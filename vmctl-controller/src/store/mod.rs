use async_trait::async_trait;
use futures_util::stream::BoxStream;
use vmctl_common::{ResourceKey, VmResource, VmSpec};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(ResourceKey),
    #[error("conflict writing {key}: resource version {expected} is stale")]
    Conflict { key: ResourceKey, expected: i64 },
    #[error("{0} already exists")]
    AlreadyExists(ResourceKey),
    #[error("invalid record: {0}")]
    Invalid(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Change notifications. Only identities are delivered; consumers re-read.
pub type KeyStream = BoxStream<'static, ResourceKey>;

/// Watched, optimistically-concurrent storage of VM records.
///
/// Writes compare `metadata.resource_version` with the stored record and fail
/// with `StoreError::Conflict` when it is stale. A write that would not change
/// anything returns the stored record as-is (no version bump, no notification).
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get(&self, key: &ResourceKey) -> Result<VmResource, StoreError>;

    /// Assigns uid, `resource_version = 1`, `generation = 1`.
    async fn create(&self, key: &ResourceKey, spec: VmSpec) -> Result<VmResource, StoreError>;

    /// Writes `metadata.finalizers` and `spec`. Returns `None` when the write
    /// dropped the last finalizer of a record marked for deletion and the
    /// record was physically removed.
    async fn update(&self, record: &VmResource) -> Result<Option<VmResource>, StoreError>;

    /// Writes `status` only.
    async fn update_status(&self, record: &VmResource) -> Result<VmResource, StoreError>;

    /// Sets the deletion marker. Records without finalizers are removed
    /// immediately, in which case `None` is returned.
    async fn request_delete(&self, key: &ResourceKey) -> Result<Option<VmResource>, StoreError>;

    async fn list(&self) -> Result<Vec<VmResource>, StoreError>;

    async fn watch(&self) -> Result<KeyStream, StoreError>;
}

/// Result of applying a write to the stored record.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Unchanged(VmResource),
    Changed(VmResource),
    Removed,
}

fn check_version(current: &VmResource, incoming: &VmResource) -> Result<(), StoreError> {
    if current.metadata.resource_version != incoming.metadata.resource_version {
        return Err(StoreError::Conflict {
            key: current.key(),
            expected: incoming.metadata.resource_version,
        });
    }
    Ok(())
}

/// Shared semantics of `ResourceStore::update` for every backend.
pub fn plan_update(current: &VmResource, incoming: &VmResource) -> Result<WriteOutcome, StoreError> {
    check_version(current, incoming)?;

    if current.metadata.is_being_deleted() {
        // No new finalizers once deletion has been requested.
        if let Some(added) = incoming
            .metadata
            .finalizers
            .iter()
            .find(|f| !current.metadata.has_finalizer(f))
        {
            return Err(StoreError::Invalid(format!(
                "cannot add finalizer {} to {} while it is being deleted",
                added,
                current.key()
            )));
        }
        if incoming.metadata.finalizers.is_empty() {
            return Ok(WriteOutcome::Removed);
        }
    }

    let mut next = current.clone();
    next.metadata.finalizers = incoming.metadata.finalizers.clone();
    next.spec = incoming.spec.clone();
    if next == *current {
        return Ok(WriteOutcome::Unchanged(next));
    }
    if next.spec != current.spec {
        next.spec.validate().map_err(|e| StoreError::Invalid(e.to_string()))?;
        next.metadata.generation += 1;
    }
    next.metadata.resource_version += 1;
    Ok(WriteOutcome::Changed(next))
}

/// Shared semantics of `ResourceStore::update_status`.
pub fn plan_status_update(
    current: &VmResource,
    incoming: &VmResource,
) -> Result<WriteOutcome, StoreError> {
    check_version(current, incoming)?;
    if current.status == incoming.status {
        return Ok(WriteOutcome::Unchanged(current.clone()));
    }
    let mut next = current.clone();
    next.status = incoming.status.clone();
    next.metadata.resource_version += 1;
    Ok(WriteOutcome::Changed(next))
}
