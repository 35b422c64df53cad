use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use vmctl_common::{LifecycleState, ResourceKey, VmResource, VmStatus, FINALIZER};
use vmctl_providers::{
    CloneStorageDevice, CreateVmRequest, IpFamily, Label, LoginUser, ModifyVmRequest,
    NetworkInterface, NetworkType, ProviderError, ServerState, VmDetails, VmProvider,
};

use crate::state_machine::{creation_in_flight, Phase};
use crate::store::{ResourceStore, StoreError};

/// Label linking a provider VM back to the record (value: record uid).
pub const OWNER_LABEL_KEY: &str = "vm-controller-uid";
pub const TITLE_LABEL_KEY: &str = "title";
pub const DEFAULT_STORAGE_TIER: &str = "maxiops";
const CUSTOM_PLAN: &str = "custom";

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Upper bound for a single wait-for-started.
    pub wait_timeout: Duration,
    /// Re-fetch-and-retry attempts after a status write conflict.
    pub status_conflict_retries: usize,
    pub storage_tier: String,
    pub owner_label_key: String,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_secs(600),
            status_conflict_retries: 3,
            storage_tier: DEFAULT_STORAGE_TIER.to_string(),
            owner_label_key: OWNER_LABEL_KEY.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Record is gone; nothing to do.
    NotFound,
    Created,
    /// An existing provider VM carrying our owner label was taken over.
    Adopted,
    Updated,
    InSync,
    /// External VM confirmed gone and our finalizer released.
    Finalized,
    /// Deletion requested but the record does not carry our finalizer.
    Skipped,
}

impl ReconcileOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileOutcome::NotFound => "not_found",
            ReconcileOutcome::Created => "created",
            ReconcileOutcome::Adopted => "adopted",
            ReconcileOutcome::Updated => "updated",
            ReconcileOutcome::InSync => "in_sync",
            ReconcileOutcome::Finalized => "finalized",
            ReconcileOutcome::Skipped => "skipped",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("store operation on {key} failed: {source}")]
    Store {
        key: ResourceKey,
        #[source]
        source: StoreError,
    },
    #[error("{operation} for {key} failed: {source}")]
    Provider {
        key: ResourceKey,
        operation: &'static str,
        #[source]
        source: ProviderError,
    },
}

impl ReconcileError {
    fn store(key: &ResourceKey, source: StoreError) -> Self {
        ReconcileError::Store {
            key: key.clone(),
            source,
        }
    }

    fn provider(key: &ResourceKey, operation: &'static str) -> impl FnOnce(ProviderError) -> Self {
        let key = key.clone();
        move |source| ReconcileError::Provider {
            key,
            operation,
            source,
        }
    }
}

/// Drives one record toward its desired state per invocation. Holds no
/// per-record state; every call starts from a fresh read.
pub struct Reconciler {
    store: Arc<dyn ResourceStore>,
    provider: Arc<dyn VmProvider>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        provider: Arc<dyn VmProvider>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            provider,
            config,
        }
    }

    pub async fn reconcile(&self, key: &ResourceKey) -> Result<ReconcileOutcome, ReconcileError> {
        let record = match self.store.get(key).await {
            Ok(record) => record,
            Err(StoreError::NotFound(_)) => {
                debug!(key = %key, "record not found, skipping");
                return Ok(ReconcileOutcome::NotFound);
            }
            Err(e) => return Err(ReconcileError::store(key, e)),
        };

        match Phase::of(Some(&record)) {
            Phase::Deleted => Ok(ReconcileOutcome::NotFound),
            Phase::PendingDeletion => self.finalize(record).await,
            Phase::Uninitialized => {
                let record = self.ensure_finalizer(record).await?;
                self.create(record).await
            }
            Phase::Provisioned => {
                let record = self.ensure_finalizer(record).await?;
                self.update(record).await
            }
        }
    }

    fn owner_label(&self, record: &VmResource) -> Label {
        Label::new(
            self.config.owner_label_key.clone(),
            record.metadata.uid.to_string(),
        )
    }

    /// Persists our finalizer before anything external happens.
    async fn ensure_finalizer(&self, mut record: VmResource) -> Result<VmResource, ReconcileError> {
        // A conflict here is not re-read; the failed key is requeued with backoff.
        if !record.metadata.add_finalizer(FINALIZER) {
            return Ok(record);
        }
        let key = record.key();
        info!(key = %key, "adding finalizer");
        match self.store.update(&record).await {
            Ok(Some(updated)) => Ok(updated),
            Ok(None) => Err(ReconcileError::store(&key, StoreError::NotFound(key.clone()))),
            Err(e) => Err(ReconcileError::store(&key, e)),
        }
    }

    async fn create(&self, record: VmResource) -> Result<ReconcileOutcome, ReconcileError> {
        let key = record.key();
        let owner = self.owner_label(&record);

        if creation_in_flight(&record) {
            let existing = self
                .provider
                .find_vm_by_label(&owner)
                .await
                .map_err(ReconcileError::provider(&key, "find_vm_by_label"))?;
            if let Some(vm) = existing {
                info!(key = %key, vm_id = %vm.uuid, "adopting VM left by an interrupted create");
                return self.finish_create(record, vm, ReconcileOutcome::Adopted).await;
            }
        }

        let record = if record.status.state == LifecycleState::Provisioning {
            record
        } else {
            let status = VmStatus {
                state: LifecycleState::Provisioning,
                ..record.status.clone()
            };
            self.persist_status(record, status).await?
        };

        let request = self.create_request(&record, owner.clone());
        info!(
            key = %key,
            zone = %request.zone,
            plan = %request.plan,
            cpu = request.core_number,
            memory = request.memory_amount,
            "creating VM"
        );
        let (vm, outcome) = match self.provider.create_vm(&request).await {
            Ok(vm) => (vm, ReconcileOutcome::Created),
            Err(e) if e.is_already_exists() => {
                warn!(key = %key, error = %e, "provider reports VM already exists, looking it up");
                let found = self
                    .provider
                    .find_vm_by_label(&owner)
                    .await
                    .map_err(ReconcileError::provider(&key, "find_vm_by_label"))?;
                match found {
                    Some(vm) => (vm, ReconcileOutcome::Adopted),
                    None => return Err(ReconcileError::provider(&key, "create_vm")(e)),
                }
            }
            Err(e) => return Err(ReconcileError::provider(&key, "create_vm")(e)),
        };
        self.finish_create(record, vm, outcome).await
    }

    async fn finish_create(
        &self,
        record: VmResource,
        vm: VmDetails,
        outcome: ReconcileOutcome,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let key = record.key();
        let ready = self
            .provider
            .wait_for_state(&vm.uuid, ServerState::Started, self.config.wait_timeout)
            .await
            .map_err(ReconcileError::provider(&key, "wait_for_state"))?;

        let ip_address = ready
            .first_address()
            .or_else(|| vm.first_address())
            .unwrap_or_default()
            .to_string();
        let status = VmStatus {
            vm_id: ready.uuid.clone(),
            state: LifecycleState::Ready,
            ip_address,
        };
        self.persist_status(record, status).await?;
        info!(key = %key, vm_id = %ready.uuid, outcome = outcome.as_str(), "VM running");
        Ok(outcome)
    }

    pub fn create_request(&self, record: &VmResource, owner: Label) -> CreateVmRequest {
        let spec = &record.spec;
        let name = &record.metadata.name;
        CreateVmRequest {
            title: name.clone(),
            hostname: name.clone(),
            zone: spec.zone.clone(),
            plan: spec.plan.clone(),
            core_number: spec.cpu,
            memory_amount: spec.memory,
            timezone: spec.timezone.clone(),
            storage_devices: vec![CloneStorageDevice {
                template: spec.storage_template.clone(),
                title: name.clone(),
                size_gb: spec.storage_size,
                tier: self.config.storage_tier.clone(),
            }],
            interfaces: vec![NetworkInterface {
                network_type: NetworkType::Utility,
                ip_families: vec![IpFamily::IPv4],
            }],
            login_user: spec.login_user.as_ref().map(|u| LoginUser {
                username: u.username.clone(),
                create_password: u.create_password,
                ssh_keys: u.ssh_keys.clone(),
            }),
            user_data: spec.user_data.clone(),
            labels: vec![owner],
        }
    }

    async fn update(&self, record: VmResource) -> Result<ReconcileOutcome, ReconcileError> {
        let key = record.key();
        let vm_id = record.status.vm_id.clone();
        let vm = self
            .provider
            .get_vm(&vm_id)
            .await
            .map_err(ReconcileError::provider(&key, "get_vm"))?;

        let Some(request) = modification(&record, &vm) else {
            debug!(key = %key, vm_id = %vm_id, "VM matches spec");
            let status = VmStatus {
                vm_id,
                ..record.status.clone()
            };
            self.persist_status(record, status).await?;
            return Ok(ReconcileOutcome::InSync);
        };

        info!(key = %key, vm_id = %vm_id, title = %request.title, plan = %request.plan, "modifying VM");
        self.provider
            .modify_vm(&vm_id, &request)
            .await
            .map_err(ReconcileError::provider(&key, "modify_vm"))?;
        self.provider
            .wait_for_state(&vm_id, ServerState::Started, self.config.wait_timeout)
            .await
            .map_err(ReconcileError::provider(&key, "wait_for_state"))?;

        let status = VmStatus {
            vm_id,
            ..record.status.clone()
        };
        self.persist_status(record, status).await?;
        Ok(ReconcileOutcome::Updated)
    }

    async fn finalize(&self, mut record: VmResource) -> Result<ReconcileOutcome, ReconcileError> {
        let key = record.key();
        if !record.metadata.has_finalizer(FINALIZER) {
            debug!(key = %key, "deletion requested without our finalizer");
            return Ok(ReconcileOutcome::Skipped);
        }

        let target = if !record.status.vm_id.is_empty() {
            Some(record.status.vm_id.clone())
        } else if creation_in_flight(&record) {
            self.provider
                .find_vm_by_label(&self.owner_label(&record))
                .await
                .map_err(ReconcileError::provider(&key, "find_vm_by_label"))?
                .map(|vm| vm.uuid)
        } else {
            None
        };

        if let Some(vm_id) = target {
            info!(key = %key, vm_id = %vm_id, "deleting VM and storage");
            match self.provider.delete_vm_and_storage(&vm_id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    info!(key = %key, vm_id = %vm_id, "VM already gone");
                }
                Err(e) => return Err(ReconcileError::provider(&key, "delete_vm_and_storage")(e)),
            }
        }

        // Conflicts are left to the requeue, same as ensure_finalizer.
        record.metadata.remove_finalizer(FINALIZER);
        match self.store.update(&record).await {
            Ok(Some(_)) => info!(key = %key, "finalizer removed, waiting on other finalizers"),
            Ok(None) => info!(key = %key, "record removed"),
            Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(ReconcileError::store(&key, e)),
        }
        Ok(ReconcileOutcome::Finalized)
    }

    /// Writes `status` onto `record`. On a version conflict the record is
    /// re-read and the same status applied to the fresh copy.
    async fn persist_status(
        &self,
        mut record: VmResource,
        status: VmStatus,
    ) -> Result<VmResource, ReconcileError> {
        let key = record.key();
        let mut attempts = 0;
        loop {
            record.status = status.clone();
            match self.store.update_status(&record).await {
                Ok(written) => return Ok(written),
                Err(e) if e.is_conflict() && attempts < self.config.status_conflict_retries => {
                    attempts += 1;
                    debug!(key = %key, attempt = attempts, "status conflict, re-reading record");
                    record = self
                        .store
                        .get(&key)
                        .await
                        .map_err(|e| ReconcileError::store(&key, e))?;
                }
                Err(e) => return Err(ReconcileError::store(&key, e)),
            }
        }
    }
}

/// Modification bringing `vm` in line with `record`, or `None` when nothing
/// drifted. CPU and memory only count on the custom plan; fixed plans define
/// them.
pub fn modification(record: &VmResource, vm: &VmDetails) -> Option<ModifyVmRequest> {
    let spec = &record.spec;
    let name = &record.metadata.name;

    let title_drift = vm.title != *name;
    let sizing_drift = spec.plan == CUSTOM_PLAN
        && (vm.core_number != spec.cpu || vm.memory_amount != spec.memory);
    let timezone_drift = spec
        .timezone
        .as_deref()
        .is_some_and(|tz| vm.timezone.as_deref() != Some(tz));
    if !title_drift && !sizing_drift && !timezone_drift && vm.plan == spec.plan && vm.zone == spec.zone
    {
        return None;
    }

    let labels = title_drift.then(|| {
        let mut labels = vm.labels.clone();
        labels.push(Label::new(TITLE_LABEL_KEY, name.clone()));
        labels
    });
    Some(ModifyVmRequest {
        title: name.clone(),
        plan: spec.plan.clone(),
        zone: spec.zone.clone(),
        core_number: spec.cpu,
        memory_amount: spec.memory,
        timezone: spec.timezone.clone(),
        labels,
    })
}
