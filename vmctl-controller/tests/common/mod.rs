// Shared fixtures for controller integration tests.
// Everything runs against the in-memory store and the mock provider.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use vmctl_common::{LifecycleState, ResourceKey, VmResource, VmSpec, VmStatus, FINALIZER};
use vmctl_controller::reconciler::OWNER_LABEL_KEY;
use vmctl_controller::{MemoryStore, Reconciler, ReconcilerConfig};
use vmctl_providers::mock::MockProvider;
use vmctl_providers::{IpAddress, Label, ServerState, VmDetails};

pub const NAMESPACE: &str = "default";

pub fn key(name: &str) -> ResourceKey {
    ResourceKey::new(NAMESPACE, name)
}

pub fn vm_spec() -> VmSpec {
    VmSpec {
        cpu: 2,
        memory: 4096,
        storage_size: 25,
        zone: "fi-hel1".to_string(),
        plan: "custom".to_string(),
        timezone: None,
        storage_template: "template-uuid".to_string(),
        login_user: None,
        user_data: None,
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub provider: Arc<MockProvider>,
    pub reconciler: Reconciler,
}

pub fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let provider = Arc::new(MockProvider::new());
    let reconciler = Reconciler::new(
        store.clone(),
        provider.clone(),
        ReconcilerConfig {
            wait_timeout: Duration::from_secs(5),
            ..ReconcilerConfig::default()
        },
    );
    Harness {
        store,
        provider,
        reconciler,
    }
}

/// Record that already carries our finalizer and a recorded VM.
pub fn provisioned(name: &str, vm_id: &str) -> VmResource {
    let mut record = VmResource::new(key(name), vm_spec());
    record.metadata.add_finalizer(FINALIZER);
    record.status = VmStatus {
        vm_id: vm_id.to_string(),
        state: LifecycleState::Ready,
        ip_address: "10.0.0.9".to_string(),
    };
    record
}

/// Same record with a deletion request on it.
pub fn terminating(name: &str, vm_id: &str) -> VmResource {
    let mut record = provisioned(name, vm_id);
    record.metadata.deletion_timestamp = Some(Utc::now());
    record
}

pub fn owner_label(record: &VmResource) -> Label {
    Label::new(OWNER_LABEL_KEY, record.metadata.uid.to_string())
}

pub fn server(uuid: &str, title: &str, labels: Vec<Label>) -> VmDetails {
    VmDetails {
        uuid: uuid.to_string(),
        title: title.to_string(),
        hostname: title.to_string(),
        zone: "fi-hel1".to_string(),
        plan: "custom".to_string(),
        state: ServerState::Started,
        core_number: 2,
        memory_amount: 4096,
        timezone: None,
        labels,
        ip_addresses: vec![IpAddress {
            address: "10.1.1.1".to_string(),
            family: "IPv4".to_string(),
            access: "utility".to_string(),
        }],
    }
}

/// Polls `check` until it returns true or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check().await
}
