use crate::{
    CreateVmRequest, IpAddress, IpFamily, Label, ModifyVmRequest, ProviderError, ServerState,
    VmDetails, VmProvider,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;

/// Every call the mock received, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCall {
    VerifyCredentials,
    Create(CreateVmRequest),
    Get(String),
    Modify(String, ModifyVmRequest),
    Delete(String),
    Wait(String, ServerState),
    FindByLabel(Label),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOperation {
    VerifyCredentials,
    Create,
    Get,
    Modify,
    Delete,
    Wait,
    FindByLabel,
}

impl ProviderCall {
    pub fn operation(&self) -> MockOperation {
        match self {
            ProviderCall::VerifyCredentials => MockOperation::VerifyCredentials,
            ProviderCall::Create(_) => MockOperation::Create,
            ProviderCall::Get(_) => MockOperation::Get,
            ProviderCall::Modify(..) => MockOperation::Modify,
            ProviderCall::Delete(_) => MockOperation::Delete,
            ProviderCall::Wait(..) => MockOperation::Wait,
            ProviderCall::FindByLabel(_) => MockOperation::FindByLabel,
        }
    }
}

#[derive(Default)]
struct MockState {
    servers: BTreeMap<String, VmDetails>,
    calls: Vec<ProviderCall>,
    failures: HashMap<MockOperation, VecDeque<ProviderError>>,
    next_id: u64,
}

impl MockState {
    fn record(&mut self, call: ProviderCall) -> Result<(), ProviderError> {
        let op = call.operation();
        self.calls.push(call);
        match self.failures.get_mut(&op).and_then(|q| q.pop_front()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// In-memory provider: servers live in a map, ids and addresses are
/// deterministic, and failures can be scripted per operation.
#[derive(Default)]
pub struct MockProvider {
    state: Mutex<MockState>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn calls(&self) -> Vec<ProviderCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn calls_of(&self, op: MockOperation) -> Vec<ProviderCall> {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| c.operation() == op)
            .cloned()
            .collect()
    }

    pub async fn clear_calls(&self) {
        self.state.lock().await.calls.clear();
    }

    /// Queue `err` as the result of the next call to `op`.
    pub async fn fail_next(&self, op: MockOperation, err: ProviderError) {
        self.state
            .lock()
            .await
            .failures
            .entry(op)
            .or_default()
            .push_back(err);
    }

    pub async fn insert_server(&self, details: VmDetails) {
        self.state
            .lock()
            .await
            .servers
            .insert(details.uuid.clone(), details);
    }

    pub async fn server(&self, uuid: &str) -> Option<VmDetails> {
        self.state.lock().await.servers.get(uuid).cloned()
    }

    pub async fn server_count(&self) -> usize {
        self.state.lock().await.servers.len()
    }
}

#[async_trait]
impl VmProvider for MockProvider {
    async fn verify_credentials(&self) -> Result<(), ProviderError> {
        self.state.lock().await.record(ProviderCall::VerifyCredentials)
    }

    async fn create_vm(&self, request: &CreateVmRequest) -> Result<VmDetails, ProviderError> {
        let mut state = self.state.lock().await;
        state.record(ProviderCall::Create(request.clone()))?;

        state.next_id += 1;
        let n = state.next_id;
        let uuid = format!("00000000-0000-4000-8000-{:012x}", n);
        let ip_addresses = request
            .interfaces
            .iter()
            .flat_map(|iface| {
                iface.ip_families.iter().map(move |family| IpAddress {
                    address: match family {
                        IpFamily::IPv4 => {
                            format!("10.{}.{}.{}", (n >> 16) & 0xff, (n >> 8) & 0xff, n & 0xff)
                        }
                        IpFamily::IPv6 => format!("fd00::{:x}", n),
                    },
                    family: family.as_str().to_string(),
                    access: iface.network_type.as_str().to_string(),
                })
            })
            .collect();

        let details = VmDetails {
            uuid: uuid.clone(),
            title: request.title.clone(),
            hostname: request.hostname.clone(),
            zone: request.zone.clone(),
            plan: request.plan.clone(),
            state: ServerState::Maintenance,
            core_number: request.core_number,
            memory_amount: request.memory_amount,
            timezone: request.timezone.clone(),
            labels: request.labels.clone(),
            ip_addresses,
        };
        state.servers.insert(uuid, details.clone());
        Ok(details)
    }

    async fn get_vm(&self, uuid: &str) -> Result<VmDetails, ProviderError> {
        let mut state = self.state.lock().await;
        state.record(ProviderCall::Get(uuid.to_string()))?;
        state
            .servers
            .get(uuid)
            .cloned()
            .ok_or_else(|| ProviderError::not_found(uuid))
    }

    async fn modify_vm(
        &self,
        uuid: &str,
        request: &ModifyVmRequest,
    ) -> Result<VmDetails, ProviderError> {
        let mut state = self.state.lock().await;
        state.record(ProviderCall::Modify(uuid.to_string(), request.clone()))?;
        let server = state
            .servers
            .get_mut(uuid)
            .ok_or_else(|| ProviderError::not_found(uuid))?;
        server.title = request.title.clone();
        server.plan = request.plan.clone();
        server.zone = request.zone.clone();
        server.core_number = request.core_number;
        server.memory_amount = request.memory_amount;
        if request.timezone.is_some() {
            server.timezone = request.timezone.clone();
        }
        if let Some(labels) = &request.labels {
            server.labels = labels.clone();
        }
        Ok(server.clone())
    }

    async fn delete_vm_and_storage(&self, uuid: &str) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        state.record(ProviderCall::Delete(uuid.to_string()))?;
        state
            .servers
            .remove(uuid)
            .map(|_| ())
            .ok_or_else(|| ProviderError::not_found(uuid))
    }

    async fn find_vm_by_label(&self, label: &Label) -> Result<Option<VmDetails>, ProviderError> {
        let mut state = self.state.lock().await;
        state.record(ProviderCall::FindByLabel(label.clone()))?;
        Ok(state.servers.values().find(|s| s.has_label(label)).cloned())
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(1)
    }

    /// Servers reach the requested state instantly.
    async fn wait_for_state(
        &self,
        uuid: &str,
        desired: ServerState,
        _timeout: Duration,
    ) -> Result<VmDetails, ProviderError> {
        let mut state = self.state.lock().await;
        state.record(ProviderCall::Wait(uuid.to_string(), desired))?;
        let server = state
            .servers
            .get_mut(uuid)
            .ok_or_else(|| ProviderError::not_found(uuid))?;
        server.state = desired;
        Ok(server.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CloneStorageDevice, ErrorKind, NetworkInterface, NetworkType};

    fn create_request(title: &str) -> CreateVmRequest {
        CreateVmRequest {
            title: title.to_string(),
            hostname: title.to_string(),
            zone: "fi-hel1".to_string(),
            plan: "custom".to_string(),
            core_number: 1,
            memory_amount: 1024,
            timezone: None,
            storage_devices: vec![CloneStorageDevice {
                template: "template-uuid".to_string(),
                title: title.to_string(),
                size_gb: 10,
                tier: "maxiops".to_string(),
            }],
            interfaces: vec![NetworkInterface {
                network_type: NetworkType::Utility,
                ip_families: vec![IpFamily::IPv4],
            }],
            login_user: None,
            user_data: None,
            labels: vec![Label::new("owner", "uid-1")],
        }
    }

    #[tokio::test]
    async fn create_wait_delete_lifecycle() {
        let mock = MockProvider::new();
        let created = mock.create_vm(&create_request("vm-1")).await.unwrap();
        assert_eq!(created.state, ServerState::Maintenance);
        assert_eq!(created.first_address(), Some("10.0.0.1"));

        let ready = mock
            .wait_for_state(&created.uuid, ServerState::Started, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(ready.state, ServerState::Started);

        let found = mock
            .find_vm_by_label(&Label::new("owner", "uid-1"))
            .await
            .unwrap();
        assert_eq!(found.map(|s| s.uuid), Some(created.uuid.clone()));

        mock.delete_vm_and_storage(&created.uuid).await.unwrap();
        let err = mock.get_vm(&created.uuid).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(mock.calls().await.len(), 5);
    }

    #[tokio::test]
    async fn scripted_failure_is_consumed_once() {
        let mock = MockProvider::new();
        mock.fail_next(
            MockOperation::Create,
            ProviderError::api(ErrorKind::Transient, 503, "SERVICE_UNAVAILABLE", "try later"),
        )
        .await;

        let err = mock.create_vm(&create_request("vm-1")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert_eq!(mock.server_count().await, 0);

        mock.create_vm(&create_request("vm-1")).await.unwrap();
        assert_eq!(mock.server_count().await, 1);
        assert_eq!(mock.calls_of(MockOperation::Create).await.len(), 2);
    }

    #[tokio::test]
    async fn default_wait_times_out_on_stuck_server() {
        // Exercise the trait's polling implementation through a thin wrapper.
        struct Polling(MockProvider);

        #[async_trait]
        impl VmProvider for Polling {
            async fn create_vm(&self, r: &CreateVmRequest) -> Result<VmDetails, ProviderError> {
                self.0.create_vm(r).await
            }
            async fn get_vm(&self, uuid: &str) -> Result<VmDetails, ProviderError> {
                self.0.get_vm(uuid).await
            }
            async fn modify_vm(
                &self,
                uuid: &str,
                r: &ModifyVmRequest,
            ) -> Result<VmDetails, ProviderError> {
                self.0.modify_vm(uuid, r).await
            }
            async fn delete_vm_and_storage(&self, uuid: &str) -> Result<(), ProviderError> {
                self.0.delete_vm_and_storage(uuid).await
            }
            async fn find_vm_by_label(
                &self,
                label: &Label,
            ) -> Result<Option<VmDetails>, ProviderError> {
                self.0.find_vm_by_label(label).await
            }
            fn poll_interval(&self) -> Duration {
                Duration::from_millis(5)
            }
        }

        let provider = Polling(MockProvider::new());
        let created = provider.create_vm(&create_request("vm-1")).await.unwrap();
        let err = provider
            .wait_for_state(&created.uuid, ServerState::Started, Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProviderError::Timeout {
                last: ServerState::Maintenance,
                ..
            }
        ));
    }
}
