use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;

pub mod error;
pub mod server;

pub use error::{ErrorKind, ProviderError};
pub use server::{
    CloneStorageDevice, CreateVmRequest, IpAddress, IpFamily, Label, LoginUser, ModifyVmRequest,
    NetworkInterface, NetworkType, ServerState, VmDetails,
};

/// Handle to a compute provider. Implementations are shared across workers
/// and must not keep per-reconciliation state.
#[async_trait]
pub trait VmProvider: Send + Sync {
    /// Cheap authenticated call used once at startup. Default is a no-op.
    async fn verify_credentials(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn create_vm(&self, request: &CreateVmRequest) -> Result<VmDetails, ProviderError>;

    async fn get_vm(&self, uuid: &str) -> Result<VmDetails, ProviderError>;

    async fn modify_vm(
        &self,
        uuid: &str,
        request: &ModifyVmRequest,
    ) -> Result<VmDetails, ProviderError>;

    /// Deletes the server and every storage device attached to it.
    async fn delete_vm_and_storage(&self, uuid: &str) -> Result<(), ProviderError>;

    /// First server carrying `label`, if any.
    async fn find_vm_by_label(&self, label: &Label) -> Result<Option<VmDetails>, ProviderError>;

    fn poll_interval(&self) -> Duration {
        Duration::from_secs(5)
    }

    /// Polls `get_vm` until the server reports `desired`. Fails with
    /// `ProviderError::Timeout` once `timeout` has elapsed; a server that
    /// lands in `error` fails immediately.
    async fn wait_for_state(
        &self,
        uuid: &str,
        desired: ServerState,
        timeout: Duration,
    ) -> Result<VmDetails, ProviderError> {
        let started = Instant::now();
        loop {
            let details = self.get_vm(uuid).await?;
            if details.state == desired {
                return Ok(details);
            }
            if details.state == ServerState::Error && desired != ServerState::Error {
                return Err(ProviderError::api(
                    ErrorKind::PermanentRejection,
                    200,
                    "SERVER_STATE_ERROR",
                    format!("server {} entered error state", uuid),
                ));
            }
            let waited = started.elapsed();
            if waited >= timeout {
                return Err(ProviderError::Timeout {
                    uuid: uuid.to_string(),
                    desired,
                    last: details.state,
                    waited,
                });
            }
            tokio::time::sleep(self.poll_interval().min(timeout - waited)).await;
        }
    }
}

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(feature = "upcloud")]
pub mod upcloud;
