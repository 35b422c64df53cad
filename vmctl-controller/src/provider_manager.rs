use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use vmctl_providers::VmProvider;

use crate::config::ProviderSettings;

pub struct ProviderManager;

impl ProviderManager {
    pub fn provider_name(settings: &ProviderSettings) -> &'static str {
        match settings {
            ProviderSettings::Mock => "mock",
            ProviderSettings::UpCloud { .. } => "upcloud",
        }
    }

    /// Builds the configured provider. Credentials come from `settings` only.
    pub fn get_provider(settings: &ProviderSettings) -> Result<Arc<dyn VmProvider>> {
        info!(provider = Self::provider_name(settings), "initializing provider");
        match settings {
            #[cfg(feature = "provider-upcloud")]
            ProviderSettings::UpCloud {
                api_url,
                username,
                password,
            } => {
                use vmctl_providers::upcloud::{UpCloudCredentials, UpCloudProvider};
                let provider = UpCloudProvider::new(
                    api_url,
                    UpCloudCredentials {
                        username: username.clone(),
                        password: password.clone(),
                    },
                )?;
                Ok(Arc::new(provider))
            }
            #[cfg(feature = "provider-mock")]
            ProviderSettings::Mock => Ok(Arc::new(vmctl_providers::mock::MockProvider::new())),
            #[allow(unreachable_patterns)]
            other => anyhow::bail!(
                "provider {} is not compiled in (enable the provider-{} feature)",
                Self::provider_name(other),
                Self::provider_name(other)
            ),
        }
    }
}

#[cfg(all(test, feature = "provider-mock"))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn builds_mock_provider() {
        let provider = ProviderManager::get_provider(&ProviderSettings::Mock).unwrap();
        provider.verify_credentials().await.unwrap();
    }
}
