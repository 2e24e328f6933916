pub mod ipfs;
pub mod local;
pub mod provider;
pub mod web3storage;

pub use ipfs::*;
pub use local::*;
pub use provider::*;
pub use web3storage::*;

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::StorageConfig;
use crate::error::StorageError;

/// Registry of storage providers by name, with a configured default
pub struct StorageManager {
    providers: HashMap<&'static str, Arc<dyn StorageProvider>>,
    default_provider: String,
}

impl StorageManager {
    pub fn new(default_provider: &str) -> Self {
        Self {
            providers: HashMap::new(),
            default_provider: default_provider.to_string(),
        }
    }

    /// Local storage is always available; remote providers are registered
    /// when their credentials are configured.
    pub fn from_config(config: &StorageConfig) -> Self {
        let mut manager = Self::new(&config.default_provider);
        manager.register(Arc::new(LocalStorage::new(&config.local_path)));

        if !config.web3storage_token.is_empty() {
            manager.register(Arc::new(Web3Storage::new(
                &config.web3storage_api_url,
                &config.web3storage_gateway_url,
                &config.web3storage_token,
            )));
        }
        if !config.ipfs_api_url.is_empty() {
            manager.register(Arc::new(IpfsStorage::new(&config.ipfs_api_url)));
        }

        if !manager.providers.contains_key(manager.default_provider.as_str()) {
            tracing::warn!(
                "Default storage provider '{}' is not configured",
                manager.default_provider
            );
        }
        manager
    }

    pub fn register(&mut self, provider: Arc<dyn StorageProvider>) {
        tracing::info!("Registered storage provider: {}", provider.storage_type());
        self.providers.insert(provider.storage_type(), provider);
    }

    /// Get a provider by name, or the default one
    pub fn get_provider(&self, name: Option<&str>) -> StorageResult<Arc<dyn StorageProvider>> {
        let name = name.unwrap_or(self.default_provider.as_str());
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::ProviderNotFound(name.to_string()))
    }

    pub fn default_provider(&self) -> &str {
        &self.default_provider
    }

    pub fn provider_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.providers.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            local_path: dir.path().to_string_lossy().to_string(),
            ipfs_api_url: "http://127.0.0.1:5001".to_string(),
            ..StorageConfig::default()
        };
        let manager = StorageManager::from_config(&config);

        assert_eq!(manager.provider_names(), vec!["ipfs", "local"]);
        assert_eq!(manager.get_provider(None).unwrap().storage_type(), "local");
        assert_eq!(manager.get_provider(Some("ipfs")).unwrap().storage_type(), "ipfs");
        assert!(matches!(
            manager.get_provider(Some("web3storage")),
            Err(StorageError::ProviderNotFound(_))
        ));
    }
}
