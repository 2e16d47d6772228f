pub mod chat;
pub mod identity;
pub mod keys;
pub mod message;

use anyhow::{Context, Result};
use sealed_dm::{
    ApiClient, CallbackAuthGateway, ClientConfig, FileStorageAdapter, IdentityKeyManager,
};
use std::path::Path;
use std::sync::Arc;

use crate::config::Config;

/// Everything a networked command needs, built from the stored login.
pub struct Client {
    pub user_id: String,
    pub config: ClientConfig,
    pub api: ApiClient,
    pub identity: Arc<IdentityKeyManager>,
}

impl Client {
    pub fn connect(config: &Config, data_dir: &Path, api_override: Option<&str>) -> Result<Self> {
        let (token, user_id) = config.credentials()?;
        let client_config = config.client_config(api_override)?;

        let gateway = Arc::new(CallbackAuthGateway::new(token));
        gateway.set_on_unauthorized(|| {
            tracing::warn!("relay rejected the stored token; run `sdm login` again");
        });
        let api = ApiClient::new(client_config.api_url.clone(), gateway)
            .context("Failed to build HTTP client")?;

        Ok(Self {
            user_id: user_id.to_string(),
            config: client_config,
            api,
            identity: Arc::new(identity_manager(data_dir, user_id)?),
        })
    }
}

/// Identity keys live under `<data_dir>/keys`, separate from the config file.
pub fn identity_manager(data_dir: &Path, user_id: &str) -> Result<IdentityKeyManager> {
    let storage = FileStorageAdapter::new(data_dir.join("keys"))
        .context("Failed to open key storage")?;
    Ok(IdentityKeyManager::new(user_id, Arc::new(storage)))
}
