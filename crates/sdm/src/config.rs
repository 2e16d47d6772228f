use anyhow::{Context, Result};
use sealed_dm::{ClientConfig, DEFAULT_API_URL};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// CLI configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Relay REST base, e.g. `http://localhost:5000/api/messages`
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// WebSocket endpoint; derived from `api_url` when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_url: Option<String>,

    /// Bearer token issued by the relay's auth service
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Relay user id the token belongs to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Path to the config file
    #[serde(skip)]
    pub path: PathBuf,
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            ws_url: None,
            token: None,
            user_id: None,
            path: PathBuf::new(),
        }
    }
}

impl Config {
    /// Load config from the data directory
    pub fn load(data_dir: &Path) -> Result<Self> {
        let config_path = data_dir.join("config.json");

        if config_path.exists() {
            let content =
                std::fs::read_to_string(&config_path).context("Failed to read config file")?;
            let mut config: Config =
                serde_json::from_str(&content).context("Failed to parse config file")?;
            config.path = config_path;
            Ok(config)
        } else {
            Ok(Config {
                path: config_path,
                ..Default::default()
            })
        }
    }

    /// Save config to disk
    pub fn save(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&self.path, content).context("Failed to write config file")?;
        Ok(())
    }

    pub fn set_credentials(&mut self, token: &str, user_id: &str) -> Result<()> {
        self.token = Some(token.to_string());
        self.user_id = Some(user_id.to_string());
        self.save()
    }

    pub fn clear_credentials(&mut self) -> Result<()> {
        self.token = None;
        self.user_id = None;
        self.save()
    }

    pub fn is_logged_in(&self) -> bool {
        self.token.is_some() && self.user_id.is_some()
    }

    /// `(token, user_id)`, or an error telling the user to log in.
    pub fn credentials(&self) -> Result<(&str, &str)> {
        match (self.token.as_deref(), self.user_id.as_deref()) {
            (Some(token), Some(user_id)) => Ok((token, user_id)),
            _ => anyhow::bail!("Not logged in. Run `sdm login <token> --user-id <id>` first."),
        }
    }

    /// Library config for this relay. `api_override` wins over the stored URL.
    pub fn client_config(&self, api_override: Option<&str>) -> Result<ClientConfig> {
        let api_url = api_override.unwrap_or(&self.api_url);
        let mut client = ClientConfig::new(api_url)
            .with_context(|| format!("Invalid API URL: {}", api_url))?;
        if let Some(ws_url) = self.ws_url.as_deref() {
            client = client
                .with_ws_url(ws_url)
                .with_context(|| format!("Invalid WebSocket URL: {}", ws_url))?;
        }
        Ok(client)
    }
}
