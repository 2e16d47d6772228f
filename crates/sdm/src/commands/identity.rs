use anyhow::Result;
use serde::Serialize;
use std::path::Path;

use super::identity_manager;
use crate::config::Config;
use crate::output::Output;

#[derive(Serialize)]
struct LoginResult {
    user_id: String,
    api_url: String,
}

#[derive(Serialize)]
struct WhoamiResult {
    logged_in: bool,
    user_id: Option<String>,
    api_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    public_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fingerprint: Option<String>,
}

/// Store the relay token and the user id it belongs to
pub async fn login(token: &str, user_id: &str, config: &Config, output: &Output) -> Result<()> {
    let token = token.trim();
    let user_id = user_id.trim();
    if token.is_empty() {
        anyhow::bail!("Token must not be empty");
    }
    if user_id.is_empty() {
        anyhow::bail!("User id must not be empty");
    }

    let mut config = config.clone();
    config.set_credentials(token, user_id)?;

    output.success(
        "login",
        LoginResult {
            user_id: user_id.to_string(),
            api_url: config.api_url.clone(),
        },
    );
    Ok(())
}

/// Clear credentials and the local identity key
pub async fn logout(data_dir: &Path, output: &Output) -> Result<()> {
    let mut config = Config::load(data_dir)?;
    if let Some(user_id) = config.user_id.clone() {
        identity_manager(data_dir, &user_id)?.reset()?;
    }
    config.clear_credentials()?;

    output.success_message("logout", "Logged out and removed the local identity key");
    Ok(())
}

/// Show the stored login and, if present, the local identity key.
/// Never creates a key.
pub async fn whoami(config: &Config, data_dir: &Path, output: &Output) -> Result<()> {
    let mut result = WhoamiResult {
        logged_in: config.is_logged_in(),
        user_id: config.user_id.clone(),
        api_url: config.api_url.clone(),
        public_key: None,
        fingerprint: None,
    };

    if let Some(user_id) = config.user_id.as_deref() {
        let keys_dir = data_dir.join("keys");
        if keys_dir.exists() {
            let manager = identity_manager(data_dir, user_id)?;
            if manager.has_identity()? {
                let identity = manager.init()?;
                result.public_key = Some(identity.public_key_base64());
                result.fingerprint = Some(identity.fingerprint());
            }
        }
    }

    output.success("whoami", result);
    Ok(())
}
