use anyhow::{Context, Result};
use sealed_dm::utils::{fingerprint, public_key_from_base64};
use sealed_dm::PublishOutcome;
use serde::Serialize;
use std::path::Path;

use super::{identity_manager, Client};
use crate::config::Config;
use crate::output::Output;

#[derive(Serialize)]
struct KeyInfo {
    user_id: String,
    public_key: String,
    public_key_hex: String,
    fingerprint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    published: Option<&'static str>,
}

fn outcome_label(outcome: PublishOutcome) -> &'static str {
    match outcome {
        PublishOutcome::AlreadyPublished => "already_published",
        PublishOutcome::Published => "published",
        PublishOutcome::Replaced => "replaced",
    }
}

fn key_info(user_id: &str, public_key_b64: &str) -> Result<KeyInfo> {
    let key = public_key_from_base64(public_key_b64).context("Relay returned a malformed key")?;
    Ok(KeyInfo {
        user_id: user_id.to_string(),
        public_key: public_key_b64.to_string(),
        public_key_hex: hex::encode(key.as_bytes()),
        fingerprint: fingerprint(&key),
        published: None,
    })
}

/// Create the local identity if missing; works offline
pub async fn init(config: &Config, data_dir: &Path, output: &Output) -> Result<()> {
    let (_, user_id) = config.credentials()?;
    let identity = identity_manager(data_dir, user_id)?
        .init()
        .context("Failed to load or create identity key")?;

    output.success("keys.init", key_info(user_id, &identity.public_key_base64())?);
    Ok(())
}

/// Upload the public key unless the relay already has it
pub async fn publish(client: &Client, output: &Output) -> Result<()> {
    let outcome = client
        .identity
        .publish(&client.api)
        .await
        .context("Failed to publish identity key")?;
    let identity = client.identity.init()?;

    let mut info = key_info(&client.user_id, &identity.public_key_base64())?;
    info.published = Some(outcome_label(outcome));
    output.success("keys.publish", info);
    Ok(())
}

/// Show a peer's published key, or our own when `peer` is `None`
pub async fn show(client: &Client, peer: Option<&str>, output: &Output) -> Result<()> {
    let user_id = peer.unwrap_or(client.user_id.as_str());
    let bundle = client
        .api
        .get_peer_key(user_id)
        .await
        .context("Failed to fetch key")?;

    match bundle {
        Some(bundle) => output.success("keys.show", key_info(user_id, &bundle.public_key)?),
        None => anyhow::bail!("{} has not published an encryption key", user_id),
    }
    Ok(())
}
