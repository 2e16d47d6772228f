//! Test utilities

#![allow(dead_code)]

use sealed_dm::{
    ApiClient, CallbackAuthGateway, ClientConfig, DisplayMessage, IdentityKeyManager,
    InMemoryStorage, ReconnectPolicy, RetryPolicy,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use url::Url;

pub mod relay_server;
pub use relay_server::RelayServer;

/// Generous upper bound for anything the fast config should finish well within.
pub const PATIENCE: Duration = Duration::from_secs(10);

/// Millisecond-scale timings so scenarios run quickly.
pub fn fast_config(relay: &RelayServer) -> ClientConfig {
    ClientConfig::new(&relay.api_url())
        .expect("relay url")
        .with_poll_interval(Duration::from_millis(100))
        .with_key_retry(RetryPolicy {
            step: Duration::from_millis(20),
            cap: Duration::from_millis(50),
            max_retries: 10,
        })
        .with_reconnect(ReconnectPolicy {
            base: Duration::from_millis(20),
            max: Duration::from_millis(100),
        })
}

pub struct TestUser {
    pub user_id: String,
    pub gateway: Arc<CallbackAuthGateway>,
    pub api: ApiClient,
    pub identity: Arc<IdentityKeyManager>,
}

/// Register `user_id` on the relay with fresh local storage.
pub async fn test_user(relay: &RelayServer, config: &ClientConfig, user_id: &str) -> TestUser {
    let token = relay.register(user_id).await;
    let gateway = Arc::new(CallbackAuthGateway::new(token));
    let api = ApiClient::new(config.api_url.clone(), gateway.clone()).expect("api client");
    let identity = Arc::new(IdentityKeyManager::new(
        user_id,
        Arc::new(InMemoryStorage::new()),
    ));
    TestUser {
        user_id: user_id.to_string(),
        gateway,
        api,
        identity,
    }
}

pub fn api_with_token(base: &Url, token: &str) -> (Arc<CallbackAuthGateway>, ApiClient) {
    let gateway = Arc::new(CallbackAuthGateway::new(token));
    let api = ApiClient::new(base.clone(), gateway.clone()).expect("api client");
    (gateway, api)
}

/// Wait until `pred` holds for the watched value, or fail after [`PATIENCE`].
pub async fn wait_until<T, F>(rx: &mut watch::Receiver<T>, what: &str, pred: F) -> T
where
    T: Clone,
    F: FnMut(&T) -> bool,
{
    match tokio::time::timeout(PATIENCE, rx.wait_for(pred)).await {
        Ok(Ok(value)) => value.clone(),
        Ok(Err(_)) => panic!("sender dropped while waiting for {}", what),
        Err(_) => panic!("timed out waiting for {}", what),
    }
}

pub fn texts(view: &[DisplayMessage]) -> Vec<String> {
    view.iter()
        .filter_map(|m| m.text().map(str::to_string))
        .collect()
}
