use crate::{
    Error, Result, DEFAULT_DECRYPT_CACHE_CAPACITY, DEFAULT_MESSAGE_PAGE, DEFAULT_POLL_INTERVAL,
    KEY_RETRY_CAP, KEY_RETRY_STEP, MAX_KEY_RETRIES, RECONNECT_BASE_DELAY, RECONNECT_MAX_DELAY,
};
use std::time::Duration;
use url::Url;

pub const DEFAULT_API_URL: &str = "http://localhost:5000/api/messages";
pub const WS_PATH: &str = "/ws/messages";

/// Linear backoff used while a peer has not published a key yet:
/// `min(step * attempt, cap)` for attempts `1..=max_retries`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub step: Duration,
    pub cap: Duration,
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.step.saturating_mul(attempt).min(self.cap)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            step: KEY_RETRY_STEP,
            cap: KEY_RETRY_CAP,
            max_retries: MAX_KEY_RETRIES,
        }
    }
}

/// Exponential backoff for WebSocket reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl ReconnectPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: RECONNECT_BASE_DELAY,
            max: RECONNECT_MAX_DELAY,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_url: Url,
    pub ws_url: Url,
    pub poll_interval: Duration,
    pub key_retry: RetryPolicy,
    pub reconnect: ReconnectPolicy,
    pub decrypt_cache_capacity: usize,
    /// How many of the newest messages a refresh fetches.
    pub message_page: usize,
}

impl ClientConfig {
    /// Builds a config for `api_url`, deriving the WebSocket endpoint from its origin.
    pub fn new(api_url: &str) -> Result<Self> {
        let api_url = parse_base_url(api_url)?;
        let ws_url = derive_ws_url(&api_url)?;
        Ok(Self {
            api_url,
            ws_url,
            poll_interval: DEFAULT_POLL_INTERVAL,
            key_retry: RetryPolicy::default(),
            reconnect: ReconnectPolicy::default(),
            decrypt_cache_capacity: DEFAULT_DECRYPT_CACHE_CAPACITY,
            message_page: DEFAULT_MESSAGE_PAGE,
        })
    }

    pub fn with_ws_url(mut self, ws_url: &str) -> Result<Self> {
        self.ws_url = Url::parse(ws_url)?;
        Ok(self)
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_key_retry(mut self, policy: RetryPolicy) -> Self {
        self.key_retry = policy;
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_decrypt_cache_capacity(mut self, capacity: usize) -> Self {
        self.decrypt_cache_capacity = capacity;
        self
    }

    pub fn with_message_page(mut self, limit: usize) -> Self {
        self.message_page = limit.max(1);
        self
    }
}

/// Parses a base URL and guarantees a trailing slash so relative joins keep the path.
fn parse_base_url(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw)?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn derive_ws_url(api_url: &Url) -> Result<Url> {
    let scheme = match api_url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => {
            return Err(Error::Serialization(format!(
                "unsupported API scheme: {other}"
            )))
        }
    };
    let mut ws = api_url.clone();
    ws.set_scheme(scheme)
        .map_err(|_| Error::Serialization("cannot derive WebSocket URL".to_string()))?;
    ws.set_path(WS_PATH);
    ws.set_query(None);
    ws.set_fragment(None);
    Ok(ws)
}
