//! Typed client for the relay's REST surface.
//!
//! Every request carries the bearer token supplied by an [`AuthGateway`].
//! A 401 is reported back to the gateway before surfacing as
//! [`Error::Unauthorized`], so the embedding app decides what logout means.

use crate::{
    Conversation, ConversationResponse, ConversationSummary, ConversationsResponse,
    CreateConversationRequest, Error, KeysResponse, Message, MessagesResponse,
    PublishKeysRequest, PublishedKeyBundle, ReadReceiptRequest, Result, SendMessageRequest,
    SendMessageResponse, UnreadCountResponse,
};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::{Arc, Mutex};
use url::Url;

type UnauthorizedCallback = Box<dyn Fn() + Send + Sync>;

/// Supplies credentials to the network layer and hears about rejected ones.
pub trait AuthGateway: Send + Sync {
    fn bearer_token(&self) -> Option<String>;
    fn on_unauthorized(&self);
}

/// Holds a token and an optional callback registered by the embedding app.
pub struct CallbackAuthGateway {
    token: String,
    callback: Mutex<Option<UnauthorizedCallback>>,
}

impl CallbackAuthGateway {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            callback: Mutex::new(None),
        }
    }

    pub fn set_on_unauthorized(&self, callback: impl Fn() + Send + Sync + 'static) {
        if let Ok(mut guard) = self.callback.lock() {
            *guard = Some(Box::new(callback));
        }
    }

    pub fn clear_on_unauthorized(&self) {
        if let Ok(mut guard) = self.callback.lock() {
            *guard = None;
        }
    }
}

impl AuthGateway for CallbackAuthGateway {
    fn bearer_token(&self) -> Option<String> {
        Some(self.token.clone())
    }

    fn on_unauthorized(&self) {
        if let Ok(guard) = self.callback.lock() {
            if let Some(cb) = guard.as_ref() {
                cb();
            }
        }
    }
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base: Url,
    auth: Arc<dyn AuthGateway>,
}

impl ApiClient {
    pub fn new(base: Url, auth: Arc<dyn AuthGateway>) -> Result<Self> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self { http, base, auth })
    }

    pub fn auth(&self) -> &Arc<dyn AuthGateway> {
        &self.auth
    }

    /// `GET /keys`: this user's published bundle, if any.
    pub async fn get_own_keys(&self) -> Result<Option<PublishedKeyBundle>> {
        let resp = self.request(Method::GET, "keys")?.send().await?;
        let body: KeysResponse = self.json(resp).await?;
        Ok(body.keys)
    }

    /// `POST /keys`.
    pub async fn publish_keys(&self, bundle: &PublishKeysRequest) -> Result<()> {
        let resp = self.request(Method::POST, "keys")?.json(bundle).send().await?;
        self.check(resp).await?;
        Ok(())
    }

    /// `GET /keys/{peer}`. `Ok(None)` when the peer has not published yet.
    pub async fn get_peer_key(&self, peer_id: &str) -> Result<Option<PublishedKeyBundle>> {
        let path = format!("keys/{}", urlencoding::encode(peer_id));
        let resp = self.request(Method::GET, &path)?.send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let mut bundle: PublishedKeyBundle = self.json(resp).await?;
        if bundle.user_id.is_empty() {
            bundle.user_id = peer_id.to_string();
        }
        Ok(Some(bundle))
    }

    /// `GET /conversations/{id}/messages`, oldest first.
    pub async fn list_messages(
        &self,
        conversation_id: &str,
        limit: Option<usize>,
        before: Option<&str>,
    ) -> Result<Vec<Message>> {
        let path = format!("conversations/{}/messages", urlencoding::encode(conversation_id));
        let mut req = self.request(Method::GET, &path)?;
        if let Some(limit) = limit {
            req = req.query(&[("limit", limit.to_string())]);
        }
        if let Some(before) = before {
            req = req.query(&[("before", before)]);
        }
        let body: MessagesResponse = self.json(req.send().await?).await?;
        Ok(body.messages)
    }

    /// `POST /conversations/{id}/messages`.
    pub async fn send_message(
        &self,
        conversation_id: &str,
        body: &SendMessageRequest,
    ) -> Result<Message> {
        let path = format!("conversations/{}/messages", urlencoding::encode(conversation_id));
        let resp = self.request(Method::POST, &path)?.json(body).send().await?;
        let created: SendMessageResponse = self.json(resp).await?;
        Ok(created.message)
    }

    /// `POST /conversations/{id}/read`.
    pub async fn mark_read(&self, conversation_id: &str, message_ids: &[String]) -> Result<()> {
        let path = format!("conversations/{}/read", urlencoding::encode(conversation_id));
        let body = ReadReceiptRequest {
            message_ids: message_ids.to_vec(),
        };
        let resp = self.request(Method::POST, &path)?.json(&body).send().await?;
        self.check(resp).await?;
        Ok(())
    }

    /// `POST /conversations`: get or create the conversation with `participant_id`.
    pub async fn create_conversation(&self, participant_id: &str) -> Result<Conversation> {
        let body = CreateConversationRequest {
            participant_id: participant_id.to_string(),
        };
        let resp = self
            .request(Method::POST, "conversations")?
            .json(&body)
            .send()
            .await?;
        let created: ConversationResponse = self.json(resp).await?;
        Ok(created.conversation)
    }

    pub async fn list_conversations(&self) -> Result<Vec<ConversationSummary>> {
        let resp = self.request(Method::GET, "conversations")?.send().await?;
        let body: ConversationsResponse = self.json(resp).await?;
        Ok(body.conversations)
    }

    pub async fn unread_count(&self) -> Result<u64> {
        let resp = self.request(Method::GET, "unread-count")?.send().await?;
        let body: UnreadCountResponse = self.json(resp).await?;
        Ok(body.count)
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let url = self.base.join(path)?;
        let mut req = self.http.request(method, url);
        if let Some(token) = self.auth.bearer_token() {
            req = req.bearer_auth(token);
        }
        Ok(req)
    }

    async fn check(&self, resp: Response) -> Result<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        if status == StatusCode::UNAUTHORIZED {
            tracing::warn!(path = resp.url().path(), "request rejected as unauthorized");
            self.auth.on_unauthorized();
            return Err(Error::Unauthorized);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(Error::Http {
            status: status.as_u16(),
            body,
        })
    }

    async fn json<T: DeserializeOwned>(&self, resp: Response) -> Result<T> {
        let resp = self.check(resp).await?;
        let bytes = resp.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| Error::Serialization(e.to_string()))
    }
}
