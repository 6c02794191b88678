//! Session Gateway Transport
//!
//! Talks HTTP/JSON to a session gateway that owns the Telegram user-account
//! (MTProto) sessions. One gateway session per linked account.
//!
//! # Endpoints
//!
//! - `POST   /sessions`                               open with a session string
//! - `GET    /sessions/{sid}/me`                      authorization + profile
//! - `GET    /sessions/{sid}/updates?offset=&timeout=` long-poll new messages
//! - `GET    /sessions/{sid}/chats/{chat}/messages?limit=` history, newest first
//! - `GET    /sessions/{sid}/chats/{chat}/messages/{id}`   single message
//! - `POST   /sessions/{sid}/chats/{chat}/messages`   threaded reply
//! - `DELETE /sessions/{sid}`                         close
//!
//! 401/403 map to `Unauthorized`, 420/429 to `RateLimited` with the gateway's
//! `retry_after`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{stream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::traits::*;
use crate::model::{ChatId, Credential, MessageId};

/// Gateway connection settings
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Base URL, e.g. `http://127.0.0.1:8700`
    pub base_url: String,
    /// Bearer token (optional)
    pub token: Option<String>,
    /// Per-request timeout for ordinary calls
    pub request_timeout: Duration,
    /// Server-side hold time for update long-polls
    pub long_poll: Duration,
    /// Pause after a failed update poll
    pub poll_retry: Duration,
}

impl GatewayConfig {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
            request_timeout: Duration::from_secs(30),
            long_poll: Duration::from_secs(25),
            poll_retry: Duration::from_secs(5),
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }
}

#[derive(Debug, Serialize)]
struct OpenRequest<'a> {
    session_string: &'a str,
}

#[derive(Debug, Deserialize)]
struct OpenResponse {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct MeResponse {
    authorized: bool,
    #[serde(default)]
    user: Option<AccountProfile>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    id: MessageId,
    chat_id: ChatId,
    #[serde(default)]
    sender_id: Option<i64>,
    #[serde(default)]
    sender_is_bot: bool,
    #[serde(default)]
    text: Option<String>,
    #[serde(with = "chrono::serde::ts_seconds")]
    date: DateTime<Utc>,
    #[serde(default)]
    reply_to: Option<MessageId>,
}

impl From<WireMessage> for ChatMessage {
    fn from(m: WireMessage) -> Self {
        Self {
            id: m.id,
            chat_id: m.chat_id,
            sender_id: m.sender_id,
            sender_is_bot: m.sender_is_bot,
            text: m.text.unwrap_or_default(),
            date: m.date,
            reply_to: m.reply_to,
        }
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    messages: Vec<WireMessage>,
}

#[derive(Debug, Deserialize)]
struct UpdatesResponse {
    messages: Vec<WireMessage>,
    next_offset: i64,
}

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    text: &'a str,
    reply_to: MessageId,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    id: MessageId,
}

#[derive(Debug, Deserialize, Default)]
struct ErrorBody {
    #[serde(default)]
    retry_after: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

/// Shared HTTP plumbing
#[derive(Clone)]
struct GatewayClient {
    client: reqwest::Client,
    config: Arc<GatewayConfig>,
}

impl GatewayClient {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Send a request and decode the JSON body
    async fn call<T: for<'de> Deserialize<'de>>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, TransportError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| TransportError::Transient(e.to_string()))?;
        Self::decode(response).await
    }

    /// Like `call`, but a 404 is `Ok(None)`
    async fn call_optional<T: for<'de> Deserialize<'de>>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<Option<T>, TransportError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| TransportError::Transient(e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::decode(response).await.map(Some)
    }

    /// Map gateway status codes onto the transport error taxonomy
    async fn decode<T: for<'de> Deserialize<'de>>(response: reqwest::Response) -> Result<T, TransportError> {
        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| TransportError::Transient(format!("Bad gateway payload: {}", e)));
        }

        let header_retry = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let text = response.text().await.unwrap_or_default();
        let body: ErrorBody = serde_json::from_str(&text).unwrap_or_default();
        let detail = body.error.unwrap_or(text);

        match status.as_u16() {
            401 | 403 => Err(TransportError::Unauthorized(detail)),
            420 | 429 => {
                let secs = body.retry_after.or(header_retry).unwrap_or(5);
                Err(TransportError::RateLimited(Duration::from_secs(secs)))
            }
            410 => Err(TransportError::Closed),
            _ => Err(TransportError::Transient(format!("Gateway error {}: {}", status, detail))),
        }
    }
}

/// Connector backed by the session gateway
pub struct GatewayConnector {
    inner: GatewayClient,
}

impl GatewayConnector {
    pub fn new(config: GatewayConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout + config.long_poll)
            .build()
            .map_err(|e| TransportError::Transient(e.to_string()))?;
        Ok(Self {
            inner: GatewayClient {
                client,
                config: Arc::new(config),
            },
        })
    }
}

#[async_trait]
impl Connector for GatewayConnector {
    async fn connect(&self, credential: &Credential) -> Result<Arc<dyn Session>, TransportError> {
        let request = self
            .inner
            .client
            .post(self.inner.url("/sessions"))
            .timeout(self.inner.config.request_timeout)
            .json(&OpenRequest {
                session_string: credential.expose(),
            });
        let opened: OpenResponse = self.inner.call(request).await?;
        debug!("Gateway session {} opened", opened.session_id);

        Ok(Arc::new(GatewaySession {
            inner: self.inner.clone(),
            session_id: opened.session_id,
            closed: CancellationToken::new(),
        }))
    }
}

/// One gateway-held session
pub struct GatewaySession {
    inner: GatewayClient,
    session_id: String,
    closed: CancellationToken,
}

impl GatewaySession {
    fn path(&self, suffix: &str) -> String {
        self.inner.url(&format!("/sessions/{}{}", self.session_id, suffix))
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Session for GatewaySession {
    async fn authorized_profile(&self) -> Result<Option<AccountProfile>, TransportError> {
        self.ensure_open()?;
        let request = self
            .inner
            .client
            .get(self.path("/me"))
            .timeout(self.inner.config.request_timeout);
        let me: MeResponse = self.inner.call(request).await?;
        Ok(if me.authorized { me.user } else { None })
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<ChatMessage>, TransportError> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::channel(256);
        let inner = self.inner.clone();
        let url = self.path("/updates");
        let closed = self.closed.clone();
        let session_id = self.session_id.clone();

        tokio::spawn(async move {
            let mut offset: i64 = 0;
            let long_poll = inner.config.long_poll.as_secs().to_string();
            loop {
                let request = inner
                    .client
                    .get(&url)
                    .query(&[("offset", offset.to_string()), ("timeout", long_poll.clone())]);

                let result = tokio::select! {
                    _ = closed.cancelled() => break,
                    _ = tx.closed() => break,
                    r = inner.call::<UpdatesResponse>(request) => r,
                };

                match result {
                    Ok(updates) => {
                        offset = updates.next_offset;
                        for message in updates.messages {
                            if tx.send(message.into()).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(TransportError::Unauthorized(e)) => {
                        warn!("Gateway session {} lost authorization: {}", session_id, e);
                        break;
                    }
                    Err(TransportError::Closed) => break,
                    Err(TransportError::RateLimited(wait)) => {
                        warn!("Gateway session {} update poll rate limited, waiting {}s", session_id, wait.as_secs());
                        tokio::select! {
                            _ = closed.cancelled() => break,
                            _ = tokio::time::sleep(wait) => {}
                        }
                    }
                    Err(e) => {
                        warn!("Gateway session {} update poll failed: {}", session_id, e);
                        tokio::select! {
                            _ = closed.cancelled() => break,
                            _ = tokio::time::sleep(inner.config.poll_retry) => {}
                        }
                    }
                }
            }
            debug!("Gateway session {} update stream ended", session_id);
        });

        Ok(rx)
    }

    async fn get_message(&self, chat: ChatId, id: MessageId) -> Result<Option<ChatMessage>, TransportError> {
        self.ensure_open()?;
        let request = self
            .inner
            .client
            .get(self.path(&format!("/chats/{}/messages/{}", chat, id)))
            .timeout(self.inner.config.request_timeout);
        let message = self.inner.call_optional::<WireMessage>(request).await?;
        Ok(message.map(ChatMessage::from))
    }

    fn recent_messages(&self, chat: ChatId, limit: usize) -> MessageStream {
        if self.closed.is_cancelled() {
            return stream::once(async { Err(TransportError::Closed) }).boxed();
        }
        let inner = self.inner.clone();
        let url = self.path(&format!("/chats/{}/messages", chat));

        stream::once(async move {
            let request = inner
                .client
                .get(&url)
                .query(&[("limit", limit.to_string())])
                .timeout(inner.config.request_timeout);
            let page: MessagesResponse = inner.call(request).await?;
            Ok::<_, TransportError>(stream::iter(
                page.messages.into_iter().map(|m| Ok::<_, TransportError>(ChatMessage::from(m))),
            ))
        })
        .try_flatten()
        .boxed()
    }

    async fn send_reply(&self, chat: ChatId, text: &str, reply_to: MessageId) -> Result<MessageId, TransportError> {
        self.ensure_open()?;
        let request = self
            .inner
            .client
            .post(self.path(&format!("/chats/{}/messages", chat)))
            .timeout(self.inner.config.request_timeout)
            .json(&SendRequest { text, reply_to });
        let sent: SendResponse = self.inner.call(request).await?;
        Ok(sent.id)
    }

    async fn disconnect(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        let request = self
            .inner
            .client
            .delete(self.path(""))
            .timeout(self.inner.config.request_timeout);
        if let Err(e) = self.inner.authorize(request).send().await {
            warn!("Gateway session {} close failed: {}", self.session_id, e);
        } else {
            info!("Gateway session {} closed", self.session_id);
        }
    }
}
