//! Transport Trait Definitions
//!
//! Interfaces for user-account sessions: connect with a credential, verify
//! authorization, stream new messages, iterate history, send threaded replies.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::model::{AccountId, ChatId, Credential, MessageId};

/// Error types for transport operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Credential rejected; the account stays disconnected until the directory changes
    #[error("Authentication failed: {0}")]
    Unauthorized(String),

    /// Platform flood control with a mandated wait
    #[error("Rate limited: retry after {} seconds", .0.as_secs())]
    RateLimited(Duration),

    /// Connection drop or other retryable failure
    #[error("Transport error: {0}")]
    Transient(String),

    #[error("Session closed")]
    Closed,
}

/// The account a session is authenticated as
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountProfile {
    pub id: AccountId,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default, rename = "bot")]
    pub is_bot: bool,
}

impl AccountProfile {
    pub fn display_name(&self) -> String {
        let name = format!(
            "{} {}",
            self.first_name.as_deref().unwrap_or(""),
            self.last_name.as_deref().unwrap_or("")
        );
        let name = name.trim();
        if name.is_empty() {
            "Unknown Account".to_string()
        } else {
            name.to_string()
        }
    }
}

/// A chat message as seen by a linked account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: MessageId,
    pub chat_id: ChatId,
    /// None for anonymous/channel posts
    pub sender_id: Option<AccountId>,
    pub sender_is_bot: bool,
    pub text: String,
    pub date: DateTime<Utc>,
    /// Message this one replies to
    pub reply_to: Option<MessageId>,
}

impl ChatMessage {
    pub fn has_text(&self) -> bool {
        !self.text.trim().is_empty()
    }

    pub fn is_from(&self, account: AccountId) -> bool {
        self.sender_id == Some(account)
    }
}

/// Recent history, most recent first
pub type MessageStream = BoxStream<'static, Result<ChatMessage, TransportError>>;

/// Opens sessions for linked accounts
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open and authenticate a session with the stored credential
    async fn connect(&self, credential: &Credential) -> Result<Arc<dyn Session>, TransportError>;
}

/// One authenticated user-account session
#[async_trait]
pub trait Session: Send + Sync {
    /// Profile of the authorized account, None if the session is not authorized
    async fn authorized_profile(&self) -> Result<Option<AccountProfile>, TransportError>;

    /// New incoming messages. The receiver ends when the session drops.
    async fn subscribe(&self) -> Result<mpsc::Receiver<ChatMessage>, TransportError>;

    /// Fetch a single message by id
    async fn get_message(&self, chat: ChatId, id: MessageId) -> Result<Option<ChatMessage>, TransportError>;

    /// Iterate up to `limit` recent messages, most recent first
    fn recent_messages(&self, chat: ChatId, limit: usize) -> MessageStream;

    /// Send `text` as a reply to `reply_to`
    async fn send_reply(&self, chat: ChatId, text: &str, reply_to: MessageId) -> Result<MessageId, TransportError>;

    /// Close the session
    async fn disconnect(&self);
}
