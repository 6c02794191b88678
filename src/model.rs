//! Domain Model
//!
//! Owners, linked accounts, chat assignments and the key that identifies a
//! live connection. Ids are raw Telegram ids.

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// End user operating the automation
pub type OwnerId = i64;

/// Secondary (linked) Telegram account id
pub type AccountId = i64;

/// Target chat id
pub type ChatId = i64;

/// Message id, unique within a chat
pub type MessageId = i64;

/// Maximum persona length in characters
pub const MAX_PERSONA_CHARS: usize = 2000;

/// Identity of a live connection: at most one exists per key at any instant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey {
    pub owner: OwnerId,
    pub account: AccountId,
}

impl ConnectionKey {
    pub fn new(owner: OwnerId, account: AccountId) -> Self {
        Self { owner, account }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.account)
    }
}

/// Opaque session credential. Wiped on drop, never printed.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// A secondary account under automated control
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedAccount {
    pub account_id: AccountId,
    pub credential: Credential,
    pub display_name: String,
}

impl LinkedAccount {
    pub fn new(account_id: AccountId, credential: Credential, display_name: &str) -> Self {
        Self {
            account_id,
            credential,
            display_name: display_name.to_string(),
        }
    }
}

/// A target chat plus the persona that governs automated messages there
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatGroupAssignment {
    pub chat_id: ChatId,
    pub chat_name: String,
    pub persona: String,
}

impl ChatGroupAssignment {
    pub fn new(chat_id: ChatId, chat_name: &str, persona: &str) -> Self {
        Self {
            chat_id,
            chat_name: chat_name.to_string(),
            persona: persona.to_string(),
        }
    }

    /// Persona length check, counted in characters
    pub fn persona_within_limit(persona: &str) -> bool {
        persona.chars().count() <= MAX_PERSONA_CHARS
    }
}
