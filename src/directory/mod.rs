//! Account and Chat Assignment Directories
//!
//! Durable owner -> linked account -> chat assignment mappings. The pool and
//! engines only read them (plus one write to correct a stale account id);
//! the admin surface writes them.
//!
//! Implementations:
//! - `JsonDirectory` (user_data.json + chat_groups.json)
//! - `MemoryDirectory` (tests, embedding)

pub mod json;
pub mod memory;

pub use json::JsonDirectory;
pub use memory::MemoryDirectory;

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::model::{AccountId, ChatGroupAssignment, ChatId, LinkedAccount, OwnerId};

/// Owner -> linked accounts
pub type AccountSnapshot = BTreeMap<OwnerId, Vec<LinkedAccount>>;

/// Owner -> account -> assignments
pub type AssignmentSnapshot = BTreeMap<OwnerId, BTreeMap<AccountId, Vec<ChatGroupAssignment>>>;

/// Directory errors
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An assignment or write references an account that is not linked
    #[error("Account {account} is not linked to owner {owner}")]
    MissingAccount { owner: OwnerId, account: AccountId },

    #[error("Account {0} is already linked")]
    AlreadyLinked(AccountId),

    #[error("Chat {0} is already assigned to this account")]
    AlreadyAssigned(ChatId),

    #[error("Quota reached: at most {limit} {what}")]
    QuotaExceeded { what: &'static str, limit: usize },

    #[error("Persona exceeds {0} characters")]
    PersonaTooLong(usize),
}

#[async_trait]
pub trait AccountDirectory: Send + Sync {
    /// Current owner -> accounts mapping
    async fn load_accounts(&self) -> Result<AccountSnapshot, DirectoryError>;

    /// Replace a stale account id with the canonical one. Re-reads before writing.
    /// Returns false when the stale entry no longer exists.
    async fn correct_account_id(
        &self,
        owner: OwnerId,
        stale: AccountId,
        canonical: AccountId,
    ) -> Result<bool, DirectoryError>;

    /// Add an account if the owner holds fewer than `max_accounts`
    async fn insert_account(
        &self,
        owner: OwnerId,
        account: LinkedAccount,
        max_accounts: usize,
    ) -> Result<(), DirectoryError>;

    /// Remove an account. Returns false if it was not linked.
    async fn remove_account(&self, owner: OwnerId, account: AccountId) -> Result<bool, DirectoryError>;
}

#[async_trait]
pub trait AssignmentDirectory: Send + Sync {
    /// Current owner -> account -> assignments mapping
    async fn load_assignments(&self) -> Result<AssignmentSnapshot, DirectoryError>;

    /// Assignments of one account (empty when none)
    async fn assignments_for(
        &self,
        owner: OwnerId,
        account: AccountId,
    ) -> Result<Vec<ChatGroupAssignment>, DirectoryError> {
        let snapshot = self.load_assignments().await?;
        Ok(snapshot
            .get(&owner)
            .and_then(|accounts| accounts.get(&account))
            .cloned()
            .unwrap_or_default())
    }

    /// Add an assignment if the account holds fewer than `max_assignments`
    async fn insert_assignment(
        &self,
        owner: OwnerId,
        account: AccountId,
        assignment: ChatGroupAssignment,
        max_assignments: usize,
    ) -> Result<(), DirectoryError>;

    /// Replace the persona of one assignment. Returns false if absent.
    async fn set_persona(
        &self,
        owner: OwnerId,
        account: AccountId,
        chat: ChatId,
        persona: &str,
    ) -> Result<bool, DirectoryError>;

    /// Remove one assignment. Returns false if absent.
    async fn remove_assignment(
        &self,
        owner: OwnerId,
        account: AccountId,
        chat: ChatId,
    ) -> Result<bool, DirectoryError>;

    /// Drop every assignment of an account. Returns false if it had none.
    async fn clear_account(&self, owner: OwnerId, account: AccountId) -> Result<bool, DirectoryError>;
}

/// Assignment entries whose account is not in the account snapshot
pub fn orphaned_assignments(
    accounts: &AccountSnapshot,
    assignments: &AssignmentSnapshot,
) -> Vec<(OwnerId, AccountId)> {
    assignments
        .iter()
        .flat_map(|(owner, by_account)| by_account.keys().map(move |account| (*owner, *account)))
        .filter(|(owner, account)| {
            !accounts
                .get(owner)
                .map(|linked| linked.iter().any(|a| a.account_id == *account))
                .unwrap_or(false)
        })
        .collect()
}
