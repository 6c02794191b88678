//! Account Administration
//!
//! Directory writes behind the admin surface: linking and unlinking accounts
//! and managing their chat assignments. Quotas come from the owner's tier and
//! are enforced here, at creation time only. Every successful change nudges
//! the connection pool so it reconciles without waiting for the next poll.

use std::sync::Arc;
use tracing::info;

use crate::directory::{AccountDirectory, AssignmentDirectory, DirectoryError};
use crate::membership::{tier_for, Membership};
use crate::model::{AccountId, ChatGroupAssignment, ChatId, LinkedAccount, OwnerId, MAX_PERSONA_CHARS};
use crate::pool::PoolHandle;

/// Result of an unlink request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlinkOutcome {
    Unlinked,
    NotLinked,
}

pub struct AccountManager {
    accounts: Arc<dyn AccountDirectory>,
    assignments: Arc<dyn AssignmentDirectory>,
    membership: Arc<dyn Membership>,
    pool: Option<PoolHandle>,
}

impl AccountManager {
    pub fn new(
        accounts: Arc<dyn AccountDirectory>,
        assignments: Arc<dyn AssignmentDirectory>,
        membership: Arc<dyn Membership>,
    ) -> Self {
        Self {
            accounts,
            assignments,
            membership,
            pool: None,
        }
    }

    /// Notify this pool after every change
    pub fn with_pool(mut self, pool: PoolHandle) -> Self {
        self.pool = Some(pool);
        self
    }

    fn changed(&self) {
        if let Some(pool) = &self.pool {
            pool.notify_changed();
        }
    }

    async fn ensure_linked(&self, owner: OwnerId, account: AccountId) -> Result<(), DirectoryError> {
        let accounts = self.accounts.load_accounts().await?;
        let linked = accounts
            .get(&owner)
            .map(|list| list.iter().any(|a| a.account_id == account))
            .unwrap_or(false);
        if linked {
            Ok(())
        } else {
            Err(DirectoryError::MissingAccount { owner, account })
        }
    }

    fn check_persona(persona: &str) -> Result<(), DirectoryError> {
        if ChatGroupAssignment::persona_within_limit(persona) {
            Ok(())
        } else {
            Err(DirectoryError::PersonaTooLong(MAX_PERSONA_CHARS))
        }
    }

    /// Store a freshly authenticated account, within the owner's account quota
    pub async fn link_account(&self, owner: OwnerId, account: LinkedAccount) -> Result<(), DirectoryError> {
        let tier = tier_for(self.membership.as_ref(), owner).await;
        let account_id = account.account_id;
        self.accounts
            .insert_account(owner, account, tier.account_quota())
            .await?;
        info!("Owner {} linked account {} ({} tier)", owner, account_id, tier.as_str());
        self.changed();
        Ok(())
    }

    /// Assign a chat to a linked account, within the assignment quota
    pub async fn add_assignment(
        &self,
        owner: OwnerId,
        account: AccountId,
        assignment: ChatGroupAssignment,
    ) -> Result<(), DirectoryError> {
        Self::check_persona(&assignment.persona)?;
        self.ensure_linked(owner, account).await?;

        let tier = tier_for(self.membership.as_ref(), owner).await;
        let chat = assignment.chat_id;
        self.assignments
            .insert_assignment(owner, account, assignment, tier.assignment_quota())
            .await?;
        info!("Owner {} assigned chat {} to account {}", owner, chat, account);
        self.changed();
        Ok(())
    }

    /// Replace the persona of an existing assignment. Returns false if absent.
    pub async fn set_persona(
        &self,
        owner: OwnerId,
        account: AccountId,
        chat: ChatId,
        persona: &str,
    ) -> Result<bool, DirectoryError> {
        Self::check_persona(persona)?;
        let updated = self.assignments.set_persona(owner, account, chat, persona).await?;
        if updated {
            info!("Owner {} updated persona for account {} in chat {}", owner, account, chat);
            self.changed();
        }
        Ok(updated)
    }

    /// Remove one assignment. Returns false if absent.
    pub async fn remove_assignment(
        &self,
        owner: OwnerId,
        account: AccountId,
        chat: ChatId,
    ) -> Result<bool, DirectoryError> {
        let removed = self.assignments.remove_assignment(owner, account, chat).await?;
        if removed {
            info!("Owner {} removed chat {} from account {}", owner, chat, account);
            self.changed();
        }
        Ok(removed)
    }

    /// Remove an account and its assignments. The pool closes the connection,
    /// cancels its tasks and drops its activity on the next pass.
    pub async fn unlink_account(&self, owner: OwnerId, account: AccountId) -> Result<UnlinkOutcome, DirectoryError> {
        let removed = self.accounts.remove_account(owner, account).await?;
        let cleared = self.assignments.clear_account(owner, account).await?;
        if !removed && !cleared {
            return Ok(UnlinkOutcome::NotLinked);
        }
        info!("Owner {} unlinked account {}", owner, account);
        self.changed();
        Ok(if removed {
            UnlinkOutcome::Unlinked
        } else {
            UnlinkOutcome::NotLinked
        })
    }

    /// Linked accounts of one owner
    pub async fn list_accounts(&self, owner: OwnerId) -> Result<Vec<LinkedAccount>, DirectoryError> {
        Ok(self
            .accounts
            .load_accounts()
            .await?
            .remove(&owner)
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MemoryDirectory;
    use crate::membership::StaticMembership;
    use crate::model::Credential;

    const PRIVILEGED: OwnerId = 1;
    const STANDARD: OwnerId = 2;

    fn manager() -> (Arc<MemoryDirectory>, AccountManager) {
        let dir = Arc::new(MemoryDirectory::new());
        let manager = AccountManager::new(
            dir.clone(),
            dir.clone(),
            Arc::new(StaticMembership::new([PRIVILEGED])),
        );
        (dir, manager)
    }

    fn account(id: AccountId) -> LinkedAccount {
        LinkedAccount::new(id, Credential::new(format!("cred-{}", id)), "Ann")
    }

    #[tokio::test]
    async fn test_account_quota_by_tier() {
        let (_dir, m) = manager();
        m.link_account(PRIVILEGED, account(10)).await.unwrap();
        m.link_account(PRIVILEGED, account(11)).await.unwrap();
        assert!(matches!(
            m.link_account(PRIVILEGED, account(12)).await,
            Err(DirectoryError::QuotaExceeded { limit: 2, .. })
        ));

        m.link_account(STANDARD, account(20)).await.unwrap();
        assert!(matches!(
            m.link_account(STANDARD, account(21)).await,
            Err(DirectoryError::QuotaExceeded { limit: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_assignment_requires_linked_account() {
        let (_dir, m) = manager();
        let result = m
            .add_assignment(STANDARD, 99, ChatGroupAssignment::new(-1, "g", "p"))
            .await;
        assert!(matches!(result, Err(DirectoryError::MissingAccount { account: 99, .. })));
    }

    #[tokio::test]
    async fn test_assignment_quota_and_persona_limit() {
        let (_dir, m) = manager();
        m.link_account(STANDARD, account(20)).await.unwrap();

        let long = "x".repeat(MAX_PERSONA_CHARS + 1);
        assert!(matches!(
            m.add_assignment(STANDARD, 20, ChatGroupAssignment::new(-1, "g", &long)).await,
            Err(DirectoryError::PersonaTooLong(_))
        ));

        m.add_assignment(STANDARD, 20, ChatGroupAssignment::new(-1, "g", "terse"))
            .await
            .unwrap();
        assert!(matches!(
            m.add_assignment(STANDARD, 20, ChatGroupAssignment::new(-2, "h", "terse")).await,
            Err(DirectoryError::QuotaExceeded { limit: 1, .. })
        ));
        assert!(m.set_persona(STANDARD, 20, -1, "chatty").await.unwrap());
        assert!(m.set_persona(STANDARD, 20, -1, &long).await.is_err());
    }

    #[tokio::test]
    async fn test_unlink_cascades_and_is_idempotent() {
        let (dir, m) = manager();
        m.link_account(PRIVILEGED, account(10)).await.unwrap();
        m.add_assignment(PRIVILEGED, 10, ChatGroupAssignment::new(-1, "g", "p"))
            .await
            .unwrap();

        assert_eq!(m.unlink_account(PRIVILEGED, 10).await.unwrap(), UnlinkOutcome::Unlinked);
        assert!(dir.assignments_for(PRIVILEGED, 10).await.unwrap().is_empty());
        assert!(m.list_accounts(PRIVILEGED).await.unwrap().is_empty());

        assert_eq!(m.unlink_account(PRIVILEGED, 10).await.unwrap(), UnlinkOutcome::NotLinked);
    }
}
