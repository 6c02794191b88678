//! In-memory directory

use async_trait::async_trait;
use parking_lot::Mutex;

use super::*;

#[derive(Default)]
struct State {
    accounts: AccountSnapshot,
    assignments: AssignmentSnapshot,
}

/// Both directories held in process memory
#[derive(Default)]
pub struct MemoryDirectory {
    state: Mutex<State>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an account without quota checks
    pub fn seed_account(&self, owner: OwnerId, account: LinkedAccount) {
        self.state.lock().accounts.entry(owner).or_default().push(account);
    }

    /// Seed an assignment without quota checks
    pub fn seed_assignment(&self, owner: OwnerId, account: AccountId, assignment: ChatGroupAssignment) {
        self.state
            .lock()
            .assignments
            .entry(owner)
            .or_default()
            .entry(account)
            .or_default()
            .push(assignment);
    }
}

#[async_trait]
impl AccountDirectory for MemoryDirectory {
    async fn load_accounts(&self) -> Result<AccountSnapshot, DirectoryError> {
        Ok(self.state.lock().accounts.clone())
    }

    async fn correct_account_id(
        &self,
        owner: OwnerId,
        stale: AccountId,
        canonical: AccountId,
    ) -> Result<bool, DirectoryError> {
        let mut state = self.state.lock();
        let Some(account) = state
            .accounts
            .get_mut(&owner)
            .and_then(|accounts| accounts.iter_mut().find(|a| a.account_id == stale))
        else {
            return Ok(false);
        };
        account.account_id = canonical;

        if let Some(by_account) = state.assignments.get_mut(&owner) {
            if let Some(moved) = by_account.remove(&stale) {
                by_account.entry(canonical).or_default().extend(moved);
            }
        }
        Ok(true)
    }

    async fn insert_account(
        &self,
        owner: OwnerId,
        account: LinkedAccount,
        max_accounts: usize,
    ) -> Result<(), DirectoryError> {
        let mut state = self.state.lock();
        let linked = state.accounts.entry(owner).or_default();
        if linked.iter().any(|a| a.account_id == account.account_id) {
            return Err(DirectoryError::AlreadyLinked(account.account_id));
        }
        if linked.len() >= max_accounts {
            return Err(DirectoryError::QuotaExceeded {
                what: "linked accounts",
                limit: max_accounts,
            });
        }
        linked.push(account);
        Ok(())
    }

    async fn remove_account(&self, owner: OwnerId, account: AccountId) -> Result<bool, DirectoryError> {
        let mut state = self.state.lock();
        let Some(linked) = state.accounts.get_mut(&owner) else {
            return Ok(false);
        };
        let before = linked.len();
        linked.retain(|a| a.account_id != account);
        Ok(linked.len() != before)
    }
}

#[async_trait]
impl AssignmentDirectory for MemoryDirectory {
    async fn load_assignments(&self) -> Result<AssignmentSnapshot, DirectoryError> {
        Ok(self.state.lock().assignments.clone())
    }

    async fn insert_assignment(
        &self,
        owner: OwnerId,
        account: AccountId,
        assignment: ChatGroupAssignment,
        max_assignments: usize,
    ) -> Result<(), DirectoryError> {
        let mut state = self.state.lock();
        let existing = state
            .assignments
            .entry(owner)
            .or_default()
            .entry(account)
            .or_default();
        if existing.iter().any(|a| a.chat_id == assignment.chat_id) {
            return Err(DirectoryError::AlreadyAssigned(assignment.chat_id));
        }
        if existing.len() >= max_assignments {
            return Err(DirectoryError::QuotaExceeded {
                what: "chat groups",
                limit: max_assignments,
            });
        }
        existing.push(assignment);
        Ok(())
    }

    async fn set_persona(
        &self,
        owner: OwnerId,
        account: AccountId,
        chat: ChatId,
        persona: &str,
    ) -> Result<bool, DirectoryError> {
        let mut state = self.state.lock();
        let found = state
            .assignments
            .get_mut(&owner)
            .and_then(|by_account| by_account.get_mut(&account))
            .and_then(|list| list.iter_mut().find(|a| a.chat_id == chat));
        match found {
            Some(assignment) => {
                assignment.persona = persona.to_string();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn remove_assignment(
        &self,
        owner: OwnerId,
        account: AccountId,
        chat: ChatId,
    ) -> Result<bool, DirectoryError> {
        let mut state = self.state.lock();
        let Some(list) = state
            .assignments
            .get_mut(&owner)
            .and_then(|by_account| by_account.get_mut(&account))
        else {
            return Ok(false);
        };
        let before = list.len();
        list.retain(|a| a.chat_id != chat);
        Ok(list.len() != before)
    }

    async fn clear_account(&self, owner: OwnerId, account: AccountId) -> Result<bool, DirectoryError> {
        let mut state = self.state.lock();
        Ok(state
            .assignments
            .get_mut(&owner)
            .and_then(|by_account| by_account.remove(&account))
            .map(|removed| !removed.is_empty())
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Credential;

    #[tokio::test]
    async fn test_correct_account_id_moves_assignments() {
        let dir = MemoryDirectory::new();
        dir.seed_account(1, LinkedAccount::new(0, Credential::new("c"), "A"));
        dir.seed_assignment(1, 0, ChatGroupAssignment::new(-5, "g", "terse"));

        assert!(dir.correct_account_id(1, 0, 42).await.unwrap());
        assert!(!dir.correct_account_id(1, 0, 42).await.unwrap());

        let accounts = dir.load_accounts().await.unwrap();
        assert_eq!(accounts[&1][0].account_id, 42);
        assert_eq!(dir.assignments_for(1, 42).await.unwrap().len(), 1);
        assert!(dir.assignments_for(1, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_account_quota() {
        let dir = MemoryDirectory::new();
        dir.insert_account(1, LinkedAccount::new(10, Credential::new("a"), "A"), 1)
            .await
            .unwrap();
        let err = dir
            .insert_account(1, LinkedAccount::new(11, Credential::new("b"), "B"), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, DirectoryError::QuotaExceeded { limit: 1, .. }));
    }

    #[tokio::test]
    async fn test_assignment_lifecycle() {
        let dir = MemoryDirectory::new();
        dir.insert_assignment(1, 10, ChatGroupAssignment::new(-5, "g", "p"), 8)
            .await
            .unwrap();
        assert!(matches!(
            dir.insert_assignment(1, 10, ChatGroupAssignment::new(-5, "g", "p"), 8).await,
            Err(DirectoryError::AlreadyAssigned(-5))
        ));
        assert!(dir.set_persona(1, 10, -5, "chatty").await.unwrap());
        assert_eq!(dir.assignments_for(1, 10).await.unwrap()[0].persona, "chatty");
        assert!(dir.remove_assignment(1, 10, -5).await.unwrap());
        assert!(!dir.remove_assignment(1, 10, -5).await.unwrap());
    }
}
