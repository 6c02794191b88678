//! JSON file directory
//!
//! Two files in the data directory:
//!
//! ```text
//! user_data.json   {"<owner>": {"linked_accounts": [{"telegram_id", "session_string",
//!                                                    "first_name", "last_name", "phone"}]}}
//! chat_groups.json {"<owner>": {"linked_accounts": [{"telegram_id",
//!                    "chat_groups": [{"chat_group_id", "chat_group_name", "personality"}]}]}}
//! ```
//!
//! Every write re-reads the file first so edits made by another process in
//! between are not clobbered. Writes go through a temp file and a rename.
//! An account record that does not parse is skipped on load and written back
//! untouched, so one bad entry never hides the rest of the file.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::*;
use crate::model::Credential;

#[derive(Debug, Default, Serialize, Deserialize)]
struct OwnerAccounts {
    #[serde(default)]
    linked_accounts: Vec<StoredAccount>,
}

impl OwnerAccounts {
    fn records(&self) -> impl Iterator<Item = &AccountRecord> {
        self.linked_accounts.iter().filter_map(StoredAccount::record)
    }
}

/// One entry of `linked_accounts`, kept verbatim when it does not parse
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum StoredAccount {
    Record(AccountRecord),
    Unreadable(serde_json::Value),
}

impl StoredAccount {
    fn record(&self) -> Option<&AccountRecord> {
        match self {
            StoredAccount::Record(record) => Some(record),
            StoredAccount::Unreadable(_) => None,
        }
    }

    fn record_mut(&mut self) -> Option<&mut AccountRecord> {
        match self {
            StoredAccount::Record(record) => Some(record),
            StoredAccount::Unreadable(_) => None,
        }
    }

    fn is_account(&self, id: AccountId) -> bool {
        self.record().map(|r| r.telegram_id == id).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AccountRecord {
    telegram_id: AccountId,
    #[serde(default)]
    session_string: Option<Credential>,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    phone: Option<String>,
}

impl AccountRecord {
    fn from_account(account: &LinkedAccount) -> Self {
        let mut parts = account.display_name.splitn(2, ' ');
        Self {
            telegram_id: account.account_id,
            session_string: Some(account.credential.clone()),
            first_name: parts.next().filter(|s| !s.is_empty()).map(str::to_string),
            last_name: parts.next().map(|s| s.trim().to_string()).filter(|s| !s.is_empty()),
            phone: None,
        }
    }

    fn to_account(&self) -> LinkedAccount {
        let name = format!(
            "{} {}",
            self.first_name.as_deref().unwrap_or(""),
            self.last_name.as_deref().unwrap_or("")
        );
        let name = name.trim();
        LinkedAccount::new(
            self.telegram_id,
            self.session_string.clone().unwrap_or_else(|| Credential::new("")),
            if name.is_empty() { "Unknown Account" } else { name },
        )
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct OwnerGroups {
    #[serde(default)]
    linked_accounts: Vec<AccountGroups>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AccountGroups {
    telegram_id: AccountId,
    #[serde(default)]
    chat_groups: Vec<GroupRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GroupRecord {
    chat_group_id: ChatId,
    #[serde(default)]
    chat_group_name: String,
    #[serde(default)]
    personality: String,
}

impl From<&GroupRecord> for ChatGroupAssignment {
    fn from(r: &GroupRecord) -> Self {
        ChatGroupAssignment::new(r.chat_group_id, &r.chat_group_name, &r.personality)
    }
}

impl From<ChatGroupAssignment> for GroupRecord {
    fn from(a: ChatGroupAssignment) -> Self {
        Self {
            chat_group_id: a.chat_id,
            chat_group_name: a.chat_name,
            personality: a.persona,
        }
    }
}

type UserData = BTreeMap<OwnerId, OwnerAccounts>;
type ChatGroups = BTreeMap<OwnerId, OwnerGroups>;

/// Directory persisted as two JSON documents
pub struct JsonDirectory {
    user_data: PathBuf,
    chat_groups: PathBuf,
    /// Serializes read-modify-write cycles within this process
    write_lock: Mutex<()>,
}

impl JsonDirectory {
    pub fn new(user_data: impl Into<PathBuf>, chat_groups: impl Into<PathBuf>) -> Self {
        Self {
            user_data: user_data.into(),
            chat_groups: chat_groups.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Standard file names inside `dir`
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join("user_data.json"), dir.join("chat_groups.json"))
    }

    async fn read<T: DeserializeOwned + Default>(path: &Path) -> Result<T, DirectoryError> {
        match tokio::fs::read(path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(T::default()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write<T: Serialize>(path: &Path, value: &T) -> Result<(), DirectoryError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let data = serde_json::to_string_pretty(value)?;

        let temp_path = path.with_extension("tmp");
        tokio::fs::write(&temp_path, &data).await?;
        tokio::fs::rename(&temp_path, path).await?;
        debug!("Wrote {}", path.display());
        Ok(())
    }

    async fn read_user_data(&self) -> Result<UserData, DirectoryError> {
        Self::read(&self.user_data).await
    }

    async fn read_chat_groups(&self) -> Result<ChatGroups, DirectoryError> {
        Self::read(&self.chat_groups).await
    }

    /// Apply `f` to the freshly read group list of one account and write back
    /// when it reports a change
    async fn modify_groups<R>(
        &self,
        owner: OwnerId,
        account: AccountId,
        f: impl FnOnce(&mut Vec<GroupRecord>) -> Result<(R, bool), DirectoryError>,
    ) -> Result<R, DirectoryError> {
        let _guard = self.write_lock.lock().await;
        let mut groups = self.read_chat_groups().await?;
        let owner_groups = groups.entry(owner).or_default();
        let idx = match owner_groups
            .linked_accounts
            .iter()
            .position(|a| a.telegram_id == account)
        {
            Some(idx) => idx,
            None => {
                owner_groups.linked_accounts.push(AccountGroups {
                    telegram_id: account,
                    chat_groups: Vec::new(),
                });
                owner_groups.linked_accounts.len() - 1
            }
        };

        let (result, changed) = f(&mut owner_groups.linked_accounts[idx].chat_groups)?;
        if changed {
            Self::write(&self.chat_groups, &groups).await?;
        }
        Ok(result)
    }
}

#[async_trait]
impl AccountDirectory for JsonDirectory {
    async fn load_accounts(&self) -> Result<AccountSnapshot, DirectoryError> {
        let data = self.read_user_data().await?;
        Ok(data
            .into_iter()
            .map(|(owner, accounts)| {
                let unreadable = accounts.linked_accounts.len() - accounts.records().count();
                if unreadable > 0 {
                    warn!("Skipping {} unreadable account record(s) of owner {}", unreadable, owner);
                }
                let linked = accounts.records().map(AccountRecord::to_account).collect();
                (owner, linked)
            })
            .collect())
    }

    async fn correct_account_id(
        &self,
        owner: OwnerId,
        stale: AccountId,
        canonical: AccountId,
    ) -> Result<bool, DirectoryError> {
        let _guard = self.write_lock.lock().await;

        let mut data = self.read_user_data().await?;
        let Some(record) = data
            .get_mut(&owner)
            .and_then(|o| {
                o.linked_accounts
                    .iter_mut()
                    .filter_map(StoredAccount::record_mut)
                    .find(|a| a.telegram_id == stale)
            })
        else {
            return Ok(false);
        };
        record.telegram_id = canonical;
        Self::write(&self.user_data, &data).await?;

        let mut groups = self.read_chat_groups().await?;
        if let Some(owner_groups) = groups.get_mut(&owner) {
            let mut moved = false;
            for entry in owner_groups.linked_accounts.iter_mut().filter(|a| a.telegram_id == stale) {
                entry.telegram_id = canonical;
                moved = true;
            }
            if moved {
                Self::write(&self.chat_groups, &groups).await?;
            }
        }

        info!("Corrected account id {} -> {} for owner {}", stale, canonical, owner);
        Ok(true)
    }

    async fn insert_account(
        &self,
        owner: OwnerId,
        account: LinkedAccount,
        max_accounts: usize,
    ) -> Result<(), DirectoryError> {
        let _guard = self.write_lock.lock().await;
        let mut data = self.read_user_data().await?;
        let linked = &mut data.entry(owner).or_default().linked_accounts;
        if linked.iter().any(|a| a.is_account(account.account_id)) {
            return Err(DirectoryError::AlreadyLinked(account.account_id));
        }
        if linked.len() >= max_accounts {
            return Err(DirectoryError::QuotaExceeded {
                what: "linked accounts",
                limit: max_accounts,
            });
        }
        linked.push(StoredAccount::Record(AccountRecord::from_account(&account)));
        Self::write(&self.user_data, &data).await
    }

    async fn remove_account(&self, owner: OwnerId, account: AccountId) -> Result<bool, DirectoryError> {
        let _guard = self.write_lock.lock().await;
        let mut data = self.read_user_data().await?;
        let Some(owner_accounts) = data.get_mut(&owner) else {
            return Ok(false);
        };
        let before = owner_accounts.linked_accounts.len();
        owner_accounts.linked_accounts.retain(|a| !a.is_account(account));
        if owner_accounts.linked_accounts.len() == before {
            return Ok(false);
        }
        Self::write(&self.user_data, &data).await?;
        Ok(true)
    }
}

#[async_trait]
impl AssignmentDirectory for JsonDirectory {
    async fn load_assignments(&self) -> Result<AssignmentSnapshot, DirectoryError> {
        let groups = self.read_chat_groups().await?;
        Ok(groups
            .into_iter()
            .map(|(owner, owner_groups)| {
                let mut by_account: BTreeMap<AccountId, Vec<ChatGroupAssignment>> = BTreeMap::new();
                for entry in owner_groups.linked_accounts {
                    by_account
                        .entry(entry.telegram_id)
                        .or_default()
                        .extend(entry.chat_groups.iter().map(ChatGroupAssignment::from));
                }
                (owner, by_account)
            })
            .collect())
    }

    async fn insert_assignment(
        &self,
        owner: OwnerId,
        account: AccountId,
        assignment: ChatGroupAssignment,
        max_assignments: usize,
    ) -> Result<(), DirectoryError> {
        self.modify_groups(owner, account, |groups| {
            if groups.iter().any(|g| g.chat_group_id == assignment.chat_id) {
                return Err(DirectoryError::AlreadyAssigned(assignment.chat_id));
            }
            if groups.len() >= max_assignments {
                return Err(DirectoryError::QuotaExceeded {
                    what: "chat groups",
                    limit: max_assignments,
                });
            }
            groups.push(assignment.into());
            Ok(((), true))
        })
        .await
    }

    async fn set_persona(
        &self,
        owner: OwnerId,
        account: AccountId,
        chat: ChatId,
        persona: &str,
    ) -> Result<bool, DirectoryError> {
        self.modify_groups(owner, account, |groups| {
            match groups.iter_mut().find(|g| g.chat_group_id == chat) {
                Some(group) => {
                    group.personality = persona.to_string();
                    Ok((true, true))
                }
                None => Ok((false, false)),
            }
        })
        .await
    }

    async fn remove_assignment(
        &self,
        owner: OwnerId,
        account: AccountId,
        chat: ChatId,
    ) -> Result<bool, DirectoryError> {
        self.modify_groups(owner, account, |groups| {
            let before = groups.len();
            groups.retain(|g| g.chat_group_id != chat);
            let removed = groups.len() != before;
            Ok((removed, removed))
        })
        .await
    }

    async fn clear_account(&self, owner: OwnerId, account: AccountId) -> Result<bool, DirectoryError> {
        let _guard = self.write_lock.lock().await;
        let mut groups = self.read_chat_groups().await?;
        let Some(owner_groups) = groups.get_mut(&owner) else {
            return Ok(false);
        };
        let before = owner_groups.linked_accounts.len();
        owner_groups.linked_accounts.retain(|a| a.telegram_id != account);
        if owner_groups.linked_accounts.len() == before {
            return Ok(false);
        }
        Self::write(&self.chat_groups, &groups).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn directory() -> (TempDir, JsonDirectory) {
        let dir = TempDir::new().unwrap();
        let json = JsonDirectory::in_dir(dir.path());
        (dir, json)
    }

    #[tokio::test]
    async fn test_missing_files_are_empty() {
        let (_dir, json) = directory();
        assert!(json.load_accounts().await.unwrap().is_empty());
        assert!(json.load_assignments().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reads_existing_layout() {
        let (dir, json) = directory();
        std::fs::write(
            dir.path().join("user_data.json"),
            r#"{"7": {"linked_accounts": [
                {"telegram_id": 42, "session_string": "s3cret", "first_name": "Ann", "last_name": "Lee", "phone": "+1555"}
            ]}}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("chat_groups.json"),
            r#"{"7": {"linked_accounts": [
                {"telegram_id": 42, "chat_groups": [
                    {"chat_group_id": -100123, "chat_group_name": "Traders", "personality": "dry wit"}
                ]}
            ]}}"#,
        )
        .unwrap();

        let accounts = json.load_accounts().await.unwrap();
        let account = &accounts[&7][0];
        assert_eq!(account.account_id, 42);
        assert_eq!(account.credential.expose(), "s3cret");
        assert_eq!(account.display_name, "Ann Lee");

        let groups = json.assignments_for(7, 42).await.unwrap();
        assert_eq!(groups, vec![ChatGroupAssignment::new(-100123, "Traders", "dry wit")]);
    }

    #[tokio::test]
    async fn test_write_preserves_external_edits() {
        let (dir, json) = directory();
        json.insert_assignment(7, 42, ChatGroupAssignment::new(-1, "a", "p"), 8)
            .await
            .unwrap();

        // Another process adds a group for a different account
        let path = dir.path().join("chat_groups.json");
        let mut raw: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        raw["7"]["linked_accounts"]
            .as_array_mut()
            .unwrap()
            .push(serde_json::json!({"telegram_id": 43, "chat_groups": []}));
        std::fs::write(&path, raw.to_string()).unwrap();

        json.insert_assignment(7, 42, ChatGroupAssignment::new(-2, "b", "p"), 8)
            .await
            .unwrap();

        let snapshot = json.load_assignments().await.unwrap();
        assert_eq!(snapshot[&7][&42].len(), 2);
        assert!(snapshot[&7].contains_key(&43));
    }

    #[tokio::test]
    async fn test_correct_account_id_updates_both_files() {
        let (_dir, json) = directory();
        json.insert_account(7, LinkedAccount::new(0, Credential::new("s"), "Ann"), 2)
            .await
            .unwrap();
        json.insert_assignment(7, 0, ChatGroupAssignment::new(-1, "a", "p"), 8)
            .await
            .unwrap();

        assert!(json.correct_account_id(7, 0, 42).await.unwrap());
        assert_eq!(json.load_accounts().await.unwrap()[&7][0].account_id, 42);
        assert_eq!(json.assignments_for(7, 42).await.unwrap().len(), 1);
        assert!(json.assignments_for(7, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_account_and_clear_assignments() {
        let (_dir, json) = directory();
        json.insert_account(7, LinkedAccount::new(42, Credential::new("s"), "Ann"), 2)
            .await
            .unwrap();
        json.insert_assignment(7, 42, ChatGroupAssignment::new(-1, "a", "p"), 8)
            .await
            .unwrap();

        assert!(json.remove_account(7, 42).await.unwrap());
        assert!(json.clear_account(7, 42).await.unwrap());
        assert!(!json.remove_account(7, 42).await.unwrap());
        assert!(!json.clear_account(7, 42).await.unwrap());
        assert!(json.load_accounts().await.unwrap()[&7].is_empty());
    }

    #[tokio::test]
    async fn test_assignment_quota() {
        let (_dir, json) = directory();
        json.insert_assignment(7, 42, ChatGroupAssignment::new(-1, "a", "p"), 1)
            .await
            .unwrap();
        let err = json
            .insert_assignment(7, 42, ChatGroupAssignment::new(-2, "b", "p"), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, DirectoryError::QuotaExceeded { limit: 1, .. }));
    }

    #[tokio::test]
    async fn test_missing_credential_and_bad_record_do_not_hide_others() {
        let (dir, json) = directory();
        let path = dir.path().join("user_data.json");
        std::fs::write(
            &path,
            r#"{
                "500": {"linked_accounts": [
                    {"telegram_id": 42, "session_string": "session-a", "first_name": "Ann", "last_name": null}
                ]},
                "600": {"linked_accounts": [
                    {"telegram_id": 43, "session_string": null, "first_name": "Bob", "last_name": null},
                    {"telegram_id": 44, "first_name": "Cy"},
                    {"first_name": "no id"}
                ]}
            }"#,
        )
        .unwrap();

        let accounts = json.load_accounts().await.unwrap();
        assert_eq!(accounts[&500][0].credential.expose(), "session-a");
        let ids: Vec<AccountId> = accounts[&600].iter().map(|a| a.account_id).collect();
        assert_eq!(ids, vec![43, 44]);
        assert!(accounts[&600].iter().all(|a| a.credential.is_empty()));

        // A write keeps the record it could not read
        assert!(json.remove_account(600, 43).await.unwrap());
        let raw: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let kept = raw["600"]["linked_accounts"].as_array().unwrap();
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[1]["first_name"], "no id");
    }
}
