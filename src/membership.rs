//! Membership / Tier lookup
//!
//! An owner is privileged when they are a present member of a configured
//! Telegram group. Lookups go through the Bot API and are cached; any failure
//! falls back to the stricter tier.

use async_trait::async_trait;
use moka::future::Cache;
use std::collections::HashSet;
use std::time::Duration;
use teloxide::prelude::*;
use teloxide::types::{ChatId as TgChatId, UserId};
use tracing::{debug, warn};

use crate::model::OwnerId;
use crate::tier::Tier;

#[derive(Debug, Clone, thiserror::Error)]
pub enum MembershipError {
    #[error("Membership lookup failed: {0}")]
    Lookup(String),
}

#[async_trait]
pub trait Membership: Send + Sync {
    async fn is_privileged(&self, owner: OwnerId) -> Result<bool, MembershipError>;
}

/// Resolve an owner's tier; lookup failures count as non-privileged
pub async fn tier_for(membership: &dyn Membership, owner: OwnerId) -> Tier {
    match membership.is_privileged(owner).await {
        Ok(privileged) => Tier::from_privileged(privileged),
        Err(e) => {
            warn!("Tier lookup for owner {} failed, using standard tier: {}", owner, e);
            Tier::Standard
        }
    }
}

/// Fixed set of privileged owners
#[derive(Debug, Default, Clone)]
pub struct StaticMembership {
    privileged: HashSet<OwnerId>,
}

impl StaticMembership {
    pub fn new(privileged: impl IntoIterator<Item = OwnerId>) -> Self {
        Self {
            privileged: privileged.into_iter().collect(),
        }
    }

    /// Nobody is privileged
    pub fn none() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Membership for StaticMembership {
    async fn is_privileged(&self, owner: OwnerId) -> Result<bool, MembershipError> {
        Ok(self.privileged.contains(&owner))
    }
}

/// Group membership checked through the Bot API
pub struct GroupMembership {
    bot: Bot,
    group: TgChatId,
    always: HashSet<OwnerId>,
    cache: Cache<OwnerId, bool>,
}

impl GroupMembership {
    pub fn new(bot: Bot, group_id: i64) -> Self {
        Self {
            bot,
            group: TgChatId(group_id),
            always: HashSet::new(),
            cache: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(Duration::from_secs(300))
                .build(),
        }
    }

    /// Owners privileged regardless of group membership
    pub fn with_always(mut self, owners: impl IntoIterator<Item = OwnerId>) -> Self {
        self.always.extend(owners);
        self
    }
}

#[async_trait]
impl Membership for GroupMembership {
    async fn is_privileged(&self, owner: OwnerId) -> Result<bool, MembershipError> {
        if self.always.contains(&owner) {
            return Ok(true);
        }
        if let Some(cached) = self.cache.get(&owner).await {
            return Ok(cached);
        }

        let user = u64::try_from(owner)
            .map(UserId)
            .map_err(|_| MembershipError::Lookup(format!("invalid user id {}", owner)))?;

        let member = self
            .bot
            .get_chat_member(self.group, user)
            .await
            .map_err(|e| MembershipError::Lookup(e.to_string()))?;

        let present = member.kind.is_present();
        debug!("Owner {} group membership: {}", owner, present);
        self.cache.insert(owner, present).await;
        Ok(present)
    }
}
