//! Shared Engine Plumbing
//!
//! What both the reply and autopost engines need from the outside world,
//! bundled once and shared behind an `Arc`:
//! - collaborators (generator, membership, activity tracker, clock)
//! - timing settings
//! - counters
//!
//! Also the per-connection binding handed to each engine task.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::activity::ActivityTracker;
use crate::clock::Clock;
use crate::config::EngineSettings;
use crate::directory::DirectoryError;
use crate::generator::{generate_reply, GenerationError, ResponseGenerator};
use crate::membership::{tier_for, Membership};
use crate::model::{ChatGroupAssignment, ChatId, ConnectionKey, MessageId, OwnerId};
use crate::tier::Tier;
use crate::transport::{Session, TransportError};

/// Umbrella error for engine work
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error("Cancelled")]
    Cancelled,
}

/// Engine counters
#[derive(Debug, Default)]
pub struct EngineStats {
    pub replies_sent: AtomicU64,
    pub autoposts_sent: AtomicU64,
    pub rejections: AtomicU64,
    pub rate_limit_waits: AtomicU64,
    pub failures: AtomicU64,
}

impl EngineStats {
    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            replies_sent: self.replies_sent.load(Ordering::Relaxed),
            autoposts_sent: self.autoposts_sent.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
            rate_limit_waits: self.rate_limit_waits.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of `EngineStats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStatsSnapshot {
    pub replies_sent: u64,
    pub autoposts_sent: u64,
    pub rejections: u64,
    pub rate_limit_waits: u64,
    pub failures: u64,
}

/// Collaborators and settings shared by both engines and the pool
pub struct EngineContext {
    pub generator: Arc<dyn ResponseGenerator>,
    pub membership: Arc<dyn Membership>,
    pub tracker: Arc<ActivityTracker>,
    pub clock: Arc<dyn Clock>,
    pub settings: EngineSettings,
    pub stats: Arc<EngineStats>,
}

impl EngineContext {
    pub fn new(
        generator: Arc<dyn ResponseGenerator>,
        membership: Arc<dyn Membership>,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
    ) -> Self {
        let tracker = Arc::new(ActivityTracker::new(
            settings.activity_window,
            settings.dedup_retention,
        ));
        Self {
            generator,
            membership,
            tracker,
            clock,
            settings,
            stats: Arc::new(EngineStats::default()),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub async fn tier(&self, owner: OwnerId) -> Tier {
        tier_for(self.membership.as_ref(), owner).await
    }

    /// Generate a sanitized reply under the configured timeout
    pub async fn generate(&self, persona: &str, stimulus: &str) -> Result<String, GenerationError> {
        generate_reply(
            self.generator.as_ref(),
            self.settings.generator_timeout,
            persona,
            stimulus,
        )
        .await
    }

    /// Send a threaded reply. A rate-limit answer is waited out once and the
    /// send retried exactly once; every other failure is returned as is.
    pub async fn send_with_retry(
        &self,
        binding: &BoundSession,
        chat: ChatId,
        text: &str,
        reply_to: MessageId,
        cancel: &CancellationToken,
    ) -> Result<MessageId, EngineError> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        match binding.session.send_reply(chat, text, reply_to).await {
            Ok(id) => Ok(id),
            Err(TransportError::RateLimited(wait)) => {
                EngineStats::bump(&self.stats.rate_limit_waits);
                warn!(
                    "[{}] Rate limited in chat {}, waiting {} seconds before retry",
                    binding.key,
                    chat,
                    wait.as_secs()
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                    _ = tokio::time::sleep(wait) => {}
                }
                Ok(binding.session.send_reply(chat, text, reply_to).await?)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// A live session as seen by one connection's engine tasks
#[derive(Clone)]
pub struct BoundSession {
    pub key: ConnectionKey,
    /// Events dated before this are backlog
    pub started_at: DateTime<Utc>,
    pub session: Arc<dyn Session>,
    assignments: watch::Receiver<Vec<ChatGroupAssignment>>,
}

impl BoundSession {
    pub fn new(
        key: ConnectionKey,
        started_at: DateTime<Utc>,
        session: Arc<dyn Session>,
        assignments: watch::Receiver<Vec<ChatGroupAssignment>>,
    ) -> Self {
        Self {
            key,
            started_at,
            session,
            assignments,
        }
    }

    /// Current assignment for `chat`, if the account is assigned there
    pub fn assignment(&self, chat: ChatId) -> Option<ChatGroupAssignment> {
        self.assignments
            .borrow()
            .iter()
            .find(|a| a.chat_id == chat)
            .cloned()
    }

    /// Snapshot of every current assignment
    pub fn assignments(&self) -> Vec<ChatGroupAssignment> {
        self.assignments.borrow().clone()
    }
}
