//! Activity Tracking for Automated Sends
//!
//! Bounds automated volume per (connection, chat) and remembers which source
//! messages were already acted on.
//!
//! Features:
//! - Sliding window send counter (7h by default)
//! - Reply and autopost dedup sets, tracked independently
//! - In-flight reply reservations so a redelivered event cannot double-send
//! - Everything lives in process memory and resets on restart

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::model::{ChatId, ConnectionKey, MessageId};

/// Per (connection, chat) record
#[derive(Debug, Default)]
struct ActivityWindow {
    /// Send timestamps inside the window, oldest first
    sends: VecDeque<DateTime<Utc>>,
    /// Source messages already replied to -> when
    replied: HashMap<MessageId, DateTime<Utc>>,
    /// Source messages already autoposted under -> when
    autoposted: HashMap<MessageId, DateTime<Utc>>,
    /// Replies accepted but not yet sent
    in_flight: HashSet<MessageId>,
}

impl ActivityWindow {
    /// Drop send timestamps and dedup entries that aged out
    fn prune(&mut self, now: DateTime<Utc>, window: chrono::Duration, retention: chrono::Duration) {
        while let Some(&oldest) = self.sends.front() {
            if now - oldest < window {
                break;
            }
            self.sends.pop_front();
        }
        self.replied.retain(|_, &mut at| now - at < retention);
        self.autoposted.retain(|_, &mut at| now - at < retention);
    }

    fn committed_and_pending(&self) -> usize {
        self.sends.len() + self.in_flight.len()
    }

    fn is_idle(&self) -> bool {
        self.sends.is_empty()
            && self.replied.is_empty()
            && self.autoposted.is_empty()
            && self.in_flight.is_empty()
    }
}

/// Why a reply reservation was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveDenied {
    /// Message already replied to, or a reply for it is in flight
    AlreadyHandled,
    /// Recorded plus in-flight sends reached the quota
    QuotaExhausted,
}

/// Tracker statistics
#[derive(Debug, Clone, Default)]
pub struct ActivityStats {
    pub windows: usize,
    pub sends_in_window: usize,
    pub in_flight: usize,
}

/// Sliding-window activity tracker shared by both engines
pub struct ActivityTracker {
    window: chrono::Duration,
    retention: chrono::Duration,
    windows: Mutex<HashMap<(ConnectionKey, ChatId), ActivityWindow>>,
}

impl ActivityTracker {
    pub fn new(window: Duration, dedup_retention: Duration) -> Self {
        Self {
            window: chrono::Duration::seconds(window.as_secs() as i64),
            retention: chrono::Duration::seconds(dedup_retention.as_secs() as i64),
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Run `f` against the pruned window for (key, chat), creating it lazily
    fn with_window<R>(
        &self,
        key: ConnectionKey,
        chat: ChatId,
        now: DateTime<Utc>,
        f: impl FnOnce(&mut ActivityWindow) -> R,
    ) -> R {
        let mut windows = self.windows.lock();
        let entry = windows.entry((key, chat)).or_default();
        entry.prune(now, self.window, self.retention);
        f(entry)
    }

    /// True iff fewer than `quota` sends were recorded within the window
    pub fn admit(&self, key: ConnectionKey, chat: ChatId, now: DateTime<Utc>, quota: usize) -> bool {
        self.with_window(key, chat, now, |w| w.sends.len() < quota)
    }

    /// Record a successful reply. Recording the same message twice is a no-op.
    pub fn record(&self, key: ConnectionKey, chat: ChatId, now: DateTime<Utc>, message_id: MessageId) {
        self.with_window(key, chat, now, |w| {
            w.in_flight.remove(&message_id);
            if w.replied.contains_key(&message_id) {
                return;
            }
            w.sends.push_back(now);
            w.replied.insert(message_id, now);
        });
        debug!("Recorded reply for {} chat {} message {}", key, chat, message_id);
    }

    pub fn has_replied(&self, key: ConnectionKey, chat: ChatId, now: DateTime<Utc>, message_id: MessageId) -> bool {
        self.with_window(key, chat, now, |w| w.replied.contains_key(&message_id))
    }

    /// Claim the right to reply to `message_id`.
    ///
    /// Checks the reply dedup set, pending replies and the quota (counting
    /// in-flight replies) in one step. The returned slot releases itself on
    /// drop unless committed.
    pub fn try_reserve(
        self: &Arc<Self>,
        key: ConnectionKey,
        chat: ChatId,
        now: DateTime<Utc>,
        quota: usize,
        message_id: MessageId,
    ) -> Result<ReplySlot, ReserveDenied> {
        self.with_window(key, chat, now, |w| {
            if w.replied.contains_key(&message_id) || w.in_flight.contains(&message_id) {
                return Err(ReserveDenied::AlreadyHandled);
            }
            if w.committed_and_pending() >= quota {
                return Err(ReserveDenied::QuotaExhausted);
            }
            w.in_flight.insert(message_id);
            Ok(())
        })?;

        Ok(ReplySlot {
            tracker: Arc::clone(self),
            key,
            chat,
            message_id,
            committed: false,
        })
    }

    fn release(&self, key: ConnectionKey, chat: ChatId, message_id: MessageId) {
        let mut windows = self.windows.lock();
        if let Some(w) = windows.get_mut(&(key, chat)) {
            w.in_flight.remove(&message_id);
        }
    }

    pub fn has_autoposted(&self, key: ConnectionKey, chat: ChatId, now: DateTime<Utc>, message_id: MessageId) -> bool {
        self.with_window(key, chat, now, |w| w.autoposted.contains_key(&message_id))
    }

    /// Add a message to the autopost dedup set. Does not count against the reply quota.
    pub fn mark_autoposted(&self, key: ConnectionKey, chat: ChatId, now: DateTime<Utc>, message_id: MessageId) {
        self.with_window(key, chat, now, |w| {
            w.autoposted.entry(message_id).or_insert(now);
        });
    }

    /// Sends recorded within the window
    pub fn recent_sends(&self, key: ConnectionKey, chat: ChatId, now: DateTime<Utc>) -> usize {
        self.with_window(key, chat, now, |w| w.sends.len())
    }

    /// Discard every window belonging to a connection
    pub fn forget(&self, key: ConnectionKey) {
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|(k, _), _| *k != key);
        debug!("Discarded {} activity windows for {}", before - windows.len(), key);
    }

    /// Drop windows with nothing left in them (call periodically)
    pub fn cleanup(&self, now: DateTime<Utc>) {
        let mut windows = self.windows.lock();
        windows.retain(|_, w| {
            w.prune(now, self.window, self.retention);
            !w.is_idle()
        });
    }

    pub fn stats(&self) -> ActivityStats {
        let windows = self.windows.lock();
        ActivityStats {
            windows: windows.len(),
            sends_in_window: windows.values().map(|w| w.sends.len()).sum(),
            in_flight: windows.values().map(|w| w.in_flight.len()).sum(),
        }
    }

    pub fn tracks(&self, key: ConnectionKey) -> bool {
        self.windows.lock().keys().any(|(k, _)| *k == key)
    }
}

/// A claimed reply. Commit after a successful send; dropping releases the claim.
pub struct ReplySlot {
    tracker: Arc<ActivityTracker>,
    key: ConnectionKey,
    chat: ChatId,
    message_id: MessageId,
    committed: bool,
}

impl ReplySlot {
    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    /// Record the send and mark the source message as replied
    pub fn commit(mut self, now: DateTime<Utc>) {
        self.tracker.record(self.key, self.chat, now, self.message_id);
        self.committed = true;
    }
}

impl Drop for ReplySlot {
    fn drop(&mut self) {
        if !self.committed {
            self.tracker.release(self.key, self.chat, self.message_id);
        }
    }
}
