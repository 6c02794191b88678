//! Autopost Engine
//!
//! One perpetual loop per live connection. After a tier-dependent random
//! sleep it walks the account's assigned chats and answers at most one recent
//! organic message in each. Per-chat failures are isolated; a failure that
//! escapes the chat loop backs the whole task off and the loop restarts.
//! Only cancellation ends it.

use futures_util::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::{BoundSession, EngineContext, EngineError, EngineStats};
use crate::links::contains_link;
use crate::model::{ChatGroupAssignment, MessageId};
use crate::transport::{ChatMessage, TransportError};

pub struct AutopostEngine {
    ctx: Arc<EngineContext>,
}

impl AutopostEngine {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Loop until cancelled
    pub async fn run(self: Arc<Self>, binding: BoundSession, cancel: CancellationToken) {
        info!("[{}] Autopost loop started", binding.key);
        loop {
            match self.cycle(&binding, &cancel).await {
                Ok(posted) => debug!("[{}] Autopost cycle done, {} posts", binding.key, posted),
                Err(EngineError::Cancelled) => break,
                Err(e) => {
                    EngineStats::bump(&self.ctx.stats.failures);
                    error!(
                        "[{}] Autopost cycle failed, backing off {} seconds: {}",
                        binding.key,
                        self.ctx.settings.autopost_backoff.as_secs(),
                        e
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.ctx.settings.autopost_backoff) => {}
                    }
                }
            }
        }
        info!("[{}] Autopost loop stopped", binding.key);
    }

    /// Sleep one interval, then post at most once per assigned chat.
    /// Returns the number of posts sent.
    pub async fn cycle(&self, binding: &BoundSession, cancel: &CancellationToken) -> Result<usize, EngineError> {
        let tier = self.ctx.tier(binding.key.owner).await;
        let interval = self.ctx.settings.autopost_interval(tier).sample();
        debug!(
            "[{}] Next autopost cycle in {} seconds ({} tier)",
            binding.key,
            interval.as_secs(),
            tier.as_str()
        );
        tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            _ = tokio::time::sleep(interval) => {}
        }

        let mut posted = 0;
        for assignment in binding.assignments() {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            match self.post_in_chat(binding, &assignment, cancel).await {
                Ok(Some(_)) => posted += 1,
                Ok(None) => {}
                Err(e @ (EngineError::Cancelled | EngineError::Transport(TransportError::Closed))) => {
                    return Err(e)
                }
                Err(e) => {
                    EngineStats::bump(&self.ctx.stats.failures);
                    warn!(
                        "[{}] Autopost in chat {} skipped: {}",
                        binding.key, assignment.chat_id, e
                    );
                }
            }
        }
        Ok(posted)
    }

    /// First recent message in the chat worth answering, if any
    pub async fn select_message(
        &self,
        binding: &BoundSession,
        assignment: &ChatGroupAssignment,
    ) -> Result<Option<ChatMessage>, TransportError> {
        let key = binding.key;
        let chat = assignment.chat_id;
        let now = self.ctx.now();
        let window = chrono::Duration::seconds(self.ctx.settings.activity_window.as_secs() as i64);

        let mut history = binding
            .session
            .recent_messages(chat, self.ctx.settings.autopost_scan_limit)
            .take(self.ctx.settings.autopost_scan_limit);

        while let Some(message) = history.next().await {
            let message = message?;
            if now - message.date > window {
                break;
            }
            if message.is_from(key.account)
                || message.sender_is_bot
                || !message.has_text()
                || contains_link(&message.text)
                || self.ctx.tracker.has_autoposted(key, chat, now, message.id)
            {
                continue;
            }
            return Ok(Some(message));
        }
        Ok(None)
    }

    async fn post_in_chat(
        &self,
        binding: &BoundSession,
        assignment: &ChatGroupAssignment,
        cancel: &CancellationToken,
    ) -> Result<Option<MessageId>, EngineError> {
        let chat = assignment.chat_id;
        let Some(message) = self.select_message(binding, assignment).await? else {
            debug!("[{}] Nothing to autopost under in chat {}", binding.key, chat);
            return Ok(None);
        };

        let text = self.ctx.generate(&assignment.persona, &message.text).await?;
        let sent = self
            .ctx
            .send_with_retry(binding, chat, &text, message.id, cancel)
            .await?;

        self.ctx
            .tracker
            .mark_autoposted(binding.key, chat, self.ctx.now(), message.id);
        EngineStats::bump(&self.ctx.stats.autoposts_sent);
        info!(
            "[{}] Autoposted in chat {} under message {}",
            binding.key, chat, message.id
        );
        Ok(Some(sent))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::{DelayRange, EngineSettings};
    use crate::generator::CannedGenerator;
    use crate::membership::StaticMembership;
    use crate::model::{ChatId, ConnectionKey, Credential};
    use crate::transport::MockNetwork;
    use std::time::Duration;
    use tokio::sync::watch;

    const ACCOUNT: i64 = 42;
    const CHAT_A: ChatId = -100;
    const CHAT_B: ChatId = -200;

    struct Fixture {
        network: Arc<MockNetwork>,
        engine: Arc<AutopostEngine>,
        binding: BoundSession,
        clock: Arc<ManualClock>,
        _assignments: watch::Sender<Vec<ChatGroupAssignment>>,
    }

    async fn fixture() -> Fixture {
        fixture_with(EngineSettings::default()).await
    }

    async fn fixture_with(settings: EngineSettings) -> Fixture {
        let clock = Arc::new(ManualClock::starting_now());
        let network = MockNetwork::with_clock(clock.clone());
        network.register_account("cred", ACCOUNT, "Ann");
        let session = network.connector().connect(&Credential::new("cred")).await.unwrap();

        let ctx = Arc::new(EngineContext::new(
            Arc::new(CannedGenerator),
            Arc::new(StaticMembership::none()),
            clock.clone(),
            settings,
        ));
        let (tx, rx) = watch::channel(vec![
            ChatGroupAssignment::new(CHAT_A, "a", "terse"),
            ChatGroupAssignment::new(CHAT_B, "b", "chatty"),
        ]);
        let binding = BoundSession::new(ConnectionKey::new(1, ACCOUNT), clock.now(), session, rx);

        Fixture {
            network,
            engine: Arc::new(AutopostEngine::new(ctx)),
            binding,
            clock,
            _assignments: tx,
        }
    }

    fn hours(h: i64) -> chrono::Duration {
        chrono::Duration::hours(h)
    }

    #[tokio::test]
    async fn test_select_skips_unsuitable_messages() {
        let f = fixture().await;
        let now = f.clock.now();
        let good = f.network.post(CHAT_A, 7, "how is everyone", None, now);
        f.network.post(CHAT_A, ACCOUNT, "mine", None, now);
        f.network.post_from_bot(CHAT_A, 99, "bot spam", None, now);
        f.network.post(CHAT_A, 8, "join www.scam.example", None, now);
        f.network.post(CHAT_A, 9, "   ", None, now);

        let assignment = f.binding.assignment(CHAT_A).unwrap();
        let selected = f.engine.select_message(&f.binding, &assignment).await.unwrap();
        assert_eq!(selected.unwrap().id, good.id);
    }

    #[tokio::test]
    async fn test_select_stops_at_window_edge() {
        let f = fixture().await;
        let now = f.clock.now();
        f.network.post(CHAT_A, 7, "ancient", None, now - hours(8));
        f.network.post(CHAT_A, 7, "newer but also old", None, now - hours(7) - chrono::Duration::seconds(1));

        let assignment = f.binding.assignment(CHAT_A).unwrap();
        assert!(f.engine.select_message(&f.binding, &assignment).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_select_honours_scan_limit() {
        let f = fixture().await;
        let now = f.clock.now();
        f.network.post(CHAT_A, 7, "buried", None, now);
        for _ in 0..100 {
            f.network.post(CHAT_A, ACCOUNT, "self", None, now);
        }
        let assignment = f.binding.assignment(CHAT_A).unwrap();
        assert!(f.engine.select_message(&f.binding, &assignment).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_posts_once_per_chat_and_dedups() {
        let f = fixture().await;
        let now = f.clock.now();
        let first = f.network.post(CHAT_A, 7, "first", None, now);
        let second = f.network.post(CHAT_A, 8, "second", None, now);
        f.network.post(CHAT_B, 7, "over here", None, now);

        let cancel = CancellationToken::new();
        assert_eq!(f.engine.cycle(&f.binding, &cancel).await.unwrap(), 2);
        let in_a = f.network.sent_in(CHAT_A);
        assert_eq!(in_a.len(), 1);
        assert_eq!(in_a[0].reply_to, second.id);

        // Second cycle moves on to the next message in chat A; chat B has nothing new
        assert_eq!(f.engine.cycle(&f.binding, &cancel).await.unwrap(), 1);
        let in_a = f.network.sent_in(CHAT_A);
        assert_eq!(in_a.len(), 2);
        assert_eq!(in_a[1].reply_to, first.id);
        assert_eq!(f.network.sent_in(CHAT_B).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_retries_then_skips_chat() {
        let f = fixture().await;
        let now = f.clock.now();
        f.network.post(CHAT_A, 7, "a", None, now);
        f.network.post(CHAT_B, 7, "b", None, now);
        f.network.fail_next_send(ACCOUNT, TransportError::RateLimited(Duration::from_secs(10)));
        f.network.fail_next_send(ACCOUNT, TransportError::RateLimited(Duration::from_secs(10)));

        let posted = f.engine.cycle(&f.binding, &CancellationToken::new()).await.unwrap();
        assert_eq!(posted, 1);
        assert!(f.network.sent_in(CHAT_A).is_empty());
        assert_eq!(f.network.sent_in(CHAT_B).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_session_escapes_cycle() {
        let f = fixture().await;
        f.network.post(CHAT_A, 7, "a", None, f.clock.now());
        f.binding.session.disconnect().await;

        let result = f.engine.cycle(&f.binding, &CancellationToken::new()).await;
        assert!(matches!(result, Err(EngineError::Transport(TransportError::Closed))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel() {
        let f = fixture().await;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&f.engine).run(f.binding.clone(), cancel.clone()));
        tokio::time::sleep(Duration::from_secs(60)).await;
        cancel.cancel();
        task.await.unwrap();
        assert!(f.network.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_backs_off_after_escaped_failure_then_resumes() {
        let settings = EngineSettings {
            autopost_interval_standard: DelayRange::secs(100, 100),
            ..EngineSettings::default()
        };
        let f = fixture_with(settings).await;
        f.network.post(CHAT_A, 7, "anyone around", None, f.clock.now());
        f.network.fail_next_send(ACCOUNT, TransportError::Closed);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&f.engine).run(f.binding.clone(), cancel.clone()));

        // First cycle fires at 100s and fails outright
        tokio::time::sleep(Duration::from_secs(150)).await;
        assert!(f.network.sent().is_empty());
        assert_eq!(f.engine.ctx.stats.snapshot().failures, 1);

        // Backoff (3600s) plus the next interval (100s) has not elapsed yet
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(f.network.sent().is_empty());
        assert!(!task.is_finished());

        tokio::time::sleep(Duration::from_secs(100)).await;
        let sent = f.network.sent_in(CHAT_A);
        assert_eq!(sent.len(), 1);
        assert!(!task.is_finished());

        cancel.cancel();
        task.await.unwrap();
    }
}
