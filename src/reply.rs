//! Reply Engine
//!
//! Event-driven: every inbound message on a live connection runs through an
//! ordered chain of checks. The engine only continues threads the linked
//! account started; it never opens a conversation.
//!
//! Accepted messages are answered after a random human-like delay. The delay
//! suspends only that message's task, never the listener or other chats.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::activity::{ReplySlot, ReserveDenied};
use crate::engine::{BoundSession, EngineContext, EngineError, EngineStats};
use crate::links::contains_link;
use crate::model::{ChatGroupAssignment, MessageId};
use crate::transport::ChatMessage;

/// First failed check for a rejected message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    OwnMessage,
    Backlog,
    NoText,
    ContainsLink,
    UnassignedChat,
    QuotaExhausted,
    NotAReply,
    NotOurThread,
    AutomatedSender,
    AlreadyReplied,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OwnMessage => "own message",
            Self::Backlog => "backlog",
            Self::NoText => "no text",
            Self::ContainsLink => "contains link",
            Self::UnassignedChat => "chat not assigned",
            Self::QuotaExhausted => "quota exhausted",
            Self::NotAReply => "not a reply",
            Self::NotOurThread => "not a reply to this account",
            Self::AutomatedSender => "automated sender",
            Self::AlreadyReplied => "already replied",
        }
    }
}

/// A message that passed every check, with its reservation held
pub struct Accepted {
    pub assignment: ChatGroupAssignment,
    slot: ReplySlot,
}

pub enum Decision {
    Accept(Accepted),
    Reject(RejectReason),
}

/// How handling one message ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome {
    Rejected(RejectReason),
    Sent(MessageId),
    Cancelled,
}

pub struct ReplyEngine {
    ctx: Arc<EngineContext>,
}

impl ReplyEngine {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Run the check chain. Only the original-message lookup can fail.
    pub async fn evaluate(&self, binding: &BoundSession, message: &ChatMessage) -> Result<Decision, EngineError> {
        use Decision::Reject;

        let key = binding.key;
        let chat = message.chat_id;

        if message.is_from(key.account) {
            return Ok(Reject(RejectReason::OwnMessage));
        }
        if message.date < binding.started_at {
            return Ok(Reject(RejectReason::Backlog));
        }
        if !message.has_text() {
            return Ok(Reject(RejectReason::NoText));
        }
        if contains_link(&message.text) {
            return Ok(Reject(RejectReason::ContainsLink));
        }
        let Some(assignment) = binding.assignment(chat) else {
            return Ok(Reject(RejectReason::UnassignedChat));
        };

        let quota = self.ctx.tier(key.owner).await.reply_quota();
        if !self.ctx.tracker.admit(key, chat, self.ctx.now(), quota) {
            return Ok(Reject(RejectReason::QuotaExhausted));
        }

        let Some(reply_to) = message.reply_to else {
            return Ok(Reject(RejectReason::NotAReply));
        };
        let original = match binding.session.get_message(chat, reply_to).await? {
            Some(original) if original.is_from(key.account) => original,
            _ => return Ok(Reject(RejectReason::NotOurThread)),
        };
        if original.sender_is_bot || message.sender_is_bot {
            return Ok(Reject(RejectReason::AutomatedSender));
        }

        match self
            .ctx
            .tracker
            .try_reserve(key, chat, self.ctx.now(), quota, message.id)
        {
            Ok(slot) => Ok(Decision::Accept(Accepted { assignment, slot })),
            Err(ReserveDenied::AlreadyHandled) => Ok(Reject(RejectReason::AlreadyReplied)),
            Err(ReserveDenied::QuotaExhausted) => Ok(Reject(RejectReason::QuotaExhausted)),
        }
    }

    /// Evaluate one message and, if accepted, wait, generate and send
    pub async fn handle(
        &self,
        binding: &BoundSession,
        message: &ChatMessage,
        cancel: &CancellationToken,
    ) -> Result<ReplyOutcome, EngineError> {
        let key = binding.key;
        let accepted = match self.evaluate(binding, message).await? {
            Decision::Accept(accepted) => accepted,
            Decision::Reject(reason) => {
                EngineStats::bump(&self.ctx.stats.rejections);
                debug!(
                    "[{}] Ignoring message {} in chat {}: {}",
                    key,
                    message.id,
                    message.chat_id,
                    reason.as_str()
                );
                return Ok(ReplyOutcome::Rejected(reason));
            }
        };

        let delay = self.ctx.settings.reply_delay.sample();
        info!(
            "[{}] Replying to message {} in chat {} in {} seconds",
            key,
            message.id,
            message.chat_id,
            delay.as_secs()
        );
        tokio::select! {
            _ = cancel.cancelled() => return Ok(ReplyOutcome::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }

        // Persona may have been edited while we waited
        let persona = binding
            .assignment(message.chat_id)
            .map(|a| a.persona)
            .unwrap_or(accepted.assignment.persona);

        let text = self.ctx.generate(&persona, &message.text).await?;
        let sent = match self
            .ctx
            .send_with_retry(binding, message.chat_id, &text, message.id, cancel)
            .await
        {
            Ok(id) => id,
            Err(EngineError::Cancelled) => return Ok(ReplyOutcome::Cancelled),
            Err(e) => return Err(e),
        };

        accepted.slot.commit(self.ctx.now());
        EngineStats::bump(&self.ctx.stats.replies_sent);
        info!(
            "[{}] Replied to message {} in chat {}",
            key, message.id, message.chat_id
        );
        Ok(ReplyOutcome::Sent(sent))
    }

    /// Forward inbound messages for one connection until cancelled or the
    /// subscription ends. Each message is handled in its own task.
    pub async fn listen(
        self: Arc<Self>,
        binding: BoundSession,
        mut updates: mpsc::Receiver<ChatMessage>,
        cancel: CancellationToken,
    ) {
        debug!("[{}] Listener started", binding.key);
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                message = updates.recv() => match message {
                    Some(message) => message,
                    None => {
                        warn!("[{}] Update stream ended", binding.key);
                        break;
                    }
                },
            };

            let engine = Arc::clone(&self);
            let binding = binding.clone();
            let cancel = cancel.child_token();
            tokio::spawn(async move {
                if let Err(e) = engine.handle(&binding, &message, &cancel).await {
                    EngineStats::bump(&engine.ctx.stats.failures);
                    warn!(
                        "[{}] Reply to message {} in chat {} abandoned: {}",
                        binding.key, message.id, message.chat_id, e
                    );
                }
            });
        }
        debug!("[{}] Listener stopped", binding.key);
    }
}
