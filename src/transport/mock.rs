//! In-process mock transport
//!
//! A tiny fake network: accounts keyed by credential, per-chat history,
//! live subscribers, injectable connect/send failures and a log of every
//! message the engines sent. Used by unit and integration tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{stream, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::traits::*;
use crate::clock::{Clock, SystemClock};
use crate::model::{AccountId, ChatId, Credential, MessageId};

/// A message sent through a mock session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub id: MessageId,
    pub account: AccountId,
    pub chat_id: ChatId,
    pub text: String,
    pub reply_to: MessageId,
}

struct MockAccount {
    profile: AccountProfile,
    authorized: bool,
}

struct Subscriber {
    session: u64,
    tx: mpsc::Sender<ChatMessage>,
}

#[derive(Default)]
struct NetworkState {
    accounts: HashMap<String, MockAccount>,
    connect_failures: HashMap<String, TransportError>,
    history: HashMap<ChatId, Vec<ChatMessage>>,
    subscribers: Vec<Subscriber>,
    send_errors: HashMap<AccountId, VecDeque<TransportError>>,
    sent: Vec<SentMessage>,
    next_message_id: MessageId,
    next_session: u64,
    open_sessions: HashSet<u64>,
    connects: usize,
}

/// Shared fake network
pub struct MockNetwork {
    state: Mutex<NetworkState>,
    clock: Arc<dyn Clock>,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Dates of sent messages come from `clock`
    pub fn with_clock(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(NetworkState {
                next_message_id: 1000,
                ..Default::default()
            }),
            clock,
        })
    }

    pub fn connector(self: &Arc<Self>) -> Arc<dyn Connector> {
        Arc::new(MockConnector {
            network: Arc::clone(self),
        })
    }

    /// Make `credential` log in as `id`
    pub fn register_account(&self, credential: &str, id: AccountId, name: &str) {
        self.state.lock().accounts.insert(
            credential.to_string(),
            MockAccount {
                profile: AccountProfile {
                    id,
                    first_name: Some(name.to_string()),
                    last_name: None,
                    is_bot: false,
                },
                authorized: true,
            },
        );
    }

    /// Connects with `credential` succeed but report "not authorized"
    pub fn deauthorize(&self, credential: &str) {
        if let Some(account) = self.state.lock().accounts.get_mut(credential) {
            account.authorized = false;
        }
    }

    /// Next connect with `credential` fails with `error`
    pub fn fail_next_connect(&self, credential: &str, error: TransportError) {
        self.state
            .lock()
            .connect_failures
            .insert(credential.to_string(), error);
    }

    /// Queue an error for the next send by `account`
    pub fn fail_next_send(&self, account: AccountId, error: TransportError) {
        self.state
            .lock()
            .send_errors
            .entry(account)
            .or_default()
            .push_back(error);
    }

    /// Append a message to chat history and deliver it to every subscriber
    pub fn post(
        &self,
        chat: ChatId,
        sender: AccountId,
        text: &str,
        reply_to: Option<MessageId>,
        date: DateTime<Utc>,
    ) -> ChatMessage {
        self.post_message(chat, sender, false, text, reply_to, date)
    }

    /// Same as `post`, from an automated sender
    pub fn post_from_bot(
        &self,
        chat: ChatId,
        sender: AccountId,
        text: &str,
        reply_to: Option<MessageId>,
        date: DateTime<Utc>,
    ) -> ChatMessage {
        self.post_message(chat, sender, true, text, reply_to, date)
    }

    fn post_message(
        &self,
        chat: ChatId,
        sender: AccountId,
        sender_is_bot: bool,
        text: &str,
        reply_to: Option<MessageId>,
        date: DateTime<Utc>,
    ) -> ChatMessage {
        let mut state = self.state.lock();
        state.next_message_id += 1;
        let message = ChatMessage {
            id: state.next_message_id,
            chat_id: chat,
            sender_id: Some(sender),
            sender_is_bot,
            text: text.to_string(),
            date,
            reply_to,
        };
        state.history.entry(chat).or_default().push(message.clone());
        Self::fan_out(&mut state, &message);
        message
    }

    /// Deliver an existing message again without touching history
    pub fn redeliver(&self, message: &ChatMessage) {
        let mut state = self.state.lock();
        Self::fan_out(&mut state, message);
    }

    fn fan_out(state: &mut NetworkState, message: &ChatMessage) {
        state
            .subscribers
            .retain(|s| s.tx.try_send(message.clone()).is_ok() || !s.tx.is_closed());
    }

    /// Everything sent so far, in order
    pub fn sent(&self) -> Vec<SentMessage> {
        self.state.lock().sent.clone()
    }

    pub fn sent_in(&self, chat: ChatId) -> Vec<SentMessage> {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|m| m.chat_id == chat)
            .cloned()
            .collect()
    }

    /// Sessions opened and not yet disconnected
    pub fn open_sessions(&self) -> usize {
        self.state.lock().open_sessions.len()
    }

    /// Total successful connects
    pub fn connects(&self) -> usize {
        self.state.lock().connects
    }

    /// Active update subscriptions
    pub fn subscribers(&self) -> usize {
        self.state.lock().subscribers.len()
    }
}

struct MockConnector {
    network: Arc<MockNetwork>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, credential: &Credential) -> Result<Arc<dyn Session>, TransportError> {
        let mut state = self.network.state.lock();
        if let Some(error) = state.connect_failures.remove(credential.expose()) {
            return Err(error);
        }
        let account = state
            .accounts
            .get(credential.expose())
            .ok_or_else(|| TransportError::Unauthorized("unknown session string".to_string()))?;
        let profile = account.profile.clone();
        let authorized = account.authorized;

        state.next_session += 1;
        let session = state.next_session;
        state.open_sessions.insert(session);
        state.connects += 1;

        Ok(Arc::new(MockSession {
            network: Arc::clone(&self.network),
            session,
            profile,
            authorized,
            closed: AtomicBool::new(false),
        }))
    }
}

struct MockSession {
    network: Arc<MockNetwork>,
    session: u64,
    profile: AccountProfile,
    authorized: bool,
    closed: AtomicBool,
}

impl MockSession {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Session for MockSession {
    async fn authorized_profile(&self) -> Result<Option<AccountProfile>, TransportError> {
        self.ensure_open()?;
        Ok(self.authorized.then(|| self.profile.clone()))
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<ChatMessage>, TransportError> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::channel(256);
        self.network.state.lock().subscribers.push(Subscriber {
            session: self.session,
            tx,
        });
        Ok(rx)
    }

    async fn get_message(&self, chat: ChatId, id: MessageId) -> Result<Option<ChatMessage>, TransportError> {
        self.ensure_open()?;
        let state = self.network.state.lock();
        Ok(state
            .history
            .get(&chat)
            .and_then(|messages| messages.iter().find(|m| m.id == id).cloned()))
    }

    fn recent_messages(&self, chat: ChatId, limit: usize) -> MessageStream {
        if let Err(e) = self.ensure_open() {
            return stream::once(async move { Err(e) }).boxed();
        }
        let state = self.network.state.lock();
        let page: Vec<ChatMessage> = state
            .history
            .get(&chat)
            .map(|messages| messages.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default();
        stream::iter(page.into_iter().map(Ok)).boxed()
    }

    async fn send_reply(&self, chat: ChatId, text: &str, reply_to: MessageId) -> Result<MessageId, TransportError> {
        self.ensure_open()?;
        let date = self.network.clock.now();
        let mut state = self.network.state.lock();
        if let Some(error) = state
            .send_errors
            .get_mut(&self.profile.id)
            .and_then(|queue| queue.pop_front())
        {
            return Err(error);
        }

        state.next_message_id += 1;
        let id = state.next_message_id;
        state.sent.push(SentMessage {
            id,
            account: self.profile.id,
            chat_id: chat,
            text: text.to_string(),
            reply_to,
        });
        state.history.entry(chat).or_default().push(ChatMessage {
            id,
            chat_id: chat,
            sender_id: Some(self.profile.id),
            sender_is_bot: self.profile.is_bot,
            text: text.to_string(),
            date,
            reply_to: Some(reply_to),
        });
        Ok(id)
    }

    async fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut state = self.network.state.lock();
        state.open_sessions.remove(&self.session);
        state.subscribers.retain(|s| s.session != self.session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_and_profile() {
        let network = MockNetwork::new();
        network.register_account("cred-a", 42, "Alice");
        let session = network
            .connector()
            .connect(&Credential::new("cred-a"))
            .await
            .unwrap();
        let profile = session.authorized_profile().await.unwrap().unwrap();
        assert_eq!(profile.id, 42);
        assert_eq!(network.open_sessions(), 1);

        session.disconnect().await;
        assert_eq!(network.open_sessions(), 0);
        assert!(matches!(
            session.send_reply(1, "x", 1).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_unknown_credential_is_unauthorized() {
        let network = MockNetwork::new();
        let result = network.connector().connect(&Credential::new("nope")).await;
        assert!(matches!(result, Err(TransportError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn test_history_is_most_recent_first() {
        let network = MockNetwork::new();
        network.register_account("cred-a", 42, "Alice");
        let now = Utc::now();
        let first = network.post(-1, 7, "one", None, now);
        let second = network.post(-1, 8, "two", None, now);

        let session = network
            .connector()
            .connect(&Credential::new("cred-a"))
            .await
            .unwrap();
        let ids: Vec<MessageId> = session
            .recent_messages(-1, 10)
            .map(|m| m.unwrap().id)
            .collect()
            .await;
        assert_eq!(ids, vec![second.id, first.id]);
    }

    #[tokio::test]
    async fn test_subscription_receives_posts_until_disconnect() {
        let network = MockNetwork::new();
        network.register_account("cred-a", 42, "Alice");
        let session = network
            .connector()
            .connect(&Credential::new("cred-a"))
            .await
            .unwrap();
        let mut rx = session.subscribe().await.unwrap();

        let posted = network.post(-1, 7, "hi", None, Utc::now());
        assert_eq!(rx.recv().await.unwrap().id, posted.id);

        session.disconnect().await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_injected_send_error() {
        let network = MockNetwork::new();
        network.register_account("cred-a", 42, "Alice");
        network.fail_next_send(42, TransportError::RateLimited(std::time::Duration::from_secs(3)));
        let session = network
            .connector()
            .connect(&Credential::new("cred-a"))
            .await
            .unwrap();
        assert!(matches!(
            session.send_reply(-1, "x", 1).await,
            Err(TransportError::RateLimited(_))
        ));
        assert!(session.send_reply(-1, "x", 1).await.is_ok());
        assert_eq!(network.sent().len(), 1);
    }
}
