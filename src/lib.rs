//! npcbot
//!
//! Operates secondary Telegram accounts on behalf of their owners. Each owner
//! links accounts, assigns them to chats with a persona, and the engine keeps
//! them talking: threaded replies to people who answer them, plus occasional
//! posts under recent organic messages. Volume is bounded per account and chat.
//!
//! # Architecture
//!
//! ```text
//! Directories ──► ConnectionPool ──► LiveConnection (one per account)
//!  (JSON / mem)     (reconcile)          ├── ReplyEngine listener ──┐
//!                                        └── AutopostEngine loop ───┤
//!                                                                   ▼
//!                          ActivityTracker ◄── EngineContext ──► ResponseGenerator
//!                           (7h windows)        (tier, clock)     (HTTP / canned)
//! ```

pub mod accounts;
pub mod activity;
pub mod autopost;
pub mod clock;
pub mod config;
pub mod directory;
pub mod engine;
pub mod generator;
pub mod links;
pub mod membership;
pub mod model;
pub mod pool;
pub mod reply;
pub mod tier;
pub mod transport;

pub use accounts::{AccountManager, UnlinkOutcome};
pub use activity::{ActivityStats, ActivityTracker, ReplySlot, ReserveDenied};
pub use autopost::AutopostEngine;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, DelayRange, EngineSettings};
pub use directory::{
    AccountDirectory, AssignmentDirectory, DirectoryError, JsonDirectory, MemoryDirectory,
};
pub use engine::{BoundSession, EngineContext, EngineError, EngineStats, EngineStatsSnapshot};
pub use generator::{
    generate_reply, sanitize_reply, CannedGenerator, GenerationError, HttpGenerator,
    RecordingGenerator, ResponseGenerator,
};
pub use links::contains_link;
pub use membership::{tier_for, GroupMembership, Membership, MembershipError, StaticMembership};
pub use model::{
    AccountId, ChatGroupAssignment, ChatId, ConnectionKey, Credential, LinkedAccount, MessageId,
    OwnerId, MAX_PERSONA_CHARS,
};
pub use pool::{ConnectionPool, PoolHandle, ReconcileReport};
pub use reply::{RejectReason, ReplyEngine, ReplyOutcome};
pub use tier::Tier;
pub use transport::{
    AccountProfile, ChatMessage, Connector, GatewayConfig, GatewayConnector, MockNetwork,
    SentMessage, Session, TransportError,
};
