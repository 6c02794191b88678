//! User-Account Transport
//!
//! Each linked account is driven through a `Session` obtained from a
//! `Connector`:
//! - Gateway (HTTP/JSON to a session gateway holding the MTProto sessions)
//! - Mock (in-process network for tests and dry runs)

pub mod gateway;
pub mod mock;
pub mod traits;

pub use gateway::{GatewayConfig, GatewayConnector};
pub use mock::{MockNetwork, SentMessage};
pub use traits::{AccountProfile, ChatMessage, Connector, MessageStream, Session, TransportError};
