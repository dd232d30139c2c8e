//! Haven core: resilient chat transport and peer-to-peer call sessions.
//!
//! Pure Rust crate with no platform dependencies. Media capture, the peer
//! connection and its stats are reached through traits the embedding shell
//! implements.

pub mod auth;
pub mod call;
pub mod codec;
pub mod connection;
pub mod errors;
pub mod events;
pub mod media;
pub mod message;
pub mod outbox;
pub mod quality;
pub mod session;
pub mod settings;
pub mod signaling;
pub mod store;

pub use call::{CallParticipant, CallPhase, CallSessionController, CallState};
pub use codec::ChatMode;
pub use connection::{ConnectionState, ConnectionStatus, ConnectionTracker, WsConnector};
pub use errors::HavenError;
pub use events::{EventBus, SessionEvent};
pub use message::{Message, Sender};
pub use session::{ChatSession, SessionConfig};
pub use settings::{Settings, SettingsStore};
