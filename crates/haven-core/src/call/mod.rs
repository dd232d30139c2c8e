//! One-to-one (or small group) call lifecycle on top of a platform peer link.

mod controller;
mod participants;
mod state;

#[cfg(test)]
pub(crate) use controller::testing;

pub use controller::{CallOptions, CallSessionController, PeerLink};
pub use participants::{CallParticipant, ParticipantRoster};
pub use state::{CallPhase, CallState};
