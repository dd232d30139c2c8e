use serde::Serialize;
use tokio::sync::broadcast;

use crate::call::{CallParticipant, CallPhase, CallState};
use crate::codec::PeerAnnouncement;
use crate::connection::ConnectionState;
use crate::errors::HavenError;
use crate::media::MediaTrack;
use crate::message::Message;
use crate::quality::NetworkStats;

/// Events published by a session to UI subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ConnectionStateChanged(ConnectionState),
    /// Automatic reconnection gave up; call `ChatSession::retry` to resume.
    Disconnected { attempts: u32 },
    MessageReceived(Message),
    Typing { user_id: String, is_typing: bool },
    PeerAnnounced(PeerAnnouncement),
    CallPhaseChanged(CallPhase),
    CallStateChanged(CallState),
    IncomingCall(CallParticipant),
    ParticipantJoined(CallParticipant),
    ParticipantUpdated(CallParticipant),
    ParticipantLeft(String), // participant id
    RemoteTrackAdded { peer_id: String, track: MediaTrack },
    RemoteTrackRemoved { peer_id: String, track_id: String },
    NetworkQualityChanged { stats: NetworkStats, quality: ConnectionQuality },
    /// Errors the user has to act on (auth, media, connection limit).
    Error(HavenError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Poor,
    Lost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TrackSource {
    Microphone,
    Camera,
    ScreenShare,
    Unknown,
}

/// Fan-out of [`SessionEvent`]s to any number of subscribers.
///
/// Backed by a bounded broadcast channel: a subscriber that falls more than
/// `capacity` events behind skips ahead and is told how many it missed.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: SessionEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("session event dropped: no subscribers");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
