use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::sync::broadcast;

use crate::codec::{MessageCodec, PeerAnnouncement};
use crate::connection::ConnectionManager;
use crate::errors::HavenError;

#[derive(Debug, Default)]
struct Peers {
    local_peer_id: Option<String>,
    /// Latest announcement per counterparty user id.
    remote: HashMap<String, PeerAnnouncement>,
}

/// Peer-id exchange over the chat socket.
///
/// The local call-capable id is re-announced every time the socket opens, so
/// the counterparty learns the current id after a reconnect. Announcements
/// from others are cached for the session, letting a call resolve its
/// target without a new handshake.
#[derive(Clone)]
pub struct SignalingChannel {
    codec: MessageCodec,
    connection: Arc<ConnectionManager>,
    peers: Arc<Mutex<Peers>>,
    announced: broadcast::Sender<PeerAnnouncement>,
}

impl SignalingChannel {
    pub fn new(codec: MessageCodec, connection: Arc<ConnectionManager>, capacity: usize) -> Self {
        let (announced, _) = broadcast::channel(capacity.max(1));
        Self {
            codec,
            connection,
            peers: Arc::new(Mutex::new(Peers::default())),
            announced,
        }
    }

    /// Remember `peer_id` as ours and announce it now if the socket is open.
    pub fn broadcast_peer_id(&self, peer_id: &str) -> Result<(), HavenError> {
        self.lock().local_peer_id = Some(peer_id.to_string());
        if self.connection.state().is_open() {
            self.announce(peer_id)?;
        } else {
            tracing::debug!("peer id {peer_id} will be announced once the socket opens");
        }
        Ok(())
    }

    /// Subscribe to announcements from other participants.
    pub fn on_peer_announced(&self) -> broadcast::Receiver<PeerAnnouncement> {
        self.announced.subscribe()
    }

    /// Called on every socket open.
    pub(crate) fn on_socket_open(&self) {
        let local = self.lock().local_peer_id.clone();
        if let Some(peer_id) = local {
            if let Err(e) = self.announce(&peer_id) {
                tracing::warn!("failed to re-announce peer id: {e}");
            }
        }
    }

    /// Cache an inbound announcement. Returns false for our own echo.
    pub(crate) fn handle_announcement(&self, announcement: PeerAnnouncement) -> bool {
        if announcement.user_id == self.codec.user_id() {
            tracing::debug!("ignoring own peer announcement");
            return false;
        }
        tracing::info!(
            "peer {} announced for user {}",
            announcement.peer_id,
            announcement.user_id
        );
        self.lock()
            .remote
            .insert(announcement.user_id.clone(), announcement.clone());
        let _ = self.announced.send(announcement);
        true
    }

    /// Cached peer id of `user_id`, if they announced one this session.
    pub fn resolve(&self, user_id: &str) -> Option<String> {
        self.lock().remote.get(user_id).map(|a| a.peer_id.clone())
    }

    pub fn local_peer_id(&self) -> Option<String> {
        self.lock().local_peer_id.clone()
    }

    pub fn known_peers(&self) -> Vec<PeerAnnouncement> {
        self.lock().remote.values().cloned().collect()
    }

    fn announce(&self, peer_id: &str) -> Result<(), HavenError> {
        let frame = self.codec.serialize_peer_announcement(peer_id, Utc::now());
        self.connection.send_transient(frame)
    }

    fn lock(&self) -> MutexGuard<'_, Peers> {
        self.peers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use url::Url;

    use super::*;
    use crate::codec::{ChatMode, ClassifiedFrame};
    use crate::connection::testing::{ScriptedConnector, wait_for};
    use crate::connection::{ConnectionEvent, ConnectionTracker};
    use crate::settings::TransportSettings;

    fn channel(connector: &ScriptedConnector) -> (SignalingChannel, tokio::sync::mpsc::Receiver<ConnectionEvent>) {
        let (manager, events) = ConnectionManager::spawn(
            Url::parse("ws://localhost/ws").unwrap(),
            connector.clone(),
            &TransportSettings::default(),
            ConnectionTracker::new(4),
        );
        let codec = MessageCodec::new("client-1", ChatMode::Peer);
        (SignalingChannel::new(codec, Arc::new(manager), 8), events)
    }

    fn announcement(user: &str, peer: &str) -> PeerAnnouncement {
        PeerAnnouncement {
            peer_id: peer.to_string(),
            user_id: user.to_string(),
            timestamp: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn announces_on_every_open() {
        let connector = ScriptedConnector::default();
        let mut remote = connector.push_ok();
        let (signaling, mut events) = channel(&connector);

        signaling.broadcast_peer_id("peer-local").unwrap();
        signaling.connection.connect("room-1", "tok").unwrap();
        wait_for(&mut events, |e| matches!(e, ConnectionEvent::Open)).await;
        signaling.on_socket_open();
        signaling.connection.outbox_size().await;

        let sent = remote.texts();
        assert_eq!(sent.len(), 1);
        let codec = MessageCodec::new("therapist-9", ChatMode::Peer);
        match codec.parse(&sent[0]).unwrap() {
            ClassifiedFrame::PeerAnnouncement(a) => {
                assert_eq!(a.peer_id, "peer-local");
                assert_eq!(a.user_id, "client-1");
            }
            other => panic!("expected announcement, got {other:?}"),
        }
        // Never queued for later.
        assert_eq!(signaling.connection.outbox_size().await, 0);
    }

    #[tokio::test]
    async fn caches_announcements_by_user() {
        let connector = ScriptedConnector::default();
        let (signaling, _events) = channel(&connector);
        let mut announced = signaling.on_peer_announced();

        assert!(signaling.handle_announcement(announcement("therapist-9", "peer-a")));
        assert!(signaling.handle_announcement(announcement("therapist-9", "peer-b")));

        assert_eq!(signaling.resolve("therapist-9").as_deref(), Some("peer-b"));
        assert_eq!(signaling.known_peers().len(), 1);
        assert_eq!(announced.recv().await.unwrap().peer_id, "peer-a");
        assert_eq!(announced.recv().await.unwrap().peer_id, "peer-b");
    }

    #[tokio::test]
    async fn own_announcements_are_ignored() {
        let connector = ScriptedConnector::default();
        let (signaling, _events) = channel(&connector);
        assert!(!signaling.handle_announcement(announcement("client-1", "peer-x")));
        assert!(signaling.resolve("client-1").is_none());
    }

    #[tokio::test]
    async fn local_id_is_kept_while_offline() {
        let connector = ScriptedConnector::default();
        let (signaling, _events) = channel(&connector);
        signaling.broadcast_peer_id("peer-local").unwrap();
        assert_eq!(signaling.local_peer_id().as_deref(), Some("peer-local"));
        assert_eq!(signaling.connection.outbox_size().await, 0);
    }
}
