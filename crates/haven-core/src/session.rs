use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use url::Url;

use crate::auth::{TokenProvider, validate_room_id};
use crate::call::{CallOptions, CallSessionController, PeerLink};
use crate::codec::{ChatMode, ClassifiedFrame, MessageCodec};
use crate::connection::{
    ConnectionEvent, ConnectionManager, ConnectionState, ConnectionTracker, Connector,
    NORMAL_CLOSURE,
};
use crate::errors::HavenError;
use crate::events::{EventBus, SessionEvent};
use crate::media::MediaDevices;
use crate::message::{Message, Sender};
use crate::outbox::QueuedMessage;
use crate::quality::StatsSource;
use crate::settings::Settings;
use crate::signaling::SignalingChannel;
use crate::store::MessageStore;

/// Where and how a session connects.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Socket base URL; the room id is appended as the last path segment.
    pub server_url: Url,
    pub settings: Settings,
}

impl SessionConfig {
    pub fn new(server_url: Url) -> Self {
        Self {
            server_url,
            settings: Settings::default(),
        }
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }
}

/// A user's chat session with one room: owns the socket, the message store
/// and the peer-id signaling that calls rely on.
///
/// Create one per chat screen and keep it for as long as the screen lives.
/// Dropping it closes the socket with a normal closure.
pub struct ChatSession {
    codec: MessageCodec,
    connection: Arc<ConnectionManager>,
    store: Arc<Mutex<MessageStore>>,
    bus: EventBus,
    signaling: SignalingChannel,
    settings: Settings,
    router: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ChatSession {
    /// Spawn the connection driver and the inbound router. Needs a running
    /// tokio runtime.
    pub fn new<C: Connector>(
        config: SessionConfig,
        user_id: impl Into<String>,
        mode: ChatMode,
        connector: C,
        tracker: Arc<ConnectionTracker>,
    ) -> Self {
        let SessionConfig {
            server_url,
            settings,
        } = config;
        let transport = &settings.transport;
        let codec = MessageCodec::new(user_id, mode);

        let (connection, events) =
            ConnectionManager::spawn(server_url, connector, transport, tracker);
        let connection = Arc::new(connection);
        let store = Arc::new(Mutex::new(MessageStore::with_window_ms(
            transport.dedup_window_ms,
        )));
        let bus = EventBus::new(transport.event_channel_capacity);
        let signaling = SignalingChannel::new(
            codec.clone(),
            connection.clone(),
            transport.event_channel_capacity,
        );

        let router = tokio::spawn(route(
            events,
            codec.clone(),
            store.clone(),
            bus.clone(),
            signaling.clone(),
        ));

        Self {
            codec,
            connection,
            store,
            bus,
            signaling,
            settings,
            router: std::sync::Mutex::new(Some(router)),
        }
    }

    /// Fetch a token and open the socket for `room_id`.
    pub async fn connect(&self, room_id: &str, tokens: &impl TokenProvider) -> Result<(), HavenError> {
        validate_room_id(room_id)?;
        let token = tokens.fetch_token().await.inspect_err(|e| {
            tracing::warn!("token fetch for room {room_id} failed: {e}");
        })?;
        tracing::info!("joining room {room_id} as {}", self.codec.user_id());
        self.connection.connect(room_id, &token)
    }

    /// Fetch a fresh token for later reconnects. Call it when the server
    /// rejects an expired token, then [`ChatSession::retry`].
    pub async fn refresh_token(&self, tokens: &impl TokenProvider) -> Result<(), HavenError> {
        let token = tokens.fetch_token().await?;
        self.connection.update_token(&token)
    }

    /// Store a message from the local user and send it, or queue it until
    /// the socket is open.
    pub async fn send_message(&self, text: &str) -> Result<Message, HavenError> {
        let content = text.trim();
        if content.is_empty() {
            return Err(HavenError::Protocol("cannot send an empty message".into()));
        }

        let message = Message::text(content, Sender::User, Utc::now());
        self.connection.send(QueuedMessage {
            message_id: message.id.clone(),
            payload: self.codec.serialize_chat(content),
        })?;

        self.store.lock().await.add(message.clone());
        self.bus.emit(SessionEvent::MessageReceived(message.clone()));
        Ok(message)
    }

    /// Typing indicators only go out on an open socket.
    pub fn send_typing(&self, is_typing: bool) -> Result<(), HavenError> {
        self.connection
            .send_transient(self.codec.serialize_typing(is_typing))
    }

    /// All messages, oldest first.
    pub async fn messages(&self) -> Vec<Message> {
        self.store.lock().await.all().to_vec()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub async fn outbox_size(&self) -> usize {
        self.connection.outbox_size().await
    }

    /// Reconnect after automatic retries gave up.
    pub fn retry(&self) -> Result<(), HavenError> {
        self.connection.retry()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.bus.subscribe()
    }

    pub fn signaling(&self) -> &SignalingChannel {
        &self.signaling
    }

    pub fn user_id(&self) -> &str {
        self.codec.user_id()
    }

    /// A call controller bound to this session's signaling and event bus.
    pub fn call_controller<D, L, S>(&self, devices: D, link: L, stats: S) -> CallSessionController<D, L, S>
    where
        D: MediaDevices,
        L: PeerLink,
        S: StatsSource,
    {
        CallSessionController::new(
            devices,
            link,
            stats,
            self.signaling.clone(),
            self.bus.clone(),
            CallOptions::from_settings(&self.settings),
        )
    }

    /// Close the socket with a normal closure and stop the background tasks.
    pub async fn shutdown(&self) {
        self.connection.shutdown().await;
        let router = self.router.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(router) = router {
            // The driver is gone, so the router drains what is left and ends.
            let _ = router.await;
        }
        tracing::info!("chat session closed");
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        let _ = self.connection.close(NORMAL_CLOSURE, "session dropped");
        if let Some(router) = self
            .router
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            router.abort();
        }
    }
}

/// Route connection events: frames through the codec into the store or the
/// signaling channel, everything else onto the session bus.
async fn route(
    mut events: mpsc::Receiver<ConnectionEvent>,
    codec: MessageCodec,
    store: Arc<Mutex<MessageStore>>,
    bus: EventBus,
    signaling: SignalingChannel,
) {
    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::StateChanged(state) => {
                bus.emit(SessionEvent::ConnectionStateChanged(state));
            }
            ConnectionEvent::Open => signaling.on_socket_open(),
            ConnectionEvent::Message(raw) => match codec.parse(&raw) {
                Ok(ClassifiedFrame::Chat(message)) => {
                    if store.lock().await.add(message.clone()) {
                        bus.emit(SessionEvent::MessageReceived(message));
                    } else {
                        tracing::debug!("duplicate message {} dropped", message.id);
                    }
                }
                Ok(ClassifiedFrame::Typing { user_id, is_typing }) => {
                    if user_id != codec.user_id() {
                        bus.emit(SessionEvent::Typing { user_id, is_typing });
                    }
                }
                Ok(ClassifiedFrame::PeerAnnouncement(announcement)) => {
                    if signaling.handle_announcement(announcement.clone()) {
                        bus.emit(SessionEvent::PeerAnnounced(announcement));
                    }
                }
                Ok(ClassifiedFrame::Control { kind, payload }) => {
                    tracing::debug!("control frame {kind}: {payload}");
                }
                Err(e) => tracing::warn!("dropping inbound frame: {e}"),
            },
            ConnectionEvent::Closed { code, reason } => {
                tracing::debug!("socket closed: {code} {reason}");
            }
            ConnectionEvent::Error(e) if e.is_retryable() => {
                tracing::debug!("transport error, reconnecting: {e}");
            }
            ConnectionEvent::Error(e) => bus.emit(SessionEvent::Error(e)),
            ConnectionEvent::RetriesExhausted { attempts } => {
                bus.emit(SessionEvent::Disconnected { attempts });
            }
        }
    }
    tracing::info!("session router ended");
}
