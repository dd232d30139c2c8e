use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use url::Url;

use super::state::{
    ABNORMAL_CLOSURE, CloseDisposition, ConnectionState, ConnectionStatus, HEARTBEAT_TIMEOUT,
    HeartbeatMonitor, NORMAL_CLOSURE, ReconnectPolicy,
};
use super::tracker::{ConnectionTracker, Registration};
use super::transport::{Connector, InboundFrame, OutboundFrame, Socket};
use crate::auth::{socket_url, validate_room_id};
use crate::errors::HavenError;
use crate::outbox::{Outbox, QueuedMessage};
use crate::settings::TransportSettings;

/// Events the connection driver publishes, in the order they happened.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    Open,
    Message(String),
    Closed { code: u16, reason: String },
    Error(HavenError),
    /// Automatic reconnection gave up; only [`ConnectionManager::retry`] resumes.
    RetriesExhausted { attempts: u32 },
}

enum Command {
    Connect { room_id: String, token: String },
    Send(QueuedMessage),
    SendTransient(String),
    Close { code: u16, reason: String },
    Retry,
    UpdateToken(String),
    OutboxSize(oneshot::Sender<usize>),
}

/// Handle to the task that owns the chat socket.
///
/// All socket state (status, retry counter, heartbeat misses, outbox) lives
/// inside the driver task; this handle only sends commands and reads
/// snapshots. Dropping the handle closes the socket with a normal closure.
pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Start the driver task. Returns the handle and the event stream.
    pub fn spawn<C: Connector>(
        server_url: Url,
        connector: C,
        settings: &TransportSettings,
        tracker: Arc<ConnectionTracker>,
    ) -> (Self, mpsc::Receiver<ConnectionEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(settings.event_channel_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(ConnectionState::default());

        let mut heartbeat = tokio::time::interval_at(
            Instant::now() + settings.heartbeat_interval(),
            settings.heartbeat_interval(),
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let driver = Driver {
            connector: Arc::new(connector),
            connect_timeout: settings.connect_timeout(),
            server_url,
            policy: ReconnectPolicy::from_settings(settings),
            heartbeat,
            heartbeat_monitor: HeartbeatMonitor::new(settings.heartbeat_max_failures),
            awaiting_pong: false,
            tracker,
            commands: command_rx,
            events: event_tx,
            state_tx,
            state: ConnectionState::default(),
            target: None,
            pending: None,
            link: None,
            reconnect_at: None,
            outbox: Outbox::new(),
        };
        let task = tokio::spawn(driver.run());

        let manager = Self {
            commands: command_tx,
            state: state_rx,
            task: Mutex::new(Some(task)),
        };
        (manager, event_rx)
    }

    /// Open the socket for `room_id`. Ignored while already open or
    /// connecting to that room.
    pub fn connect(&self, room_id: &str, token: &str) -> Result<(), HavenError> {
        validate_room_id(room_id)?;
        self.command(Command::Connect {
            room_id: room_id.to_string(),
            token: token.to_string(),
        })
    }

    /// Send a chat frame now, or queue it until the socket opens.
    pub fn send(&self, message: QueuedMessage) -> Result<(), HavenError> {
        self.command(Command::Send(message))
    }

    /// Send a frame only if the socket is open right now; otherwise drop it.
    pub fn send_transient(&self, payload: String) -> Result<(), HavenError> {
        self.command(Command::SendTransient(payload))
    }

    pub fn close(&self, code: u16, reason: &str) -> Result<(), HavenError> {
        self.command(Command::Close {
            code,
            reason: reason.to_string(),
        })
    }

    /// Reconnect by hand after automatic attempts were exhausted.
    pub fn retry(&self) -> Result<(), HavenError> {
        self.command(Command::Retry)
    }

    /// Use `token` for every later connect attempt. The live socket, if any,
    /// is left alone.
    pub fn update_token(&self, token: &str) -> Result<(), HavenError> {
        self.command(Command::UpdateToken(token.to_string()))
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub async fn outbox_size(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.command(Command::OutboxSize(tx)).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Close with a normal closure and wait for the driver to stop.
    pub async fn shutdown(&self) {
        let _ = self.close(NORMAL_CLOSURE, "session closed");
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            // Commands run in order: once this answers, the close went out.
            let _ = self.outbox_size().await;
            task.abort();
            let _ = task.await;
        }
    }

    fn command(&self, command: Command) -> Result<(), HavenError> {
        self.commands
            .send(command)
            .map_err(|_| HavenError::Transport("connection driver stopped".into()))
    }
}

#[derive(Debug, Clone)]
struct Target {
    room_id: String,
    token: String,
}

/// A socket together with its tracker slot; both go away together.
struct Link {
    socket: Socket,
    _registration: Registration,
}

impl Link {
    fn close(self, code: u16, reason: &str) {
        self.socket.close(code, reason);
    }
}

/// Aborts the connect attempt when dropped.
struct ConnectTask(JoinHandle<Result<Socket, HavenError>>);

impl Drop for ConnectTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// A connect attempt in flight. It holds its tracker slot until it either
/// becomes a [`Link`] or is dropped.
struct PendingConnect {
    task: ConnectTask,
    registration: Registration,
    room_id: String,
}

struct Driver<C> {
    connector: Arc<C>,
    connect_timeout: Duration,
    server_url: Url,
    policy: ReconnectPolicy,
    heartbeat: Interval,
    heartbeat_monitor: HeartbeatMonitor,
    /// A ping went out and nothing has come back since.
    awaiting_pong: bool,
    tracker: Arc<ConnectionTracker>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::Sender<ConnectionEvent>,
    state_tx: watch::Sender<ConnectionState>,
    state: ConnectionState,
    target: Option<Target>,
    pending: Option<PendingConnect>,
    link: Option<Link>,
    reconnect_at: Option<Instant>,
    outbox: Outbox,
}

impl<C: Connector> Driver<C> {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.teardown(NORMAL_CLOSURE, "session dropped").await;
                        break;
                    }
                },
                result = connect_result(&mut self.pending) => self.on_connected(result).await,
                frame = next_frame(&mut self.link) => self.handle_frame(frame).await,
                _ = self.heartbeat.tick(), if self.state.is_open() => self.send_heartbeat().await,
                _ = sleep_until(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.open().await;
                }
            }
        }
        tracing::info!("connection driver stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { room_id, token } => {
                let same_room = self.target.as_ref().is_some_and(|t| t.room_id == room_id);
                if same_room && self.state.is_live() {
                    tracing::debug!("connect ignored: room {room_id} already {:?}", self.state.status);
                    return;
                }
                if self.link.is_some() || self.pending.is_some() {
                    self.teardown(NORMAL_CLOSURE, "switching rooms").await;
                }
                self.target = Some(Target { room_id, token });
                self.reconnect_at = None;
                self.state.retry_count = 0;
                self.open().await;
            }
            Command::Send(message) => self.send_or_queue(message),
            Command::SendTransient(payload) => match &self.link {
                Some(link) if self.state.is_open() => {
                    if let Err(e) = link.socket.send(OutboundFrame::Text(payload)) {
                        tracing::debug!("transient frame lost: {e}");
                    }
                }
                _ => tracing::debug!("transient frame dropped while {:?}", self.state.status),
            },
            Command::Close { code, reason } => self.teardown(code, &reason).await,
            Command::Retry => {
                if self.target.is_none() || self.state.is_live() {
                    tracing::warn!("retry ignored while {:?}", self.state.status);
                    return;
                }
                tracing::info!("manual reconnect requested");
                self.reconnect_at = None;
                self.state.retry_count = 0;
                self.open().await;
            }
            Command::UpdateToken(token) => match &mut self.target {
                Some(target) => {
                    target.token = token;
                    tracing::debug!("token updated for room {}", target.room_id);
                }
                None => tracing::debug!("token update ignored: no room"),
            },
            Command::OutboxSize(reply) => {
                let _ = reply.send(self.outbox.size());
            }
        }
    }

    /// Re-checks the socket right before writing; frames that cannot go out
    /// now wait in the outbox.
    fn send_or_queue(&mut self, message: QueuedMessage) {
        if let (Some(link), true) = (&self.link, self.state.is_open()) {
            match link.socket.send(OutboundFrame::Text(message.payload.clone())) {
                Ok(()) => return,
                Err(e) => tracing::warn!("send failed, queueing message {}: {e}", message.message_id),
            }
        }
        self.outbox.enqueue(message);
        tracing::debug!("outbox holds {} message(s)", self.outbox.size());
    }

    async fn open(&mut self) {
        let Some(target) = self.target.clone() else {
            return;
        };

        self.state.status = ConnectionStatus::Connecting;
        self.publish().await;

        let url = match socket_url(&self.server_url, &target.room_id, &target.token) {
            Ok(url) => url,
            Err(e) => return self.fail_terminal(e).await,
        };
        let registration = match self.tracker.register(&target.room_id) {
            Ok(registration) => registration,
            Err(e) => return self.fail_terminal(e).await,
        };

        // Runs beside the command loop so a close can cancel it.
        let connector = self.connector.clone();
        let timeout = self.connect_timeout;
        let task = tokio::spawn(async move {
            match tokio::time::timeout(timeout, connector.connect(&url)).await {
                Ok(result) => result,
                Err(_) => Err(HavenError::Transport(format!(
                    "connect timed out after {timeout:?}"
                ))),
            }
        });
        self.pending = Some(PendingConnect {
            task: ConnectTask(task),
            registration,
            room_id: target.room_id,
        });
    }

    async fn on_connected(&mut self, result: Result<Socket, HavenError>) {
        let Some(PendingConnect {
            registration,
            room_id,
            ..
        }) = self.pending.take()
        else {
            return;
        };

        match result {
            Ok(socket) => {
                self.link = Some(Link {
                    socket,
                    _registration: registration,
                });
                self.on_open().await;
            }
            Err(e) if e.is_retryable() => {
                drop(registration);
                tracing::warn!("connect to room {room_id} failed: {e}");
                self.emit(ConnectionEvent::Error(e.clone())).await;
                self.schedule_reconnect(e.to_string()).await;
            }
            Err(e) => {
                drop(registration);
                self.fail_terminal(e).await;
            }
        }
    }

    async fn on_open(&mut self) {
        self.heartbeat_monitor.reset();
        self.heartbeat.reset();
        self.awaiting_pong = false;
        self.state = ConnectionState {
            status: ConnectionStatus::Open,
            retry_count: 0,
            last_error: None,
        };
        tracing::info!("socket open");
        self.publish().await;

        if let Some(link) = &self.link {
            let report = self
                .outbox
                .flush(|m| link.socket.send(OutboundFrame::Text(m.payload.clone())));
            if report.sent > 0 || report.requeued > 0 {
                tracing::info!(
                    "outbox flushed: {} sent, {} requeued",
                    report.sent,
                    report.requeued
                );
            }
        }
        self.emit(ConnectionEvent::Open).await;
    }

    async fn handle_frame(&mut self, frame: InboundFrame) {
        match frame {
            InboundFrame::Text(raw) => {
                self.awaiting_pong = false;
                self.emit(ConnectionEvent::Message(raw)).await;
            }
            InboundFrame::Pong => self.awaiting_pong = false,
            InboundFrame::Closed { code, reason } => {
                // The peer already closed; just release our end.
                self.link = None;
                tracing::info!("socket closed by server: {code} {reason}");
                self.emit(ConnectionEvent::Closed {
                    code,
                    reason: reason.clone(),
                })
                .await;

                match self.policy.disposition(code) {
                    CloseDisposition::Normal => {
                        self.state = ConnectionState::default();
                        self.publish().await;
                    }
                    CloseDisposition::Terminal => {
                        let e = HavenError::Auth(format!("server rejected connection ({code}): {reason}"));
                        self.fail_terminal(e).await;
                    }
                    CloseDisposition::Retry => {
                        let reason = if reason.is_empty() {
                            format!("closed with code {code}")
                        } else {
                            reason
                        };
                        self.schedule_reconnect(reason).await;
                    }
                }
            }
        }
    }

    async fn send_heartbeat(&mut self) {
        let Some(link) = &self.link else {
            return;
        };
        // A beat is missed when the last ping got no answer or this one
        // cannot be written.
        let answered = !self.awaiting_pong;
        let sent = link.socket.send(OutboundFrame::Ping).is_ok();
        self.awaiting_pong = true;
        if !self.heartbeat_monitor.record(answered && sent) {
            return;
        }

        tracing::warn!(
            "{} consecutive heartbeats failed, dropping socket",
            self.heartbeat_monitor.failures()
        );
        if let Some(link) = self.link.take() {
            link.close(HEARTBEAT_TIMEOUT, "heartbeat lost");
        }
        self.emit(ConnectionEvent::Closed {
            code: ABNORMAL_CLOSURE,
            reason: "heartbeat lost".into(),
        })
        .await;
        self.schedule_reconnect("heartbeat lost".into()).await;
    }

    async fn schedule_reconnect(&mut self, reason: String) {
        let attempt = self.state.retry_count + 1;
        self.state.status = ConnectionStatus::Closed;

        if !self.policy.allows(attempt) {
            tracing::warn!("giving up after {} reconnect attempts: {reason}", self.state.retry_count);
            self.state.last_error = Some(format!(
                "disconnected after {} attempts: {reason}",
                self.state.retry_count
            ));
            self.publish().await;
            self.emit(ConnectionEvent::RetriesExhausted {
                attempts: self.state.retry_count,
            })
            .await;
            return;
        }

        let delay = self.policy.delay_for(attempt);
        self.state.retry_count = attempt;
        self.state.last_error = Some(reason);
        self.reconnect_at = Some(Instant::now() + delay);
        tracing::warn!(
            "reconnecting in {delay:?} (attempt {attempt}/{})",
            self.policy.max_attempts()
        );
        self.publish().await;
    }

    /// Errors retrying cannot fix: surface them and wait for new input.
    async fn fail_terminal(&mut self, e: HavenError) {
        tracing::warn!("connection refused: {e}");
        self.reconnect_at = None;
        self.state.status = ConnectionStatus::Closed;
        self.state.last_error = Some(e.to_string());
        self.publish().await;
        self.emit(ConnectionEvent::Error(e)).await;
    }

    async fn teardown(&mut self, code: u16, reason: &str) {
        self.reconnect_at = None;
        if let Some(pending) = self.pending.take() {
            tracing::info!("connect to room {} cancelled: {code} {reason}", pending.room_id);
        }
        if let Some(link) = self.link.take() {
            tracing::info!("closing socket: {code} {reason}");
            link.close(code, reason);
            self.emit(ConnectionEvent::Closed {
                code,
                reason: reason.to_string(),
            })
            .await;
        }
        let status = if code == NORMAL_CLOSURE {
            ConnectionStatus::Idle
        } else {
            ConnectionStatus::Closed
        };
        if self.state.status != status || self.state.retry_count != 0 {
            self.state.status = status;
            self.state.retry_count = 0;
            self.publish().await;
        }
    }

    async fn publish(&mut self) {
        self.state_tx.send_replace(self.state.clone());
        self.emit(ConnectionEvent::StateChanged(self.state.clone())).await;
    }

    async fn emit(&self, event: ConnectionEvent) {
        if self.events.send(event).await.is_err() {
            tracing::trace!("no connection event listener");
        }
    }
}

async fn connect_result(pending: &mut Option<PendingConnect>) -> Result<Socket, HavenError> {
    match pending {
        Some(pending) => (&mut pending.task.0)
            .await
            .unwrap_or_else(|e| Err(HavenError::Transport(format!("connect task failed: {e}")))),
        None => std::future::pending().await,
    }
}

async fn next_frame(link: &mut Option<Link>) -> InboundFrame {
    match link {
        Some(link) => link.socket.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
