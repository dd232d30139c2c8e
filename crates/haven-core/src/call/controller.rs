use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::participants::{CallParticipant, ParticipantRoster};
use super::state::{CallPhase, CallState};
use crate::errors::HavenError;
use crate::events::{EventBus, SessionEvent, TrackKind};
use crate::media::{MediaConstraints, MediaDevices, MediaStreamManager, MediaTrack};
use crate::quality::{NetworkQualityMonitor, NetworkStats, StatsSource};
use crate::settings::Settings;
use crate::signaling::SignalingChannel;

const TICK: Duration = Duration::from_secs(1);

/// The peer-to-peer media connection, implemented by the platform.
pub trait PeerLink: Send + Sync + 'static {
    /// Place a call to `peer_id`, offering `tracks`.
    fn dial(
        &self,
        peer_id: &str,
        tracks: &[MediaTrack],
    ) -> impl Future<Output = Result<(), HavenError>> + Send;

    /// Answer the offer received from `peer_id`.
    fn answer(
        &self,
        peer_id: &str,
        tracks: &[MediaTrack],
    ) -> impl Future<Output = Result<(), HavenError>> + Send;

    /// Swap the outgoing video track without renegotiating.
    fn replace_video_track(
        &self,
        track: &MediaTrack,
    ) -> impl Future<Output = Result<(), HavenError>> + Send;

    fn hang_up(&self, peer_id: &str);
}

/// Per-session call preferences.
#[derive(Debug, Clone, PartialEq)]
pub struct CallOptions {
    pub mic_enabled_on_join: bool,
    pub camera_enabled_on_join: bool,
    pub stats_interval: Duration,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl CallOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            mic_enabled_on_join: settings.mic_enabled_on_join,
            camera_enabled_on_join: settings.camera_enabled_on_join,
            stats_interval: settings.transport.stats_interval(),
        }
    }
}

struct Call<D, L, S> {
    phase: CallPhase,
    state: CallState,
    roster: ParticipantRoster,
    media: MediaStreamManager<D>,
    link: L,
    quality: NetworkQualityMonitor<S>,
    /// Bumped whenever a call ends; timers of an older call stop themselves.
    generation: u64,
    recording_generation: u64,
}

#[derive(Default)]
struct Timers {
    duration: Option<JoinHandle<()>>,
    recording: Option<JoinHandle<()>>,
    sampler: Option<JoinHandle<()>>,
}

impl Timers {
    fn stop_all(&mut self) {
        for task in [
            self.duration.take(),
            self.recording.take(),
            self.sampler.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
    }
}

#[derive(Clone, Copy)]
enum Counter {
    CallDuration,
    RecordingDuration,
}

/// State machine for the session's one call.
///
/// Illegal transitions are logged and ignored: remote call events and user
/// input race, so a stale command must not fail loudly. Every phase and
/// state change is published on the session's [`EventBus`].
pub struct CallSessionController<D, L, S> {
    call: Arc<Mutex<Call<D, L, S>>>,
    timers: std::sync::Mutex<Timers>,
    signaling: SignalingChannel,
    bus: EventBus,
    options: CallOptions,
}

impl<D, L, S> CallSessionController<D, L, S>
where
    D: MediaDevices,
    L: PeerLink,
    S: StatsSource,
{
    pub fn new(
        devices: D,
        link: L,
        stats: S,
        signaling: SignalingChannel,
        bus: EventBus,
        options: CallOptions,
    ) -> Self {
        let call = Call {
            phase: CallPhase::Idle,
            state: CallState::default(),
            roster: ParticipantRoster::new(),
            media: MediaStreamManager::new(devices),
            link,
            quality: NetworkQualityMonitor::new(stats),
            generation: 0,
            recording_generation: 0,
        };
        Self {
            call: Arc::new(Mutex::new(call)),
            timers: std::sync::Mutex::new(Timers::default()),
            signaling,
            bus,
            options,
        }
    }

    pub async fn phase(&self) -> CallPhase {
        self.call.lock().await.phase
    }

    pub async fn state(&self) -> CallState {
        self.call.lock().await.state.clone()
    }

    pub async fn participants(&self) -> Vec<CallParticipant> {
        self.call.lock().await.roster.participants().to_vec()
    }

    /// Remote tracks of `peer_id`, for the rendering layer.
    pub async fn remote_tracks(&self, peer_id: &str) -> Vec<MediaTrack> {
        self.call.lock().await.media.remote_tracks(peer_id).to_vec()
    }

    pub async fn local_tracks(&self) -> Vec<MediaTrack> {
        self.call.lock().await.media.local_tracks().to_vec()
    }

    pub async fn active_track_count(&self) -> usize {
        self.call.lock().await.media.active_track_count()
    }

    /// The most recent network sample, while a call is active.
    pub async fn network_stats(&self) -> Option<NetworkStats> {
        self.call.lock().await.quality.latest().cloned()
    }

    /// Call `participants`. Returns false if not idle, if local media cannot
    /// be opened, or if a participant has no announced peer id.
    pub async fn start_call(&self, participants: Vec<CallParticipant>) -> bool {
        let mut call = self.call.lock().await;
        if call.phase != CallPhase::Idle {
            tracing::warn!("start_call ignored while {:?}", call.phase);
            return false;
        }
        if participants.is_empty() {
            tracing::warn!("start_call without participants");
            return false;
        }

        let mut targets = Vec::with_capacity(participants.len());
        for participant in &participants {
            match self.signaling.resolve(&participant.id) {
                Some(peer_id) => targets.push(peer_id),
                None => {
                    tracing::warn!("cannot call {}: no peer id announced", participant.id);
                    return false;
                }
            }
        }

        let tracks = match self.acquire_media(&mut call).await {
            Ok(tracks) => tracks,
            Err(_) => return false,
        };
        for (i, peer_id) in targets.iter().enumerate() {
            if let Err(e) = call.link.dial(peer_id, &tracks).await {
                tracing::warn!("dialing {peer_id} failed: {e}");
                for dialed in &targets[..i] {
                    call.link.hang_up(dialed);
                }
                call.media.release_local();
                return false;
            }
        }

        tracing::info!("calling {} participant(s)", participants.len());
        for (participant, peer_id) in participants.into_iter().zip(targets) {
            if call.roster.add(participant.clone(), peer_id) {
                self.bus.emit(SessionEvent::ParticipantJoined(participant));
            }
        }
        call.state.is_in_call = true;
        call.state.is_call_outgoing = true;
        self.apply_join_preferences(&mut call);
        self.set_phase(&mut call, CallPhase::Outgoing);
        self.publish_state(&call);
        true
    }

    /// The remote party's offer arrived.
    pub async fn on_incoming_call(&self, caller: CallParticipant, peer_id: &str) {
        let mut call = self.call.lock().await;
        if call.phase != CallPhase::Idle {
            tracing::warn!("incoming call from {} ignored while {:?}", caller.id, call.phase);
            return;
        }
        tracing::info!("incoming call from {}", caller.id);
        call.roster.add(caller.clone(), peer_id);
        call.state = CallState {
            is_in_call: true,
            is_call_incoming: true,
            ..CallState::default()
        };
        self.bus.emit(SessionEvent::IncomingCall(caller.clone()));
        self.bus.emit(SessionEvent::ParticipantJoined(caller));
        self.set_phase(&mut call, CallPhase::Incoming);
        self.publish_state(&call);
    }

    /// Answer an incoming call. A media error leaves the call ringing.
    pub async fn accept_call(&self) -> Result<(), HavenError> {
        let mut call = self.call.lock().await;
        if call.phase != CallPhase::Incoming {
            tracing::warn!("accept_call ignored while {:?}", call.phase);
            return Ok(());
        }

        let tracks = self.acquire_media(&mut call).await?;
        for peer_id in call.roster.peer_ids() {
            if let Err(e) = call.link.answer(&peer_id, &tracks).await {
                tracing::warn!("answering {peer_id} failed: {e}");
                call.media.release_local();
                self.bus.emit(SessionEvent::Error(e.clone()));
                return Err(e);
            }
        }
        self.apply_join_preferences(&mut call);
        self.activate(&mut call);
        Ok(())
    }

    pub async fn reject_call(&self) {
        let mut call = self.call.lock().await;
        match call.phase {
            CallPhase::Incoming | CallPhase::Outgoing => {
                tracing::info!("call rejected");
                self.finish(&mut call);
            }
            phase => tracing::warn!("reject_call ignored while {phase:?}"),
        }
    }

    pub async fn end_call(&self) {
        let mut call = self.call.lock().await;
        if !call.phase.in_call() {
            tracing::warn!("end_call ignored while {:?}", call.phase);
            return;
        }
        tracing::info!("call ended after {}s", call.state.call_duration);
        self.finish(&mut call);
    }

    /// Media with the callee is flowing.
    pub async fn on_remote_connected(&self, peer_id: &str) {
        let mut call = self.call.lock().await;
        match call.phase {
            CallPhase::Outgoing => {
                tracing::info!("{peer_id} answered");
                self.activate(&mut call);
            }
            CallPhase::Active => tracing::debug!("{peer_id} connected to an active call"),
            phase => tracing::warn!("remote connect from {peer_id} ignored while {phase:?}"),
        }
    }

    pub async fn on_remote_rejected(&self, peer_id: &str) {
        let mut call = self.call.lock().await;
        if call.phase != CallPhase::Outgoing {
            tracing::warn!("remote reject from {peer_id} ignored while {:?}", call.phase);
            return;
        }
        tracing::info!("{peer_id} declined the call");
        self.drop_peer(&mut call, peer_id);
    }

    /// The remote side hung up. The call ends when the last party leaves.
    pub async fn on_remote_hangup(&self, peer_id: &str) {
        let mut call = self.call.lock().await;
        if !call.phase.in_call() {
            tracing::debug!("hang-up from {peer_id} after the call ended");
            return;
        }
        tracing::info!("{peer_id} hung up");
        self.drop_peer(&mut call, peer_id);
    }

    pub async fn on_remote_track(&self, peer_id: &str, track: MediaTrack) {
        let mut call = self.call.lock().await;
        if !call.phase.in_call() {
            tracing::warn!("remote track {} from {peer_id} outside a call", track.id);
            return;
        }
        call.media.add_remote_track(peer_id, track.clone());
        self.bus.emit(SessionEvent::RemoteTrackAdded {
            peer_id: peer_id.to_string(),
            track,
        });
    }

    pub async fn on_remote_track_removed(&self, peer_id: &str, track_id: &str) {
        let mut call = self.call.lock().await;
        if call.media.remove_remote_track(peer_id, track_id).is_some() {
            self.bus.emit(SessionEvent::RemoteTrackRemoved {
                peer_id: peer_id.to_string(),
                track_id: track_id.to_string(),
            });
        }
    }

    /// The remote party muted, unmuted, or switched their camera.
    pub async fn on_remote_media_state(&self, peer_id: &str, muted: Option<bool>, video_enabled: Option<bool>) {
        let mut call = self.call.lock().await;
        let Some(id) = call.roster.by_peer(peer_id).map(str::to_string) else {
            tracing::debug!("media state for unknown peer {peer_id}");
            return;
        };
        if let Some(participant) = call.roster.participant_mut(&id) {
            if let Some(muted) = muted {
                participant.is_muted = muted;
            }
            if let Some(video_enabled) = video_enabled {
                participant.is_video_enabled = video_enabled;
            }
            let updated = participant.clone();
            self.bus.emit(SessionEvent::ParticipantUpdated(updated));
        }
    }

    pub async fn toggle_mute(&self) {
        let mut call = self.call.lock().await;
        if call.phase != CallPhase::Active {
            tracing::warn!("toggle_mute ignored while {:?}", call.phase);
            return;
        }
        let muted = !call.state.is_muted;
        if !call.media.set_enabled(TrackKind::Audio, !muted) {
            tracing::warn!("toggle_mute: no microphone track");
            return;
        }
        call.state.is_muted = muted;
        tracing::info!("microphone muted: {muted}");
        self.publish_state(&call);
    }

    pub async fn toggle_video(&self) {
        let mut call = self.call.lock().await;
        if call.phase != CallPhase::Active {
            tracing::warn!("toggle_video ignored while {:?}", call.phase);
            return;
        }
        let enabled = !call.state.is_video_enabled;
        if !call.media.set_enabled(TrackKind::Video, enabled) {
            tracing::warn!("toggle_video: no camera track");
            return;
        }
        call.state.is_video_enabled = enabled;
        tracing::info!("camera enabled: {enabled}");
        self.publish_state(&call);
    }

    /// Start sharing the screen in place of the camera, or stop and put the
    /// camera back.
    pub async fn toggle_screen_share(&self) -> Result<(), HavenError> {
        let mut call = self.call.lock().await;
        if call.phase != CallPhase::Active {
            tracing::warn!("toggle_screen_share ignored while {:?}", call.phase);
            return Ok(());
        }
        if call.state.is_screen_sharing {
            return self.stop_sharing(&mut call).await;
        }

        let screen = match call.media.start_screen_share().await {
            Ok(screen) => screen,
            Err(e) => {
                tracing::warn!("screen share unavailable: {e}");
                self.bus.emit(SessionEvent::Error(e.clone()));
                return Err(e);
            }
        };
        if let Err(e) = call.link.replace_video_track(&screen).await {
            tracing::warn!("could not send screen track: {e}");
            call.media.stop_screen_share();
            return Err(e);
        }
        call.state.is_screen_sharing = true;
        self.publish_state(&call);
        Ok(())
    }

    /// The OS ended the share (e.g. the user clicked "stop sharing").
    pub async fn on_screen_share_ended(&self) {
        let mut call = self.call.lock().await;
        if call.state.is_screen_sharing {
            if let Err(e) = self.stop_sharing(&mut call).await {
                tracing::warn!("restoring camera after screen share: {e}");
            }
        }
    }

    pub async fn start_recording(&self) {
        let mut call = self.call.lock().await;
        if call.phase != CallPhase::Active || call.state.is_recording {
            tracing::warn!(
                "start_recording ignored while {:?} (recording: {})",
                call.phase,
                call.state.is_recording
            );
            return;
        }
        call.recording_generation += 1;
        call.state.is_recording = true;
        call.state.recording_duration = 0;
        let task = self.spawn_ticker(Counter::RecordingDuration, call.recording_generation);
        self.timers().recording = Some(task);
        tracing::info!("recording started");
        self.publish_state(&call);
    }

    /// Stops the recording clock; the last duration stays readable.
    pub async fn stop_recording(&self) {
        let mut call = self.call.lock().await;
        if call.phase != CallPhase::Active || !call.state.is_recording {
            tracing::warn!("stop_recording ignored while {:?}", call.phase);
            return;
        }
        call.recording_generation += 1;
        if let Some(task) = self.timers().recording.take() {
            task.abort();
        }
        call.state.is_recording = false;
        tracing::info!("recording stopped after {}s", call.state.recording_duration);
        self.publish_state(&call);
    }

    async fn acquire_media(&self, call: &mut Call<D, L, S>) -> Result<Vec<MediaTrack>, HavenError> {
        let tracks = match call.media.acquire_local(MediaConstraints::default()).await {
            Ok(tracks) => tracks.to_vec(),
            Err(e) => {
                tracing::warn!("local media unavailable: {e}");
                call.media.release_local();
                self.bus.emit(SessionEvent::Error(e.clone()));
                return Err(e);
            }
        };

        call.media
            .set_enabled(TrackKind::Audio, self.options.mic_enabled_on_join);
        call.media
            .set_enabled(TrackKind::Video, self.options.camera_enabled_on_join);
        Ok(tracks)
    }

    /// Mirror the join preferences applied in `acquire_media` into the state.
    fn apply_join_preferences(&self, call: &mut Call<D, L, S>) {
        call.state.is_muted = !self.options.mic_enabled_on_join;
        call.state.is_video_enabled =
            self.options.camera_enabled_on_join && call.media.camera_track().is_some();
    }

    async fn stop_sharing(&self, call: &mut Call<D, L, S>) -> Result<(), HavenError> {
        let camera = call.media.stop_screen_share();
        call.state.is_screen_sharing = false;
        self.publish_state(call);
        match camera {
            Some(camera) => call.link.replace_video_track(&camera).await,
            None => Ok(()),
        }
    }

    fn activate(&self, call: &mut Call<D, L, S>) {
        call.state.is_call_active = true;
        call.state.is_call_outgoing = false;
        call.state.is_call_incoming = false;
        call.state.call_duration = 0;
        call.quality.reset();

        let duration = self.spawn_ticker(Counter::CallDuration, call.generation);
        let sampler = self.spawn_sampler(call.generation);
        {
            let mut timers = self.timers();
            timers.duration = Some(duration);
            timers.sampler = Some(sampler);
        }

        tracing::info!("call active");
        self.set_phase(call, CallPhase::Active);
        self.publish_state(call);
    }

    fn drop_peer(&self, call: &mut Call<D, L, S>, peer_id: &str) {
        call.media.remove_peer(peer_id);
        if let Some(id) = call.roster.by_peer(peer_id).map(str::to_string) {
            call.roster.remove(&id);
            self.bus.emit(SessionEvent::ParticipantLeft(id));
        }
        if call.roster.is_empty() {
            self.finish(call);
        }
    }

    /// Tear the call down and go back to idle.
    fn finish(&self, call: &mut Call<D, L, S>) {
        call.generation += 1;
        call.recording_generation += 1;
        self.timers().stop_all();

        for peer_id in call.roster.peer_ids() {
            call.link.hang_up(&peer_id);
        }
        call.media.stop_all();
        call.quality.reset();
        for participant in call.roster.participants() {
            self.bus.emit(SessionEvent::ParticipantLeft(participant.id.clone()));
        }
        call.roster.clear();
        call.state = CallState::default();

        self.set_phase(call, CallPhase::Ended);
        self.set_phase(call, CallPhase::Idle);
        self.publish_state(call);
    }

    fn set_phase(&self, call: &mut Call<D, L, S>, phase: CallPhase) {
        if call.phase != phase {
            tracing::debug!("call phase {:?} -> {phase:?}", call.phase);
            call.phase = phase;
            self.bus.emit(SessionEvent::CallPhaseChanged(phase));
        }
    }

    fn publish_state(&self, call: &Call<D, L, S>) {
        self.bus.emit(SessionEvent::CallStateChanged(call.state.clone()));
    }

    fn spawn_ticker(&self, counter: Counter, generation: u64) -> JoinHandle<()> {
        let call = self.call.clone();
        let bus = self.bus.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + TICK, TICK);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let mut call = call.lock().await;
                let current = match counter {
                    Counter::CallDuration => call.generation,
                    Counter::RecordingDuration => call.recording_generation,
                };
                if current != generation {
                    break;
                }
                match counter {
                    Counter::CallDuration => call.state.call_duration += 1,
                    Counter::RecordingDuration => call.state.recording_duration += 1,
                }
                bus.emit(SessionEvent::CallStateChanged(call.state.clone()));
            }
        })
    }

    fn spawn_sampler(&self, generation: u64) -> JoinHandle<()> {
        let call = self.call.clone();
        let bus = self.bus.clone();
        let every = self.options.stats_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let mut call = call.lock().await;
                if call.generation != generation || call.phase != CallPhase::Active {
                    break;
                }
                match call.quality.sample() {
                    Ok(stats) => {
                        let quality = stats.quality();
                        tracing::debug!("network sample: {stats:?} ({quality:?})");
                        bus.emit(SessionEvent::NetworkQualityChanged { stats, quality });
                    }
                    Err(e) => tracing::debug!("network sample failed: {e}"),
                }
            }
        })
    }

    fn timers(&self) -> std::sync::MutexGuard<'_, Timers> {
        self.timers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<D, L, S> Drop for CallSessionController<D, L, S> {
    fn drop(&mut self) {
        self.timers
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .stop_all();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Default)]
    struct LinkLog {
        fail_dial: bool,
        fail_answer: bool,
        dialed: Vec<String>,
        answered: Vec<String>,
        hung_up: Vec<String>,
        video: Vec<String>,
    }

    /// Records what the controller asks of the peer connection.
    #[derive(Clone, Default)]
    pub(crate) struct FakeLink {
        log: Arc<Mutex<LinkLog>>,
    }

    impl FakeLink {
        pub(crate) fn fail_dial(&self) {
            self.log.lock().unwrap().fail_dial = true;
        }

        pub(crate) fn fail_answer(&self) {
            self.log.lock().unwrap().fail_answer = true;
        }

        pub(crate) fn dialed(&self) -> Vec<String> {
            self.log.lock().unwrap().dialed.clone()
        }

        pub(crate) fn answered(&self) -> Vec<String> {
            self.log.lock().unwrap().answered.clone()
        }

        pub(crate) fn hung_up(&self) -> Vec<String> {
            self.log.lock().unwrap().hung_up.clone()
        }

        /// Ids of the outgoing video tracks, in replacement order.
        pub(crate) fn video(&self) -> Vec<String> {
            self.log.lock().unwrap().video.clone()
        }
    }

    impl PeerLink for FakeLink {
        async fn dial(&self, peer_id: &str, _tracks: &[MediaTrack]) -> Result<(), HavenError> {
            let mut log = self.log.lock().unwrap();
            if log.fail_dial {
                return Err(HavenError::Transport(format!("{peer_id} unreachable")));
            }
            log.dialed.push(peer_id.to_string());
            Ok(())
        }

        async fn answer(&self, peer_id: &str, _tracks: &[MediaTrack]) -> Result<(), HavenError> {
            let mut log = self.log.lock().unwrap();
            if log.fail_answer {
                return Err(HavenError::Transport("offer expired".into()));
            }
            log.answered.push(peer_id.to_string());
            Ok(())
        }

        async fn replace_video_track(&self, track: &MediaTrack) -> Result<(), HavenError> {
            self.log.lock().unwrap().video.push(track.id.clone());
            Ok(())
        }

        fn hang_up(&self, peer_id: &str) {
            self.log.lock().unwrap().hung_up.push(peer_id.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::broadcast;
    use url::Url;

    use super::testing::FakeLink;
    use super::*;
    use crate::codec::{ChatMode, MessageCodec, PeerAnnouncement};
    use crate::connection::testing::ScriptedConnector;
    use crate::connection::{ConnectionManager, ConnectionTracker};
    use crate::events::{ConnectionQuality, TrackSource};
    use crate::media::testing::FakeDevices;
    use crate::quality::StatsReport;
    use crate::quality::testing::ScriptedStats;
    use crate::settings::TransportSettings;

    type Controller = CallSessionController<FakeDevices, FakeLink, ScriptedStats>;

    struct Harness {
        controller: Controller,
        devices: FakeDevices,
        link: FakeLink,
        stats: ScriptedStats,
        events: broadcast::Receiver<SessionEvent>,
    }

    fn harness_with(options: CallOptions) -> Harness {
        let (manager, _connection_events) = ConnectionManager::spawn(
            Url::parse("ws://localhost/ws").unwrap(),
            ScriptedConnector::default(),
            &TransportSettings::default(),
            ConnectionTracker::new(4),
        );
        let signaling = SignalingChannel::new(
            MessageCodec::new("client-1", ChatMode::Peer),
            Arc::new(manager),
            8,
        );
        signaling.handle_announcement(PeerAnnouncement {
            peer_id: "peer-t1".into(),
            user_id: "t1".into(),
            timestamp: None,
        });

        let bus = EventBus::new(256);
        let events = bus.subscribe();
        let devices = FakeDevices::default();
        let link = FakeLink::default();
        let stats = ScriptedStats::default();
        let controller = CallSessionController::new(
            devices.clone(),
            link.clone(),
            stats.clone(),
            signaling,
            bus,
            options,
        );
        Harness {
            controller,
            devices,
            link,
            stats,
            events,
        }
    }

    fn harness() -> Harness {
        harness_with(CallOptions::default())
    }

    fn therapist() -> CallParticipant {
        CallParticipant {
            is_therapist: true,
            ..CallParticipant::new("t1", "Dr. Amari")
        }
    }

    fn drain(events: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    async fn active_call(h: &Harness) {
        assert!(h.controller.start_call(vec![therapist()]).await);
        h.controller.on_remote_connected("peer-t1").await;
        assert_eq!(h.controller.phase().await, CallPhase::Active);
    }

    async fn assert_reset(controller: &Controller) {
        assert_eq!(controller.phase().await, CallPhase::Idle);
        assert_eq!(controller.state().await, CallState::default());
        assert_eq!(controller.active_track_count().await, 0);
        assert!(controller.participants().await.is_empty());
    }

    #[tokio::test]
    async fn outgoing_call_cannot_be_accepted_and_ends_idle() {
        let mut h = harness();
        assert!(h.controller.start_call(vec![therapist()]).await);
        assert_eq!(h.controller.phase().await, CallPhase::Outgoing);
        let state = h.controller.state().await;
        assert!(state.is_in_call && state.is_call_outgoing && !state.is_call_active);
        assert_eq!(h.link.dialed(), ["peer-t1"]);

        h.controller.accept_call().await.unwrap();
        assert_eq!(h.controller.phase().await, CallPhase::Outgoing);

        h.controller.end_call().await;
        assert_reset(&h.controller).await;
        assert_eq!(h.controller.state().await.call_duration, 0);
        assert_eq!(h.link.hung_up(), ["peer-t1"]);

        let phases: Vec<CallPhase> = drain(&mut h.events)
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::CallPhaseChanged(phase) => Some(phase),
                _ => None,
            })
            .collect();
        assert_eq!(phases, [CallPhase::Outgoing, CallPhase::Ended, CallPhase::Idle]);
    }

    #[tokio::test]
    async fn start_call_needs_an_announced_peer() {
        let h = harness();
        let stranger = CallParticipant::new("u9", "Unknown");
        assert!(!h.controller.start_call(vec![stranger]).await);
        assert_eq!(h.controller.phase().await, CallPhase::Idle);
        assert_eq!(h.devices.opened(), 0);
    }

    #[tokio::test]
    async fn denied_media_aborts_start_call() {
        let mut h = harness();
        h.devices.deny_user_media(true);
        assert!(!h.controller.start_call(vec![therapist()]).await);
        assert_reset(&h.controller).await;
        assert!(h.link.dialed().is_empty());
        assert!(drain(&mut h.events)
            .iter()
            .any(|e| matches!(e, SessionEvent::Error(HavenError::Media(_)))));
    }

    #[tokio::test]
    async fn failed_dial_releases_media() {
        let h = harness();
        h.link.fail_dial();
        assert!(!h.controller.start_call(vec![therapist()]).await);
        assert_reset(&h.controller).await;
        assert_eq!(h.devices.opened(), 1);
    }

    #[tokio::test]
    async fn second_call_is_refused_while_in_call() {
        let h = harness();
        assert!(h.controller.start_call(vec![therapist()]).await);
        assert!(!h.controller.start_call(vec![therapist()]).await);
        assert_eq!(h.link.dialed().len(), 1);
    }

    #[tokio::test]
    async fn toggles_are_ignored_when_idle() {
        let h = harness();
        h.controller.toggle_mute().await;
        h.controller.toggle_video().await;
        h.controller.toggle_screen_share().await.unwrap();
        h.controller.start_recording().await;
        h.controller.end_call().await;
        assert_eq!(h.controller.state().await, CallState::default());
        assert!(h.devices.enabled_calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn accepted_call_counts_duration_until_it_ends() {
        let h = harness();
        h.controller.on_incoming_call(therapist(), "peer-t1").await;
        assert_eq!(h.controller.phase().await, CallPhase::Incoming);
        assert!(h.controller.state().await.is_call_incoming);

        h.controller.accept_call().await.unwrap();
        assert_eq!(h.link.answered(), ["peer-t1"]);
        let state = h.controller.state().await;
        assert!(state.is_call_active && !state.is_call_incoming);

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(h.controller.state().await.call_duration, 3);

        h.controller.end_call().await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_reset(&h.controller).await;
    }

    #[tokio::test]
    async fn denied_media_keeps_the_call_ringing() {
        let h = harness();
        h.controller.on_incoming_call(therapist(), "peer-t1").await;
        h.devices.deny_user_media(true);

        let err = h.controller.accept_call().await.unwrap_err();
        assert!(matches!(err, HavenError::Media(_)));
        assert_eq!(h.controller.phase().await, CallPhase::Incoming);
        assert!(h.link.answered().is_empty());

        h.devices.deny_user_media(false);
        h.controller.accept_call().await.unwrap();
        assert_eq!(h.controller.phase().await, CallPhase::Active);
    }

    #[tokio::test]
    async fn failed_answer_releases_media() {
        let h = harness();
        h.controller.on_incoming_call(therapist(), "peer-t1").await;
        h.link.fail_answer();
        assert!(h.controller.accept_call().await.is_err());
        assert_eq!(h.controller.phase().await, CallPhase::Incoming);
        assert_eq!(h.controller.local_tracks().await.len(), 0);
    }

    #[tokio::test]
    async fn rejecting_an_incoming_call() {
        let h = harness();
        h.controller.on_incoming_call(therapist(), "peer-t1").await;
        h.controller.reject_call().await;
        assert_reset(&h.controller).await;
        assert_eq!(h.link.hung_up(), ["peer-t1"]);
    }

    #[tokio::test]
    async fn reject_is_ignored_once_active() {
        let h = harness();
        active_call(&h).await;
        h.controller.reject_call().await;
        assert_eq!(h.controller.phase().await, CallPhase::Active);
    }

    #[tokio::test]
    async fn incoming_call_while_busy_is_ignored() {
        let h = harness();
        active_call(&h).await;
        h.controller
            .on_incoming_call(CallParticipant::new("u2", "Sam"), "peer-u2")
            .await;
        assert_eq!(h.controller.participants().await.len(), 1);
    }

    #[tokio::test]
    async fn mute_and_video_toggles_reach_the_tracks() {
        let h = harness();
        active_call(&h).await;
        let state = h.controller.state().await;
        assert!(!state.is_muted);
        assert!(state.is_video_enabled);

        h.controller.toggle_mute().await;
        h.controller.toggle_video().await;
        let state = h.controller.state().await;
        assert!(state.is_muted);
        assert!(!state.is_video_enabled);
        let tracks = h.controller.local_tracks().await;
        assert!(tracks.iter().all(|t| !t.enabled));

        h.controller.toggle_mute().await;
        assert!(!h.controller.state().await.is_muted);
        assert_eq!(
            h.devices.enabled_calls().last(),
            Some(&("mic".to_string(), true))
        );
    }

    #[tokio::test]
    async fn join_preferences_shape_the_initial_state() {
        let h = harness_with(CallOptions {
            mic_enabled_on_join: false,
            camera_enabled_on_join: false,
            ..CallOptions::default()
        });
        active_call(&h).await;
        let state = h.controller.state().await;
        assert!(state.is_muted);
        assert!(!state.is_video_enabled);
    }

    #[tokio::test]
    async fn screen_share_swaps_the_outgoing_video() {
        let h = harness();
        active_call(&h).await;

        h.controller.toggle_screen_share().await.unwrap();
        assert!(h.controller.state().await.is_screen_sharing);
        assert_eq!(h.link.video(), ["screen"]);

        h.controller.toggle_screen_share().await.unwrap();
        assert!(!h.controller.state().await.is_screen_sharing);
        assert_eq!(h.link.video(), ["screen", "cam"]);
        assert_eq!(h.devices.stopped(), ["screen"]);
    }

    #[tokio::test]
    async fn os_ending_the_share_restores_the_camera() {
        let h = harness();
        active_call(&h).await;
        h.controller.toggle_screen_share().await.unwrap();

        h.controller.on_screen_share_ended().await;
        assert!(!h.controller.state().await.is_screen_sharing);
        assert_eq!(h.link.video(), ["screen", "cam"]);

        h.controller.on_screen_share_ended().await;
        assert_eq!(h.link.video().len(), 2);
    }

    #[tokio::test]
    async fn denied_screen_share_keeps_the_camera() {
        let h = harness();
        active_call(&h).await;
        h.devices.deny_display_media(true);

        let err = h.controller.toggle_screen_share().await.unwrap_err();
        assert!(matches!(err, HavenError::Media(_)));
        assert!(!h.controller.state().await.is_screen_sharing);
        assert!(h.link.video().is_empty());
        assert_eq!(h.controller.phase().await, CallPhase::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn recording_clock_runs_only_while_recording() {
        let h = harness();
        active_call(&h).await;

        h.controller.start_recording().await;
        assert!(h.controller.state().await.is_recording);
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        h.controller.stop_recording().await;

        tokio::time::sleep(Duration::from_secs(3)).await;
        let state = h.controller.state().await;
        assert!(!state.is_recording);
        assert_eq!(state.recording_duration, 2);
        assert_eq!(state.call_duration, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn ending_a_recorded_call_resets_everything() {
        let h = harness();
        active_call(&h).await;
        h.controller.toggle_screen_share().await.unwrap();
        h.controller.start_recording().await;
        let audio = MediaTrack::new("t1-audio", TrackKind::Audio, TrackSource::Microphone);
        h.controller.on_remote_track("peer-t1", audio).await;
        tokio::time::sleep(Duration::from_millis(1_500)).await;

        h.controller.end_call().await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_reset(&h.controller).await;
    }

    #[tokio::test(start_paused = true)]
    async fn network_is_sampled_only_while_active() {
        let mut h = harness();
        h.stats.push(StatsReport {
            timestamp_ms: 0.0,
            round_trip_time_ms: Some(40.0),
            ..StatsReport::default()
        });
        h.stats.push(StatsReport {
            timestamp_ms: 2_000.0,
            bytes_received: 250_000,
            packets_received: 200,
            round_trip_time_ms: Some(40.0),
            ..StatsReport::default()
        });

        assert!(h.controller.start_call(vec![therapist()]).await);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.stats.collected(), 0);

        h.controller.on_remote_connected("peer-t1").await;
        tokio::time::sleep(Duration::from_millis(4_500)).await;
        assert_eq!(h.stats.collected(), 2);
        let latest = h.controller.network_stats().await.unwrap();
        assert_eq!(latest.bitrate, 1_000);

        let qualities: Vec<ConnectionQuality> = drain(&mut h.events)
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::NetworkQualityChanged { quality, .. } => Some(quality),
                _ => None,
            })
            .collect();
        assert_eq!(qualities, [ConnectionQuality::Excellent, ConnectionQuality::Excellent]);

        h.controller.end_call().await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.stats.collected(), 2);
        assert!(h.controller.network_stats().await.is_none());
    }

    #[tokio::test]
    async fn remote_streams_are_registered_per_peer() {
        let mut h = harness();
        active_call(&h).await;
        let video = MediaTrack::new("t1-video", TrackKind::Video, TrackSource::Camera);
        h.controller.on_remote_track("peer-t1", video.clone()).await;
        assert_eq!(h.controller.remote_tracks("peer-t1").await, [video.clone()]);

        h.controller.on_remote_track_removed("peer-t1", "t1-video").await;
        assert!(h.controller.remote_tracks("peer-t1").await.is_empty());

        let events = drain(&mut h.events);
        assert!(events.contains(&SessionEvent::RemoteTrackAdded {
            peer_id: "peer-t1".into(),
            track: video,
        }));
        assert!(events.contains(&SessionEvent::RemoteTrackRemoved {
            peer_id: "peer-t1".into(),
            track_id: "t1-video".into(),
        }));
    }

    #[tokio::test]
    async fn remote_media_state_updates_the_participant() {
        let h = harness();
        active_call(&h).await;
        h.controller.on_remote_media_state("peer-t1", Some(true), Some(false)).await;
        let participants = h.controller.participants().await;
        assert!(participants[0].is_muted);
        assert!(!participants[0].is_video_enabled);
    }

    #[tokio::test]
    async fn remote_hangup_of_the_last_party_ends_the_call() {
        let mut h = harness();
        active_call(&h).await;
        h.controller.on_remote_hangup("peer-t1").await;
        assert_reset(&h.controller).await;
        assert!(drain(&mut h.events).contains(&SessionEvent::ParticipantLeft("t1".into())));
    }

    #[tokio::test]
    async fn remote_rejection_ends_an_outgoing_call() {
        let h = harness();
        assert!(h.controller.start_call(vec![therapist()]).await);
        h.controller.on_remote_rejected("peer-t1").await;
        assert_reset(&h.controller).await;
    }
}
