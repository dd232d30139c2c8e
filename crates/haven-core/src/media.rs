//! Local capture and the registry of remote streams.
//!
//! Capture itself belongs to the platform; it is reached through the
//! [`MediaDevices`] trait. [`MediaStreamManager`] only does the bookkeeping:
//! which tracks are live, which are enabled, and which remote tracks belong
//! to which peer. Rendering layers look remote streams up by peer id instead
//! of being handed them.

use std::collections::HashMap;
use std::future::Future;

use serde::Serialize;

use crate::errors::HavenError;
use crate::events::{TrackKind, TrackSource};

/// What to capture from camera and microphone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// A single audio or video track, local or remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
    pub source: TrackSource,
    pub enabled: bool,
}

impl MediaTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind, source: TrackSource) -> Self {
        Self {
            id: id.into(),
            kind,
            source,
            enabled: true,
        }
    }
}

/// Platform capture devices.
///
/// Permission denials and missing devices come back as [`HavenError::Media`].
pub trait MediaDevices: Send + Sync + 'static {
    fn open_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> impl Future<Output = Result<Vec<MediaTrack>, HavenError>> + Send;

    /// Ask the OS for a screen or window to share.
    fn open_display_media(&self) -> impl Future<Output = Result<MediaTrack, HavenError>> + Send;

    fn set_track_enabled(&self, track_id: &str, enabled: bool);

    fn stop_track(&self, track_id: &str);
}

/// Bookkeeping for local capture and remote streams during a call.
pub struct MediaStreamManager<D> {
    devices: D,
    local: Vec<MediaTrack>,
    screen: Option<MediaTrack>,
    remote: HashMap<String, Vec<MediaTrack>>,
}

impl<D: MediaDevices> MediaStreamManager<D> {
    pub fn new(devices: D) -> Self {
        Self {
            devices,
            local: Vec::new(),
            screen: None,
            remote: HashMap::new(),
        }
    }

    /// Open camera and microphone unless they are already open.
    pub async fn acquire_local(&mut self, constraints: MediaConstraints) -> Result<&[MediaTrack], HavenError> {
        if self.local.is_empty() {
            let tracks = self.devices.open_user_media(constraints).await?;
            if tracks.is_empty() {
                return Err(HavenError::Media("no capture device available".into()));
            }
            tracing::info!("local media acquired: {} track(s)", tracks.len());
            self.local = tracks;
        }
        Ok(&self.local)
    }

    pub fn has_local_media(&self) -> bool {
        !self.local.is_empty()
    }

    pub fn local_tracks(&self) -> &[MediaTrack] {
        &self.local
    }

    /// Enable or disable every local track of `kind`.
    ///
    /// Returns false when there is no such track to change.
    pub fn set_enabled(&mut self, kind: TrackKind, enabled: bool) -> bool {
        let mut changed = false;
        for track in self.local.iter_mut().filter(|t| t.kind == kind) {
            track.enabled = enabled;
            self.devices.set_track_enabled(&track.id, enabled);
            changed = true;
        }
        changed
    }

    pub fn camera_track(&self) -> Option<&MediaTrack> {
        self.local
            .iter()
            .find(|t| t.kind == TrackKind::Video && t.source == TrackSource::Camera)
    }

    pub fn screen_track(&self) -> Option<&MediaTrack> {
        self.screen.as_ref()
    }

    /// The video track currently going out: the screen while sharing,
    /// the camera otherwise.
    pub fn outgoing_video(&self) -> Option<&MediaTrack> {
        self.screen.as_ref().or_else(|| self.camera_track())
    }

    pub async fn start_screen_share(&mut self) -> Result<MediaTrack, HavenError> {
        if let Some(track) = &self.screen {
            return Ok(track.clone());
        }
        let mut track = self.devices.open_display_media().await?;
        track.source = TrackSource::ScreenShare;
        tracing::info!("screen share started: {}", track.id);
        self.screen = Some(track.clone());
        Ok(track)
    }

    /// Stop sharing and hand back the camera track to restore, if any.
    pub fn stop_screen_share(&mut self) -> Option<MediaTrack> {
        if let Some(track) = self.screen.take() {
            self.devices.stop_track(&track.id);
            tracing::info!("screen share stopped: {}", track.id);
        }
        self.camera_track().cloned()
    }

    pub fn add_remote_track(&mut self, peer_id: &str, track: MediaTrack) {
        let tracks = self.remote.entry(peer_id.to_string()).or_default();
        if let Some(existing) = tracks.iter_mut().find(|t| t.id == track.id) {
            *existing = track;
        } else {
            tracks.push(track);
        }
    }

    pub fn remove_remote_track(&mut self, peer_id: &str, track_id: &str) -> Option<MediaTrack> {
        let tracks = self.remote.get_mut(peer_id)?;
        let index = tracks.iter().position(|t| t.id == track_id)?;
        let track = tracks.remove(index);
        if tracks.is_empty() {
            self.remote.remove(peer_id);
        }
        Some(track)
    }

    /// Forget every stream of a peer that left.
    pub fn remove_peer(&mut self, peer_id: &str) -> Vec<MediaTrack> {
        self.remote.remove(peer_id).unwrap_or_default()
    }

    pub fn remote_tracks(&self, peer_id: &str) -> &[MediaTrack] {
        self.remote.get(peer_id).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn remote_peers(&self) -> Vec<String> {
        self.remote.keys().cloned().collect()
    }

    /// Stop camera, microphone and screen capture.
    pub fn release_local(&mut self) {
        for track in self.local.drain(..).chain(self.screen.take()) {
            self.devices.stop_track(&track.id);
        }
    }

    /// Release local capture and forget all remote streams.
    pub fn stop_all(&mut self) {
        self.release_local();
        self.remote.clear();
    }

    pub fn active_track_count(&self) -> usize {
        self.local.len()
            + usize::from(self.screen.is_some())
            + self.remote.values().map(Vec::len).sum::<usize>()
    }
}
