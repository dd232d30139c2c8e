use serde::Serialize;

/// Where a call is in its lifecycle.
///
/// `Idle → Outgoing | Incoming → Active → Ended → Idle`. `Ended` is only
/// passed through: cleanup runs there and the controller returns to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallPhase {
    #[default]
    Idle,
    Outgoing,
    Incoming,
    Active,
    Ended,
}

impl CallPhase {
    /// Any phase in which a call exists.
    pub fn in_call(self) -> bool {
        matches!(self, Self::Outgoing | Self::Incoming | Self::Active)
    }
}

/// Snapshot of the session's call, as the UI renders it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallState {
    pub is_in_call: bool,
    pub is_call_active: bool,
    pub is_call_outgoing: bool,
    pub is_call_incoming: bool,
    pub is_muted: bool,
    pub is_video_enabled: bool,
    pub is_screen_sharing: bool,
    pub is_recording: bool,
    /// Seconds since the call became active.
    pub call_duration: u64,
    /// Seconds since recording started.
    pub recording_duration: u64,
}
