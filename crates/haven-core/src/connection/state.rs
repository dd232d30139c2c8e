use std::time::Duration;

use serde::Serialize;

use crate::settings::TransportSettings;

/// Intentional shutdown; never followed by a reconnect.
pub const NORMAL_CLOSURE: u16 = 1000;
/// Reported when the socket vanished without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;
/// Sent when we drop a socket whose keep-alives stopped going through.
pub const HEARTBEAT_TIMEOUT: u16 = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Open,
    Closed,
}

/// Read-only snapshot of the chat socket, published on every transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Idle,
            retry_count: 0,
            last_error: None,
        }
    }
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        self.status == ConnectionStatus::Open
    }

    /// Open or on its way there.
    pub fn is_live(&self) -> bool {
        matches!(self.status, ConnectionStatus::Open | ConnectionStatus::Connecting)
    }
}

/// What to do after the server closed the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDisposition {
    Normal,
    Terminal,
    Retry,
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    base: Duration,
    cap: Duration,
    max_attempts: u32,
    terminal_codes: Vec<u16>,
}

impl ReconnectPolicy {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            max_attempts,
            terminal_codes: Vec::new(),
        }
    }

    pub fn from_settings(settings: &TransportSettings) -> Self {
        Self {
            base: Duration::from_millis(settings.reconnect_base_delay_ms),
            cap: Duration::from_millis(settings.reconnect_max_delay_ms),
            max_attempts: settings.reconnect_max_attempts,
            terminal_codes: settings.terminal_close_codes.clone(),
        }
    }

    /// `min(base * 2^(attempt-1), cap)` for 1-based `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base.saturating_mul(factor).min(self.cap)
    }

    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn disposition(&self, code: u16) -> CloseDisposition {
        if code == NORMAL_CLOSURE {
            CloseDisposition::Normal
        } else if self.terminal_codes.contains(&code) {
            CloseDisposition::Terminal
        } else {
            CloseDisposition::Retry
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_settings(&TransportSettings::default())
    }
}

/// Counts consecutive keep-alive failures.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    failures: u32,
    max_failures: u32,
}

impl HeartbeatMonitor {
    pub fn new(max_failures: u32) -> Self {
        Self {
            failures: 0,
            max_failures: max_failures.max(1),
        }
    }

    /// Record one heartbeat tick. `healthy` means the previous ping was
    /// answered and this one went out. Returns `true` once the link counts
    /// as lost.
    pub fn record(&mut self, healthy: bool) -> bool {
        if healthy {
            self.failures = 0;
            false
        } else {
            self.failures += 1;
            self.failures >= self.max_failures
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}
