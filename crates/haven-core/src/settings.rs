use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Connection and telemetry tuning.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct TransportSettings {
    pub heartbeat_interval_secs: u64,
    /// How long one connect attempt (handshake included) may take.
    pub connect_timeout_secs: u64,
    /// Consecutive failed keep-alives before the socket is declared dead.
    pub heartbeat_max_failures: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub reconnect_max_attempts: u32,
    /// Close codes the server uses for rejections that retrying cannot fix.
    pub terminal_close_codes: Vec<u16>,
    pub max_concurrent_connections: usize,
    pub event_channel_capacity: usize,
    pub stats_interval_secs: u64,
    pub dedup_window_ms: i64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 15,
            connect_timeout_secs: 10,
            heartbeat_max_failures: 3,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 10_000,
            reconnect_max_attempts: 5,
            terminal_close_codes: vec![1008, 4001, 4003, 4004],
            max_concurrent_connections: 4,
            event_channel_capacity: 256,
            stats_interval_secs: 2,
            dedup_window_ms: 1_000,
        }
    }
}

impl TransportSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs.max(1))
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_true")]
    pub mic_enabled_on_join: bool,
    #[serde(default = "default_true")]
    pub camera_enabled_on_join: bool,
    #[serde(default)]
    pub transport: TransportSettings,
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            display_name: None,
            mic_enabled_on_join: true,
            camera_enabled_on_join: true,
            transport: TransportSettings::default(),
        }
    }
}

pub struct SettingsStore {
    settings: Mutex<Settings>,
    file_path: PathBuf,
}

impl SettingsStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let file_path = data_dir.into().join("settings.json");
        let settings = Self::load(&file_path);
        Self {
            settings: Mutex::new(settings),
            file_path,
        }
    }

    pub fn get(&self) -> Settings {
        self.lock().clone()
    }

    pub fn set_display_name(&self, name: Option<String>) {
        self.lock().display_name = name;
        self.save();
    }

    pub fn set_mic_enabled_on_join(&self, enabled: bool) {
        self.lock().mic_enabled_on_join = enabled;
        self.save();
    }

    pub fn set_camera_enabled_on_join(&self, enabled: bool) {
        self.lock().camera_enabled_on_join = enabled;
        self.save();
    }

    pub fn set_transport(&self, transport: TransportSettings) {
        self.lock().transport = transport;
        self.save();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Settings> {
        // Settings are plain data; a panic mid-update cannot leave them torn.
        self.settings.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn save(&self) {
        let settings = self.get();
        if let Some(parent) = self.file_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(&settings) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.file_path, json) {
                    tracing::warn!("failed to write {}: {e}", self.file_path.display());
                }
            }
            Err(e) => tracing::warn!("failed to serialize settings: {e}"),
        }
    }

    fn load(path: &PathBuf) -> Settings {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("ignoring corrupt {}: {e}", path.display());
                Settings::default()
            }),
            Err(_) => Settings::default(),
        }
    }
}
