use serde::Serialize;

use crate::errors::HavenError;
use crate::events::ConnectionQuality;

/// Raw cumulative counters from the peer connection, as WebRTC stats
/// reports expose them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsReport {
    /// Milliseconds on the stats clock.
    pub timestamp_ms: f64,
    pub bytes_received: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
    pub round_trip_time_ms: Option<f64>,
    pub frame_width: Option<u32>,
    pub frame_height: Option<u32>,
    pub frames_per_second: Option<f64>,
}

/// Reads stats from the live peer connection.
pub trait StatsSource: Send + Sync + 'static {
    fn collect(&self) -> Result<StatsReport, HavenError>;
}

/// One sampling tick's view of the media connection. Overwritten every tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStats {
    /// Inbound kbit/s since the previous sample.
    pub bitrate: u64,
    /// Percent of packets lost since the previous sample.
    pub packet_loss: f64,
    /// Round-trip time in ms.
    pub latency: u32,
    /// `"<width>x<height>"` of the inbound video, if any.
    pub resolution: Option<String>,
    pub frame_rate: f64,
}

impl NetworkStats {
    pub fn quality(&self) -> ConnectionQuality {
        grade(self.packet_loss, self.latency)
    }
}

/// Grade a connection by packet loss (percent) and round-trip time (ms).
pub fn grade(packet_loss: f64, latency_ms: u32) -> ConnectionQuality {
    if packet_loss >= 20.0 || latency_ms >= 1_000 {
        ConnectionQuality::Lost
    } else if packet_loss >= 5.0 || latency_ms >= 300 {
        ConnectionQuality::Poor
    } else if packet_loss >= 1.0 || latency_ms >= 150 {
        ConnectionQuality::Good
    } else {
        ConnectionQuality::Excellent
    }
}

/// Turns cumulative counters into per-interval rates.
pub struct NetworkQualityMonitor<S> {
    source: S,
    previous: Option<StatsReport>,
    latest: Option<NetworkStats>,
}

impl<S: StatsSource> NetworkQualityMonitor<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            previous: None,
            latest: None,
        }
    }

    /// Take one sample. The first sample after a reset has no previous
    /// counters to diff against and reports zero bitrate and loss.
    pub fn sample(&mut self) -> Result<NetworkStats, HavenError> {
        let report = self.source.collect()?;
        let stats = derive(self.previous.as_ref(), &report);
        self.previous = Some(report);
        self.latest = Some(stats.clone());
        Ok(stats)
    }

    pub fn latest(&self) -> Option<&NetworkStats> {
        self.latest.as_ref()
    }

    pub fn reset(&mut self) {
        self.previous = None;
        self.latest = None;
    }
}

fn derive(previous: Option<&StatsReport>, current: &StatsReport) -> NetworkStats {
    let (bitrate, packet_loss) = match previous {
        Some(prev) if current.timestamp_ms > prev.timestamp_ms => {
            let seconds = (current.timestamp_ms - prev.timestamp_ms) / 1_000.0;
            let bytes = current.bytes_received.saturating_sub(prev.bytes_received);
            let bitrate = (bytes as f64 * 8.0 / seconds / 1_000.0).round() as u64;

            let received = current.packets_received.saturating_sub(prev.packets_received);
            let lost = current.packets_lost.saturating_sub(prev.packets_lost);
            let total = received + lost;
            let loss = if total == 0 {
                0.0
            } else {
                lost as f64 * 100.0 / total as f64
            };
            (bitrate, loss)
        }
        _ => (0, 0.0),
    };

    let resolution = match (current.frame_width, current.frame_height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => Some(format!("{w}x{h}")),
        _ => None,
    };

    NetworkStats {
        bitrate,
        packet_loss,
        latency: current.round_trip_time_ms.map(|rtt| rtt.round() as u32).unwrap_or(0),
        resolution,
        frame_rate: current.frames_per_second.unwrap_or(0.0),
    }
}
