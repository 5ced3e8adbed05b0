use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Rectangular lat/lon window, inclusive on all four edges.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegionBounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl RegionBounds {
    pub fn new(min_lat: f64, max_lat: f64, min_lon: f64, max_lon: f64) -> Self {
        Self {
            min_lat,
            max_lat,
            min_lon,
            max_lon,
        }
    }

    /// Edge-inclusive containment check.
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        lat >= self.min_lat && lat <= self.max_lat && lon >= self.min_lon && lon <= self.max_lon
    }

    pub fn is_valid(&self) -> bool {
        self.min_lat < self.max_lat
            && self.min_lon < self.max_lon
            && self.min_lat >= -90.0
            && self.max_lat <= 90.0
            && self.min_lon >= -180.0
            && self.max_lon <= 180.0
    }
}

/// Geographic subscription zone. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub id: String,
    pub name: String,
    pub bounds: RegionBounds,
    /// 1..=3, controls how many schedule slots the region gets per rotation
    /// cycle (not how often vessels inside it report).
    pub priority: u8,
}

/// Bounding boxes sent upstream at connect time. The upstream protocol only
/// accepts a filter during the handshake, so changing it forces a reconnect.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionFilter {
    pub boxes: Vec<RegionBounds>,
}

impl SubscriptionFilter {
    pub fn from_region(region: &Region) -> Self {
        Self {
            boxes: vec![region.bounds],
        }
    }

    pub fn from_boxes(boxes: Vec<RegionBounds>) -> Self {
        Self { boxes }
    }
}

/// Normalized decode of an upstream position report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionUpdate {
    pub mmsi: u64,
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub speed_over_ground: f64,
    pub course_over_ground: f64,
    pub true_heading: Option<u16>,
    pub navigational_status: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VesselDimensions {
    pub to_bow: u32,
    pub to_stern: u32,
    pub to_port: u32,
    pub to_starboard: u32,
}

/// Normalized decode of an upstream vessel metadata report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticData {
    pub mmsi: u64,
    pub name: Option<String>,
    pub vessel_type: Option<u32>,
    pub dimensions: Option<VesselDimensions>,
    pub destination: Option<String>,
    pub call_sign: Option<String>,
}

/// Read-only snapshot of the stream client's counters. Cumulative counters
/// survive reconnects; only a process restart clears them.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatistics {
    pub connected: bool,
    pub messages_received: u64,
    pub messages_processed: u64,
    pub error_count: u64,
    pub last_message_at: Option<DateTime<Utc>>,
    /// Consecutive reconnect attempts in the current outage (0 once streaming).
    pub reconnect_attempts: u32,
}

/// Read-only snapshot of the scheduler's rotation state.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub current_region: Region,
    pub next_region: Region,
    /// None when auto-rotation is disabled or the scheduler is stopped.
    pub next_rotation_at: Option<DateTime<Utc>>,
    pub cycle_progress_pct: u32,
    /// Slots advanced in the current cycle; resets to zero on wrap.
    pub regions_completed: u64,
    pub schedule_length: usize,
}

/// Process configuration, loaded from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub stream_url: String,
    pub api_key: String,
    pub region_duration_ms: u64,
    pub auto_rotate: bool,
    pub reconnect_base_ms: u64,
    pub max_reconnect_attempts: u32,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let stream_url = std::env::var("AIS_STREAM_URL")
            .unwrap_or_else(|_| "wss://stream.aisstream.io/v0/stream".to_string());

        let api_key = std::env::var("AIS_API_KEY").context("AIS_API_KEY must be set")?;

        let region_duration_ms = std::env::var("REGION_DURATION_MS")
            .unwrap_or_else(|_| String::new())
            .parse()
            .unwrap_or(4 * 3600 * 1000);

        let auto_rotate = std::env::var("AUTO_ROTATE")
            .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
            .unwrap_or(true);

        let reconnect_base_ms = std::env::var("RECONNECT_BASE_MS")
            .unwrap_or_else(|_| String::new())
            .parse()
            .unwrap_or(1_000);

        let max_reconnect_attempts = std::env::var("MAX_RECONNECT_ATTEMPTS")
            .unwrap_or_else(|_| String::new())
            .parse()
            .unwrap_or(5);

        Ok(Self {
            stream_url,
            api_key,
            region_duration_ms,
            auto_rotate,
            reconnect_base_ms,
            max_reconnect_attempts,
        })
    }
}
