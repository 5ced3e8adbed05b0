//! Upstream AIS feed wire protocol.
//!
//! Outbound: a single auth + subscription frame sent at connect time.
//! Inbound: JSON frames discriminated by `MessageType`; the two shapes we
//! consume are `PositionReport` and `ShipStaticData`. Anything else is valid
//! but ignored, and a decode failure is never fatal to the stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{PositionUpdate, StaticData, SubscriptionFilter, VesselDimensions};

pub const MSG_TYPE_POSITION: &str = "PositionReport";
pub const MSG_TYPE_STATIC: &str = "ShipStaticData";

/// Auth + subscription frame, sent immediately on socket open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeMessage {
    #[serde(rename = "APIKey")]
    pub api_key: String,
    /// Each box is [[minLat, minLon], [maxLat, maxLon]].
    #[serde(rename = "BoundingBoxes")]
    pub bounding_boxes: Vec<[[f64; 2]; 2]>,
    #[serde(rename = "FilterMessageTypes")]
    pub filter_message_types: Vec<String>,
}

impl SubscribeMessage {
    pub fn new(api_key: &str, filter: &SubscriptionFilter) -> Self {
        Self {
            api_key: api_key.to_string(),
            bounding_boxes: filter
                .boxes
                .iter()
                .map(|b| [[b.min_lat, b.min_lon], [b.max_lat, b.max_lon]])
                .collect(),
            filter_message_types: vec![MSG_TYPE_POSITION.to_string(), MSG_TYPE_STATIC.to_string()],
        }
    }
}

/// Classified result of decoding one inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedFrame {
    Position(PositionUpdate),
    Static(StaticData),
    /// Well-formed frame of a type we do not consume.
    Unrecognized { message_type: String },
    /// Upstream rejected the subscription (bad key, malformed boxes).
    UpstreamError { reason: String },
}

/// Non-fatal decode failure; the offending payload is surfaced as a warning
/// event and the stream continues.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeError {
    pub message_type: String,
    pub reason: String,
}

impl DecodeError {
    fn new(message_type: &str, reason: impl Into<String>) -> Self {
        Self {
            message_type: message_type.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct MetaData {
    #[serde(rename = "MMSI")]
    mmsi: Option<u64>,
    #[serde(default)]
    latitude: Option<f64>,
    #[serde(default)]
    longitude: Option<f64>,
    #[serde(default)]
    time_utc: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct PositionReportBody {
    #[serde(rename = "Sog")]
    sog: Option<f64>,
    #[serde(rename = "Cog")]
    cog: Option<f64>,
    #[serde(rename = "TrueHeading")]
    true_heading: Option<u16>,
    #[serde(rename = "NavigationalStatus")]
    navigational_status: Option<u8>,
}

#[derive(Debug, Clone, Deserialize)]
struct DimensionBody {
    #[serde(rename = "A")]
    a: Option<u32>,
    #[serde(rename = "B")]
    b: Option<u32>,
    #[serde(rename = "C")]
    c: Option<u32>,
    #[serde(rename = "D")]
    d: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
struct ShipStaticDataBody {
    #[serde(rename = "Name")]
    name: Option<String>,
    #[serde(rename = "Type")]
    vessel_type: Option<u32>,
    #[serde(rename = "Destination")]
    destination: Option<String>,
    #[serde(rename = "CallSign")]
    call_sign: Option<String>,
    #[serde(rename = "Dimension")]
    dimension: Option<DimensionBody>,
}

/// Decode one inbound text frame into a domain event.
pub fn decode_frame(raw: &str) -> Result<DecodedFrame, DecodeError> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| DecodeError::new("unknown", format!("invalid json: {e}")))?;

    // Auth rejections arrive as a bare {"error": ...} object.
    if let Some(reason) = value.get("error").and_then(Value::as_str) {
        return Ok(DecodedFrame::UpstreamError {
            reason: reason.to_string(),
        });
    }

    let message_type = match value.get("MessageType").and_then(Value::as_str) {
        Some(t) => t.to_string(),
        None => return Err(DecodeError::new("unknown", "missing MessageType")),
    };

    match message_type.as_str() {
        MSG_TYPE_POSITION => decode_position(&value).map(DecodedFrame::Position),
        MSG_TYPE_STATIC => decode_static(&value).map(DecodedFrame::Static),
        _ => Ok(DecodedFrame::Unrecognized { message_type }),
    }
}

fn metadata(value: &Value, message_type: &str) -> Result<MetaData, DecodeError> {
    let meta = value
        .get("MetaData")
        .cloned()
        .ok_or_else(|| DecodeError::new(message_type, "missing MetaData"))?;
    serde_json::from_value(meta)
        .map_err(|e| DecodeError::new(message_type, format!("bad MetaData: {e}")))
}

fn message_body<T: serde::de::DeserializeOwned>(
    value: &Value,
    message_type: &str,
) -> Result<T, DecodeError> {
    let body = value
        .get("Message")
        .and_then(|m| m.get(message_type))
        .cloned()
        .ok_or_else(|| DecodeError::new(message_type, format!("missing Message.{message_type}")))?;
    serde_json::from_value(body)
        .map_err(|e| DecodeError::new(message_type, format!("bad Message.{message_type}: {e}")))
}

fn decode_position(value: &Value) -> Result<PositionUpdate, DecodeError> {
    let meta = metadata(value, MSG_TYPE_POSITION)?;
    let body: PositionReportBody = message_body(value, MSG_TYPE_POSITION)?;

    let mmsi = meta
        .mmsi
        .ok_or_else(|| DecodeError::new(MSG_TYPE_POSITION, "missing MMSI"))?;
    let latitude = meta
        .latitude
        .ok_or_else(|| DecodeError::new(MSG_TYPE_POSITION, "missing latitude"))?;
    let longitude = meta
        .longitude
        .ok_or_else(|| DecodeError::new(MSG_TYPE_POSITION, "missing longitude"))?;
    let speed_over_ground = body
        .sog
        .ok_or_else(|| DecodeError::new(MSG_TYPE_POSITION, "missing Sog"))?;
    let course_over_ground = body
        .cog
        .ok_or_else(|| DecodeError::new(MSG_TYPE_POSITION, "missing Cog"))?;

    Ok(PositionUpdate {
        mmsi,
        timestamp: parse_time_utc(meta.time_utc.as_deref()),
        latitude,
        longitude,
        speed_over_ground,
        course_over_ground,
        // 511 is the AIS sentinel for "heading unavailable".
        true_heading: body.true_heading.filter(|&h| h < 511),
        navigational_status: body.navigational_status,
    })
}

fn decode_static(value: &Value) -> Result<StaticData, DecodeError> {
    let meta = metadata(value, MSG_TYPE_STATIC)?;
    let body: ShipStaticDataBody = message_body(value, MSG_TYPE_STATIC)?;

    let mmsi = meta
        .mmsi
        .ok_or_else(|| DecodeError::new(MSG_TYPE_STATIC, "missing MMSI"))?;

    let dimensions = body.dimension.map(|d| VesselDimensions {
        to_bow: d.a.unwrap_or(0),
        to_stern: d.b.unwrap_or(0),
        to_port: d.c.unwrap_or(0),
        to_starboard: d.d.unwrap_or(0),
    });

    Ok(StaticData {
        mmsi,
        name: clean_text(body.name),
        vessel_type: body.vessel_type,
        dimensions,
        destination: clean_text(body.destination),
        call_sign: clean_text(body.call_sign),
    })
}

/// AIS text fields are padded with '@' and trailing spaces.
fn clean_text(raw: Option<String>) -> Option<String> {
    let cleaned = raw?.trim_end_matches(['@', ' ']).trim().to_string();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

/// Upstream timestamps look like "2024-03-01 12:34:56.789012345 +0000 UTC".
/// Falls back to arrival time when the field is absent or unparseable.
fn parse_time_utc(raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(|s| DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f %z UTC").ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}
