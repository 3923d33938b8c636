//! Shared types, error enum, and the inbound position message for speedwatch-core.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All errors produced by speedwatch-core.
#[derive(Debug, Error)]
pub enum SpeedwatchError {
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("sample has no coordinates")]
    InvalidCoordinate,
    #[error("topic has no segment {index}: {topic}")]
    MissingTopicSegment { index: usize, topic: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, SpeedwatchError>;

/// Metres per second → kilometres per hour.
pub const MS_TO_KMH: f64 = 3.6;

// ---------------------------------------------------------------------------
// Position sample
// ---------------------------------------------------------------------------

/// One vehicle position update (the `VP` object of an HFP message).
///
/// Field names on the wire are the terse HFP ones; everything except the
/// route, operating day, start time and logical timestamp is optional because
/// the feed routinely leaves values out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    #[serde(rename = "desi")]
    pub route_number: String,
    #[serde(rename = "dir", default)]
    pub direction: Option<String>,
    #[serde(rename = "oper", default)]
    pub operator: Option<u32>,
    #[serde(rename = "veh", default)]
    pub vehicle_number: Option<u32>,
    /// ISO 8601 time of the reading, kept for display only.
    #[serde(rename = "tst", default)]
    pub time: Option<String>,
    /// Logical timestamp (Unix seconds). Drives the tracker clock.
    #[serde(rename = "tsi")]
    pub timestamp: i64,
    /// Speed in m/s.
    #[serde(rename = "spd", default)]
    pub speed: Option<f64>,
    #[serde(rename = "hdg", default)]
    pub heading: Option<i32>,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub long: Option<f64>,
    #[serde(rename = "acc", default)]
    pub acceleration: Option<f64>,
    #[serde(rename = "dl", default)]
    pub schedule_offset: Option<i32>,
    #[serde(rename = "odo", default)]
    pub odometer: Option<f64>,
    #[serde(rename = "drst", default)]
    pub door_status: Option<u8>,
    #[serde(rename = "oday")]
    pub operating_day: String,
    #[serde(rename = "start")]
    pub start_time: String,
    #[serde(default)]
    pub stop: Option<u32>,
}

impl PositionSample {
    /// Speed converted to km/h. A reading too large to represent is treated
    /// as missing.
    pub fn speed_kmh(&self) -> Option<f64> {
        self.speed.map(|s| s * MS_TO_KMH).filter(|v| v.is_finite())
    }
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "VP")]
    vp: PositionSample,
}

/// Parse a raw HFP payload (`{"VP": {...}}`) into a sample.
pub fn parse_message(payload: &[u8]) -> Result<PositionSample> {
    serde_json::from_slice::<Envelope>(payload)
        .map(|e| e.vp)
        .map_err(|e| SpeedwatchError::MalformedPayload(e.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &str = r#"{"VP":{"desi":"550","dir":"1","oper":22,"veh":1234,
        "tst":"2022-03-01T06:01:02.123Z","tsi":1646114462,"spd":12.5,"hdg":90,
        "lat":60.15,"long":24.95,"acc":0.1,"dl":-20,"odo":1500,"drst":0,
        "oday":"2022-03-01","jrn":1,"line":100,"start":"07:55","loc":"GPS",
        "stop":null,"route":"2550","occu":0}}"#;

    #[test]
    fn test_parse_message() {
        let s = parse_message(PAYLOAD.as_bytes()).unwrap();
        assert_eq!(s.route_number, "550");
        assert_eq!(s.direction.as_deref(), Some("1"));
        assert_eq!(s.operator, Some(22));
        assert_eq!(s.vehicle_number, Some(1234));
        assert_eq!(s.timestamp, 1646114462);
        assert_eq!(s.lat, Some(60.15));
        assert_eq!(s.operating_day, "2022-03-01");
        assert_eq!(s.start_time, "07:55");
        assert!(s.stop.is_none());
    }

    #[test]
    fn test_parse_null_coordinates() {
        let payload = r#"{"VP":{"desi":"550","tsi":150,"lat":null,"long":null,
            "oday":"2022-03-01","start":"07:55"}}"#;
        let s = parse_message(payload.as_bytes()).unwrap();
        assert!(s.lat.is_none() && s.long.is_none());
        assert!(s.speed.is_none());
    }

    #[test]
    fn test_parse_missing_envelope() {
        let err = parse_message(br#"{"desi":"550"}"#).unwrap_err();
        assert!(matches!(err, SpeedwatchError::MalformedPayload(_)));
    }

    #[test]
    fn test_parse_garbage() {
        assert!(parse_message(b"not json").is_err());
    }

    #[test]
    fn test_speed_kmh() {
        let s = parse_message(PAYLOAD.as_bytes()).unwrap();
        assert!((s.speed_kmh().unwrap() - 45.0).abs() < 1e-9);
    }

    #[test]
    fn test_speed_kmh_overflow_is_missing() {
        let payload = r#"{"VP":{"desi":"550","tsi":100,"spd":1e308,
            "oday":"2022-03-01","start":"07:55"}}"#;
        let s = parse_message(payload.as_bytes()).unwrap();
        assert_eq!(s.speed, Some(1e308));
        assert!(s.speed_kmh().is_none());
    }
}
