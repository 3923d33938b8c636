//! Vehicle run identity: topic + message → `VehicleKey`.
//!
//! HFP topics look like
//! `/hfp/v2/journey/ongoing/vp/bus/0022/00845/2550/1/Westendinasema/07:55/1140105/...`.
//! Splitting on `/` keeps the leading empty segment, which puts the route
//! display name (headsign) at index 11.

use std::fmt;

use serde::Serialize;

use crate::types::{PositionSample, Result, SpeedwatchError};

/// Index of the route display name among the `/`-separated topic segments.
pub const ROUTE_NAME_SEGMENT: usize = 11;

/// Identifies one run of one vehicle.
///
/// Vehicle and operator numbers are deliberately not part of the key. Two
/// buses serving the same route with the same operating day and scheduled
/// start collide and share a buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct VehicleKey {
    pub route_number: String,
    pub route_name: String,
    pub operating_day: String,
    pub start_time: String,
}

impl fmt::Display for VehicleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) {} {}",
            self.route_number, self.route_name, self.operating_day, self.start_time
        )
    }
}

/// Extract the route display name from a feed topic.
pub fn route_name_from_topic(topic: &str) -> Result<&str> {
    topic
        .split('/')
        .nth(ROUTE_NAME_SEGMENT)
        .ok_or_else(|| SpeedwatchError::MissingTopicSegment {
            index: ROUTE_NAME_SEGMENT,
            topic: topic.to_string(),
        })
}

/// Derive the key for the run that produced `sample`.
pub fn resolve_key(topic: &str, sample: &PositionSample) -> Result<VehicleKey> {
    Ok(VehicleKey {
        route_number: sample.route_number.clone(),
        route_name: route_name_from_topic(topic)?.to_string(),
        operating_day: sample.operating_day.clone(),
        start_time: sample.start_time.clone(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
