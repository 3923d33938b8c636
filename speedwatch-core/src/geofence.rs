//! Rectangular monitored area and the inside/outside predicate.

use serde::Serialize;

use crate::types::{Result, SpeedwatchError};

/// Monitored rectangle (WGS84 degrees, bounds inclusive) plus the speed limit
/// that applies inside it.
///
/// The speed limit is carried for renderers and statistics; the tracker never
/// looks at it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MonitoredArea {
    pub north: f64,
    pub south: f64,
    pub east: f64,
    pub west: f64,
    /// km/h
    pub speed_limit: f64,
}

impl MonitoredArea {
    pub fn new(north: f64, south: f64, east: f64, west: f64, speed_limit: f64) -> Self {
        MonitoredArea {
            north,
            south,
            east,
            west,
            speed_limit,
        }
    }

    /// Whether the coordinate lies inside the area, edges included.
    ///
    /// Fails with `InvalidCoordinate` when either value is missing, which the
    /// feed does routinely.
    pub fn contains(&self, lat: Option<f64>, long: Option<f64>) -> Result<bool> {
        match (lat, long) {
            (Some(lat), Some(long)) => Ok(self.south <= lat
                && lat <= self.north
                && self.west <= long
                && long <= self.east),
            _ => Err(SpeedwatchError::InvalidCoordinate),
        }
    }

    pub fn center(&self) -> (f64, f64) {
        (
            (self.north + self.south) / 2.0,
            (self.east + self.west) / 2.0,
        )
    }

    /// Check that the bounds describe a non-empty rectangle.
    pub fn validate(&self) -> Result<()> {
        if self.south > self.north {
            return Err(SpeedwatchError::Config(format!(
                "south bound {} is above north bound {}",
                self.south, self.north
            )));
        }
        if self.west > self.east {
            return Err(SpeedwatchError::Config(format!(
                "west bound {} is east of east bound {}",
                self.west, self.east
            )));
        }
        if self.speed_limit <= 0.0 {
            return Err(SpeedwatchError::Config(format!(
                "speed limit must be positive, got {}",
                self.speed_limit
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
