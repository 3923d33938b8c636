//! Turning a popped buffer into a trip, or discarding it as noise.

use serde::Serialize;
use tracing::info;

use crate::geofence::MonitoredArea;
use crate::identity::VehicleKey;
use crate::store::VehicleBuffer;
use crate::types::PositionSample;

/// A trip needs strictly more samples than this to be kept.
pub const MIN_SAMPLES: usize = 10;

/// Overspeed (km/h) at or above which a trip counts as speeding.
pub const SPEEDING_THRESHOLD: f64 = 4.0;

/// One complete pass of a vehicle run through the monitored area.
#[derive(Debug, Clone, Serialize)]
pub struct Trip {
    pub key: VehicleKey,
    pub samples: Vec<PositionSample>,
    pub area: MonitoredArea,
}

impl Trip {
    pub fn route_name(&self) -> &str {
        &self.key.route_name
    }

    /// Highest reported speed in km/h, ignoring samples without speed.
    pub fn max_speed_kmh(&self) -> Option<f64> {
        self.samples
            .iter()
            .filter_map(|s| s.speed_kmh())
            .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.max(v))))
    }

    /// Worst excess over the area speed limit in km/h (negative when the
    /// vehicle never reached the limit).
    pub fn max_overspeed_kmh(&self) -> Option<f64> {
        self.max_speed_kmh().map(|v| v - self.area.speed_limit)
    }

    /// Earliest and latest logical timestamps. Samples can arrive slightly
    /// out of order, so this is not simply the first and last sample.
    pub fn time_span(&self) -> Option<(i64, i64)> {
        let first = self.samples.iter().map(|s| s.timestamp).min()?;
        let last = self.samples.iter().map(|s| s.timestamp).max()?;
        Some((first, last))
    }
}

/// Size policy applied to every popped buffer.
#[derive(Debug, Clone, Copy)]
pub struct TripPolicy {
    pub min_samples: usize,
}

impl Default for TripPolicy {
    fn default() -> Self {
        TripPolicy {
            min_samples: MIN_SAMPLES,
        }
    }
}

impl TripPolicy {
    /// Build a trip from a buffer if it holds more than `min_samples` samples.
    pub fn finalize(
        &self,
        key: VehicleKey,
        buffer: VehicleBuffer,
        area: &MonitoredArea,
    ) -> Option<Trip> {
        if buffer.len() <= self.min_samples {
            info!(
                vehicle = %key,
                samples = buffer.len(),
                min_samples = self.min_samples,
                "vehicle left the area, too few samples, discarding"
            );
            return None;
        }

        info!(
            vehicle = %key,
            samples = buffer.len(),
            "vehicle left the area, trip complete"
        );
        Some(Trip {
            key,
            samples: buffer.samples,
            area: *area,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
