//! Per-vehicle buffers of in-area samples.
//!
//! The store exclusively owns every buffer. A buffer leaves the store only by
//! being popped (vehicle left the area) or swept (vehicle went silent).

use std::collections::HashMap;

use tracing::{info, warn};

use crate::identity::VehicleKey;
use crate::types::PositionSample;

/// Samples collected for one vehicle run while it has been inside the area.
#[derive(Debug, Clone, Default)]
pub struct VehicleBuffer {
    pub samples: Vec<PositionSample>,
    /// Highest logical timestamp seen for this run.
    pub last_seen: i64,
}

impl VehicleBuffer {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Logical seconds since this run last reported.
    pub fn age(&self, clock: i64) -> i64 {
        clock.saturating_sub(self.last_seen)
    }

    pub fn is_expired(&self, clock: i64, threshold: i64) -> bool {
        self.age(clock) >= threshold
    }
}

/// Mapping from vehicle run to its buffer.
#[derive(Debug, Default)]
pub struct VehicleStore {
    buffers: HashMap<VehicleKey, VehicleBuffer>,
}

impl VehicleStore {
    pub fn new() -> Self {
        VehicleStore {
            buffers: HashMap::new(),
        }
    }

    /// Append an in-area sample, opening a buffer if the run is new.
    ///
    /// Returns `true` when this sample started tracking the run.
    pub fn record_in_area(&mut self, key: &VehicleKey, sample: PositionSample) -> bool {
        let entered = !self.buffers.contains_key(key);
        if entered {
            info!(
                vehicle = %key,
                timestamp = sample.timestamp,
                "vehicle entered the monitored area"
            );
            self.buffers.insert(
                key.clone(),
                VehicleBuffer {
                    samples: Vec::new(),
                    last_seen: sample.timestamp,
                },
            );
        }

        if let Some(buffer) = self.buffers.get_mut(key) {
            buffer.last_seen = buffer.last_seen.max(sample.timestamp);
            buffer.samples.push(sample);
        }
        entered
    }

    /// Remove and return the buffer for `key`, if the run is being tracked.
    pub fn pop_if_present(&mut self, key: &VehicleKey) -> Option<VehicleBuffer> {
        self.buffers.remove(key)
    }

    /// Drop every run whose last sample lags `clock` by `threshold` or more.
    /// Returns the removed keys; their samples are discarded.
    pub fn sweep_expired(&mut self, clock: i64, threshold: i64) -> Vec<VehicleKey> {
        let expired: Vec<VehicleKey> = self
            .buffers
            .iter()
            .filter(|(_, buf)| buf.is_expired(clock, threshold))
            .map(|(k, _)| k.clone())
            .collect();

        for key in &expired {
            if let Some(buf) = self.buffers.remove(key) {
                warn!(
                    vehicle = %key,
                    last_seen = buf.last_seen,
                    clock,
                    samples = buf.len(),
                    "dropped expired vehicle"
                );
            }
        }
        expired
    }

    pub fn get(&self, key: &VehicleKey) -> Option<&VehicleBuffer> {
        self.buffers.get(key)
    }

    pub fn contains(&self, key: &VehicleKey) -> bool {
        self.buffers.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn key(route: &str) -> VehicleKey {
        VehicleKey {
            route_number: route.into(),
            route_name: "Westendinasema".into(),
            operating_day: "2022-03-01".into(),
            start_time: "07:55".into(),
        }
    }

    fn sample(ts: i64) -> PositionSample {
        PositionSample {
            route_number: "550".into(),
            direction: Some("1".into()),
            operator: Some(22),
            vehicle_number: Some(845),
            time: None,
            timestamp: ts,
            speed: Some(10.0),
            heading: None,
            lat: Some(60.15),
            long: Some(25.0),
            acceleration: None,
            schedule_offset: None,
            odometer: None,
            door_status: None,
            operating_day: "2022-03-01".into(),
            start_time: "07:55".into(),
            stop: None,
        }
    }

    #[test]
    fn test_record_creates_buffer() {
        let mut store = VehicleStore::new();
        assert!(store.record_in_area(&key("550"), sample(100)));
        assert!(!store.record_in_area(&key("550"), sample(101)));

        let buf = store.get(&key("550")).unwrap();
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.last_seen, 101);
    }

    #[test]
    fn test_last_seen_is_max() {
        let mut store = VehicleStore::new();
        store.record_in_area(&key("550"), sample(105));
        store.record_in_area(&key("550"), sample(101));

        let buf = store.get(&key("550")).unwrap();
        assert_eq!(buf.last_seen, 105);
        // Arrival order is kept even when timestamps go backwards
        assert_eq!(buf.samples[0].timestamp, 105);
        assert_eq!(buf.samples[1].timestamp, 101);
    }

    #[test]
    fn test_pop_if_present() {
        let mut store = VehicleStore::new();
        assert!(store.pop_if_present(&key("550")).is_none());

        store.record_in_area(&key("550"), sample(100));
        let buf = store.pop_if_present(&key("550")).unwrap();
        assert_eq!(buf.len(), 1);
        assert!(store.is_empty());
        assert!(store.pop_if_present(&key("550")).is_none());
    }

    #[test]
    fn test_sweep_expired() {
        let mut store = VehicleStore::new();
        store.record_in_area(&key("550"), sample(100));
        store.record_in_area(&key("560"), sample(130));

        assert!(store.sweep_expired(159, 60).is_empty());
        assert_eq!(store.sweep_expired(160, 60), vec![key("550")]);
        assert!(!store.contains(&key("550")));
        assert!(store.contains(&key("560")));

        assert_eq!(store.sweep_expired(190, 60), vec![key("560")]);
        assert!(store.is_empty());
    }

    #[test]
    fn test_sweep_removes_many() {
        let mut store = VehicleStore::new();
        for route in ["1", "2", "3", "4"] {
            store.record_in_area(&key(route), sample(100));
        }
        let mut removed = store.sweep_expired(500, 60);
        removed.sort();
        assert_eq!(removed.len(), 4);
        assert!(store.is_empty());
    }
}
