//! Trip tracker: the per-message state machine.
//!
//! Pure logic, no I/O. Each message goes through identity resolution,
//! geofence classification, store mutation and an expiration sweep, in that
//! order. The caller gets back `TrackEvent`s and decides what to do with
//! finished trips (render, publish, archive).
//!
//! Expiration runs on a logical clock, the highest sample timestamp seen so
//! far, so transport stalls and reconnects never expire anyone by themselves.

use tracing::{debug, error, warn};

use crate::finalize::{Trip, TripPolicy};
use crate::geofence::MonitoredArea;
use crate::identity::{resolve_key, VehicleKey};
use crate::store::VehicleStore;
use crate::types::*;

/// Runs silent for this many logical seconds are dropped.
pub const EXPIRE_AFTER: i64 = 60;

// ---------------------------------------------------------------------------
// Track events (output)
// ---------------------------------------------------------------------------

/// Events emitted by the tracker for the caller to act on.
#[derive(Debug, Clone)]
pub enum TrackEvent {
    /// First in-area sample of a run.
    Entered { key: VehicleKey, timestamp: i64 },
    /// Run left the area with enough samples. Ownership of the samples moves
    /// to the caller.
    Finalized(Trip),
    /// Run left the area with too few samples.
    Discarded { key: VehicleKey, samples: usize },
    /// Run went silent inside the area and was dropped.
    Expired { key: VehicleKey },
}

// ---------------------------------------------------------------------------
// Logical clock
// ---------------------------------------------------------------------------

/// Running maximum of every sample timestamp observed.
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalClock {
    now: Option<i64>,
}

impl GlobalClock {
    pub fn new() -> Self {
        GlobalClock { now: None }
    }

    /// Advance to `timestamp` if it is newer. Returns the current time.
    pub fn observe(&mut self, timestamp: i64) -> i64 {
        let now = self.now.map_or(timestamp, |t| t.max(timestamp));
        self.now = Some(now);
        now
    }

    /// `None` until the first timestamp is observed.
    pub fn now(&self) -> Option<i64> {
        self.now
    }
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// Track vehicle runs through one monitored area.
///
/// One instance per process, owned by the feed loop and handed each message
/// in order. Nothing in here is shared or locked.
pub struct Tracker {
    pub store: VehicleStore,
    pub clock: GlobalClock,
    pub area: MonitoredArea,
    pub policy: TripPolicy,
    pub expire_after: i64,

    // Counters
    pub total_messages: u64,
    pub malformed_messages: u64,
    pub missing_coordinates: u64,
    pub trips_finalized: u64,
    pub trips_discarded: u64,
    pub runs_expired: u64,
}

impl Tracker {
    pub fn new(area: MonitoredArea, policy: TripPolicy, expire_after: i64) -> Self {
        Tracker {
            store: VehicleStore::new(),
            clock: GlobalClock::new(),
            area,
            policy,
            expire_after,
            total_messages: 0,
            malformed_messages: 0,
            missing_coordinates: 0,
            trips_finalized: 0,
            trips_discarded: 0,
            runs_expired: 0,
        }
    }

    /// Tracker with the default trip policy and expiration threshold.
    pub fn with_area(area: MonitoredArea) -> Self {
        Self::new(area, TripPolicy::default(), EXPIRE_AFTER)
    }

    /// Process one raw feed message. Never fails: a bad message is logged
    /// and skipped.
    pub fn handle_message(&mut self, topic: &str, payload: &[u8]) -> Vec<TrackEvent> {
        self.total_messages += 1;

        let sample = match parse_message(payload) {
            Ok(s) => s,
            Err(e) => {
                self.malformed_messages += 1;
                error!(
                    topic,
                    payload = %String::from_utf8_lossy(payload),
                    error = %e,
                    "could not parse message"
                );
                return Vec::new();
            }
        };

        self.update(topic, sample)
    }

    /// Process one parsed sample.
    pub fn update(&mut self, topic: &str, sample: PositionSample) -> Vec<TrackEvent> {
        let mut events = Vec::new();

        // The clock trusts timestamps even when the position is unusable.
        let now = self.clock.observe(sample.timestamp);

        match self.apply(topic, sample, &mut events) {
            Ok(()) => {}
            Err(SpeedwatchError::InvalidCoordinate) => {
                self.missing_coordinates += 1;
                debug!(topic, "sample without coordinates, skipping");
            }
            Err(e) => {
                error!(topic, clock = now, error = %e, "could not process message");
            }
        }

        for key in self.store.sweep_expired(now, self.expire_after) {
            self.runs_expired += 1;
            events.push(TrackEvent::Expired { key });
        }

        events
    }

    fn apply(
        &mut self,
        topic: &str,
        sample: PositionSample,
        events: &mut Vec<TrackEvent>,
    ) -> Result<()> {
        let key = resolve_key(topic, &sample)?;

        if self.area.contains(sample.lat, sample.long)? {
            let timestamp = sample.timestamp;
            if self.store.record_in_area(&key, sample) {
                events.push(TrackEvent::Entered { key, timestamp });
            }
            return Ok(());
        }

        let Some(buffer) = self.store.pop_if_present(&key) else {
            return Ok(());
        };
        let samples = buffer.len();
        match self.policy.finalize(key.clone(), buffer, &self.area) {
            Some(trip) => {
                self.trips_finalized += 1;
                events.push(TrackEvent::Finalized(trip));
            }
            None => {
                self.trips_discarded += 1;
                events.push(TrackEvent::Discarded { key, samples });
            }
        }
        Ok(())
    }

    /// Number of runs currently inside the area.
    pub fn tracked_count(&self) -> usize {
        self.store.len()
    }

    /// Log a one-line summary of the counters.
    pub fn log_summary(&self) {
        if self.malformed_messages > 0 {
            warn!(
                malformed = self.malformed_messages,
                "some messages could not be parsed"
            );
        }
        debug!(
            messages = self.total_messages,
            tracked = self.store.len(),
            finalized = self.trips_finalized,
            discarded = self.trips_discarded,
            expired = self.runs_expired,
            "tracker summary"
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
