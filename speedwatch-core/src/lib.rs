//! speedwatch-core: Pure tracking library for transit vehicle positions.
//!
//! No async, no network. Just the trip state machine and the types around
//! it. The `speedwatch` binary wires it to the live feed and to the trip
//! renderer, publisher and archiver.

pub mod config;
pub mod finalize;
pub mod geofence;
pub mod identity;
pub mod store;
pub mod tracker;
pub mod types;

// Re-export commonly used types at crate root
pub use finalize::{Trip, TripPolicy};
pub use geofence::MonitoredArea;
pub use identity::{resolve_key, VehicleKey};
pub use store::{VehicleBuffer, VehicleStore};
pub use tracker::{GlobalClock, TrackEvent, Tracker};
pub use types::*;
