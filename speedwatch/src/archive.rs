//! Per-day CSV archive of finished trips.
//!
//! One row per sample, appended to `<dir>/<operating_day>.csv`. The header is
//! written only when the file is created.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use csv::WriterBuilder;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use speedwatch_core::{PositionSample, Trip};

/// Stores finished trips somewhere durable.
pub trait TripArchiver: Send {
    fn archive(&mut self, trip: &Trip) -> Result<PathBuf>;
}

/// One archived sample. Speed is stored in km/h.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveRow {
    pub route_number: String,
    pub direction: Option<String>,
    pub operator: Option<u32>,
    pub vehicle_number: Option<u32>,
    pub time: Option<String>,
    pub timestamp: i64,
    pub speed: Option<f64>,
    pub heading: Option<i32>,
    pub lat: Option<f64>,
    pub long: Option<f64>,
    pub acceleration: Option<f64>,
    pub schedule_offset: Option<i32>,
    pub odometer: Option<f64>,
    pub door_status: Option<u8>,
    pub operating_day: String,
    pub start_time: String,
    pub stop: Option<u32>,
    pub route_name: String,
}

impl ArchiveRow {
    pub fn from_sample(sample: &PositionSample, route_name: &str) -> Self {
        ArchiveRow {
            route_number: sample.route_number.clone(),
            direction: sample.direction.clone(),
            operator: sample.operator,
            vehicle_number: sample.vehicle_number,
            time: sample.time.clone(),
            timestamp: sample.timestamp,
            speed: sample.speed_kmh(),
            heading: sample.heading,
            lat: sample.lat,
            long: sample.long,
            acceleration: sample.acceleration,
            schedule_offset: sample.schedule_offset,
            odometer: sample.odometer,
            door_status: sample.door_status,
            operating_day: sample.operating_day.clone(),
            start_time: sample.start_time.clone(),
            stop: sample.stop,
            route_name: route_name.to_string(),
        }
    }
}

/// Archive file for an operating day. Anything but digits, letters and `-`
/// is dropped so a feed value can never escape the directory.
pub fn archive_path(dir: &Path, operating_day: &str) -> PathBuf {
    let name: String = operating_day
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect();
    let name = if name.is_empty() { "unknown".to_string() } else { name };
    dir.join(format!("{name}.csv"))
}

/// Appends trips to per-day CSV files.
pub struct CsvArchiver {
    dir: PathBuf,
}

impl CsvArchiver {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        CsvArchiver { dir: dir.into() }
    }
}

impl TripArchiver for CsvArchiver {
    fn archive(&mut self, trip: &Trip) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating {}", self.dir.display()))?;

        let path = archive_path(&self.dir, &trip.key.operating_day);
        let file_exists = path.exists();
        debug!(path = %path.display(), file_exists, "appending trip rows");

        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;

        let mut writer = WriterBuilder::new()
            .has_headers(!file_exists)
            .from_writer(file);
        for sample in &trip.samples {
            writer.serialize(ArchiveRow::from_sample(sample, trip.route_name()))?;
        }
        writer.flush()?;

        info!(
            path = %path.display(),
            vehicle = %trip.key,
            rows = trip.samples.len(),
            "archived trip"
        );
        Ok(path)
    }
}

/// Read every row of one archive file.
pub fn read_archive(path: &Path) -> Result<Vec<ArchiveRow>> {
    let mut reader =
        csv::Reader::from_path(path).with_context(|| format!("opening {}", path.display()))?;
    let mut rows = Vec::new();
    for row in reader.deserialize() {
        rows.push(row.with_context(|| format!("reading {}", path.display()))?);
    }
    Ok(rows)
}
