//! Weekly speeding statistics from the CSV archives.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike};
use tracing::{info, warn};

use speedwatch_core::finalize::SPEEDING_THRESHOLD;

use crate::archive::{archive_path, read_archive, ArchiveRow};

/// Highest recorded speed of one archived trip.
#[derive(Debug, Clone, PartialEq)]
pub struct TripMax {
    pub route_number: String,
    pub direction: Option<String>,
    pub operating_day: String,
    pub start_time: String,
    pub max_speed: f64,
    /// Sample timestamp (unix seconds) at which the maximum was reached.
    pub at: i64,
}

impl TripMax {
    pub fn is_speeding(&self, speed_limit: f64) -> bool {
        self.max_speed - speed_limit >= SPEEDING_THRESHOLD
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HourCount {
    pub speeding: usize,
    pub compliant: usize,
}

impl HourCount {
    pub fn total(&self) -> usize {
        self.speeding + self.compliant
    }
}

/// Last week's Monday through Sunday.
pub fn default_range(today: NaiveDate) -> (NaiveDate, NaiveDate) {
    let days_back = i64::from(today.weekday().num_days_from_monday()) + 7;
    let start = today - Duration::days(days_back);
    (start, start + Duration::days(6))
}

/// Read the archives for every day in `[from, to]`. Missing days are skipped.
pub fn load_rows(dir: &Path, from: NaiveDate, to: NaiveDate) -> Result<Vec<ArchiveRow>> {
    let mut rows = Vec::new();
    for day in from.iter_days().take_while(|d| *d <= to) {
        let path = archive_path(dir, &day.format("%Y-%m-%d").to_string());
        if !path.exists() {
            warn!(path = %path.display(), "no archive for day");
            continue;
        }
        let day_rows = read_archive(&path)?;
        info!(path = %path.display(), rows = day_rows.len(), "read archive");
        rows.extend(day_rows);
    }
    Ok(rows)
}

/// Group rows into trips and keep each trip's maximum speed. Rows without a
/// speed are ignored; a trip with no speed at all is left out.
pub fn trip_maxima(rows: &[ArchiveRow]) -> Vec<TripMax> {
    let mut trips: BTreeMap<(&str, Option<&str>, &str, &str), TripMax> = BTreeMap::new();

    for row in rows {
        let Some(speed) = row.speed else { continue };
        let key = (
            row.route_number.as_str(),
            row.direction.as_deref(),
            row.operating_day.as_str(),
            row.start_time.as_str(),
        );
        trips
            .entry(key)
            .and_modify(|t| {
                if speed > t.max_speed {
                    t.max_speed = speed;
                    t.at = row.timestamp;
                }
            })
            .or_insert_with(|| TripMax {
                route_number: row.route_number.clone(),
                direction: row.direction.clone(),
                operating_day: row.operating_day.clone(),
                start_time: row.start_time.clone(),
                max_speed: speed,
                at: row.timestamp,
            });
    }

    trips.into_values().collect()
}

/// Speeding and compliant trips per hour of day (UTC), by when the maximum
/// speed was reached.
pub fn hourly_counts(trips: &[TripMax], speed_limit: f64) -> [HourCount; 24] {
    let mut counts = [HourCount::default(); 24];
    for trip in trips {
        let Some(time) = DateTime::from_timestamp(trip.at, 0) else {
            continue;
        };
        let bucket = &mut counts[time.hour() as usize];
        if trip.is_speeding(speed_limit) {
            bucket.speeding += 1;
        } else {
            bucket.compliant += 1;
        }
    }
    counts
}

/// Histogram of trip maximum speeds with `bins` equal-width bins.
/// Returns `(bin_start, bin_end, count)`.
pub fn speed_histogram(trips: &[TripMax], bins: usize) -> Vec<(f64, f64, usize)> {
    if trips.is_empty() || bins == 0 {
        return Vec::new();
    }
    let lo = trips.iter().map(|t| t.max_speed).fold(f64::INFINITY, f64::min);
    let hi = trips
        .iter()
        .map(|t| t.max_speed)
        .fold(f64::NEG_INFINITY, f64::max);
    let width = if hi > lo { (hi - lo) / bins as f64 } else { 1.0 };

    let mut counts = vec![0usize; bins];
    for trip in trips {
        let idx = (((trip.max_speed - lo) / width) as usize).min(bins - 1);
        counts[idx] += 1;
    }

    counts
        .into_iter()
        .enumerate()
        .map(|(i, n)| {
            let start = lo + width * i as f64;
            (start, start + width, n)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(route: &str, start: &str, ts: i64, speed: Option<f64>) -> ArchiveRow {
        ArchiveRow {
            route_number: route.into(),
            direction: Some("1".into()),
            operator: Some(22),
            vehicle_number: Some(845),
            time: None,
            timestamp: ts,
            speed,
            heading: None,
            lat: Some(60.15),
            long: Some(25.0),
            acceleration: None,
            schedule_offset: None,
            odometer: None,
            door_status: None,
            operating_day: "2022-03-01".into(),
            start_time: start.into(),
            stop: None,
            route_name: "Westendinasema".into(),
        }
    }

    // 2022-03-01T06:00:00Z
    const SIX_AM: i64 = 1_646_114_400;

    #[test]
    fn test_default_range() {
        let wednesday = NaiveDate::from_ymd_opt(2022, 3, 9).unwrap();
        let (from, to) = default_range(wednesday);
        assert_eq!(from, NaiveDate::from_ymd_opt(2022, 2, 28).unwrap());
        assert_eq!(to, NaiveDate::from_ymd_opt(2022, 3, 6).unwrap());

        let monday = NaiveDate::from_ymd_opt(2022, 3, 7).unwrap();
        assert_eq!(default_range(monday).0, from);
    }

    #[test]
    fn test_trip_maxima() {
        let rows = vec![
            row("550", "07:55", SIX_AM, Some(40.0)),
            row("550", "07:55", SIX_AM + 10, Some(58.0)),
            row("550", "07:55", SIX_AM + 20, None),
            row("550", "08:05", SIX_AM + 600, Some(45.0)),
            row("560", "08:05", SIX_AM + 700, None),
        ];
        let trips = trip_maxima(&rows);

        assert_eq!(trips.len(), 2);
        assert_eq!(trips[0].start_time, "07:55");
        assert_eq!(trips[0].max_speed, 58.0);
        assert_eq!(trips[0].at, SIX_AM + 10);
        assert_eq!(trips[1].max_speed, 45.0);
    }

    #[test]
    fn test_is_speeding_threshold() {
        let mut trip = trip_maxima(&[row("550", "07:55", SIX_AM, Some(54.0))]).remove(0);
        assert!(trip.is_speeding(50.0));
        trip.max_speed = 53.9;
        assert!(!trip.is_speeding(50.0));
    }

    #[test]
    fn test_hourly_counts() {
        let rows = vec![
            row("550", "07:55", SIX_AM, Some(60.0)),
            row("550", "08:05", SIX_AM + 300, Some(45.0)),
            row("550", "09:05", SIX_AM + 3600, Some(52.0)),
        ];
        let counts = hourly_counts(&trip_maxima(&rows), 50.0);

        assert_eq!(counts[6], HourCount { speeding: 1, compliant: 1 });
        assert_eq!(counts[7], HourCount { speeding: 0, compliant: 1 });
        assert_eq!(counts.iter().map(HourCount::total).sum::<usize>(), 3);
    }

    #[test]
    fn test_speed_histogram() {
        let rows = vec![
            row("550", "07:55", SIX_AM, Some(40.0)),
            row("550", "08:05", SIX_AM, Some(50.0)),
            row("550", "08:15", SIX_AM, Some(60.0)),
        ];
        let hist = speed_histogram(&trip_maxima(&rows), 2);
        assert_eq!(hist.len(), 2);
        assert_eq!(hist[0].2, 1);
        assert_eq!(hist[1].2, 2);
        assert_eq!(hist[0].0, 40.0);
        assert!(speed_histogram(&[], 20).is_empty());
    }

    #[test]
    fn test_load_rows_skips_missing_days() {
        use crate::archive::{CsvArchiver, TripArchiver};
        use speedwatch_core::{MonitoredArea, PositionSample, Trip, VehicleKey};

        let dir = tempfile::tempdir().unwrap();
        let sample = PositionSample {
            route_number: "550".into(),
            direction: Some("1".into()),
            operator: None,
            vehicle_number: None,
            time: None,
            timestamp: SIX_AM,
            speed: Some(15.0),
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
        };
        let trip = Trip {
            key: VehicleKey {
                route_number: "550".into(),
                route_name: "Westendinasema".into(),
                operating_day: "2022-03-01".into(),
                start_time: "07:55".into(),
            },
            samples: vec![sample],
            area: MonitoredArea::new(60.20, 60.10, 25.10, 24.90, 50.0),
        };
        CsvArchiver::new(dir.path()).archive(&trip).unwrap();

        let from = NaiveDate::from_ymd_opt(2022, 2, 28).unwrap();
        let to = NaiveDate::from_ymd_opt(2022, 3, 6).unwrap();
        let rows = load_rows(dir.path(), from, to).unwrap();
        assert_eq!(rows.len(), 1);
        assert!((rows[0].speed.unwrap() - 54.0).abs() < 1e-9);
    }
}
