//! Trip rendering: title text and a two-panel SVG chart.
//!
//! Left panel: speed over time with the limit as a dashed line and readings
//! above it in red. Right panel: the path through the monitored area, same
//! colouring, with an arrow on the last reading showing direction of travel.

use std::fmt::Write as _;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::DateTime;
use tracing::info;

use speedwatch_core::finalize::SPEEDING_THRESHOLD;
use speedwatch_core::{PositionSample, Trip};

const WIDTH: f64 = 1200.0;
const HEIGHT: f64 = 450.0;
const TITLE_HEIGHT: f64 = 50.0;
const MARGIN: f64 = 50.0;
const SPEED_PANEL_WIDTH: f64 = 760.0;
/// Upper bound on speed axis labels, whatever the readings.
const MAX_SPEED_TICKS: usize = 20;

const COLOR_NORMAL: &str = "#1f77b4";
const COLOR_SPEEDING: &str = "red";

/// Output of rendering one trip.
#[derive(Debug, Clone)]
pub struct Rendering {
    pub path: PathBuf,
    pub title: String,
}

/// Produces an image artifact and a title for a finished trip.
pub trait TripRenderer: Send + Sync {
    fn render(&self, trip: &Trip) -> Result<Rendering>;
}

// ---------------------------------------------------------------------------
// Title
// ---------------------------------------------------------------------------

/// Human-readable one-line description of a trip.
pub fn trip_title(trip: &Trip) -> String {
    let key = &trip.key;
    let mut title = format!(
        "Route {} ({}) - departure {} {}. ",
        key.route_number, key.route_name, key.operating_day, key.start_time
    );

    let limit = trip.area.speed_limit;
    match trip.max_overspeed_kmh() {
        Some(over) if over >= SPEEDING_THRESHOLD => {
            let _ = write!(
                title,
                "Max overspeed {:.1} km/h ({:.0}%).",
                over,
                100.0 * over / limit
            );
        }
        Some(over) if over > 0.0 => title.push_str("No notable overspeed."),
        _ => title.push_str("No overspeed."),
    }
    title
}

// ---------------------------------------------------------------------------
// SVG renderer
// ---------------------------------------------------------------------------

/// Writes `<uuid>.svg` files into a directory.
pub struct SvgRenderer {
    dir: PathBuf,
}

impl SvgRenderer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        SvgRenderer { dir: dir.into() }
    }
}

impl TripRenderer for SvgRenderer {
    fn render(&self, trip: &Trip) -> Result<Rendering> {
        let title = trip_title(trip);
        let svg = render_svg(trip, &title);

        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating {}", self.dir.display()))?;
        let path = self.dir.join(format!("{}.svg", uuid::Uuid::new_v4()));
        std::fs::write(&path, svg).with_context(|| format!("writing {}", path.display()))?;

        info!(path = %path.display(), vehicle = %trip.key, "rendered trip");
        Ok(Rendering { path, title })
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn clock_label(timestamp: i64) -> String {
    DateTime::from_timestamp(timestamp, 0)
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| timestamp.to_string())
}

/// Render the full SVG document for a trip.
pub fn render_svg(trip: &Trip, title: &str) -> String {
    let mut svg = String::new();
    let _ = writeln!(
        svg,
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{WIDTH}" height="{HEIGHT}" viewBox="0 0 {WIDTH} {HEIGHT}" font-family="sans-serif" font-size="12">"#
    );
    let _ = writeln!(svg, r#"<rect width="100%" height="100%" fill="white"/>"#);
    let _ = writeln!(
        svg,
        r#"<text x="{}" y="30" text-anchor="middle" font-size="16">{}</text>"#,
        WIDTH / 2.0,
        escape(title)
    );
    let mut samples: Vec<&PositionSample> = trip.samples.iter().collect();
    samples.sort_by_key(|s| s.timestamp);
    speed_panel(&mut svg, trip, &samples);
    map_panel(&mut svg, trip, &samples);
    svg.push_str("</svg>\n");
    svg
}

/// Speed axis label step: 10 or 20 km/h, widened so at most
/// `MAX_SPEED_TICKS` labels are drawn.
fn speed_tick_step(v_top: f64) -> f64 {
    let step = if v_top > 60.0 { 20.0 } else { 10.0 };
    if v_top / step > MAX_SPEED_TICKS as f64 {
        (v_top / MAX_SPEED_TICKS as f64).ceil()
    } else {
        step
    }
}

fn speed_panel(svg: &mut String, trip: &Trip, samples: &[&PositionSample]) {
    let limit = trip.area.speed_limit;
    let points: Vec<(i64, f64)> = samples
        .iter()
        .filter_map(|s| s.speed_kmh().map(|v| (s.timestamp, v)))
        .collect();

    let x0 = MARGIN;
    let x1 = SPEED_PANEL_WIDTH - MARGIN / 2.0;
    let y0 = HEIGHT - MARGIN;
    let y1 = TITLE_HEIGHT + MARGIN / 2.0;

    let (t_min, t_max) = trip.time_span().unwrap_or((0, 1));
    let t_span = (t_max - t_min).max(1) as f64;
    let max_speed = points.iter().map(|p| p.1).fold(0.0, f64::max);
    let v_top = (limit + 10.0).max(max_speed + 5.0);

    let x = |t: i64| x0 + (t - t_min) as f64 / t_span * (x1 - x0);
    let y = |v: f64| y0 - v / v_top * (y0 - y1);

    // Axes
    let _ = writeln!(
        svg,
        r#"<line x1="{x0}" y1="{y0}" x2="{x1}" y2="{y0}" stroke="black"/><line x1="{x0}" y1="{y0}" x2="{x0}" y2="{y1}" stroke="black"/>"#
    );
    let _ = writeln!(
        svg,
        r#"<text x="{}" y="{}" text-anchor="middle">Time</text>"#,
        (x0 + x1) / 2.0,
        HEIGHT - 10.0
    );
    let _ = writeln!(
        svg,
        r#"<text x="15" y="{0}" text-anchor="middle" transform="rotate(-90 15 {0})">Speed (km/h)</text>"#,
        (y0 + y1) / 2.0
    );
    for t in [t_min, t_min + (t_max - t_min) / 2, t_max] {
        let _ = writeln!(
            svg,
            r#"<text x="{:.1}" y="{}" text-anchor="middle">{}</text>"#,
            x(t),
            y0 + 16.0,
            clock_label(t)
        );
    }
    let step = speed_tick_step(v_top);
    for i in 0..=MAX_SPEED_TICKS {
        let v = step * i as f64;
        if v > v_top {
            break;
        }
        let _ = writeln!(
            svg,
            r#"<text x="{}" y="{:.1}" text-anchor="end">{v:.0}</text>"#,
            x0 - 5.0,
            y(v) + 4.0
        );
    }

    // Limit
    let _ = writeln!(
        svg,
        r#"<line x1="{x0}" y1="{0:.1}" x2="{x1}" y2="{0:.1}" stroke="{COLOR_SPEEDING}" stroke-dasharray="6,4"/>"#,
        y(limit)
    );

    if points.is_empty() {
        return;
    }

    let path: Vec<String> = points
        .iter()
        .map(|&(t, v)| format!("{:.1},{:.1}", x(t), y(v)))
        .collect();
    let _ = writeln!(
        svg,
        r#"<polyline points="{}" fill="none" stroke="{COLOR_NORMAL}" stroke-width="1.5"/>"#,
        path.join(" ")
    );
    for &(t, v) in &points {
        let color = if v > limit { COLOR_SPEEDING } else { COLOR_NORMAL };
        let _ = writeln!(
            svg,
            r#"<circle cx="{:.1}" cy="{:.1}" r="3" fill="{color}"><title>{v:.1} km/h</title></circle>"#,
            x(t),
            y(v)
        );
    }
}

fn map_panel(svg: &mut String, trip: &Trip, samples: &[&PositionSample]) {
    let area = &trip.area;
    let limit = area.speed_limit;

    let px0 = SPEED_PANEL_WIDTH + MARGIN / 2.0;
    let px1 = WIDTH - MARGIN / 2.0;
    let py0 = TITLE_HEIGHT + MARGIN / 2.0;
    let py1 = HEIGHT - MARGIN;

    // Equirectangular, longitude shrunk by cos(lat) so the area keeps its shape.
    let (center_lat, _) = area.center();
    let kx = center_lat.to_radians().cos();
    let world_w = ((area.east - area.west) * kx).max(f64::EPSILON);
    let world_h = (area.north - area.south).max(f64::EPSILON);
    let scale = ((px1 - px0) / world_w).min((py1 - py0) / world_h);
    let ox = px0 + ((px1 - px0) - world_w * scale) / 2.0;
    let oy = py0 + ((py1 - py0) - world_h * scale) / 2.0;

    let project = |lat: f64, long: f64| {
        (
            ox + (long - area.west) * kx * scale,
            oy + (area.north - lat) * scale,
        )
    };

    let _ = writeln!(
        svg,
        r##"<rect x="{ox:.1}" y="{oy:.1}" width="{:.1}" height="{:.1}" fill="#f4f4f4" stroke="#999"/>"##,
        world_w * scale,
        world_h * scale
    );

    let points: Vec<(f64, f64, Option<f64>)> = samples
        .iter()
        .filter_map(|s| match (s.lat, s.long) {
            (Some(lat), Some(long)) => {
                let (x, y) = project(lat, long);
                Some((x, y, s.speed_kmh()))
            }
            _ => None,
        })
        .collect();
    if points.is_empty() {
        return;
    }

    let path: Vec<String> = points
        .iter()
        .map(|(x, y, _)| format!("{x:.1},{y:.1}"))
        .collect();
    let _ = writeln!(
        svg,
        r#"<polyline points="{}" fill="none" stroke="{COLOR_NORMAL}" stroke-width="1.5"/>"#,
        path.join(" ")
    );
    for (x, y, v) in &points[..points.len() - 1] {
        let color = match v {
            Some(v) if *v > limit => COLOR_SPEEDING,
            _ => COLOR_NORMAL,
        };
        let _ = writeln!(svg, r#"<circle cx="{x:.1}" cy="{y:.1}" r="2.5" fill="{color}"/>"#);
    }

    // Direction arrow on the last reading
    let (lx, ly, lv) = points[points.len() - 1];
    let angle = if points.len() >= 2 {
        let (px, py, _) = points[points.len() - 2];
        (ly - py).atan2(lx - px).to_degrees()
    } else {
        0.0
    };
    let color = match lv {
        Some(v) if v > limit => COLOR_SPEEDING,
        _ => COLOR_NORMAL,
    };
    let _ = writeln!(
        svg,
        r#"<polygon points="8,0 -6,-6 -6,6" fill="{color}" transform="translate({lx:.1} {ly:.1}) rotate({angle:.1})"/>"#
    );
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use speedwatch_core::{MonitoredArea, PositionSample, VehicleKey};

    fn sample(ts: i64, speed_ms: Option<f64>, lat: f64) -> PositionSample {
        PositionSample {
            route_number: "550".into(),
            direction: Some("1".into()),
            operator: Some(22),
            vehicle_number: Some(845),
            time: None,
            timestamp: ts,
            speed: speed_ms,
            heading: None,
            lat: Some(lat),
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

    fn trip(speeds_kmh: &[f64]) -> Trip {
        Trip {
            key: VehicleKey {
                route_number: "550".into(),
                route_name: "Westendinasema".into(),
                operating_day: "2022-03-01".into(),
                start_time: "07:55".into(),
            },
            samples: speeds_kmh
                .iter()
                .enumerate()
                .map(|(i, v)| sample(100 + i as i64, Some(v / 3.6), 60.11 + i as f64 * 0.005))
                .collect(),
            area: MonitoredArea::new(60.20, 60.10, 25.10, 24.90, 50.0),
        }
    }

    #[test]
    fn test_title_speeding() {
        let title = trip_title(&trip(&[40.0, 60.0, 45.0]));
        assert_eq!(
            title,
            "Route 550 (Westendinasema) - departure 2022-03-01 07:55. Max overspeed 10.0 km/h (20%)."
        );
    }

    #[test]
    fn test_title_minor_overspeed() {
        let title = trip_title(&trip(&[40.0, 52.0]));
        assert!(title.ends_with("No notable overspeed."));
    }

    #[test]
    fn test_title_no_overspeed() {
        assert!(trip_title(&trip(&[30.0, 49.0])).ends_with("No overspeed."));

        let mut t = trip(&[30.0]);
        t.samples[0].speed = None;
        assert!(trip_title(&t).ends_with("No overspeed."));
    }

    #[test]
    fn test_render_svg_contents() {
        let t = trip(&[40.0, 60.0, 45.0]);
        let svg = render_svg(&t, "A & B");
        assert!(svg.starts_with("<svg"));
        assert!(svg.trim_end().ends_with("</svg>"));
        assert!(svg.contains("A &amp; B"));
        assert!(svg.contains("stroke-dasharray"));
        // One red marker on the speed panel for the 60 km/h reading
        assert!(svg.contains(r#"r="3" fill="red""#));
        assert!(svg.contains("<polygon"));
    }

    #[test]
    fn test_render_single_sample() {
        let t = trip(&[45.0]);
        let svg = render_svg(&t, "single");
        assert!(svg.contains("<polygon"));
    }

    fn speed_marker_xs(svg: &str) -> Vec<f64> {
        svg.lines()
            .filter(|l| l.starts_with("<circle") && l.contains(r#"r="3""#))
            .map(|l| {
                let rest = &l[l.find("cx=\"").unwrap() + 4..];
                rest[..rest.find('"').unwrap()].parse().unwrap()
            })
            .collect()
    }

    #[test]
    fn test_speed_tick_step() {
        assert_eq!(speed_tick_step(60.0), 10.0);
        assert_eq!(speed_tick_step(100.0), 20.0);
        let step = speed_tick_step(1e17);
        assert!(1e17 / step <= MAX_SPEED_TICKS as f64);
    }

    #[test]
    fn test_render_huge_speed_is_bounded() {
        let mut t = trip(&[40.0; 11]);
        t.samples[5].speed = Some(1e17);
        let svg = render_svg(&t, "huge");

        let labels = svg.matches(r#"text-anchor="end""#).count();
        assert!(labels <= MAX_SPEED_TICKS + 1);
        assert!(svg.len() < 100_000);
        assert!(svg.trim_end().ends_with("</svg>"));
    }

    #[test]
    fn test_render_unrepresentable_speed_skipped() {
        let mut t = trip(&[40.0, 45.0]);
        t.samples[1].speed = Some(1e308);
        let svg = render_svg(&t, "overflow");
        assert_eq!(speed_marker_xs(&svg).len(), 1);
        assert!(!svg.contains("inf"));
    }

    #[test]
    fn test_late_samples_stay_inside_speed_panel() {
        let mut t = trip(&[40.0, 45.0, 50.0, 55.0, 42.0]);
        for (s, ts) in t.samples.iter_mut().zip([100, 103, 101, 98, 104]) {
            s.timestamp = ts;
        }
        let svg = render_svg(&t, "late");

        let xs = speed_marker_xs(&svg);
        assert_eq!(xs.len(), 5);
        for x in &xs {
            assert!(*x >= MARGIN && *x <= SPEED_PANEL_WIDTH - MARGIN / 2.0, "x={x}");
        }
        // Drawn in time order
        assert!(xs.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_svg_renderer_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = SvgRenderer::new(dir.path().join("renders"));
        let rendering = renderer.render(&trip(&[40.0, 60.0])).unwrap();

        assert!(rendering.path.exists());
        assert_eq!(rendering.path.extension().unwrap(), "svg");
        assert!(rendering.title.starts_with("Route 550"));
        let text = std::fs::read_to_string(&rendering.path).unwrap();
        assert!(text.contains("Route 550"));
    }
}
