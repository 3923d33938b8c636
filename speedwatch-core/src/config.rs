//! Configuration file management for speedwatch.
//!
//! Reads/writes `~/.speedwatch/config.yaml` with the monitored area, tracker
//! thresholds, feed broker, tracked routes, output directories and webhook.

use std::path::PathBuf;

use crate::finalize::MIN_SAMPLES;
use crate::geofence::MonitoredArea;
use crate::tracker::EXPIRE_AFTER;
use crate::types::SpeedwatchError;

/// Full configuration structure.
#[derive(Debug, Clone)]
pub struct Config {
    pub area: AreaConfig,
    pub tracker: TrackerConfig,
    pub feed: FeedConfig,
    pub output: OutputConfig,
    pub routes: Vec<String>,
    pub webhook: Option<String>,
}

/// Area bounds are optional here so the CLI can supply or override them.
#[derive(Debug, Clone, Default)]
pub struct AreaConfig {
    pub north: Option<f64>,
    pub south: Option<f64>,
    pub east: Option<f64>,
    pub west: Option<f64>,
    pub speed_limit: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub expire_after: i64,
    pub min_samples: usize,
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct OutputConfig {
    pub render_dir: String,
    pub archive_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            area: AreaConfig::default(),
            tracker: TrackerConfig {
                expire_after: EXPIRE_AFTER,
                min_samples: MIN_SAMPLES,
            },
            feed: FeedConfig {
                host: "mqtt.hsl.fi".into(),
                port: 8883,
            },
            output: OutputConfig {
                render_dir: "data/renders".into(),
                archive_dir: "data/archive".into(),
            },
            routes: Vec::new(),
            webhook: None,
        }
    }
}

impl AreaConfig {
    /// Build the monitored area. Every bound and the speed limit must be set.
    pub fn to_area(&self) -> Result<MonitoredArea, SpeedwatchError> {
        let get = |name: &str, v: Option<f64>| {
            v.ok_or_else(|| SpeedwatchError::Config(format!("area {name} is not set")))
        };
        let area = MonitoredArea::new(
            get("north", self.north)?,
            get("south", self.south)?,
            get("east", self.east)?,
            get("west", self.west)?,
            get("speed_limit", self.speed_limit)?,
        );
        area.validate()?;
        Ok(area)
    }
}

impl TrackerConfig {
    /// Reject thresholds that would stop every trip from completing. A zero
    /// `expire_after` sweeps each run on the message that opened it.
    pub fn validate(&self) -> Result<(), SpeedwatchError> {
        if self.expire_after <= 0 {
            return Err(SpeedwatchError::Config(format!(
                "tracker expire_after must be positive, got {}",
                self.expire_after
            )));
        }
        Ok(())
    }
}

/// Get the config directory path (`~/.speedwatch/`).
pub fn config_dir() -> PathBuf {
    dirs_home().join(".speedwatch")
}

/// Get the config file path.
pub fn config_file() -> PathBuf {
    config_dir().join("config.yaml")
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Load config from `~/.speedwatch/config.yaml`.
///
/// Returns default config if file doesn't exist.
pub fn load_config() -> Config {
    let path = config_file();
    if !path.exists() {
        return Config::default();
    }

    let text = match std::fs::read_to_string(&path) {
        Ok(t) => t,
        Err(_) => return Config::default(),
    };

    parse_config(&text)
}

/// Save config to `~/.speedwatch/config.yaml`.
pub fn save_config(config: &Config) -> Result<PathBuf, SpeedwatchError> {
    let dir = config_dir();
    std::fs::create_dir_all(&dir).map_err(|e| SpeedwatchError::Config(e.to_string()))?;

    let path = config_file();
    let text = serialize_config(config);
    std::fs::write(&path, text).map_err(|e| SpeedwatchError::Config(e.to_string()))?;

    Ok(path)
}

/// Parse simple YAML-like config text. Unknown keys are ignored.
pub fn parse_config(text: &str) -> Config {
    let mut config = Config::default();
    let mut current_section: Option<String> = None;

    for line in text.lines() {
        let stripped = line.trim();
        if stripped.is_empty() || stripped.starts_with('#') {
            continue;
        }

        let is_indented = line.starts_with("  ") || line.starts_with('\t');

        let Some((key, val)) = stripped.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let val = val.trim();

        if !is_indented {
            if val.is_empty() {
                current_section = Some(key.to_string());
                continue;
            }
            current_section = None;
            match key {
                "webhook" => config.webhook = parse_string_value(val),
                "routes" => config.routes = parse_list_value(val),
                _ => {}
            }
            continue;
        }

        let Some(section) = current_section.as_deref() else {
            continue;
        };
        match (section, key) {
            ("area", "north") => config.area.north = parse_float_value(val),
            ("area", "south") => config.area.south = parse_float_value(val),
            ("area", "east") => config.area.east = parse_float_value(val),
            ("area", "west") => config.area.west = parse_float_value(val),
            ("area", "speed_limit") => config.area.speed_limit = parse_float_value(val),
            ("tracker", "expire_after") => {
                if let Ok(v) = val.parse() {
                    config.tracker.expire_after = v;
                }
            }
            ("tracker", "min_samples") => {
                if let Ok(v) = val.parse() {
                    config.tracker.min_samples = v;
                }
            }
            ("feed", "host") => {
                if let Some(v) = parse_string_value(val) {
                    config.feed.host = v;
                }
            }
            ("feed", "port") => {
                if let Ok(v) = val.parse() {
                    config.feed.port = v;
                }
            }
            ("output", "render_dir") => {
                if let Some(v) = parse_string_value(val) {
                    config.output.render_dir = v;
                }
            }
            ("output", "archive_dir") => {
                if let Some(v) = parse_string_value(val) {
                    config.output.archive_dir = v;
                }
            }
            _ => {}
        }
    }

    config
}

fn parse_string_value(val: &str) -> Option<String> {
    if val == "null" || val == "~" || val.is_empty() {
        return None;
    }
    // Strip quotes
    if val.len() >= 2
        && ((val.starts_with('"') && val.ends_with('"'))
            || (val.starts_with('\'') && val.ends_with('\'')))
    {
        return Some(val[1..val.len() - 1].to_string());
    }
    Some(val.to_string())
}

fn parse_float_value(val: &str) -> Option<f64> {
    if val == "null" || val == "~" || val.is_empty() {
        return None;
    }
    val.parse().ok()
}

/// `550, 560` or `[550, 560]`.
fn parse_list_value(val: &str) -> Vec<String> {
    let inner = val.trim_start_matches('[').trim_end_matches(']');
    inner
        .split(',')
        .filter_map(|s| parse_string_value(s.trim()))
        .collect()
}

fn float_line(name: &str, v: Option<f64>) -> String {
    match v {
        Some(v) => format!("  {name}: {v}"),
        None => format!("  {name}: null"),
    }
}

/// Serialize config to YAML-like text.
pub fn serialize_config(config: &Config) -> String {
    let mut lines = vec!["# speedwatch configuration".to_string(), String::new()];

    lines.push("area:".into());
    lines.push(float_line("north", config.area.north));
    lines.push(float_line("south", config.area.south));
    lines.push(float_line("east", config.area.east));
    lines.push(float_line("west", config.area.west));
    lines.push(float_line("speed_limit", config.area.speed_limit));
    lines.push(String::new());

    lines.push("tracker:".into());
    lines.push(format!("  expire_after: {}", config.tracker.expire_after));
    lines.push(format!("  min_samples: {}", config.tracker.min_samples));
    lines.push(String::new());

    lines.push("feed:".into());
    lines.push(format!("  host: \"{}\"", config.feed.host));
    lines.push(format!("  port: {}", config.feed.port));
    lines.push(String::new());

    lines.push("output:".into());
    lines.push(format!("  render_dir: \"{}\"", config.output.render_dir));
    lines.push(format!("  archive_dir: \"{}\"", config.output.archive_dir));
    lines.push(String::new());

    lines.push(format!("routes: [{}]", config.routes.join(", ")));
    match &config.webhook {
        Some(url) => lines.push(format!("webhook: \"{url}\"")),
        None => lines.push("webhook: null".into()),
    }

    lines.join("\n") + "\n"
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
