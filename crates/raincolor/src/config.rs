//! Configuration file loading.
//!
//! The file is a YAML map of location name to section. Recognized keys:
//! `location` (status page URL carrying `lat=`/`lon=` query parameters),
//! `bulb` / `sb_device_id` (whitespace-separated device lists), `broadcast`,
//! `post` / `channel`, `format_falling` / `format_clear`, the `vvox*`
//! speech settings and `rgb` (baseline color). A section whose station
//! cannot be resolved is dropped with a warning; the rest of the file
//! keeps working.

use crate::amedas::StationCatalog;
use crate::color::Rgb;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_INTERVAL_SECS: u64 = 300;

const DEFAULT_FORMAT_FALLING: &str = "さんの家、降り始めたみたいです";
const DEFAULT_FORMAT_CLEAR: &str = "さんの家、止んだみたいです";

const DEFAULT_VVOX_HOST: &str = "localhost";
const DEFAULT_VVOX_PORT: u16 = 50021;
const DEFAULT_VVOX_VOICE: u32 = 3;
const DEFAULT_VVOX_SPEED: f32 = 1.2;

/// Configuration errors. File-level variants are fatal at startup; section
/// variants drop only the affected location.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config read error: {0}")]
    Io(String),
    #[error("Config parse error: {0}")]
    Parse(String),
    #[error("Section '{name}': {reason}")]
    Section { name: String, reason: String },
}

/// One named section as written in the file.
#[derive(Debug, Clone, Deserialize)]
pub struct LocationSection {
    /// Status page URL; its query string carries the coordinates.
    pub location: String,
    /// Whitespace-separated local bulb addresses (`ip` or `ip:port`).
    #[serde(default)]
    pub bulb: Option<String>,
    /// Broadcast address to probe for local bulbs at (re)load.
    #[serde(default)]
    pub broadcast: Option<String>,
    /// Whitespace-separated cloud device ids.
    #[serde(default)]
    pub sb_device_id: Option<String>,
    /// Webhook URL for transition messages.
    #[serde(default)]
    pub post: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub format_falling: Option<String>,
    #[serde(default)]
    pub format_clear: Option<String>,
    /// Enable speech synthesis for transition messages.
    #[serde(default)]
    pub vvox: bool,
    #[serde(default)]
    pub vvox_host: Option<String>,
    #[serde(default)]
    pub vvox_port: Option<u16>,
    #[serde(default)]
    pub vvox_voice: Option<u32>,
    #[serde(default)]
    pub vvox_speed: Option<f32>,
    /// Baseline color as `"r g b"`.
    #[serde(default)]
    pub rgb: Option<String>,
}

pub type ConfigFile = BTreeMap<String, LocationSection>;

/// Load the configuration file.
pub fn load(path: impl AsRef<Path>) -> Result<ConfigFile, ConfigError> {
    let contents = std::fs::read_to_string(path.as_ref())
        .map_err(|e| ConfigError::Io(format!("{}: {}", path.as_ref().display(), e)))?;
    parse(&contents)
}

/// Parse configuration from a YAML string.
pub fn parse(yaml: &str) -> Result<ConfigFile, ConfigError> {
    serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))
}

/// Default config location: `~/.config/raincolor.yaml`.
pub fn default_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("raincolor.yaml")
}

/// Webhook notification target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookTarget {
    pub url: String,
    pub channel: Option<String>,
}

/// Speech synthesis target.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechTarget {
    pub host: String,
    pub port: u16,
    pub voice: u32,
    pub speed: f32,
}

/// A monitored location: resolved configuration plus mutable run state.
///
/// Only locations whose station resolution succeeded enter the active map.
#[derive(Debug, Clone)]
pub struct Location {
    pub name: String,
    pub page_url: String,
    pub lat: f64,
    pub lon: f64,
    /// Resolved once at load; immutable afterwards.
    pub station_id: String,
    pub baseline: Rgb,
    pub bulbs: Vec<String>,
    pub broadcast: Option<String>,
    pub cloud_devices: Vec<String>,
    pub webhook: Option<WebhookTarget>,
    pub speech: Option<SpeechTarget>,
    pub format_falling: String,
    pub format_clear: String,
    /// Debounce flag: true after a Started transition until Cleared.
    pub notified: bool,
    /// Whether the last sampled telemetry indicated active precipitation.
    pub last_rainsnow: bool,
}

impl Location {
    /// Build a runtime location from a section, resolving its station.
    pub fn from_section(
        name: &str,
        section: &LocationSection,
        catalog: &StationCatalog,
    ) -> Result<Self, ConfigError> {
        let section_error = |reason: String| ConfigError::Section {
            name: name.to_string(),
            reason,
        };

        let (lat, lon) = parse_latlon(&section.location).ok_or_else(|| {
            section_error("location URL lacks lat=/lon= query parameters".to_string())
        })?;

        let station = catalog
            .nearest_snow_station(lat, lon)
            .ok_or_else(|| section_error("no snowfall-capable station in the catalog".to_string()))?;

        let baseline = match &section.rgb {
            Some(raw) => raw.parse().map_err(|e| section_error(format!("{}", e)))?,
            None => Rgb::DEFAULT_BASELINE,
        };

        let webhook = section.post.as_ref().map(|url| WebhookTarget {
            url: url.clone(),
            channel: section.channel.clone(),
        });

        let speech = section.vvox.then(|| SpeechTarget {
            host: section
                .vvox_host
                .clone()
                .unwrap_or_else(|| DEFAULT_VVOX_HOST.to_string()),
            port: section.vvox_port.unwrap_or(DEFAULT_VVOX_PORT),
            voice: section.vvox_voice.unwrap_or(DEFAULT_VVOX_VOICE),
            speed: section.vvox_speed.unwrap_or(DEFAULT_VVOX_SPEED),
        });

        Ok(Location {
            name: name.to_string(),
            page_url: section.location.clone(),
            lat,
            lon,
            station_id: station.id.clone(),
            baseline,
            bulbs: split_list(section.bulb.as_deref()),
            broadcast: section.broadcast.clone(),
            cloud_devices: split_list(section.sb_device_id.as_deref()),
            webhook,
            speech,
            format_falling: section
                .format_falling
                .clone()
                .unwrap_or_else(|| DEFAULT_FORMAT_FALLING.to_string()),
            format_clear: section
                .format_clear
                .clone()
                .unwrap_or_else(|| DEFAULT_FORMAT_CLEAR.to_string()),
            notified: false,
            last_rainsnow: false,
        })
    }
}

fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .map(|v| v.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

/// Pull `lat`/`lon` out of the status page URL's query string.
pub fn parse_latlon(url: &str) -> Option<(f64, f64)> {
    let (_, query) = url.split_once('?')?;
    let mut lat = None;
    let mut lon = None;
    for pair in query.split('&') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        match key {
            "lat" => lat = value.parse().ok(),
            "lon" => lon = value.parse().ok(),
            _ => {}
        }
    }
    Some((lat?, lon?))
}
