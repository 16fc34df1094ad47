//! Client for the AMeDAS weather-telemetry network.
//!
//! The station catalog is a one-shot JSON fetch at startup: a table keyed by
//! station id, each record carrying a display name, lat/lon as
//! degree+minute pairs, and a capability code string whose sixth character
//! flags snowfall reporting. Per-sample telemetry is published hourly in
//! 3-hour files on a fixed UTC+9 clock.

use chrono::{DateTime, Duration, FixedOffset, Timelike, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;

const CATALOG_URL: &str = "https://www.jma.go.jp/bosai/amedas/const/amedastable.json";
const POINT_URL: &str = "https://www.jma.go.jp/bosai/amedas/data/point";

/// Observations appear with a delay; sample 10 minutes behind the clock.
const SETTLING_LAG_MINUTES: i64 = 10;

/// Index of the snowfall flag within the `elems` capability string.
const SNOW_ELEM_INDEX: usize = 5;

/// Errors from catalog or telemetry fetches.
#[derive(Debug, thiserror::Error)]
pub enum AmedasError {
    #[error("Catalog fetch failed: {0}")]
    Catalog(String),
    #[error("Telemetry fetch failed: {0}")]
    Telemetry(String),
    #[error("Unexpected payload: {0}")]
    Payload(String),
}

/// The provider's publication clock (UTC+9).
pub fn provider_offset() -> FixedOffset {
    FixedOffset::east_opt(9 * 3600).expect("UTC+9 is a valid offset")
}

/// Current time on the provider clock.
pub fn provider_now() -> DateTime<FixedOffset> {
    Utc::now().with_timezone(&provider_offset())
}

#[derive(Debug, Deserialize)]
struct RawStation {
    #[serde(rename = "kjName")]
    kj_name: String,
    lat: [f64; 2],
    lon: [f64; 2],
    #[serde(default)]
    elems: String,
}

/// A weather-telemetry station, decoded to decimal degrees.
#[derive(Debug, Clone)]
pub struct Station {
    pub id: String,
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    pub reports_snow: bool,
}

fn deg_min_to_decimal(pair: [f64; 2]) -> f64 {
    pair[0] + pair[1] / 60.0
}

/// Immutable station table, loaded once at startup.
pub struct StationCatalog {
    stations: Vec<Station>,
}

impl StationCatalog {
    pub fn new(stations: Vec<Station>) -> Self {
        StationCatalog { stations }
    }

    /// One-shot fetch of the provider's station table.
    pub async fn fetch(client: &reqwest::Client) -> Result<Self, AmedasError> {
        let resp = client
            .get(CATALOG_URL)
            .send()
            .await
            .map_err(|e| AmedasError::Catalog(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(AmedasError::Catalog(format!("status {}", resp.status())));
        }
        let raw: BTreeMap<String, RawStation> = resp
            .json()
            .await
            .map_err(|e| AmedasError::Payload(e.to_string()))?;
        Ok(Self::from_raw(raw))
    }

    fn from_raw(raw: BTreeMap<String, RawStation>) -> Self {
        let stations = raw
            .into_iter()
            .map(|(id, record)| Station {
                id,
                name: record.kj_name,
                lat: deg_min_to_decimal(record.lat),
                lon: deg_min_to_decimal(record.lon),
                reports_snow: record.elems.as_bytes().get(SNOW_ELEM_INDEX) == Some(&b'1'),
            })
            .collect();
        StationCatalog { stations }
    }

    pub fn len(&self) -> usize {
        self.stations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }

    /// Nearest snowfall-capable station by planar distance over decimal
    /// degrees (sufficient at single-country scale). Ties keep the first
    /// candidate in table order. `None` when no capable station exists.
    pub fn nearest_snow_station(&self, lat: f64, lon: f64) -> Option<&Station> {
        let mut best: Option<(&Station, f64)> = None;
        for station in self.stations.iter().filter(|s| s.reports_snow) {
            let distance = (station.lat - lat).powi(2) + (station.lon - lon).powi(2);
            match best {
                Some((_, best_distance)) if distance >= best_distance => {}
                _ => best = Some((station, distance)),
            }
        }
        best.map(|(station, _)| station)
    }
}

/// Request path stamp and lookup key for one observation instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryBucket {
    /// `YYYYMMDD_hh` with the hour truncated to the 3-hour file boundary.
    pub file_stamp: String,
    /// `YYYYMMDDHH0000`, the exact-hour key inside the file.
    pub hour_key: String,
}

/// Compute the bucket for `now` on the provider clock: the settling lag is
/// subtracted first, then the hour truncates to the most recent 3-hour file.
pub fn telemetry_bucket(now: DateTime<FixedOffset>) -> TelemetryBucket {
    let t = now - Duration::minutes(SETTLING_LAG_MINUTES);
    let date = t.format("%Y%m%d");
    let file_hour = t.hour() / 3 * 3;
    TelemetryBucket {
        file_stamp: format!("{}_{:02}", date, file_hour),
        hour_key: format!("{}{:02}0000", date, t.hour()),
    }
}

#[derive(Debug, Deserialize)]
struct HourlyEntry {
    #[serde(default)]
    snow: Option<(Option<f64>, Option<i64>)>,
}

/// One station-hour snowfall observation: `[value, quality]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SnowReading {
    pub depth_cm: Option<f64>,
    pub quality: Option<i64>,
}

impl SnowReading {
    /// Active snowfall: a value is present and its quality code is normal
    /// (0) or quasi-normal (1). Other codes mark the value unusable.
    pub fn indicates_snowfall(&self) -> bool {
        self.depth_cm.is_some() && matches!(self.quality, Some(0) | Some(1))
    }
}

/// Fetch the station's telemetry file for the bucket and look up the snow
/// pair at the exact-hour key. A missing hour or absent snow element is
/// `None` (no snowfall signal), not an error.
pub async fn fetch_snow_reading(
    client: &reqwest::Client,
    station_id: &str,
    bucket: &TelemetryBucket,
) -> Result<Option<SnowReading>, AmedasError> {
    let url = format!("{}/{}/{}.json", POINT_URL, station_id, bucket.file_stamp);
    let resp = client
        .get(&url)
        .send()
        .await
        .map_err(|e| AmedasError::Telemetry(e.to_string()))?;
    if !resp.status().is_success() {
        return Err(AmedasError::Telemetry(format!(
            "{}: status {}",
            url,
            resp.status()
        )));
    }
    let hours: BTreeMap<String, HourlyEntry> = resp
        .json()
        .await
        .map_err(|e| AmedasError::Payload(e.to_string()))?;
    Ok(hours
        .get(&bucket.hour_key)
        .and_then(|entry| entry.snow)
        .map(|(depth_cm, quality)| SnowReading { depth_cm, quality }))
}
