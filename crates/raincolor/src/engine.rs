//! Orchestration: the tick loop and the presentation boundary.
//!
//! The engine owns the active location map. Ticks and presentation commands
//! ({Reload, Open, Exit}) are serialized through one `select!` loop, so a
//! reload can never interleave inside a location's sample/decide/act/notify
//! sequence. After every tick a summary is published through a watch
//! channel for the presentation layer to render.

use crate::amedas::StationCatalog;
use crate::color::Rgb;
use crate::config::{self, ConfigError, Location};
use crate::devices::switchbot::SwitchBotClient;
use crate::devices::yeelight::{self, YeelightBulb};
use crate::devices::{self, DeviceBackend, DeviceCommand, DeviceEndpoint};
use crate::notify::Notifier;
use crate::sampler::{self, ConditionSource};
use crate::state::{self, Transition};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// How long the local-protocol discovery probe listens for replies.
const DISCOVERY_WAIT: Duration = Duration::from_secs(2);

/// Commands from the presentation layer into the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCommand {
    /// Re-read the configuration and swap in a fresh location map.
    Reload,
    /// Open the named location's status page in a browser.
    Open(String),
    /// Stop the engine.
    Exit,
}

/// Icon for one location; the fill is the most recently actuated color.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IconState {
    pub fill: Rgb,
    pub outline: Rgb,
}

/// One location's entry in the tick summary.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationStatus {
    pub name: String,
    /// `"<name>: ok"` at baseline, `"<name>: <r> <g> <b>"` otherwise.
    pub line: String,
    pub icon: IconState,
    pub notified: bool,
}

/// Published after every tick for the presentation layer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickSummary {
    pub locations: Vec<LocationStatus>,
}

impl TickSummary {
    /// All display lines joined, tray-title style.
    pub fn title(&self) -> String {
        self.locations
            .iter()
            .map(|status| status.line.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub struct Engine<S> {
    sampler: S,
    notifier: Notifier,
    catalog: StationCatalog,
    switchbot: Option<Arc<SwitchBotClient>>,
    config_path: PathBuf,
    interval: Duration,
    locations: BTreeMap<String, Location>,
    endpoints: BTreeMap<String, Vec<DeviceEndpoint>>,
    summary_tx: watch::Sender<TickSummary>,
}

impl<S: ConditionSource> Engine<S> {
    /// Build the engine and load the initial configuration. A config file
    /// that cannot be read or parsed is fatal here; individual sections
    /// that fail to resolve are dropped with a warning.
    pub async fn new(
        sampler: S,
        notifier: Notifier,
        catalog: StationCatalog,
        switchbot: Option<Arc<SwitchBotClient>>,
        config_path: PathBuf,
        interval: Duration,
    ) -> Result<(Self, watch::Receiver<TickSummary>), ConfigError> {
        let (summary_tx, summary_rx) = watch::channel(TickSummary::default());
        let mut engine = Engine {
            sampler,
            notifier,
            catalog,
            switchbot,
            config_path,
            interval,
            locations: BTreeMap::new(),
            endpoints: BTreeMap::new(),
            summary_tx,
        };
        engine.reload().await?;
        Ok((engine, summary_rx))
    }

    pub fn location(&self, name: &str) -> Option<&Location> {
        self.locations.get(name)
    }

    pub fn location_names(&self) -> Vec<String> {
        self.locations.keys().cloned().collect()
    }

    /// Rebuild the location map from the config file. The previous map is
    /// replaced only when the file loads; run state starts over, as at
    /// process start.
    pub async fn reload(&mut self) -> Result<(), ConfigError> {
        let sections = config::load(&self.config_path)?;
        let mut locations = BTreeMap::new();
        let mut endpoints = BTreeMap::new();
        for (name, section) in &sections {
            match Location::from_section(name, section, &self.catalog) {
                Ok(location) => {
                    let location_endpoints = self.build_endpoints(&location).await;
                    log::info!(
                        "{}: station {} at ({:.4}, {:.4}), {} device(s)",
                        name,
                        location.station_id,
                        location.lat,
                        location.lon,
                        location_endpoints.len()
                    );
                    endpoints.insert(name.clone(), location_endpoints);
                    locations.insert(name.clone(), location);
                }
                Err(e) => log::warn!("Dropping section: {}", e),
            }
        }
        if locations.is_empty() {
            log::warn!("No monitorable locations configured");
        }
        self.locations = locations;
        self.endpoints = endpoints;
        Ok(())
    }

    async fn build_endpoints(&self, location: &Location) -> Vec<DeviceEndpoint> {
        let mut endpoints: Vec<DeviceEndpoint> = location
            .bulbs
            .iter()
            .map(|addr| DeviceEndpoint::Local(YeelightBulb::new(addr.as_str())))
            .collect();

        if let Some(broadcast) = &location.broadcast {
            match yeelight::discover(broadcast, DISCOVERY_WAIT).await {
                Ok(found) => {
                    log::info!("{}: discovered {} bulb(s)", location.name, found.len());
                    endpoints.extend(
                        found
                            .into_iter()
                            .map(|addr| DeviceEndpoint::Local(YeelightBulb::new(addr))),
                    );
                }
                Err(e) => log::warn!("{}: bulb discovery failed: {}", location.name, e),
            }
        }

        for device_id in &location.cloud_devices {
            match &self.switchbot {
                Some(client) => endpoints.push(DeviceEndpoint::Cloud {
                    client: client.clone(),
                    device_id: device_id.clone(),
                }),
                None => log::warn!(
                    "{}: cloud device {} configured but credentials are unavailable",
                    location.name,
                    device_id
                ),
            }
        }
        endpoints
    }

    /// Run until `Exit` or shutdown. The first tick fires immediately,
    /// then on the fixed interval.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<EngineCommand>,
        mut shutdown: watch::Receiver<()>,
    ) {
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = interval.tick() => self.tick().await,
                command = commands.recv() => match command {
                    Some(EngineCommand::Reload) => match self.reload().await {
                        Ok(()) => self.tick().await,
                        Err(e) => {
                            log::error!("Reload failed, keeping previous configuration: {}", e);
                        }
                    },
                    Some(EngineCommand::Open(name)) => self.open(&name),
                    Some(EngineCommand::Exit) | None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        log::info!("Engine stopped");
    }

    /// One pass over every location. Failures are contained per location;
    /// the summary always covers the full active set.
    pub async fn tick(&mut self) {
        let mut statuses = Vec::with_capacity(self.locations.len());
        for (name, location) in self.locations.iter_mut() {
            let endpoints = self
                .endpoints
                .get(name)
                .map(Vec::as_slice)
                .unwrap_or_default();
            let status =
                process_location(&self.sampler, &self.notifier, location, endpoints).await;
            statuses.push(status);
        }
        let summary = TickSummary { locations: statuses };
        log::debug!("tick: {}", summary.title().replace('\n', " | "));
        self.summary_tx.send_replace(summary);
    }

    /// Open the location's status page, with the `rainsnow/` segment when
    /// the last sample saw active precipitation.
    fn open(&self, name: &str) {
        let Some(location) = self.locations.get(name) else {
            log::warn!("Open: unknown location '{}'", name);
            return;
        };
        let url = sampler::variant_url(&location.page_url, location.last_rainsnow);
        if let Err(e) = open::that(&url) {
            log::warn!("Open {}: {}", url, e);
        }
    }
}

/// Sample one location, apply the transition rule, drive devices and sinks.
///
/// A transient sample error logs, reports a red-outlined sentinel icon and
/// leaves all state untouched (fail-open: no actuation, no notification).
async fn process_location<S: ConditionSource, B: DeviceBackend>(
    sampler: &S,
    notifier: &Notifier,
    location: &mut Location,
    endpoints: &[B],
) -> LocationStatus {
    let sample = match sampler.sample(location).await {
        Ok(sample) => sample,
        Err(e) => {
            log::warn!("{}: sample failed, skipping this tick: {}", location.name, e);
            return LocationStatus {
                name: location.name.clone(),
                line: format!("{}: {}", location.name, Rgb::BLACK),
                icon: IconState {
                    fill: Rgb::BLACK,
                    outline: Rgb::RED,
                },
                notified: location.notified,
            };
        }
    };
    location.last_rainsnow = sample.rainsnow;

    let transition = state::decide(location.notified, location.baseline, sample.color);
    match transition {
        Transition::Started => location.notified = true,
        Transition::Cleared => location.notified = false,
        Transition::None => {}
    }

    // Devices track the current color every tick, edges or not.
    let command = DeviceCommand::for_sample(sample.color, location.baseline);
    devices::fan_out(endpoints, &command).await;

    if transition != Transition::None {
        notifier.notify(location, transition).await;
    }

    let at_baseline = sample.color == location.baseline;
    let line = if at_baseline {
        format!("{}: ok", location.name)
    } else {
        format!("{}: {}", location.name, sample.color)
    };
    let icon = if command.is_off() {
        IconState {
            fill: Rgb::BLACK,
            outline: if at_baseline { Rgb::WHITE } else { Rgb::RED },
        }
    } else {
        IconState {
            fill: sample.color,
            outline: Rgb::WHITE,
        }
    };
    LocationStatus {
        name: location.name.clone(),
        line,
        icon,
        notified: location.notified,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::ActuationError;
    use crate::sampler::{Sample, SampleError};
    use std::sync::Mutex;

    struct ScriptedSource {
        samples: Mutex<Vec<Result<Sample, SampleError>>>,
    }

    impl ScriptedSource {
        fn new(samples: Vec<Result<Sample, SampleError>>) -> Self {
            ScriptedSource {
                samples: Mutex::new(samples),
            }
        }
    }

    impl ConditionSource for ScriptedSource {
        async fn sample(&self, _location: &Location) -> Result<Sample, SampleError> {
            self.samples.lock().unwrap().remove(0)
        }
    }

    struct RecordingBackend {
        applied: Mutex<Vec<DeviceCommand>>,
    }

    impl RecordingBackend {
        fn new() -> Self {
            RecordingBackend {
                applied: Mutex::new(Vec::new()),
            }
        }
    }

    impl DeviceBackend for RecordingBackend {
        fn label(&self) -> String {
            "recorder".to_string()
        }

        async fn apply(&self, command: &DeviceCommand) -> Result<(), ActuationError> {
            self.applied.lock().unwrap().push(*command);
            Ok(())
        }
    }

    fn test_location() -> Location {
        let catalog = StationCatalog::new(vec![crate::amedas::Station {
            id: "44132".to_string(),
            name: "東京".to_string(),
            lat: 35.7,
            lon: 139.75,
            reports_snow: true,
        }]);
        let sections =
            config::parse("yamada:\n  location: \"https://example.com/?lat=35.7&lon=139.75\"\n")
                .unwrap();
        Location::from_section("yamada", &sections["yamada"], &catalog).unwrap()
    }

    fn sample(color: Rgb) -> Result<Sample, SampleError> {
        Ok(Sample {
            color,
            rainsnow: false,
        })
    }

    #[tokio::test]
    async fn started_turns_devices_on() {
        let source = ScriptedSource::new(vec![sample(Rgb::new(10, 10, 10))]);
        let notifier = Notifier::new(reqwest::Client::new());
        let mut location = test_location();
        let backends = vec![RecordingBackend::new()];

        let status = process_location(&source, &notifier, &mut location, &backends).await;

        assert!(location.notified);
        assert_eq!(status.line, "yamada: 10 10 10");
        assert_eq!(status.icon.fill, Rgb::new(10, 10, 10));
        assert_eq!(status.icon.outline, Rgb::WHITE);
        let applied = backends[0].applied.lock().unwrap().clone();
        assert_eq!(
            applied,
            vec![DeviceCommand::for_sample(Rgb::new(10, 10, 10), location.baseline)]
        );
    }

    #[tokio::test]
    async fn cleared_turns_devices_off() {
        let source = ScriptedSource::new(vec![sample(Rgb::DEFAULT_BASELINE)]);
        let notifier = Notifier::new(reqwest::Client::new());
        let mut location = test_location();
        location.notified = true;
        let backends = vec![RecordingBackend::new()];

        let status = process_location(&source, &notifier, &mut location, &backends).await;

        assert!(!location.notified);
        assert_eq!(status.line, "yamada: ok");
        assert_eq!(status.icon.fill, Rgb::BLACK);
        assert_eq!(status.icon.outline, Rgb::WHITE);
        let applied = backends[0].applied.lock().unwrap().clone();
        assert_eq!(applied.len(), 1);
        assert!(applied[0].is_off());
    }

    #[tokio::test]
    async fn sentinel_black_turns_devices_off_but_follows_equality_rule() {
        let source = ScriptedSource::new(vec![sample(Rgb::BLACK)]);
        let notifier = Notifier::new(reqwest::Client::new());
        let mut location = test_location();
        let backends = vec![RecordingBackend::new()];

        let status = process_location(&source, &notifier, &mut location, &backends).await;

        // Black differs from the baseline, so the state machine still
        // registers a start; only the devices treat it as "off".
        assert!(location.notified);
        assert_eq!(status.icon.fill, Rgb::BLACK);
        assert_eq!(status.icon.outline, Rgb::RED);
        let applied = backends[0].applied.lock().unwrap().clone();
        assert!(applied[0].is_off());
    }

    #[tokio::test]
    async fn sample_error_is_fail_open() {
        let source = ScriptedSource::new(vec![Err(SampleError::Page("boom".to_string()))]);
        let notifier = Notifier::new(reqwest::Client::new());
        let mut location = test_location();
        location.notified = true;
        location.last_rainsnow = true;
        let backends = vec![RecordingBackend::new()];

        let status = process_location(&source, &notifier, &mut location, &backends).await;

        // No state mutation, no actuation.
        assert!(location.notified);
        assert!(location.last_rainsnow);
        assert!(backends[0].applied.lock().unwrap().is_empty());
        assert_eq!(status.icon.outline, Rgb::RED);
    }

    #[tokio::test]
    async fn persisting_condition_actuates_without_renotifying() {
        let color = Rgb::new(10, 10, 10);
        let source = ScriptedSource::new(vec![sample(color), sample(color)]);
        let notifier = Notifier::new(reqwest::Client::new());
        let mut location = test_location();
        let backends = vec![RecordingBackend::new()];

        process_location(&source, &notifier, &mut location, &backends).await;
        assert!(location.notified);
        process_location(&source, &notifier, &mut location, &backends).await;
        assert!(location.notified);

        // Both ticks re-issued the identical idempotent command.
        let applied = backends[0].applied.lock().unwrap().clone();
        assert_eq!(applied.len(), 2);
        assert_eq!(applied[0], applied[1]);
    }
}
