//! Device actuation fan-out.
//!
//! Actuation reacts to the current sampled color every tick, not to
//! notify/clear edges, so commands must be idempotent: repeating an "off"
//! or an identical "on" is harmless. Each backend is its own failure
//! domain; one device failing never blocks its siblings.

pub mod switchbot;
pub mod yeelight;

use crate::color::Rgb;
use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;

/// Indicator brightness: the bulb is a signal, not a light source.
pub const INDICATOR_BRIGHTNESS: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Power {
    On,
    Off,
}

/// One idempotent device intent, rebuilt fresh each tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceCommand {
    pub power: Power,
    pub color: Option<Rgb>,
    pub brightness: Option<u8>,
}

impl DeviceCommand {
    /// Off at the baseline color or the no-data sentinel; otherwise on with
    /// the sampled color at indicator brightness.
    pub fn for_sample(color: Rgb, baseline: Rgb) -> Self {
        if color == baseline || color == Rgb::BLACK {
            DeviceCommand {
                power: Power::Off,
                color: None,
                brightness: None,
            }
        } else {
            DeviceCommand {
                power: Power::On,
                color: Some(color),
                brightness: Some(INDICATOR_BRIGHTNESS),
            }
        }
    }

    pub fn is_off(&self) -> bool {
        self.power == Power::Off
    }
}

/// Errors from a single device command.
#[derive(Debug, thiserror::Error)]
pub enum ActuationError {
    #[error("Connect failed: {0}")]
    Connect(String),
    #[error("IO error: {0}")]
    Io(String),
    #[error("API error: {0}")]
    Api(String),
    #[error("Timed out")]
    Timeout,
}

/// A device endpoint that can apply a command.
///
/// The fan-out is generic over this seam so tests can record and fail
/// commands without real devices.
pub trait DeviceBackend: Send + Sync {
    /// Human-readable target for logs.
    fn label(&self) -> String;

    fn apply(
        &self,
        command: &DeviceCommand,
    ) -> impl Future<Output = Result<(), ActuationError>> + Send;
}

/// Apply one command to every backend concurrently, isolating failures per
/// device. Never returns an error to the caller.
pub async fn fan_out<B: DeviceBackend>(backends: &[B], command: &DeviceCommand) {
    let results = join_all(backends.iter().map(|b| b.apply(command))).await;
    for (backend, result) in backends.iter().zip(results) {
        if let Err(e) = result {
            log::warn!("Device {}: {}", backend.label(), e);
        }
    }
}

/// A location's configured endpoint, either protocol.
pub enum DeviceEndpoint {
    Local(yeelight::YeelightBulb),
    Cloud {
        client: Arc<switchbot::SwitchBotClient>,
        device_id: String,
    },
}

impl DeviceBackend for DeviceEndpoint {
    fn label(&self) -> String {
        match self {
            DeviceEndpoint::Local(bulb) => format!("bulb {}", bulb.addr()),
            DeviceEndpoint::Cloud { device_id, .. } => format!("cloud {}", device_id),
        }
    }

    async fn apply(&self, command: &DeviceCommand) -> Result<(), ActuationError> {
        match self {
            DeviceEndpoint::Local(bulb) => bulb.apply(command).await,
            DeviceEndpoint::Cloud { client, device_id } => {
                client.apply(device_id, command).await
            }
        }
    }
}
