//! raincolor daemon binary.
//!
//! Loads the station catalog and configuration, then runs the monitoring
//! engine on a fixed interval until Ctrl+C.

use anyhow::Context;
use argh::FromArgs;
use raincolor::amedas::StationCatalog;
use raincolor::devices::switchbot::{self, SwitchBotClient};
use raincolor::engine::{Engine, EngineCommand};
use raincolor::notify::Notifier;
use raincolor::sampler::WebSampler;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Timeout for all outbound HTTP calls.
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(FromArgs)]
/// Precipitation monitor driving smart indicator devices and notifications
struct Args {
    /// path to the configuration file (default: ~/.config/raincolor.yaml)
    #[argh(option, short = 'c')]
    config: Option<String>,

    /// polling interval in seconds
    #[argh(option, short = 'i', default = "raincolor::config::DEFAULT_INTERVAL_SECS")]
    interval: u64,

    /// list cloud devices and their status, then exit
    #[argh(switch)]
    devices: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let env = env_logger::Env::default().default_filter_or("info");
    env_logger::init_from_env(env);

    let args: Args = argh::from_env();
    let config_path = args
        .config
        .map(PathBuf::from)
        .unwrap_or_else(raincolor::config::default_path);

    let client = reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .context("building HTTP client")?;

    // Missing credentials disable the cloud protocol, nothing else.
    let switchbot = match SwitchBotClient::from_credential_file(client.clone()) {
        Ok(switchbot) => Some(Arc::new(switchbot)),
        Err(e) => {
            log::warn!("Cloud device protocol disabled: {}", e);
            None
        }
    };

    if args.devices {
        let Some(switchbot) = &switchbot else {
            log::error!("Cloud credentials are required to list devices");
            std::process::exit(1);
        };
        return list_cloud_devices(switchbot).await;
    }

    log::info!("Fetching station catalog...");
    let catalog = match StationCatalog::fetch(&client).await {
        Ok(catalog) => catalog,
        Err(e) => {
            log::error!("Station catalog unavailable: {}", e);
            std::process::exit(1);
        }
    };
    log::info!("Station catalog loaded ({} stations)", catalog.len());

    let sampler = WebSampler::new(client.clone());
    let notifier = Notifier::new(client);

    let (engine, mut summary_rx) = Engine::new(
        sampler,
        notifier,
        catalog,
        switchbot,
        config_path,
        Duration::from_secs(args.interval),
    )
    .await
    .context("loading configuration")?;

    let (cmd_tx, cmd_rx) = mpsc::channel(8);
    let (shutdown_tx, shutdown_rx) = watch::channel(());

    ctrlc::set_handler({
        let cmd_tx = cmd_tx.clone();
        move || {
            log::info!("Received Ctrl+C, shutting down...");
            let _ = cmd_tx.try_send(EngineCommand::Exit);
            shutdown_tx.send(()).ok();
        }
    })
    .context("setting Ctrl+C handler")?;

    // Stand-in for the tray title: log each tick's summary lines.
    tokio::spawn(async move {
        while summary_rx.changed().await.is_ok() {
            let title = summary_rx.borrow().title();
            for line in title.lines() {
                log::info!("{}", line);
            }
        }
    });

    log::info!(
        "raincolor running ({}s interval). Press Ctrl+C to exit.",
        args.interval
    );
    engine.run(cmd_rx, shutdown_rx).await;

    log::info!("raincolor stopped");
    Ok(())
}

/// Dump the cloud account's devices with a status one-liner per device.
async fn list_cloud_devices(switchbot: &SwitchBotClient) -> anyhow::Result<()> {
    let list = switchbot
        .device_list()
        .await
        .context("listing cloud devices")?;
    let devices = list
        .pointer("/body/deviceList")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    for device in devices {
        let id = device
            .get("deviceId")
            .and_then(|v| v.as_str())
            .unwrap_or("?");
        let name = device
            .get("deviceName")
            .and_then(|v| v.as_str())
            .unwrap_or("?");
        let status = match switchbot.device_status(id).await {
            Ok(body) => switchbot::summarize_status(&body).unwrap_or_default(),
            Err(e) => format!("({})", e),
        };
        println!("{}\t{}\t{}", id, name, status);
    }
    Ok(())
}
