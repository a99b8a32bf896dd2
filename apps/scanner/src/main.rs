//! Camwatch Scanner - headless camera discovery.
//!
//! Runs the ONVIF and UPnP discovery engines against the local network and
//! prints every device table change as a JSON line on stdout. The URL codec
//! subcommands convert between device identities and the pseudo-URLs stored
//! in camera configurations.

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use camwatch_core::protocol_constants::SEARCH_TARGET_ALL;
use camwatch_core::{
    construct_onvif_url, construct_upnp_url, extract_usn_from_upnp_url,
    extract_uuid_from_onvif_url, ControlPointManager, DeviceEvent, DeviceEventHub,
    OnvifDeviceManager, TokioSpawner,
};
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::signal;

use crate::config::ScannerConfig;

/// Camwatch Scanner - ONVIF and UPnP camera discovery.
#[derive(Parser, Debug)]
#[command(name = "camwatch-scanner")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE", env = "CAMWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "CAMWATCH_LOG_LEVEL")]
    log_level: log::LevelFilter,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Discover devices and print table changes as JSON lines (default).
    Watch {
        /// Exit after this many seconds instead of running until signalled.
        #[arg(long, value_name = "SECS")]
        once: Option<u64>,
    },
    /// Build a UPnP pseudo-URL for a USN.
    EncodeUpnp {
        usn: String,
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        password: Option<String>,
        #[arg(long)]
        path: Option<String>,
        #[arg(long, default_value = "http")]
        scheme: String,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Build an ONVIF pseudo-URL for a device uuid.
    EncodeOnvif {
        uuid: String,
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        password: Option<String>,
        /// Stream URI the scheme, port and path are taken from.
        #[arg(long)]
        stream_uri: Option<String>,
    },
    /// Print the identity a pseudo-URL refers to.
    Decode { url: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    match args.command.unwrap_or(Command::Watch { once: None }) {
        Command::Watch { once } => {
            log::info!("Camwatch Scanner v{}", env!("CARGO_PKG_VERSION"));
            let config = ScannerConfig::load(args.config.as_deref())
                .context("Failed to load configuration")?;
            watch(config, once.map(Duration::from_secs)).await
        }
        Command::EncodeUpnp {
            usn,
            username,
            password,
            path,
            scheme,
            port,
        } => {
            println!(
                "{}",
                construct_upnp_url(
                    &usn,
                    username.as_deref(),
                    password.as_deref(),
                    path.as_deref(),
                    &scheme,
                    port,
                )
            );
            Ok(())
        }
        Command::EncodeOnvif {
            uuid,
            username,
            password,
            stream_uri,
        } => {
            println!(
                "{}",
                construct_onvif_url(
                    &uuid,
                    username.as_deref(),
                    password.as_deref(),
                    stream_uri.as_deref(),
                )
            );
            Ok(())
        }
        Command::Decode { url } => {
            println!("{}", decode(&url)?);
            Ok(())
        }
    }
}

/// Describes the identity behind a UPnP or ONVIF pseudo-URL as JSON.
fn decode(url: &str) -> Result<serde_json::Value> {
    if let Ok(usn) = extract_usn_from_upnp_url(url) {
        return Ok(json!({ "kind": "upnp", "usn": usn }));
    }
    if let Ok(uuid) = extract_uuid_from_onvif_url(url) {
        return Ok(json!({ "kind": "onvif", "uuid": uuid }));
    }
    Err(anyhow!("not a camera pseudo-URL: {url}"))
}

/// Runs both engines until a shutdown signal or the optional deadline.
async fn watch(config: ScannerConfig, run_for: Option<Duration>) -> Result<()> {
    log::info!(
        "Configuration: poll_interval_ms={}, search_interval_secs={}, onvif={}, upnp={}",
        config.poll_interval_ms,
        config.search_interval_secs,
        config.enable_onvif,
        config.enable_upnp
    );

    let hub = DeviceEventHub::new();
    let mut subscription = hub.subscribe();

    let onvif = if config.enable_onvif {
        let manager =
            OnvifDeviceManager::with_defaults(config.discovery.onvif.clone(), TokioSpawner::current())
                .context("Failed to create ONVIF HTTP client")?;
        for entry in &config.devices {
            manager.set_device_settings(&entry.uuid, entry.credentials(), entry.selected_addr());
        }
        Some(manager)
    } else {
        None
    };

    let mut upnp = config
        .enable_upnp
        .then(|| ControlPointManager::with_defaults(config.discovery.upnp.clone()));

    // The first tick of each interval fires immediately.
    let mut search_tick = tokio::time::interval(Duration::from_secs(config.search_interval_secs));
    let mut poll_tick = tokio::time::interval(Duration::from_millis(config.poll_interval_ms));
    poll_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let deadline = async {
        match run_for {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = search_tick.tick() => {
                log::debug!("[Scanner] Active search");
                if let Some(onvif) = &onvif {
                    onvif.active_search(None, false);
                }
                if let Some(upnp) = upnp.as_mut() {
                    upnp.active_search(SEARCH_TARGET_ALL);
                }
            }
            _ = poll_tick.tick() => {
                if let Some(onvif) = &onvif {
                    let (changed, gone) = onvif.poll_for_changes();
                    hub.publish_onvif_diff(&changed, &gone);
                }
                if let Some(upnp) = upnp.as_mut() {
                    let (changed, gone) = upnp.poll_for_changes();
                    hub.publish_upnp_diff(&changed, &gone);
                }
            }
            Some(event) = subscription.recv() => {
                let line = event_line(&event, onvif.as_ref(), upnp.as_ref());
                println!("{line}");
            }
            _ = &mut shutdown => {
                log::info!("Shutdown signal received");
                break;
            }
            _ = &mut deadline => {
                log::info!("Run time elapsed");
                break;
            }
        }
    }

    let onvif_count = onvif.as_ref().map_or(0, |m| m.get_devices().len());
    let upnp_count = upnp.as_ref().map_or(0, |m| m.get_devices().len());
    log::info!(
        "Shutdown complete ({} ONVIF, {} UPnP devices known)",
        onvif_count,
        upnp_count
    );
    Ok(())
}

/// One JSON output line: the event plus the device's current entry.
fn event_line(
    event: &DeviceEvent,
    onvif: Option<&Arc<OnvifDeviceManager>>,
    upnp: Option<&ControlPointManager>,
) -> serde_json::Value {
    let device = match event {
        DeviceEvent::OnvifChanged { uuid, .. } => onvif
            .and_then(|m| m.get_device(uuid))
            .map(|state| {
                json!({
                    "name": state.friendly_name(true),
                    "state": state,
                })
            }),
        DeviceEvent::UpnpChanged { usn, .. } => upnp
            .and_then(|m| m.get_device(usn))
            .map(|device| json!(device.info())),
        DeviceEvent::OnvifGone { .. } | DeviceEvent::UpnpGone { .. } => None,
    };
    json!({ "event": event, "device": device })
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_recognizes_both_encodings() {
        let upnp = construct_upnp_url("uuid:cam-1", None, None, Some("/img.jpg"), "http", None);
        assert_eq!(decode(&upnp).unwrap(), json!({ "kind": "upnp", "usn": "uuid:cam-1" }));

        let onvif = construct_onvif_url("urn:uuid:cam-2", None, None, None);
        assert_eq!(decode(&onvif).unwrap(), json!({ "kind": "onvif", "uuid": "urn:uuid:cam-2" }));

        assert!(decode("http://10.0.0.5/").is_err());
    }

    #[test]
    fn gone_event_line_has_no_device() {
        let event = DeviceEvent::UpnpGone {
            usn: "uuid:cam-1".into(),
            timestamp: 1,
        };
        let line = event_line(&event, None, None);
        assert_eq!(line["event"]["type"], "upnpGone");
        assert!(line["device"].is_null());
    }

    #[test]
    fn args_default_to_watch() {
        let args = Args::try_parse_from(["camwatch-scanner"]).unwrap();
        assert!(args.command.is_none());

        let args = Args::try_parse_from(["camwatch-scanner", "watch", "--once", "10"]).unwrap();
        assert!(matches!(args.command, Some(Command::Watch { once: Some(10) })));
    }
}
