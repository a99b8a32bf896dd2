//! Scanner configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use camwatch_core::{Credentials, DiscoveryConfig, OnvifAddress};
use serde::Deserialize;

/// Scanner configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Interval in milliseconds between `poll_for_changes` calls.
    /// Override: `CAMWATCH_POLL_INTERVAL_MS`
    pub poll_interval_ms: u64,

    /// Interval in seconds between repeated active searches.
    /// Override: `CAMWATCH_SEARCH_INTERVAL_SECS`
    pub search_interval_secs: u64,

    /// Run WS-Discovery and ONVIF polling.
    /// Override: `CAMWATCH_ENABLE_ONVIF`
    pub enable_onvif: bool,

    /// Run SSDP discovery and UPnP description fetches.
    /// Override: `CAMWATCH_ENABLE_UPNP`
    pub enable_upnp: bool,

    /// Engine timing.
    pub discovery: DiscoveryConfig,

    /// Per-device ONVIF settings.
    pub devices: Vec<DeviceEntry>,
}

/// User settings for one ONVIF device.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DeviceEntry {
    pub uuid: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Address polled for profiles and stream URIs.
    pub host: Option<String>,
    pub port: Option<u16>,
}

impl DeviceEntry {
    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.username, &self.password) {
            (None, None) => None,
            (user, pass) => Some(Credentials::new(
                user.clone().unwrap_or_default(),
                pass.clone().unwrap_or_default(),
            )),
        }
    }

    pub fn selected_addr(&self) -> Option<OnvifAddress> {
        self.host
            .as_ref()
            .map(|host| OnvifAddress::new(host.clone(), self.port.unwrap_or(80)))
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            search_interval_secs: 300,
            enable_onvif: true,
            enable_upnp: true,
            discovery: DiscoveryConfig::default(),
            devices: Vec::new(),
        }
    }
}

impl ScannerConfig {
    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Self::from_yaml(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("CAMWATCH_POLL_INTERVAL_MS") {
            if let Ok(ms) = val.parse() {
                self.poll_interval_ms = ms;
            }
        }

        if let Ok(val) = std::env::var("CAMWATCH_SEARCH_INTERVAL_SECS") {
            if let Ok(secs) = val.parse() {
                self.search_interval_secs = secs;
            }
        }

        if let Ok(val) = std::env::var("CAMWATCH_ENABLE_ONVIF") {
            if let Ok(enabled) = val.parse() {
                self.enable_onvif = enabled;
            }
        }

        if let Ok(val) = std::env::var("CAMWATCH_ENABLE_UPNP") {
            if let Ok(enabled) = val.parse() {
                self.enable_upnp = enabled;
            }
        }

        // Note: CAMWATCH_LOG_LEVEL is handled by clap via #[arg(env = ...)] in main.rs
    }

    fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(anyhow!("poll_interval_ms must be > 0"));
        }
        if self.search_interval_secs == 0 {
            return Err(anyhow!("search_interval_secs must be > 0"));
        }
        if let Some(entry) = self.devices.iter().find(|d| d.uuid.is_empty()) {
            return Err(anyhow!("device entry without uuid: {:?}", entry.host));
        }
        self.discovery.upnp.validate().map_err(|e| anyhow!(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_yaml_gives_defaults() {
        let config = ScannerConfig::from_yaml("{}").unwrap();
        assert_eq!(config.poll_interval_ms, 500);
        assert!(config.enable_onvif && config.enable_upnp);
        assert_eq!(config.discovery, DiscoveryConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_devices_and_nested_discovery() {
        let yaml = r#"
poll_interval_ms: 250
enable_upnp: false
discovery:
  onvif:
    probe_repeat: 2
  upnp:
    search_retries: 5
devices:
  - uuid: "urn:uuid:cam-1"
    username: admin
    password: secret
    host: 10.0.0.5
    port: 8080
  - uuid: "urn:uuid:cam-2"
"#;
        let config = ScannerConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.poll_interval_ms, 250);
        assert!(!config.enable_upnp);
        assert_eq!(config.discovery.onvif.probe_repeat, 2);
        assert_eq!(config.discovery.upnp.search_retries, 5);
        assert_eq!(config.devices.len(), 2);

        let first = &config.devices[0];
        assert_eq!(first.credentials(), Some(Credentials::new("admin", "secret")));
        assert_eq!(first.selected_addr(), Some(OnvifAddress::new("10.0.0.5", 8080)));

        let second = &config.devices[1];
        assert_eq!(second.credentials(), None);
        assert_eq!(second.selected_addr(), None);
    }

    #[test]
    fn rejects_inverted_search_interval() {
        let yaml = r#"
discovery:
  upnp:
    search_min_interval_secs: 20
    search_max_interval_secs: 10
"#;
        let config = ScannerConfig::from_yaml(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_device_without_uuid() {
        let config = ScannerConfig::from_yaml("devices:\n  - host: 10.0.0.5\n").unwrap();
        assert!(config.validate().is_err());
    }
}
