//! Tunable discovery configuration.
//!
//! Wire-level constants live in [`crate::protocol_constants`]; everything here
//! is a timing or retry policy that deployments may want to adjust. All fields
//! have defaults matching the behavior cameras in the field are known to
//! tolerate.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for both discovery engines.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// WS-Discovery / ONVIF polling policy.
    pub onvif: OnvifConfig,
    /// SSDP / UPnP description policy.
    pub upnp: UpnpConfig,
}

/// ONVIF engine timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OnvifConfig {
    /// Wall time of one probe round (seconds). A discovery runs two rounds.
    pub discovery_timeout_secs: u64,

    /// Maximum number of probe sends per round, including the first.
    pub probe_repeat: u32,

    /// Upper bound of the random delay between probe resends (milliseconds).
    pub probe_max_delay_ms: u64,

    /// Timeout of a single ONVIF HTTP request (seconds).
    pub http_timeout_secs: u64,

    /// A device not seen for this long is removed on the next eviction check.
    pub device_timeout_secs: u64,

    /// Cool-down of an endpoint that sent a deviceless probe response.
    pub blacklist_timeout_secs: u64,
}

impl Default for OnvifConfig {
    fn default() -> Self {
        Self {
            discovery_timeout_secs: 5,
            probe_repeat: 4,
            probe_max_delay_ms: 600,
            http_timeout_secs: 5,
            device_timeout_secs: 30,
            blacklist_timeout_secs: 30,
        }
    }
}

impl OnvifConfig {
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs)
    }

    pub fn probe_max_delay(&self) -> Duration {
        Duration::from_millis(self.probe_max_delay_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn device_timeout(&self) -> Duration {
        Duration::from_secs(self.device_timeout_secs)
    }

    pub fn blacklist_timeout(&self) -> Duration {
        Duration::from_secs(self.blacklist_timeout_secs)
    }
}

/// UPnP control point timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpnpConfig {
    /// Number of `ssdp:all` searches sent on a newly seen local address.
    pub search_retries: u32,

    /// Lower bound of the random spacing between those searches (seconds).
    pub search_min_interval_secs: u64,

    /// Upper bound of the random spacing between those searches (seconds).
    pub search_max_interval_secs: u64,

    /// A description fetch times out after this long since its last reset...
    pub description_timeout_secs: u64,

    /// ...but only once it has also been polled more than this many times.
    pub description_min_polls: u32,

    /// Fetch attempts after which a device is never described.
    pub max_description_failures: u32,

    /// Added to `max-age` when computing expiry.
    pub expire_slop_secs: u64,
}

impl Default for UpnpConfig {
    fn default() -> Self {
        Self {
            search_retries: 2,
            search_min_interval_secs: 4,
            search_max_interval_secs: 11,
            description_timeout_secs: 15,
            description_min_polls: 8,
            max_description_failures: 4,
            expire_slop_secs: 60,
        }
    }
}

impl UpnpConfig {
    pub fn description_timeout(&self) -> Duration {
        Duration::from_secs(self.description_timeout_secs)
    }

    pub fn expire_slop(&self) -> Duration {
        Duration::from_secs(self.expire_slop_secs)
    }

    /// Validates ranges that would otherwise panic or never terminate.
    pub fn validate(&self) -> Result<(), String> {
        if self.search_min_interval_secs > self.search_max_interval_secs {
            return Err("search_min_interval_secs must be <= search_max_interval_secs".to_string());
        }
        if self.max_description_failures == 0 {
            return Err("max_description_failures must be >= 1".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_field_tested_values() {
        let config = DiscoveryConfig::default();
        assert_eq!(config.onvif.discovery_timeout(), Duration::from_secs(5));
        assert_eq!(config.onvif.probe_repeat, 4);
        assert_eq!(config.onvif.probe_max_delay(), Duration::from_millis(600));
        assert_eq!(config.upnp.expire_slop(), Duration::from_secs(60));
        assert_eq!(config.upnp.max_description_failures, 4);
        assert!(config.upnp.validate().is_ok());
    }

    #[test]
    fn partial_document_keeps_defaults() {
        let config: DiscoveryConfig =
            serde_json::from_str(r#"{"onvif":{"probe_repeat":2}}"#).unwrap();
        assert_eq!(config.onvif.probe_repeat, 2);
        assert_eq!(config.onvif.http_timeout_secs, 5);
        assert_eq!(config.upnp, UpnpConfig::default());
    }

    #[test]
    fn inverted_search_interval_is_rejected() {
        let config = UpnpConfig {
            search_min_interval_secs: 12,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
