//! A UPnP device found over SSDP.
//!
//! Each sighting creates a fresh [`UpnpDevice`]. Its description is then
//! fetched by polling [`UpnpDevice::poll_for_description`] until
//! [`UpnpDevice::needs_description`] turns false, either because the
//! description arrived or because too many attempts failed. The control
//! point folds duplicate sightings into the copy it already has.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use serde::Serialize;
use url::Url;

use super::description::parse_description;
use super::fetch::DescriptionFetch;
use super::ssdp::{SsdpError, SsdpMessage};
use crate::config::UpnpConfig;

/// Attribute combinations tried, in order, to name a model.
const MODEL_ATTRIBUTES: &[&[&str]] = &[
    &["manufacturer", "modelNumber"],
    &["modelName"],
    &["modelNumber"],
    &["manufacturer"],
    &["modelDescription"],
];

/// Manufacturers whose `modelName` is the real model name.
const NAME_FIRST_MANUFACTURERS: &[&str] = &["ACTi Corporation", "ASANTE"];

const ROUTER_DEVICE_TYPES: &[&str] = &[
    "urn:schemas-upnp-org:device:InternetGatewayDevice",
    "urn:dslforum-org:device:InternetGatewayDevice",
    // Linksys WRT610N
    "urn:schemas-wifialliance-org:device:WFADevice:1",
];

/// Model description used by the Linksys WRT610N's many basic devices.
const LINKSYS_EGHN_DESCRIPTION: &str = "Linksys EGHN Architecture Device";

pub struct UpnpDevice {
    usn: String,
    ssdp_ip: IpAddr,
    ssdp: SsdpMessage,
    url_base: Option<String>,
    attributes: BTreeMap<String, String>,
    got_description: bool,
    /// In-flight description download. Copies never carry one.
    fetch: Option<DescriptionFetch>,
    max_description_failures: u32,
    verify_requested_at: Option<Instant>,
    expires_at: Instant,
    expire_slop: Duration,
    did_about_to_expire_search: bool,
}

impl Clone for UpnpDevice {
    fn clone(&self) -> Self {
        Self {
            usn: self.usn.clone(),
            ssdp_ip: self.ssdp_ip,
            ssdp: self.ssdp.clone(),
            url_base: self.url_base.clone(),
            attributes: self.attributes.clone(),
            got_description: self.got_description,
            fetch: None,
            max_description_failures: self.max_description_failures,
            verify_requested_at: self.verify_requested_at,
            expires_at: self.expires_at,
            expire_slop: self.expire_slop,
            did_about_to_expire_search: self.did_about_to_expire_search,
        }
    }
}

impl std::fmt::Debug for UpnpDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpnpDevice")
            .field("usn", &self.usn)
            .field("ssdp_ip", &self.ssdp_ip)
            .field("location", &self.location())
            .field("url_base", &self.url_base)
            .field("attributes", &self.attributes)
            .finish()
    }
}

/// Serializable view of a device for hosts and logs.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpnpDeviceInfo {
    pub usn: String,
    pub ip: IpAddr,
    pub friendly_name: String,
    pub model_name: String,
    pub presentation_url: String,
    pub presentation_url_is_guess: bool,
    pub is_router: bool,
    pub location: Option<String>,
    pub attributes: BTreeMap<String, String>,
}

impl UpnpDevice {
    /// Creates a device from an SSDP message received at `now`.
    ///
    /// The device expires `max-age` plus the configured slop after `now`, or
    /// at `now` itself when the cache-control header is missing or unreadable.
    pub fn new(
        ssdp_ip: IpAddr,
        ssdp: SsdpMessage,
        config: &UpnpConfig,
        now: Instant,
    ) -> Result<Self, SsdpError> {
        let usn = ssdp.usn().ok_or(SsdpError::MissingUsn)?.to_string();

        let expires_at = match ssdp.max_age() {
            Some(max_age) => now + Duration::from_secs(max_age) + config.expire_slop(),
            None => {
                log::debug!(
                    "[UPnP] {} has no usable cache-control ({:?}), expiring immediately",
                    usn,
                    ssdp.get("cache-control")
                );
                now
            }
        };

        let fetch = ssdp
            .location()
            .and_then(|location| DescriptionFetch::new(location, config, now));

        Ok(Self {
            usn,
            ssdp_ip,
            ssdp,
            url_base: None,
            attributes: BTreeMap::new(),
            got_description: false,
            fetch,
            max_description_failures: config.max_description_failures,
            verify_requested_at: None,
            expires_at,
            expire_slop: config.expire_slop(),
            did_about_to_expire_search: false,
        })
    }

    pub fn usn(&self) -> &str {
        &self.usn
    }

    /// Address the SSDP message came from.
    pub fn ssdp_ip(&self) -> IpAddr {
        self.ssdp_ip
    }

    pub fn ssdp(&self) -> &SsdpMessage {
        &self.ssdp
    }

    pub fn location(&self) -> Option<&str> {
        self.ssdp.location()
    }

    pub fn url_base(&self) -> Option<&str> {
        self.url_base.as_deref()
    }

    /// Simple attributes of the root device; empty until described.
    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    pub fn friendly_name(&self, always_include_ip: bool) -> String {
        match self.attributes.get("friendlyName") {
            Some(name) if always_include_ip => format!("{} -- {}", name, self.ssdp_ip),
            Some(name) => name.clone(),
            None => format!("Unknown -- {}", self.ssdp_ip),
        }
    }

    /// Best-effort model name.
    ///
    /// Vendors disagree on which fields carry the model; e.g. AXIS puts it in
    /// `modelNumber`, Panasonic in `modelNumber` with a generic `modelName`,
    /// and ACTi in `modelName` with a serial-bearing `modelNumber`.
    pub fn model_name(&self) -> String {
        let name_first: &[&str] = &["manufacturer", "modelName"];
        let manufacturer = self.attributes.get("manufacturer").map(String::as_str);
        let special = manufacturer.is_some_and(|m| NAME_FIRST_MANUFACTURERS.contains(&m));

        special
            .then_some(name_first)
            .into_iter()
            .chain(MODEL_ATTRIBUTES.iter().copied())
            .find_map(|keys| {
                keys.iter()
                    .map(|k| self.attributes.get(*k).map(String::as_str))
                    .collect::<Option<Vec<_>>>()
                    .map(|parts| parts.join(" "))
            })
            .unwrap_or_else(|| "Unknown".to_string())
    }

    /// Presentation URL, optionally with credentials, and whether it is a
    /// guess.
    ///
    /// A relative `presentationURL` is resolved against `URLBase`, else
    /// against the description location. Without one the guess is
    /// `http://<ssdp ip>/`. Credentials are fully percent-encoded.
    pub fn presentation_url(&self, username: Option<&str>, password: Option<&str>) -> (String, bool) {
        let (url, guess) = match self
            .attributes
            .get("presentationURL")
            .and_then(|p| self.resolve(p))
        {
            Some(url) => (url, false),
            None => {
                let guessed = match self.ssdp_ip {
                    IpAddr::V4(ip) => format!("http://{ip}/"),
                    IpAddr::V6(ip) => format!("http://[{ip}]/"),
                };
                match Url::parse(&guessed) {
                    Ok(url) => (url, true),
                    Err(_) => return (guessed, true),
                }
            }
        };

        let username = username.unwrap_or("");
        let password = password.unwrap_or("");
        if username.is_empty() && password.is_empty() {
            return (url.to_string(), guess);
        }

        let mut out = format!(
            "{}://{}:{}@{}",
            url.scheme(),
            urlencoding::encode(username),
            urlencoding::encode(password),
            url.host_str().unwrap_or_default()
        );
        if let Some(port) = url.port() {
            out.push_str(&format!(":{port}"));
        }
        out.push_str(&url[url::Position::BeforePath..]);
        (out, guess)
    }

    fn resolve(&self, presentation: &str) -> Option<Url> {
        if let Ok(url) = Url::parse(presentation) {
            return Some(url);
        }
        let base = self.url_base.as_deref().or_else(|| self.location())?;
        Url::parse(base).ok()?.join(presentation).ok()
    }

    /// True for gateways, which hosts usually hide from camera lists.
    pub fn is_router(&self) -> bool {
        let device_type = self.attributes.get("deviceType").map_or("", String::as_str);
        ROUTER_DEVICE_TYPES.iter().any(|t| device_type.starts_with(t))
            || self.attributes.get("modelDescription").map(String::as_str)
                == Some(LINKSYS_EGHN_DESCRIPTION)
    }

    /// Whether the device has a presentation URL.
    ///
    /// Devices without any attributes (not yet or never described) return
    /// `value_for_uncertain`.
    pub fn is_presentable(&self, value_for_uncertain: bool) -> bool {
        if self.attributes.is_empty() {
            return value_for_uncertain;
        }
        self.attributes.contains_key("presentationURL")
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    pub fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }

    /// Fires once, when `now` is within half the slop of expiry.
    pub fn wants_about_to_expire_search(&mut self, now: Instant) -> bool {
        if !self.did_about_to_expire_search && now + self.expire_slop / 2 > self.expires_at {
            self.did_about_to_expire_search = true;
            return true;
        }
        false
    }

    /// Marks the device for re-verification by the next sighting.
    pub fn request_verify(&mut self, now: Instant) {
        self.verify_requested_at = Some(now);
    }

    pub fn needs_verify(&self) -> bool {
        self.verify_requested_at.is_some()
    }

    /// True while a description is still expected.
    pub fn needs_description(&self) -> bool {
        self.location().is_some()
            && !self.got_description
            && self
                .fetch
                .as_ref()
                .is_some_and(|f| f.failures() < self.max_description_failures)
    }

    /// Gives the description fetch one step.
    ///
    /// Returns `true` once nothing more is expected, whether or not a
    /// description was obtained.
    pub fn poll_for_description(&mut self, now: Instant) -> bool {
        if !self.needs_description() {
            return true;
        }
        let Some(fetch) = self.fetch.as_mut() else {
            return true;
        };
        let Some(body) = fetch.poll(now) else {
            return false;
        };

        match parse_description(&body) {
            Ok(description) => {
                self.url_base = description.url_base;
                self.attributes = description.attributes;
                self.got_description = true;
                self.fetch = None;
                true
            }
            Err(e) => {
                log::warn!("[UPnP] Bad description from {} ({}): {}", self.ssdp_ip, self.usn, e);
                fetch.reset(now);
                false
            }
        }
    }

    /// Folds this fresh sighting into an older copy when possible.
    ///
    /// Returns `true` when the sighting is a duplicate; the older copy has
    /// taken its expiry and this device should be dropped. Returns `false`
    /// when it should become the pending copy, because there is no older one,
    /// the location moved, or the older copy awaits verification (or, for a
    /// described copy, is expired or was never described).
    pub fn handle_duplicates_early(
        &self,
        older_described: Option<&mut UpnpDevice>,
        older_pending: Option<&mut UpnpDevice>,
        now: Instant,
    ) -> bool {
        if let Some(pending) = older_pending {
            if pending.needs_verify() || pending.location() != self.location() {
                return false;
            }
            pending.expires_at = self.expires_at;
            return true;
        }

        if let Some(described) = older_described {
            if described.needs_verify()
                || described.is_expired(now)
                || described.attributes.is_empty()
                || described.location() != self.location()
            {
                return false;
            }
            described.expires_at = self.expires_at;
            return true;
        }

        false
    }

    /// Takes everything from a newer copy of this device.
    ///
    /// Returns `true` for a big change: attributes, URL base, location or
    /// source address differ.
    pub fn update_from_newer(&mut self, other: UpnpDevice) -> bool {
        let mut is_big = false;

        self.expires_at = other.expires_at;
        self.did_about_to_expire_search = other.did_about_to_expire_search;

        if self.attributes != other.attributes {
            is_big = true;
            self.attributes = other.attributes;
        }
        if self.url_base != other.url_base {
            is_big = true;
            self.url_base = other.url_base;
        }
        if self.ssdp.location() != other.ssdp.location() {
            is_big = true;
        }
        self.ssdp = other.ssdp;
        if self.ssdp_ip != other.ssdp_ip {
            is_big = true;
            self.ssdp_ip = other.ssdp_ip;
        }

        self.verify_requested_at = other.verify_requested_at;
        is_big
    }

    pub fn info(&self) -> UpnpDeviceInfo {
        let (presentation_url, presentation_url_is_guess) = self.presentation_url(None, None);
        UpnpDeviceInfo {
            usn: self.usn.clone(),
            ip: self.ssdp_ip,
            friendly_name: self.friendly_name(false),
            model_name: self.model_name(),
            presentation_url,
            presentation_url_is_guess,
            is_router: self.is_router(),
            location: self.location().map(str::to_string),
            attributes: self.attributes.clone(),
        }
    }
}
