//! What is known about one ONVIF device.
//!
//! A state is created from a probe match, refined by polls, and merged into
//! the manager's table. States are plain values: the manager hands out clones
//! and tasks work on their own copies.

use std::collections::BTreeMap;
use std::fmt;

use chrono::TimeDelta;
use serde::{Serialize, Serializer};
use url::Url;

use super::codec::{Credentials, DeviceInformation, FaultCode, MediaProfile, ProbeMatch};
use crate::protocol_constants::{HTTP_DEFAULT_PORT, ONVIF_SCOPE_AUTHORITY, ONVIF_SCOPE_SCHEME};
use crate::utils::normalize_whitespace;

// ─────────────────────────────────────────────────────────────────────────────
// Addresses and Settings
// ─────────────────────────────────────────────────────────────────────────────

/// An ONVIF service endpoint (`host`, `port`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct OnvifAddress {
    pub host: String,
    pub port: u16,
}

impl OnvifAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses one XAddrs entry. IPv6 and unparseable URLs yield `None`.
    pub fn from_xaddr(xaddr: &str) -> Option<Self> {
        let url = Url::parse(xaddr).ok()?;
        let host = match url.host()? {
            url::Host::Ipv6(_) => return None,
            url::Host::Ipv4(ip) => ip.to_string(),
            url::Host::Domain(domain) => domain.to_string(),
        };
        let port = url.port_or_known_default().unwrap_or(HTTP_DEFAULT_PORT);
        Some(Self { host, port })
    }
}

impl fmt::Display for OnvifAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// User-supplied settings for one device. Never derived from the network.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSettings {
    pub credentials: Option<Credentials>,
    /// The one address profiles and stream URIs are fetched from.
    pub selected_addr: Option<OnvifAddress>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Scopes
// ─────────────────────────────────────────────────────────────────────────────

/// WS-Discovery scopes grouped by namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OnvifScopes {
    /// `onvif://www.onvif.org/<category>/<value>` scopes by category.
    pub onvif: BTreeMap<String, Vec<String>>,
    /// Other `scheme://authority` scopes, by authority then category.
    pub other: BTreeMap<String, BTreeMap<String, Vec<String>>>,
    /// Scopes with neither scheme nor authority, verbatim.
    pub malformed: Vec<String>,
}

/// Splits `scheme://netloc/rest` without normalizing anything.
fn split_scope(scope: &str) -> (&str, &str, &str) {
    let (scheme, rest) = match scope.split_once(':') {
        Some((scheme, rest))
            if !scheme.is_empty()
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')) =>
        {
            (scheme, rest)
        }
        _ => ("", scope),
    };
    match rest.strip_prefix("//") {
        Some(rest) => {
            let end = rest.find('/').unwrap_or(rest.len());
            (scheme, &rest[..end], &rest[end..])
        }
        None => (scheme, "", rest),
    }
}

/// Splits a scope path into its category and trimmed value.
fn category_value(path: &str) -> (String, String) {
    let (category, value) = path
        .trim_start_matches('/')
        .split_once('/')
        .unwrap_or((path.trim_start_matches('/'), ""));
    (category.to_string(), value.trim_matches('/').to_string())
}

impl OnvifScopes {
    pub fn parse<S: AsRef<str>>(scopes: &[S]) -> Self {
        let mut parsed = Self::default();
        for raw in scopes {
            let scope = urlencoding::decode(raw.as_ref())
                .map(|s| s.into_owned())
                .unwrap_or_else(|_| raw.as_ref().to_string());
            let (scheme, netloc, path) = split_scope(&scope);

            let hostname = netloc.rsplit('@').next().unwrap_or(netloc);
            let hostname = hostname.split(':').next().unwrap_or(hostname);

            if scheme == ONVIF_SCOPE_SCHEME && hostname.eq_ignore_ascii_case(ONVIF_SCOPE_AUTHORITY) {
                let (category, value) = category_value(path);
                parsed.onvif.entry(category).or_default().push(value);
            } else if !scheme.is_empty() || !netloc.is_empty() {
                let authority = format!("{scheme}://{netloc}");
                let (category, value) = category_value(path);
                parsed
                    .other
                    .entry(authority)
                    .or_default()
                    .entry(category)
                    .or_default()
                    .push(value);
            } else {
                parsed.malformed.push(scope);
            }
        }
        parsed
    }

    /// First value of an ONVIF scope category.
    pub fn first(&self, category: &str) -> Option<&str> {
        self.onvif
            .get(category)
            .and_then(|values| values.first())
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Device State
// ─────────────────────────────────────────────────────────────────────────────

/// Why the last poll could not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// No HTTP response at all.
    HttpRequestError,
    /// The device answered with a SOAP fault.
    Fault(FaultCode),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HttpRequestError => f.write_str("HttpRequestError"),
            Self::Fault(code) => f.write_str(code.as_str()),
        }
    }
}

impl Serialize for FailureReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A resolved stream URI and the transport it was requested for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamUri {
    pub uri: String,
    pub transport: String,
}

/// One device as known through WS-Discovery and ONVIF polling.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OnvifDeviceState {
    pub uuid: String,
    pub generation: i64,
    /// Source address of the probe match.
    pub wsdiscovery_ip: String,
    pub scopes: OnvifScopes,
    /// Endpoints from XAddrs.
    pub announced_addrs: Vec<OnvifAddress>,
    /// Endpoints that answered HTTP; the last one answered most recently.
    pub valid_addrs: Vec<OnvifAddress>,
    pub basic_info: Option<DeviceInformation>,
    pub authenticated: bool,
    pub last_failure_reason: Option<FailureReason>,
    pub profiles: Vec<MediaProfile>,
    /// Stream URI per profile token.
    pub stream_uris: BTreeMap<String, StreamUri>,
    #[serde(skip)]
    pub settings: DeviceSettings,
    /// Device clock minus local clock, measured by the last poll.
    #[serde(skip)]
    pub clock_offset: TimeDelta,
}

impl OnvifDeviceState {
    pub fn new(
        generation: i64,
        wsdiscovery_ip: impl Into<String>,
        uuid: impl Into<String>,
        xaddrs: &[String],
        scopes: &[String],
        settings: DeviceSettings,
    ) -> Self {
        let announced_addrs = xaddrs
            .iter()
            .filter_map(|xaddr| {
                let addr = OnvifAddress::from_xaddr(xaddr);
                if addr.is_none() {
                    log::warn!("[ONVIF] Ignoring unusable XAddr {}", xaddr);
                }
                addr
            })
            .collect();

        Self {
            uuid: uuid.into(),
            generation,
            wsdiscovery_ip: wsdiscovery_ip.into(),
            scopes: OnvifScopes::parse(scopes),
            announced_addrs,
            valid_addrs: Vec::new(),
            basic_info: None,
            authenticated: false,
            last_failure_reason: None,
            profiles: Vec::new(),
            stream_uris: BTreeMap::new(),
            settings,
            clock_offset: TimeDelta::zero(),
        }
    }

    /// Builds a state from a probe match. A match without a device uuid
    /// cannot identify a device and yields `None`.
    pub fn from_probe_match(
        probe: &ProbeMatch,
        generation: i64,
        wsdiscovery_ip: impl Into<String>,
        settings: DeviceSettings,
    ) -> Option<Self> {
        let uuid = probe.device_uuid.as_deref().filter(|u| !u.is_empty())?;
        Some(Self::new(
            generation,
            wsdiscovery_ip,
            uuid,
            &probe.xaddrs,
            &probe.scopes,
            settings,
        ))
    }

    pub fn is_valid(&self) -> bool {
        !self.uuid.is_empty()
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn failure_reason(&self) -> Option<&FailureReason> {
        self.last_failure_reason.as_ref()
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.settings.credentials.as_ref()
    }

    pub fn selected_address(&self) -> Option<&OnvifAddress> {
        self.settings.selected_addr.as_ref()
    }

    /// True if `former` differs from `self` in a way worth reporting.
    ///
    /// The simple check only looks at what a probe match can carry.
    pub fn has_changed(&self, former: &Self, simple_check: bool) -> bool {
        if self.scopes != former.scopes
            || sorted(&self.announced_addrs) != sorted(&former.announced_addrs)
            || self.settings != former.settings
        {
            return true;
        }
        if simple_check {
            return false;
        }
        self.basic_info != former.basic_info
            || sorted(&self.profiles) != sorted(&former.profiles)
            || sorted(&self.valid_addrs) != sorted(&former.valid_addrs)
            || self.stream_uris != former.stream_uris
    }

    /// Marks `addr` reachable. New addresses are appended; a known address
    /// keeps its position, so the list stays in first-reached order.
    pub fn mark_reachable(&mut self, addr: &OnvifAddress) {
        if !self.valid_addrs.contains(addr) {
            self.valid_addrs.push(addr.clone());
        }
    }

    /// Human readable name from device information, falling back to scopes.
    pub fn friendly_name(&self, always_include_ip: bool) -> String {
        let manufacturer = self
            .basic_info
            .as_ref()
            .map(|info| info.manufacturer.as_str())
            .filter(|m| !m.is_empty())
            .or_else(|| self.scopes.first("name"))
            .unwrap_or("Unknown");
        let model = self
            .basic_info
            .as_ref()
            .map(|info| info.model.as_str())
            .filter(|m| !m.is_empty())
            .or_else(|| self.scopes.first("hardware"))
            .unwrap_or("Unknown");

        // Vendors often repeat the model inside the name and vice versa.
        let name_lower = manufacturer.to_lowercase();
        let model_lower = model.to_lowercase();
        let mut name = if name_lower.contains(&model_lower) {
            normalize_whitespace(manufacturer)
        } else if model_lower.contains(&name_lower) {
            normalize_whitespace(model)
        } else {
            normalize_whitespace(&format!("{manufacturer} {model}"))
        };

        if always_include_ip {
            if self.wsdiscovery_ip.is_empty() {
                name.push_str(" IP Unavailable");
            } else {
                name.push_str(" -- ");
                name.push_str(&self.wsdiscovery_ip);
            }
        }
        name.trim().to_string()
    }

    pub fn log_id(&self) -> String {
        format!("{} [{}]", self.friendly_name(true), self.uuid)
    }
}

fn sorted<T: Ord + Clone>(items: &[T]) -> Vec<T> {
    let mut items = items.to_vec();
    items.sort();
    items
}
