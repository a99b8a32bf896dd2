//! SSDP datagram parsing and M-SEARCH construction.
//!
//! Only two kinds of datagram matter to a control point: unicast
//! `HTTP/1.1 200 OK` replies to our searches and multicast `NOTIFY`
//! announcements. Everything else (other control points searching, garbage)
//! is rejected at the start line.

use std::collections::BTreeMap;
use std::net::IpAddr;

use thiserror::Error;

use crate::protocol_constants::{SSDP_MULTICAST_ADDR, SSDP_MX, SSDP_PORT};

/// Reasons a datagram is dropped before it reaches the device table.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SsdpError {
    #[error("not an SSDP status message")]
    NotStatusMessage,

    #[error("malformed SSDP headers")]
    MalformedHeaders,

    #[error("SSDP message has no USN")]
    MissingUsn,
}

/// `SERVER` strings of ACTi cameras that answer `ssdp:all` with a single
/// root-device reply.
const ACTI_SERVER_TYPES: [&str; 2] = [
    "Linux, UPnP/1.0, LibUPnP",      // ACM4001
    "Linux, UPnP/1.0, ACTi libupnp", // TCM4301
];

/// `SERVER` string of the Linksys WRT610N HNAP announcement.
const LINKSYS_HNAP_SERVER_TYPES: [&str; 1] = ["POSIX, UPnP/1.0 linux/5.10.56.51"];

const ROOT_DEVICE_SUFFIX: &str = "::upnp:rootdevice";

/// Builds an M-SEARCH request for `target`.
pub fn search_request(target: &str) -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         Host: {SSDP_MULTICAST_ADDR}:{SSDP_PORT}\r\n\
         MAN:\"ssdp:discover\"\r\n\
         ST: {target}\r\n\
         MX: {SSDP_MX}\r\n\
         \r\n"
    )
}

/// True for the start line of a search reply or a `NOTIFY` announcement.
pub fn is_status_message(start_line: &str) -> bool {
    let words: Vec<String> = start_line
        .split_whitespace()
        .map(|w| w.to_ascii_uppercase())
        .collect();
    words == ["HTTP/1.1", "200", "OK"] || words == ["NOTIFY", "*", "HTTP/1.1"]
}

/// Parses the numeric value of a `max-age=N` cache-control directive.
///
/// The directive must open the header; whitespace around `=` is allowed.
pub fn parse_max_age(cache_control: &str) -> Option<u64> {
    let prefix = "max-age";
    if cache_control.len() < prefix.len()
        || !cache_control.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
    {
        return None;
    }
    let rest = cache_control[prefix.len()..].trim_start();
    let rest = rest.strip_prefix('=')?.trim_start();
    let end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    rest[..end].parse().ok()
}

/// Headers of one SSDP status message, keyed by lower-cased name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SsdpMessage {
    headers: BTreeMap<String, String>,
}

impl SsdpMessage {
    /// Parses a datagram, rejecting anything that is not a status message.
    ///
    /// Repeated headers are joined with `", "` and folded continuation lines
    /// are appended to the previous value. Header parsing stops at the first
    /// line that is neither.
    pub fn parse(datagram: &[u8]) -> Result<Self, SsdpError> {
        let text = std::str::from_utf8(datagram).map_err(|_| SsdpError::MalformedHeaders)?;
        let (start_line, rest) = text.split_once("\r\n").ok_or(SsdpError::NotStatusMessage)?;
        if !is_status_message(start_line) {
            return Err(SsdpError::NotStatusMessage);
        }
        Ok(Self::parse_headers(rest))
    }

    fn parse_headers(block: &str) -> Self {
        let mut headers: BTreeMap<String, String> = BTreeMap::new();
        let mut last: Option<String> = None;

        for line in block.split('\n') {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.is_empty() {
                break;
            }
            if line.starts_with([' ', '\t']) {
                match last.as_ref().and_then(|k| headers.get_mut(k)) {
                    Some(value) => {
                        value.push(' ');
                        value.push_str(line.trim());
                        continue;
                    }
                    None => break,
                }
            }
            let Some((name, value)) = line.split_once(':') else {
                break;
            };
            let name = name.trim().to_ascii_lowercase();
            let value = value.trim();
            headers
                .entry(name.clone())
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(value);
                })
                .or_insert_with(|| value.to_string());
            last = Some(name);
        }

        Self { headers }
    }

    /// Builds a message directly from `(name, value)` pairs.
    pub fn from_headers<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            headers: pairs
                .into_iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v.to_string()))
                .collect(),
        }
    }

    /// Header value by case-insensitive name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn usn(&self) -> Option<&str> {
        self.get("usn")
    }

    pub fn location(&self) -> Option<&str> {
        self.get("location")
    }

    /// `max-age` from the cache-control header, if it parses.
    pub fn max_age(&self) -> Option<u64> {
        self.get("cache-control").and_then(parse_max_age)
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// The USN leaving the network, for `ssdp:byebye` notifications.
    pub fn byebye_usn(&self) -> Result<Option<&str>, SsdpError> {
        let is_byebye = self
            .get("nts")
            .is_some_and(|nts| nts.eq_ignore_ascii_case("ssdp:byebye"));
        if !is_byebye {
            return Ok(None);
        }
        self.usn().map(Some).ok_or(SsdpError::MissingUsn)
    }

    /// Notification type for `ssdp:alive`, else the search target.
    ///
    /// Returns `None` for a notification with an unexpected sub type, and an
    /// empty string when the message carries neither header.
    pub fn status_type(&self) -> Option<&str> {
        if let (Some(nt), Some(nts)) = (self.get("nt"), self.get("nts")) {
            return (nts == "ssdp:alive").then_some(nt);
        }
        Some(self.get("st").unwrap_or(""))
    }

    /// Applies known device workarounds in place.
    ///
    /// Returns `true` when the message must be dropped, including when any
    /// header the workarounds inspect is missing.
    pub fn adjust_for_device_bugs(&mut self, from_ip: IpAddr) -> bool {
        let (Some(usn), Some(server), Some(cache_control), Some(location)) = (
            self.get("usn"),
            self.get("server"),
            self.get("cache-control"),
            self.get("location"),
        ) else {
            return true;
        };

        if ACTI_SERVER_TYPES.contains(&server)
            && (usn.starts_with("uuid:TCM") || usn.starts_with("uuid:ACM"))
        {
            // A lone root-device reply is rewritten so it reads as a reply
            // for the device's own UUID.
            if self.get("st") == Some("upnp:rootdevice") && usn.ends_with(ROOT_DEVICE_SUFFIX) {
                let usn = usn
                    .rsplitn(3, ROOT_DEVICE_SUFFIX)
                    .last()
                    .unwrap_or(usn)
                    .to_string();
                log::debug!("[SSDP] ACTi root-device reply rewritten to {}", usn);
                self.set("usn", usn.clone());
                self.set("st", usn);
            }
            return false;
        }

        if LINKSYS_HNAP_SERVER_TYPES.contains(&server)
            && cache_control == "max-age=60"
            && location == format!("http://{from_ip}/HNAP1/")
        {
            log::trace!("[SSDP] Dropping Linksys HNAP announcement from {}", from_ip);
            return true;
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const ALIVE: &str = "NOTIFY * HTTP/1.1\r\n\
        HOST: 239.255.255.250:1900\r\n\
        CACHE-CONTROL: max-age=1800\r\n\
        LOCATION: http://192.168.1.20:49152/desc.xml\r\n\
        NT: uuid:cam-1\r\n\
        NTS: ssdp:alive\r\n\
        SERVER: Linux/2.6 UPnP/1.0 cam/1.0\r\n\
        USN: uuid:cam-1\r\n\
        \r\n";

    fn from_ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20))
    }

    #[test]
    fn test_search_request_format() {
        let req = search_request("ssdp:all");
        assert!(req.starts_with("M-SEARCH * HTTP/1.1\r\n"));
        assert!(req.contains("Host: 239.255.255.250:1900\r\n"));
        assert!(req.contains("MAN:\"ssdp:discover\"\r\n"));
        assert!(req.contains("ST: ssdp:all\r\n"));
        assert!(req.contains("MX: 3\r\n"));
        assert!(req.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_status_message_start_lines() {
        assert!(is_status_message("HTTP/1.1 200 OK"));
        assert!(is_status_message("http/1.1 200 ok"));
        assert!(is_status_message("NOTIFY * HTTP/1.1"));
        assert!(!is_status_message("M-SEARCH * HTTP/1.1"));
        assert!(!is_status_message("HTTP/1.1 404 Not Found"));
        assert!(!is_status_message(""));
    }

    #[test]
    fn test_parse_lowercases_header_names() {
        let msg = SsdpMessage::parse(ALIVE.as_bytes()).unwrap();
        assert_eq!(msg.get("Location"), Some("http://192.168.1.20:49152/desc.xml"));
        assert_eq!(msg.usn(), Some("uuid:cam-1"));
        assert_eq!(msg.max_age(), Some(1800));
        assert_eq!(msg.status_type(), Some("uuid:cam-1"));
        assert_eq!(msg.byebye_usn(), Ok(None));
    }

    #[test]
    fn test_parse_rejects_search_requests() {
        let err = SsdpMessage::parse(search_request("ssdp:all").as_bytes()).unwrap_err();
        assert_eq!(err, SsdpError::NotStatusMessage);
        assert_eq!(
            SsdpMessage::parse(b"NOTIFY * HTTP/1.1").unwrap_err(),
            SsdpError::NotStatusMessage
        );
        assert_eq!(
            SsdpMessage::parse(&[0xff, 0xfe, b'\r', b'\n']).unwrap_err(),
            SsdpError::MalformedHeaders
        );
    }

    #[test]
    fn test_repeated_and_folded_headers() {
        let msg = SsdpMessage::parse(
            b"HTTP/1.1 200 OK\r\nEXT:\r\nX-A: one\r\nx-a: two\r\nX-B: first\r\n  second\r\nbroken line\r\nUSN: lost\r\n\r\n",
        )
        .unwrap();
        assert_eq!(msg.get("x-a"), Some("one, two"));
        assert_eq!(msg.get("x-b"), Some("first second"));
        assert_eq!(msg.get("ext"), Some(""));
        assert_eq!(msg.usn(), None);
    }

    #[test]
    fn test_max_age_variants() {
        assert_eq!(parse_max_age("max-age=60"), Some(60));
        assert_eq!(parse_max_age("MAX-AGE = 1800"), Some(1800));
        assert_eq!(parse_max_age("max-age=120, private"), Some(120));
        assert_eq!(parse_max_age("max-age="), None);
        assert_eq!(parse_max_age("no-cache, max-age=60"), None);
        assert_eq!(parse_max_age("max-age"), None);
    }

    #[test]
    fn test_byebye() {
        let msg = SsdpMessage::from_headers([("NTS", "ssdp:byebye"), ("USN", "uuid:gone")]);
        assert_eq!(msg.byebye_usn(), Ok(Some("uuid:gone")));

        let msg = SsdpMessage::from_headers([("NTS", "SSDP:BYEBYE")]);
        assert_eq!(msg.byebye_usn(), Err(SsdpError::MissingUsn));
    }

    #[test]
    fn test_status_type_rules() {
        let search_reply = SsdpMessage::from_headers([("ST", "uuid:abc")]);
        assert_eq!(search_reply.status_type(), Some("uuid:abc"));

        let odd = SsdpMessage::from_headers([("NT", "uuid:abc"), ("NTS", "ssdp:update")]);
        assert_eq!(odd.status_type(), None);

        let nt_without_nts = SsdpMessage::from_headers([("NT", "uuid:abc"), ("ST", "upnp:rootdevice")]);
        assert_eq!(nt_without_nts.status_type(), Some("upnp:rootdevice"));

        assert_eq!(SsdpMessage::default().status_type(), Some(""));
    }

    #[test]
    fn test_acti_root_device_reply_is_rewritten() {
        let mut msg = SsdpMessage::from_headers([
            ("CACHE-CONTROL", "max-age=1800"),
            ("LOCATION", "http://192.168.11.170:49152/devicedesc.xml"),
            ("SERVER", "Linux, UPnP/1.0, LibUPnP"),
            ("ST", "upnp:rootdevice"),
            ("USN", "uuid:ACM4001-09F-X-00005::upnp:rootdevice"),
        ]);
        assert!(!msg.adjust_for_device_bugs(from_ip()));
        assert_eq!(msg.usn(), Some("uuid:ACM4001-09F-X-00005"));
        assert_eq!(msg.get("st"), Some("uuid:ACM4001-09F-X-00005"));
        assert_eq!(msg.status_type(), Some("uuid:ACM4001-09F-X-00005"));
    }

    #[test]
    fn test_other_root_device_replies_untouched() {
        let mut msg = SsdpMessage::from_headers([
            ("CACHE-CONTROL", "max-age=1800"),
            ("LOCATION", "http://192.168.1.9/desc.xml"),
            ("SERVER", "Linux, UPnP/1.0, LibUPnP"),
            ("ST", "upnp:rootdevice"),
            ("USN", "uuid:OTHER-1::upnp:rootdevice"),
        ]);
        assert!(!msg.adjust_for_device_bugs(from_ip()));
        assert_eq!(msg.usn(), Some("uuid:OTHER-1::upnp:rootdevice"));
    }

    #[test]
    fn test_linksys_hnap_announcement_dropped() {
        let linksys = |location: &str, cache: &str| {
            SsdpMessage::from_headers([
                ("CACHE-CONTROL", cache),
                ("LOCATION", location),
                ("NT", "uuid:160F7BFB-457F-3058-06AB-1C244666013D"),
                ("NTS", "ssdp:alive"),
                ("SERVER", "POSIX, UPnP/1.0 linux/5.10.56.51"),
                ("USN", "uuid:160F7BFB-457F-3058-06AB-1C244666013D"),
            ])
        };
        assert!(linksys("http://192.168.1.20/HNAP1/", "max-age=60").adjust_for_device_bugs(from_ip()));
        assert!(!linksys("http://192.168.1.20/HNAP1/", "max-age=1800").adjust_for_device_bugs(from_ip()));
        assert!(!linksys("http://192.168.1.21/HNAP1/", "max-age=60").adjust_for_device_bugs(from_ip()));
    }

    #[test]
    fn test_missing_workaround_headers_drop_message() {
        let mut msg = SsdpMessage::parse(ALIVE.as_bytes()).unwrap();
        assert!(!msg.adjust_for_device_bugs(from_ip()));

        let mut no_server = SsdpMessage::from_headers([
            ("CACHE-CONTROL", "max-age=1800"),
            ("LOCATION", "http://192.168.1.20/"),
            ("USN", "uuid:x"),
        ]);
        assert!(no_server.adjust_for_device_bugs(from_ip()));
    }
}
