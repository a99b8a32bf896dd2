//! WS-Discovery and ONVIF SOAP message building and parsing.
//!
//! Requests are rendered as compact single-line documents; several camera
//! firmwares reject leading whitespace before the root element. Responses
//! are parsed through [`crate::xml`], which ignores namespace prefixes, so a
//! camera answering with `tds:`, `ns1:` or no prefix at all parses the same.

use std::fmt;

use base64::Engine;
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use rand::RngCore;
use serde::{Serialize, Serializer};
use sha1::{Digest, Sha1};

use crate::protocol_constants::{
    ACTION_GET_DEVICE_INFORMATION, ACTION_GET_PROFILES, ACTION_GET_STREAM_URI,
    ACTION_GET_SYSTEM_DATE_AND_TIME, ACTION_PROBE, ADDRESS_ANONYMOUS, ADDRESS_DISCOVERY_ALL,
    NS_ONVIF_DEVICE, NS_ONVIF_MEDIA, NS_ONVIF_NETWORK, NS_ONVIF_SCHEMA, NS_SOAP_ENVELOPE,
    NS_WS_ADDRESSING, NS_WS_DISCOVERY, NS_WS_SECURITY, NS_WS_SECURITY_UTILITY,
    ONVIF_STREAM_TYPE, PROBE_TYPE_VIDEO_TRANSMITTER, SOAP_CONTENT_TYPE,
    WSSE_BASE64_ENCODING_TYPE, WSSE_CREATED_FORMAT, WSSE_NONCE_LEN, WSSE_PASSWORD_DIGEST_TYPE,
};
use crate::xml::{escape, XmlElement, XmlError, XmlResult};

const XML_DECLARATION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;

// ─────────────────────────────────────────────────────────────────────────────
// Fault Codes
// ─────────────────────────────────────────────────────────────────────────────

/// SOAP 1.2 fault codes and the ONVIF-defined Sender/Receiver subcodes.
///
/// `Sender` and `Receiver` only appear when the fault carries no subcode.
/// Codes outside the ONVIF set are kept verbatim in `Unknown`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FaultCode {
    VersionMismatch,
    MustUnderstand,
    DataEncodingUnknown,
    Sender,
    Receiver,
    // Sender subcodes
    WellFormed,
    TagMismatch,
    Tag,
    Namespace,
    MissingAttr,
    ProhibAttr,
    InvalidArgs,
    InvalidArgVal,
    UnknownAction,
    OperationProhibited,
    NotAuthorized,
    // Receiver subcodes
    ActionNotSupported,
    Action,
    OutofMemory,
    CriticalError,
    Unknown(String),
}

impl FaultCode {
    fn main_code(code: &str) -> Option<Self> {
        Some(match code {
            "VersionMismatch" => Self::VersionMismatch,
            "MustUnderstand" => Self::MustUnderstand,
            "DataEncodingUnknown" => Self::DataEncodingUnknown,
            "Sender" => Self::Sender,
            "Receiver" => Self::Receiver,
            _ => return None,
        })
    }

    fn subcode(code: &str) -> Option<Self> {
        Some(match code {
            "WellFormed" => Self::WellFormed,
            "TagMismatch" => Self::TagMismatch,
            "Tag" => Self::Tag,
            "Namespace" => Self::Namespace,
            "MissingAttr" => Self::MissingAttr,
            "ProhibAttr" => Self::ProhibAttr,
            "InvalidArgs" => Self::InvalidArgs,
            "InvalidArgVal" => Self::InvalidArgVal,
            "UnknownAction" => Self::UnknownAction,
            "OperationProhibited" => Self::OperationProhibited,
            "NotAuthorized" => Self::NotAuthorized,
            "ActionNotSupported" => Self::ActionNotSupported,
            "Action" => Self::Action,
            "OutofMemory" => Self::OutofMemory,
            "CriticalError" => Self::CriticalError,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::VersionMismatch => "VersionMismatch",
            Self::MustUnderstand => "MustUnderstand",
            Self::DataEncodingUnknown => "DataEncodingUnknown",
            Self::Sender => "Sender",
            Self::Receiver => "Receiver",
            Self::WellFormed => "WellFormed",
            Self::TagMismatch => "TagMismatch",
            Self::Tag => "Tag",
            Self::Namespace => "Namespace",
            Self::MissingAttr => "MissingAttr",
            Self::ProhibAttr => "ProhibAttr",
            Self::InvalidArgs => "InvalidArgs",
            Self::InvalidArgVal => "InvalidArgVal",
            Self::UnknownAction => "UnknownAction",
            Self::OperationProhibited => "OperationProhibited",
            Self::NotAuthorized => "NotAuthorized",
            Self::ActionNotSupported => "ActionNotSupported",
            Self::Action => "Action",
            Self::OutofMemory => "OutofMemory",
            Self::CriticalError => "CriticalError",
            Self::Unknown(code) => code,
        }
    }
}

impl fmt::Display for FaultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for FaultCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Strips a `prefix:` qualifier from a QName value.
fn unqualified(value: &str) -> &str {
    value.rsplit(':').next().unwrap_or(value).trim()
}

/// Extracts the fault code from a SOAP response.
///
/// Returns `Ok(None)` when the body carries no `Fault`, and an error when a
/// `Fault` is present but has no readable `Code/Value`.
pub fn parse_fault(doc: &XmlElement) -> XmlResult<Option<FaultCode>> {
    let Some(fault) = doc.child("Body").and_then(|body| body.find("Fault")) else {
        return Ok(None);
    };
    let code = fault.require("Code")?;
    let main = code
        .child("Value")
        .map(|v| unqualified(&v.text).to_string())
        .filter(|v| !v.is_empty())
        .ok_or(XmlError::MissingElement("Value"))?;

    let parsed = match FaultCode::main_code(&main) {
        Some(FaultCode::Sender) | Some(FaultCode::Receiver) => {
            let sub = code
                .child("Subcode")
                .and_then(|s| s.child("Value"))
                .map(|v| unqualified(&v.text).to_string())
                .filter(|v| !v.is_empty());
            match sub {
                Some(sub) => FaultCode::subcode(&sub).unwrap_or(FaultCode::Unknown(sub)),
                None => FaultCode::main_code(&main).unwrap_or(FaultCode::Unknown(main)),
            }
        }
        Some(known) => known,
        None => FaultCode::Unknown(main),
    };

    if let FaultCode::Unknown(code) = &parsed {
        log::warn!("[ONVIF] Unknown fault code: {}", code);
    }
    Ok(Some(parsed))
}

// ─────────────────────────────────────────────────────────────────────────────
// WS-Security
// ─────────────────────────────────────────────────────────────────────────────

/// Username and password for one device.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password_len", &self.password.len())
            .finish()
    }
}

/// A WS-Security `UsernameToken` with a PasswordDigest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsernameToken {
    pub username: String,
    pub password_digest: String,
    pub nonce: String,
    pub created: String,
}

impl UsernameToken {
    /// Creates a token timestamped on the device's clock, i.e. the local UTC
    /// time shifted by `clock_offset` (device minus local).
    pub fn new(credentials: &Credentials, clock_offset: TimeDelta) -> Self {
        let mut nonce = [0u8; WSSE_NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        Self::from_parts(credentials, &nonce, Utc::now() + clock_offset)
    }

    /// Builds a token from a fixed nonce and timestamp.
    pub fn from_parts(credentials: &Credentials, nonce: &[u8], created: DateTime<Utc>) -> Self {
        let created = created.format(WSSE_CREATED_FORMAT).to_string();

        let mut hasher = Sha1::new();
        hasher.update(nonce);
        hasher.update(created.as_bytes());
        hasher.update(credentials.password.as_bytes());
        let engine = &base64::engine::general_purpose::STANDARD;

        Self {
            username: credentials.username.clone(),
            password_digest: engine.encode(hasher.finalize()),
            nonce: engine.encode(nonce),
            created,
        }
    }

    fn to_xml(&self) -> String {
        format!(
            concat!(
                r#"<Security s:mustUnderstand="1" xmlns="{wsse}">"#,
                "<UsernameToken>",
                "<Username>{user}</Username>",
                r#"<Password Type="{digest_type}">{digest}</Password>"#,
                r#"<Nonce EncodingType="{encoding}">{nonce}</Nonce>"#,
                "<wsu:Created>{created}</wsu:Created>",
                "</UsernameToken>",
                "</Security>"
            ),
            wsse = NS_WS_SECURITY,
            user = escape(&self.username),
            digest_type = WSSE_PASSWORD_DIGEST_TYPE,
            digest = self.password_digest,
            encoding = WSSE_BASE64_ENCODING_TYPE,
            nonce = self.nonce,
            created = self.created,
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Requests
// ─────────────────────────────────────────────────────────────────────────────

/// Builds a WS-Discovery Probe. `with_types` restricts it to
/// `NetworkVideoTransmitter`s.
pub fn probe_request(message_id: &str, with_types: bool) -> String {
    let probe = if with_types {
        format!("<d:Probe><d:Types>{PROBE_TYPE_VIDEO_TRANSMITTER}</d:Types></d:Probe>")
    } else {
        "<d:Probe/>".to_string()
    };
    format!(
        concat!(
            "{decl}",
            r#"<s:Envelope xmlns:s="{soap}" xmlns:a="{wsa}" xmlns:d="{wsd}" xmlns:dn="{dn}">"#,
            "<s:Header>",
            r#"<a:Action s:mustUnderstand="1">{action}</a:Action>"#,
            "<a:MessageID>{id}</a:MessageID>",
            "<a:ReplyTo><a:Address>{anon}</a:Address></a:ReplyTo>",
            r#"<a:To s:mustUnderstand="1">{to}</a:To>"#,
            "</s:Header>",
            "<s:Body>{probe}</s:Body>",
            "</s:Envelope>"
        ),
        decl = XML_DECLARATION,
        soap = NS_SOAP_ENVELOPE,
        wsa = NS_WS_ADDRESSING,
        wsd = NS_WS_DISCOVERY,
        dn = NS_ONVIF_NETWORK,
        action = ACTION_PROBE,
        id = escape(message_id),
        anon = ADDRESS_ANONYMOUS,
        to = ADDRESS_DISCOVERY_ALL,
        probe = probe,
    )
}

/// One ONVIF SOAP operation, rendered per attempt so every authenticated
/// attempt gets a fresh nonce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnvifRequest {
    action: &'static str,
    namespaces: Vec<(&'static str, &'static str)>,
    body: String,
}

impl OnvifRequest {
    pub fn get_system_date_and_time() -> Self {
        Self {
            action: ACTION_GET_SYSTEM_DATE_AND_TIME,
            namespaces: Vec::new(),
            body: format!(r#"<GetSystemDateAndTime xmlns="{NS_ONVIF_DEVICE}"/>"#),
        }
    }

    pub fn get_device_information() -> Self {
        Self {
            action: ACTION_GET_DEVICE_INFORMATION,
            namespaces: Vec::new(),
            body: format!(r#"<GetDeviceInformation xmlns="{NS_ONVIF_DEVICE}"/>"#),
        }
    }

    pub fn get_profiles() -> Self {
        Self {
            action: ACTION_GET_PROFILES,
            namespaces: vec![("trt", NS_ONVIF_MEDIA)],
            body: "<trt:GetProfiles/>".to_string(),
        }
    }

    pub fn get_stream_uri(transport: &str, profile_token: &str) -> Self {
        Self {
            action: ACTION_GET_STREAM_URI,
            namespaces: vec![("trt", NS_ONVIF_MEDIA), ("tt", NS_ONVIF_SCHEMA)],
            body: format!(
                concat!(
                    "<trt:GetStreamUri>",
                    "<trt:StreamSetup>",
                    "<tt:Stream>{stream}</tt:Stream>",
                    "<tt:Transport><tt:Protocol>{transport}</tt:Protocol></tt:Transport>",
                    "</trt:StreamSetup>",
                    "<trt:ProfileToken>{token}</trt:ProfileToken>",
                    "</trt:GetStreamUri>"
                ),
                stream = ONVIF_STREAM_TYPE,
                transport = escape(transport),
                token = escape(profile_token),
            ),
        }
    }

    pub fn action(&self) -> &'static str {
        self.action
    }

    /// `Content-Type` header value carrying the action URI.
    pub fn content_type(&self) -> String {
        format!(r#"{SOAP_CONTENT_TYPE};action="{}""#, self.action)
    }

    /// Renders the envelope, with a `Security` header first in `Header` when
    /// a token is given.
    pub fn to_xml(&self, security: Option<&UsernameToken>) -> String {
        let mut xml = String::from(XML_DECLARATION);
        xml.push_str(&format!(r#"<s:Envelope xmlns:s="{NS_SOAP_ENVELOPE}""#));
        for (prefix, uri) in &self.namespaces {
            xml.push_str(&format!(r#" xmlns:{prefix}="{uri}""#));
        }
        if let Some(token) = security {
            xml.push_str(&format!(r#" xmlns:wsu="{NS_WS_SECURITY_UTILITY}">"#));
            xml.push_str("<s:Header>");
            xml.push_str(&token.to_xml());
            xml.push_str("</s:Header>");
        } else {
            xml.push('>');
        }
        xml.push_str("<s:Body>");
        xml.push_str(&self.body);
        xml.push_str("</s:Body></s:Envelope>");
        xml
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Responses
// ─────────────────────────────────────────────────────────────────────────────

/// The interesting parts of one `ProbeMatches` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeMatch {
    /// Message id of the probe this answers.
    pub relates_to: String,
    /// Endpoint reference address, the device's stable identity.
    pub device_uuid: Option<String>,
    pub xaddrs: Vec<String>,
    pub scopes: Vec<String>,
}

pub fn parse_probe_match(doc: &XmlElement) -> XmlResult<ProbeMatch> {
    let header = doc.child("Header").ok_or(XmlError::MissingElement("Header"))?;
    let relates_to = header.require_text("RelatesTo")?;
    let matches = doc.require("ProbeMatches")?;

    let list = |name: &str| -> Vec<String> {
        matches
            .find(name)
            .map(|e| e.text.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    };

    Ok(ProbeMatch {
        relates_to,
        device_uuid: matches.find_text("Address"),
        xaddrs: list("XAddrs"),
        scopes: list("Scopes"),
    })
}

/// Result of `GetDeviceInformation`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInformation {
    pub manufacturer: String,
    pub model: String,
    pub firmware_version: String,
    pub serial_number: String,
    pub hardware_id: String,
}

pub fn parse_device_information(doc: &XmlElement) -> XmlResult<DeviceInformation> {
    let response = doc.require("GetDeviceInformationResponse")?;
    Ok(DeviceInformation {
        manufacturer: response.require_text("Manufacturer")?,
        model: response.require_text("Model")?,
        firmware_version: response.require_text("FirmwareVersion")?,
        serial_number: response.require_text("SerialNumber")?,
        hardware_id: response.require_text("HardwareId")?,
    })
}

fn number<T: std::str::FromStr>(parent: &XmlElement, name: &'static str) -> XmlResult<T> {
    let text = parent.require_text(name)?;
    text.parse().map_err(|_| XmlError::InvalidValue {
        element: name,
        value: text,
    })
}

/// Returns the device's UTC clock from `GetSystemDateAndTime`.
pub fn parse_system_date_and_time(doc: &XmlElement) -> XmlResult<DateTime<Utc>> {
    let response = doc.require("GetSystemDateAndTimeResponse")?;
    let utc = response.require("UTCDateTime")?;
    let date = utc.require("Date")?;
    let time = utc.require("Time")?;

    let year: i32 = number(date, "Year")?;
    let month: u32 = number(date, "Month")?;
    let day: u32 = number(date, "Day")?;
    let hour: u32 = number(time, "Hour")?;
    let minute: u32 = number(time, "Minute")?;
    let second: u32 = number(time, "Second")?;

    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_opt(hour, minute, second))
        .map(|dt| dt.and_utc())
        .ok_or_else(|| XmlError::InvalidValue {
            element: "UTCDateTime",
            value: format!("{year}-{month}-{day} {hour}:{minute}:{second}"),
        })
}

/// Video resolution of a media profile's encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// One media profile from `GetProfiles`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct MediaProfile {
    pub name: String,
    pub token: String,
    pub encoding: String,
    pub resolution: Option<Resolution>,
}

/// Parses `GetProfilesResponse`. Profiles without a token are skipped since
/// no stream URI can be requested for them.
pub fn parse_profiles(doc: &XmlElement) -> XmlResult<Vec<MediaProfile>> {
    let response = doc.require("GetProfilesResponse")?;
    let elements = response.find_all("Profiles");

    let mut profiles = Vec::new();
    for (index, element) in elements.iter().enumerate() {
        let Some(token) = element.attr("token").filter(|t| !t.is_empty()) else {
            continue;
        };

        let name = element
            .child("Name")
            .map(|n| n.text.trim().to_string())
            .filter(|n| !n.is_empty())
            .or_else(|| element.find_text("Name"))
            .unwrap_or_else(|| format!("UnknownProfile {}", index + 1));

        let encoder = element.find("VideoEncoderConfiguration");
        let encoding = encoder
            .and_then(|e| e.find_text("Encoding"))
            .unwrap_or_else(|| "UnknownEncoding".to_string());
        let resolution = encoder.and_then(|e| e.find("Resolution")).and_then(|r| {
            Some(Resolution {
                width: number(r, "Width").ok()?,
                height: number(r, "Height").ok()?,
            })
        });

        profiles.push(MediaProfile {
            name,
            token: token.to_string(),
            encoding,
            resolution,
        });
    }

    if profiles.len() != elements.len() {
        log::info!(
            "[ONVIF] Acquired {} profiles, out of {}",
            profiles.len(),
            elements.len()
        );
    }
    Ok(profiles)
}

pub fn parse_stream_uri(doc: &XmlElement) -> XmlResult<String> {
    doc.require("GetStreamUriResponse")?.require_text("Uri")
}
