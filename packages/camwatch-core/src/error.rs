//! Centralized error codes for the camwatch core library.
//!
//! Each concern defines its own `thiserror` enum next to the code that raises
//! it. This module gives all of them a stable, machine-readable code so logs
//! and the scanner's JSON output stay greppable across releases.

use crate::interfaces::{DiscoveryError, NetworkError};
use crate::onvif::transport::TransportError;
use crate::upnp::ssdp::SsdpError;
use crate::url_codec::UrlCodecError;
use crate::xml::XmlError;

/// Trait for error types that provide machine-readable error codes.
pub trait ErrorCode {
    /// Returns a machine-readable error code.
    fn code(&self) -> &'static str;
}

impl ErrorCode for DiscoveryError {
    fn code(&self) -> &'static str {
        match self {
            Self::SocketBind(_) => "socket_bind_failed",
            Self::SocketOption(_) => "socket_option_failed",
        }
    }
}

impl ErrorCode for NetworkError {
    fn code(&self) -> &'static str {
        match self {
            Self::Enumeration(_) => "interface_enumeration_failed",
        }
    }
}

impl ErrorCode for TransportError {
    fn code(&self) -> &'static str {
        match self {
            Self::Http(_) => "http_request_failed",
            Self::NoResponse(_) => "http_no_response",
        }
    }
}

impl ErrorCode for XmlError {
    fn code(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "xml_malformed",
            Self::MissingElement(_) => "xml_missing_element",
            Self::InvalidValue { .. } => "xml_invalid_value",
        }
    }
}

impl ErrorCode for UrlCodecError {
    fn code(&self) -> &'static str {
        match self {
            Self::NotUpnpUrl(_) => "not_upnp_url",
            Self::NotOnvifUrl(_) => "not_onvif_url",
        }
    }
}

impl ErrorCode for SsdpError {
    fn code(&self) -> &'static str {
        match self {
            Self::NotStatusMessage => "ssdp_not_status_message",
            Self::MalformedHeaders => "ssdp_malformed_headers",
            Self::MissingUsn => "ssdp_missing_usn",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Result Type Aliases
// ─────────────────────────────────────────────────────────────────────────────

// Re-export Result type aliases from their defining modules
pub use crate::interfaces::DiscoveryResult;
pub use crate::url_codec::UrlResult;
pub use crate::xml::XmlResult;
