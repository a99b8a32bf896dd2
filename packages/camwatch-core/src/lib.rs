//! Camwatch Core - network camera discovery engines.
//!
//! This crate finds cameras on the local network and keeps a live table of
//! them. It is used by the headless scanner and is meant to be embedded in
//! any host that stores camera references.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`onvif`]: WS-Discovery probing and ONVIF SOAP polling (tokio tasks)
//! - [`upnp`]: SSDP discovery and UPnP description fetch (cooperative polling)
//! - [`url_codec`]: Stable pseudo-URLs that name a device instead of an IP
//! - [`events`]: Push delivery of device table changes
//! - [`interfaces`]: Local address enumeration and multicast sockets
//! - [`config`]: Timing configuration for both engines
//! - [`error`]: Centralized error codes
//!
//! # Abstraction Traits
//!
//! The crate defines several traits to decouple the engines from the
//! environment they run in:
//!
//! - [`TaskSpawner`](runtime::TaskSpawner): Spawning discovery and poll tasks
//! - [`SoapTransport`](onvif::SoapTransport): The HTTP exchange with a camera
//! - [`InterfaceSource`](interfaces::InterfaceSource): Local IPv4 addresses
//!
//! Each trait has a default implementation suitable for the scanner.

#![allow(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod events;
pub mod interfaces;
pub mod onvif;
pub mod protocol_constants;
pub mod runtime;
pub mod upnp;
pub mod url_codec;
pub mod utils;
pub mod xml;

// Re-export commonly used types at the crate root
pub use config::{DiscoveryConfig, OnvifConfig, UpnpConfig};
pub use error::{DiscoveryResult, ErrorCode, UrlResult, XmlResult};
pub use events::{DeviceEvent, DeviceEventHub, Subscription, SubscriptionId};
pub use interfaces::{DiscoveryError, InterfaceSource, NetworkError, StaticInterfaces, SystemInterfaces};
pub use runtime::{TaskSpawner, TokioSpawner};
pub use utils::now_millis;

// Re-export engine types
pub use onvif::{Credentials, OnvifAddress, OnvifDeviceManager, OnvifDeviceState};
pub use upnp::{ControlPointManager, UpnpDevice, UpnpDeviceInfo};

// Re-export URL codec
pub use url_codec::{
    construct_onvif_url, construct_upnp_url, extract_usn_from_upnp_url,
    extract_uuid_from_onvif_url, is_onvif_url, is_upnp_url, realize_onvif_url, realize_upnp_url,
    UrlCodecError,
};
