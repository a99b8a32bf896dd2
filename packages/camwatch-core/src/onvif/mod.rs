//! ONVIF camera discovery over WS-Discovery and polling over SOAP.
//!
//! This module provides:
//! - WS-Discovery probe and ONVIF SOAP request codecs ([`codec`])
//! - Per-device state with change detection ([`state`])
//! - One-shot discovery runs and device polls ([`discovery`], [`poll`])
//! - The device table arbitrating their results ([`manager`])

pub mod codec;
pub mod discovery;
pub mod manager;
pub mod poll;
pub mod state;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_fixtures;

pub use codec::{Credentials, DeviceInformation, FaultCode, MediaProfile, Resolution};
pub use discovery::{DiscoverySink, OnvifDiscovery};
pub use manager::OnvifDeviceManager;
pub use poll::DevicePoll;
pub use state::{DeviceSettings, FailureReason, OnvifAddress, OnvifDeviceState, OnvifScopes, StreamUri};
pub use transport::{HttpReply, ReqwestTransport, SoapTransport, TransportError};
