//! UPnP discovery (SSDP) and device description.
//!
//! This module provides:
//! - SSDP datagram parsing, vendor workarounds and M-SEARCH ([`ssdp`])
//! - Description document parsing ([`description`]) and its non-blocking
//!   HTTP fetch ([`fetch`])
//! - Per-device lifecycle and helpers ([`device`])
//! - The cooperative device table ([`control_point`])

pub mod control_point;
pub mod description;
pub mod device;
pub mod fetch;
pub mod ssdp;

#[cfg(test)]
pub(crate) mod test_fixtures;

pub use control_point::ControlPointManager;
pub use description::{parse_description, DeviceDescription};
pub use device::{UpnpDevice, UpnpDeviceInfo};
pub use fetch::DescriptionFetch;
pub use ssdp::{SsdpError, SsdpMessage};
