//! Device change notification.
//!
//! Both managers expose a pull API (`poll_for_changes`). Hosts that prefer
//! push delivery feed each diff into a [`DeviceEventHub`], which fans the
//! resulting [`DeviceEvent`]s out to explicit subscribers.

mod hub;

pub use hub::{DeviceEventHub, Subscription, SubscriptionId};

use serde::Serialize;

/// A change to one entry of a device table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DeviceEvent {
    /// An ONVIF device appeared or changed materially.
    OnvifChanged {
        uuid: String,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
    /// An ONVIF device left the table.
    OnvifGone { uuid: String, timestamp: u64 },
    /// A UPnP device appeared or changed materially.
    UpnpChanged { usn: String, timestamp: u64 },
    /// A UPnP device left the table.
    UpnpGone { usn: String, timestamp: u64 },
}

impl DeviceEvent {
    /// The uuid or USN the event is about.
    pub fn key(&self) -> &str {
        match self {
            Self::OnvifChanged { uuid, .. } | Self::OnvifGone { uuid, .. } => uuid,
            Self::UpnpChanged { usn, .. } | Self::UpnpGone { usn, .. } => usn,
        }
    }

    /// True for removals.
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::OnvifGone { .. } | Self::UpnpGone { .. })
    }
}
