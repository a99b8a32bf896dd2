//! Explicit subscription registry for [`DeviceEvent`]s.
//!
//! Subscribers hold a [`Subscription`] and are removed either by calling
//! [`DeviceEventHub::unsubscribe`] or by dropping the handle. Nothing is
//! tracked through weak references, so a subscriber's lifetime is exactly the
//! lifetime of its handle.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::DeviceEvent;
use crate::utils::now_millis;

/// Identifies one subscription within its hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

struct HubInner {
    next_id: AtomicU64,
    subscribers: Mutex<BTreeMap<SubscriptionId, mpsc::UnboundedSender<DeviceEvent>>>,
}

/// Fan-out point for device events. Cheap to clone.
#[derive(Clone)]
pub struct DeviceEventHub {
    inner: Arc<HubInner>,
}

impl Default for DeviceEventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceEventHub {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                next_id: AtomicU64::new(1),
                subscribers: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    /// Registers a new subscriber.
    pub fn subscribe(&self) -> Subscription {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.lock().insert(id, tx);
        log::debug!("[Events] Subscriber {:?} added", id);
        Subscription {
            id,
            hub: self.clone(),
            rx,
        }
    }

    /// Removes a subscriber. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.inner.subscribers.lock().remove(&id).is_some();
        if removed {
            log::debug!("[Events] Subscriber {:?} removed", id);
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    /// Delivers `event` to every subscriber.
    pub fn emit(&self, event: DeviceEvent) {
        tracing::debug!(?event, "device_event");
        let mut subscribers = self.inner.subscribers.lock();
        // Receivers dropped without going through the handle.
        subscribers.retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    /// Emits the events for one ONVIF `poll_for_changes` diff.
    pub fn publish_onvif_diff(&self, changed: &HashSet<String>, gone: &HashSet<String>) {
        let timestamp = now_millis();
        for uuid in sorted(changed) {
            self.emit(DeviceEvent::OnvifChanged { uuid, timestamp });
        }
        for uuid in sorted(gone) {
            self.emit(DeviceEvent::OnvifGone { uuid, timestamp });
        }
    }

    /// Emits the events for one UPnP `poll_for_changes` diff.
    pub fn publish_upnp_diff(&self, changed: &HashSet<String>, gone: &HashSet<String>) {
        let timestamp = now_millis();
        for usn in sorted(changed) {
            self.emit(DeviceEvent::UpnpChanged { usn, timestamp });
        }
        for usn in sorted(gone) {
            self.emit(DeviceEvent::UpnpGone { usn, timestamp });
        }
    }
}

fn sorted(keys: &HashSet<String>) -> Vec<String> {
    let mut keys: Vec<String> = keys.iter().cloned().collect();
    keys.sort();
    keys
}

/// Receiving end of a subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: SubscriptionId,
    hub: DeviceEventHub,
    rx: mpsc::UnboundedReceiver<DeviceEvent>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Waits for the next event. `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<DeviceEvent> {
        self.rx.recv().await
    }

    /// Returns an already queued event without waiting.
    pub fn try_recv(&mut self) -> Option<DeviceEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.id);
    }
}
