//! Authoritative table of ONVIF devices.
//!
//! The manager schedules discovery runs and device polls, merges what they
//! report back and computes change sets for the host. Results may arrive in
//! any order; generation numbers decide which of them is current.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::codec::Credentials;
use super::discovery::{DiscoverySink, OnvifDiscovery};
use super::poll::DevicePoll;
use super::state::{DeviceSettings, OnvifAddress, OnvifDeviceState};
use super::transport::{ReqwestTransport, SoapTransport, TransportError};
use crate::config::OnvifConfig;
use crate::interfaces::{InterfaceSource, SystemInterfaces};
use crate::runtime::{TaskSpawner, TokioSpawner};

#[derive(Default)]
struct ManagerInner {
    generation: i64,
    devices: HashMap<String, OnvifDeviceState>,
    last_seen: HashMap<String, Instant>,
    settings: HashMap<String, DeviceSettings>,
    /// Table as returned by the previous `poll_for_changes`.
    snapshot: HashMap<String, OnvifDeviceState>,
    forced_notify: HashSet<String>,
    pending_polls: usize,
    current_discovery: Option<i64>,
}

/// Registry and arbiter of ONVIF device states.
pub struct OnvifDeviceManager {
    me: Weak<Self>,
    config: OnvifConfig,
    spawner: TokioSpawner,
    transport: Arc<dyn SoapTransport>,
    interfaces: Arc<dyn InterfaceSource>,
    inner: Mutex<ManagerInner>,
    /// Endpoints that sent deviceless probe matches, by time of offence.
    blacklist: Mutex<HashMap<SocketAddr, Instant>>,
    discovery_target: Option<SocketAddr>,
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

impl OnvifDeviceManager {
    pub fn new(
        config: OnvifConfig,
        spawner: TokioSpawner,
        transport: Arc<dyn SoapTransport>,
        interfaces: Arc<dyn InterfaceSource>,
    ) -> Arc<Self> {
        Self::build(config, spawner, transport, interfaces, None)
    }

    fn build(
        config: OnvifConfig,
        spawner: TokioSpawner,
        transport: Arc<dyn SoapTransport>,
        interfaces: Arc<dyn InterfaceSource>,
        discovery_target: Option<SocketAddr>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            spawner,
            transport,
            interfaces,
            inner: Mutex::new(ManagerInner {
                generation: -1,
                ..Default::default()
            }),
            blacklist: Mutex::new(HashMap::new()),
            discovery_target,
        })
    }

    /// Manager talking HTTP through `reqwest` on the system's interfaces.
    pub fn with_defaults(config: OnvifConfig, spawner: TokioSpawner) -> Result<Arc<Self>, TransportError> {
        let transport = Arc::new(ReqwestTransport::new(config.http_timeout())?);
        Ok(Self::new(config, spawner, transport, SystemInterfaces::arc()))
    }

    /// Sends discovery probes to `target` instead of the multicast group.
    #[cfg(test)]
    pub(crate) fn with_discovery_target(
        config: OnvifConfig,
        spawner: TokioSpawner,
        transport: Arc<dyn SoapTransport>,
        interfaces: Arc<dyn InterfaceSource>,
        target: SocketAddr,
    ) -> Arc<Self> {
        Self::build(config, spawner, transport, interfaces, Some(target))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Searching
    // ─────────────────────────────────────────────────────────────────────────

    /// Polls the known device `uuid`, or runs a full discovery when `uuid` is
    /// `None` or unknown. Every call takes a fresh generation.
    ///
    /// `needs_notify` makes the polled device show up as changed in the next
    /// `poll_for_changes`, whether or not anything changed.
    pub fn active_search(&self, uuid: Option<&str>, needs_notify: bool) {
        let mut inner = self.inner.lock();
        log::debug!("[ONVIF] Active search ({:?}, {})", uuid, needs_notify);

        inner.generation += 1;
        let generation = inner.generation;

        let known = uuid.and_then(|u| inner.devices.get_mut(u)).map(|state| {
            state.generation = generation;
            state.clone()
        });
        match known {
            Some(state) => self.schedule_poll(&mut inner, state, needs_notify),
            None => self.schedule_discovery(&mut inner, generation),
        }
    }

    fn schedule_discovery(&self, inner: &mut ManagerInner, generation: i64) {
        let Some(manager) = self.me.upgrade() else {
            return;
        };
        let mut discovery = OnvifDiscovery::new(
            generation,
            self.config.clone(),
            self.interfaces.clone(),
            manager.clone(),
        );
        if let Some(target) = self.discovery_target {
            discovery = discovery.with_target(target);
        }
        inner.current_discovery = Some(generation);
        log::info!("[ONVIF] Scheduling discovery gen {}", generation);

        self.spawner.spawn(async move {
            let seen = AssertUnwindSafe(discovery.run())
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    log::error!("[ONVIF] Uncaught discovery error: {}", panic_message(&*panic));
                    HashSet::new()
                });
            manager.on_discovery_done(&seen);
        });
    }

    fn schedule_poll(&self, inner: &mut ManagerInner, mut state: OnvifDeviceState, force_notify: bool) {
        let Some(manager) = self.me.upgrade() else {
            return;
        };
        state.settings = inner.settings.get(&state.uuid).cloned().unwrap_or_default();
        log::info!("[ONVIF] Scheduling poll for device {}", state.log_id());
        inner.pending_polls += 1;

        let uuid = state.uuid.clone();
        let poll = DevicePoll::new(state, self.transport.clone());
        self.spawner.spawn(async move {
            let result = AssertUnwindSafe(poll.run())
                .catch_unwind()
                .await
                .map_err(|panic| panic_message(&*panic));
            manager.on_poll_done(&uuid, force_notify, result);
        });
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// Returns `(changed, gone)` since the previous call. New devices count
    /// as changed.
    pub fn poll_for_changes(&self) -> (HashSet<String>, HashSet<String>) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let mut changed = HashSet::new();
        let mut gone = HashSet::new();

        let previous: Vec<(String, OnvifDeviceState)> = inner.snapshot.drain().collect();
        for (uuid, old) in &previous {
            match inner.devices.get(uuid) {
                None => {
                    gone.insert(uuid.clone());
                }
                Some(current) if current.has_changed(old, false) => {
                    changed.insert(uuid.clone());
                }
                Some(_) => {
                    if inner.forced_notify.remove(uuid) {
                        log::debug!("[ONVIF] Forcing notification for {}", uuid);
                        changed.insert(uuid.clone());
                    }
                }
            }
        }
        let previous: HashSet<String> = previous.into_iter().map(|(uuid, _)| uuid).collect();
        let added: Vec<String> = inner
            .devices
            .keys()
            .filter(|uuid| !previous.contains(*uuid))
            .cloned()
            .collect();

        for uuid in &added {
            log::info!("[ONVIF] Device added: {}", inner.devices[uuid].log_id());
        }
        for uuid in &changed {
            log::info!("[ONVIF] Device changed: {}", inner.devices[uuid].log_id());
        }
        for uuid in &gone {
            log::info!("[ONVIF] Device gone: {}", uuid);
        }

        changed.extend(added);
        inner.snapshot = inner.devices.clone();
        (changed, gone)
    }

    pub fn get_device(&self, uuid: &str) -> Option<OnvifDeviceState> {
        self.inner.lock().devices.get(uuid).cloned()
    }

    pub fn get_devices(&self) -> HashMap<String, OnvifDeviceState> {
        self.inner.lock().devices.clone()
    }

    pub fn pending_polls(&self) -> usize {
        self.inner.lock().pending_polls
    }

    pub fn is_discovering(&self) -> bool {
        self.inner.lock().current_discovery.is_some()
    }

    /// Stores user settings for `uuid`; later polls use them.
    pub fn set_device_settings(
        &self,
        uuid: &str,
        credentials: Option<Credentials>,
        selected_addr: Option<OnvifAddress>,
    ) {
        let mut inner = self.inner.lock();
        log::info!(
            "[ONVIF] New settings for {} ({}, password of {} chars, {})",
            uuid,
            credentials.as_ref().map_or("-", |c| c.username.as_str()),
            credentials.as_ref().map_or(0, |c| c.password.chars().count()),
            selected_addr.as_ref().map_or_else(|| "-".to_string(), ToString::to_string)
        );
        inner.settings.insert(
            uuid.to_string(),
            DeviceSettings {
                credentials,
                selected_addr,
            },
        );
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Task Reports
    // ─────────────────────────────────────────────────────────────────────────

    /// Merges a state reported by discovery. States that are not newer or
    /// carry no visible change are dropped. New devices get polled.
    pub fn on_device_discovered(&self, state: OnvifDeviceState) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let uuid = state.uuid.clone();
        inner.last_seen.insert(uuid.clone(), Instant::now());

        let is_new = match inner.devices.get(&uuid) {
            Some(existing) => {
                if existing.generation >= state.generation || !state.has_changed(existing, true) {
                    log::debug!("[ONVIF] Obsolete discovery for device {}", state.log_id());
                    return;
                }
                false
            }
            None => true,
        };

        inner.devices.insert(uuid, state.clone());
        if is_new {
            self.schedule_poll(inner, state, false);
        }
    }

    /// Merges a poll result. A failed poll only evicts the device if it has
    /// not been seen for the device timeout.
    pub fn on_poll_done(&self, uuid: &str, force_notify: bool, result: Result<OnvifDeviceState, String>) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.pending_polls = inner.pending_polls.saturating_sub(1);

        let state = match result {
            Ok(state) => state,
            Err(error) => {
                self.remove_uuid(inner, uuid);
                log::warn!("[ONVIF] Poll error ({}) for device {}", error, uuid);
                return;
            }
        };

        match inner.devices.get(uuid) {
            None => log::warn!("[ONVIF] Device not found post-poll ({})", state.log_id()),
            Some(existing) if !force_notify => {
                if existing.generation > state.generation || existing.has_changed(&state, true) {
                    log::debug!("[ONVIF] Obsolete poll for device {}", state.log_id());
                    inner.last_seen.insert(uuid.to_string(), Instant::now());
                    return;
                }
            }
            Some(_) => {}
        }

        log::info!("[ONVIF] Device {} poll completed", state.log_id());
        inner.devices.insert(uuid.to_string(), state);
        inner.last_seen.insert(uuid.to_string(), Instant::now());
        if force_notify {
            inner.forced_notify.insert(uuid.to_string());
        }
    }

    /// Evicts devices a finished discovery did not see, subject to the
    /// device timeout.
    pub fn on_discovery_done(&self, seen: &HashSet<String>) {
        let mut inner = self.inner.lock();
        let missing: Vec<String> = inner
            .devices
            .keys()
            .filter(|uuid| !seen.contains(*uuid))
            .cloned()
            .collect();
        for uuid in missing {
            self.remove_uuid(&mut inner, &uuid);
        }
        inner.current_discovery = None;
    }

    fn remove_uuid(&self, inner: &mut ManagerInner, uuid: &str) {
        let Some(last_seen) = inner.last_seen.get(uuid).copied() else {
            return;
        };
        let unseen = last_seen.elapsed();
        if unseen > self.config.device_timeout() {
            inner.devices.remove(uuid);
            inner.last_seen.remove(uuid);
            log::info!("[ONVIF] Deleted {} after not seeing it for {:?}", uuid, unseen);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Blacklist
    // ─────────────────────────────────────────────────────────────────────────

    pub fn blacklist_device(&self, endpoint: SocketAddr) {
        self.blacklist.lock().insert(endpoint, Instant::now());
    }

    /// True while `endpoint` is cooling down. Expired entries are dropped.
    pub fn device_blacklisted(&self, endpoint: &SocketAddr) -> bool {
        let mut blacklist = self.blacklist.lock();
        match blacklist.get(endpoint) {
            Some(since) if since.elapsed() < self.config.blacklist_timeout() => true,
            Some(_) => {
                blacklist.remove(endpoint);
                false
            }
            None => false,
        }
    }
}

impl DiscoverySink for OnvifDeviceManager {
    fn device_blacklisted(&self, endpoint: &SocketAddr) -> bool {
        OnvifDeviceManager::device_blacklisted(self, endpoint)
    }

    fn blacklist_device(&self, endpoint: SocketAddr) {
        OnvifDeviceManager::blacklist_device(self, endpoint);
    }

    fn device_settings(&self, uuid: &str) -> DeviceSettings {
        self.inner.lock().settings.get(uuid).cloned().unwrap_or_default()
    }

    fn on_device_discovered(&self, state: OnvifDeviceState) {
        OnvifDeviceManager::on_device_discovered(self, state);
    }
}
