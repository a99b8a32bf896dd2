//! UPnP control point: SSDP discovery plus description of found devices.
//!
//! The manager is cooperative. Nothing runs between calls; the host calls
//! [`ControlPointManager::poll_for_changes`] periodically and each call
//! drains every socket without blocking, advances pending description
//! fetches, expires stale devices and reports what changed.
//!
//! Sockets:
//! - one passive socket bound to the SSDP group, joined on every local
//!   address as addresses appear (never left, to keep multi-homed hosts
//!   listening);
//! - one request socket per local IPv4 address, used for M-SEARCH and
//!   receiving the unicast replies.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;

use super::device::UpnpDevice;
use super::ssdp::{search_request, SsdpMessage};
use crate::config::UpnpConfig;
use crate::interfaces::{
    join_ssdp_group, multicast_sender, ssdp_listener, InterfaceSource, SystemInterfaces,
};
use crate::protocol_constants::{
    SEARCH_TARGET_ALL, SSDP_MAX_PACKET_SIZE, SSDP_MULTICAST_ADDR, SSDP_MULTICAST_TTL, SSDP_PORT,
};

/// Remaining `ssdp:all` searches for one newly seen local address.
#[derive(Debug, Clone, Copy)]
struct SearchSchedule {
    sent: u32,
    next_at: Instant,
}

pub struct ControlPointManager {
    config: UpnpConfig,
    interfaces: Arc<dyn InterfaceSource>,
    passive: Option<UdpSocket>,
    request_sockets: BTreeMap<Ipv4Addr, UdpSocket>,
    searches: BTreeMap<Ipv4Addr, SearchSchedule>,
    /// Described devices, by USN.
    devices: HashMap<String, UpnpDevice>,
    /// Devices whose description is still being fetched, by USN.
    pending: HashMap<String, UpnpDevice>,
    search_target: SocketAddr,
}

impl ControlPointManager {
    /// Opens the passive socket and starts searching on every local address.
    ///
    /// Failing to open the passive socket (port 1900 taken without reuse,
    /// no multicast support) is logged; active searches still work.
    pub fn new(config: UpnpConfig, interfaces: Arc<dyn InterfaceSource>) -> Self {
        let passive = match ssdp_listener() {
            Ok(socket) => Some(socket),
            Err(e) => {
                log::error!("[ControlPoint] Couldn't open SSDP listening socket: {}", e);
                None
            }
        };
        let mut manager = Self::with_sockets(config, interfaces, passive);
        manager.check_for_ip_changes(Instant::now());
        manager
    }

    pub fn with_defaults(config: UpnpConfig) -> Self {
        Self::new(config, SystemInterfaces::arc())
    }

    fn with_sockets(
        config: UpnpConfig,
        interfaces: Arc<dyn InterfaceSource>,
        passive: Option<UdpSocket>,
    ) -> Self {
        let group = SSDP_MULTICAST_ADDR
            .parse::<Ipv4Addr>()
            .unwrap_or(Ipv4Addr::BROADCAST);
        Self {
            config,
            interfaces,
            passive,
            request_sockets: BTreeMap::new(),
            searches: BTreeMap::new(),
            devices: HashMap::new(),
            pending: HashMap::new(),
            search_target: SocketAddr::V4(SocketAddrV4::new(group, SSDP_PORT)),
        }
    }

    /// Sends searches to `target` instead of the SSDP group.
    #[cfg(test)]
    fn with_search_target(mut self, target: SocketAddr) -> Self {
        self.search_target = target;
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Public Surface
    // ─────────────────────────────────────────────────────────────────────────

    /// Multicasts an M-SEARCH for `target` on every local address.
    ///
    /// Matching devices (all of them for `ssdp:all`) are flagged for
    /// verification, so their next sighting replaces them and refetches the
    /// description.
    pub fn active_search(&mut self, target: &str) {
        self.active_search_at(target, Instant::now());
    }

    /// Processes everything that arrived since the last call.
    ///
    /// Returns `(changed, gone)`: USNs that are new or changed in a big way
    /// (all present in [`get_devices`](Self::get_devices)) and previously
    /// known USNs that disappeared.
    pub fn poll_for_changes(&mut self) -> (HashSet<String>, HashSet<String>) {
        self.poll_for_changes_at(Instant::now())
    }

    /// Copies of all described devices, by USN.
    pub fn get_devices(&self) -> HashMap<String, UpnpDevice> {
        self.devices.clone()
    }

    pub fn get_device(&self, usn: &str) -> Option<&UpnpDevice> {
        self.devices.get(usn)
    }

    /// Number of devices still being described.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Polling
    // ─────────────────────────────────────────────────────────────────────────

    fn active_search_at(&mut self, target: &str, now: Instant) {
        if target == SEARCH_TARGET_ALL {
            for device in self.devices.values_mut().chain(self.pending.values_mut()) {
                device.request_verify(now);
            }
        } else {
            for table in [&mut self.devices, &mut self.pending] {
                if let Some(device) = table.get_mut(target) {
                    device.request_verify(now);
                }
            }
        }

        let request = search_request(target);
        for (ip, socket) in &self.request_sockets {
            log::debug!("[ControlPoint] Active search on {} for {}", ip, target);
            if let Err(e) = socket.send_to(request.as_bytes(), self.search_target) {
                log::debug!("[ControlPoint] Search on {} failed: {}", ip, e);
            }
        }
    }

    fn poll_for_changes_at(&mut self, now: Instant) -> (HashSet<String>, HashSet<String>) {
        let before: HashSet<String> = self.devices.keys().cloned().collect();
        let mut changed = HashSet::new();

        self.check_for_ip_changes(now);

        loop {
            self.advance_pending(now, &mut changed);
            if !self.drain_once(now) {
                break;
            }
        }

        self.purge_expired(now);

        let current: HashSet<String> = self.devices.keys().cloned().collect();
        let gone = before.difference(&current).cloned().collect();
        changed.retain(|usn| current.contains(usn));
        (changed, gone)
    }

    /// Promotes pending devices that finished their description phase.
    fn advance_pending(&mut self, now: Instant, changed: &mut HashSet<String>) {
        let finished: Vec<String> = self
            .pending
            .iter_mut()
            .filter_map(|(usn, device)| device.poll_for_description(now).then(|| usn.clone()))
            .collect();

        for usn in finished {
            let Some(device) = self.pending.remove(&usn) else {
                continue;
            };
            match self.devices.get_mut(&usn) {
                Some(existing) => {
                    let name = device.friendly_name(true);
                    if existing.update_from_newer(device) {
                        log::info!("[ControlPoint] Updating from newer: {} ({})", name, usn);
                        changed.insert(usn);
                    }
                }
                None => {
                    log::info!(
                        "[ControlPoint] New device: {} ({})",
                        device.friendly_name(true),
                        usn
                    );
                    self.devices.insert(usn.clone(), device);
                    changed.insert(usn);
                }
            }
        }
    }

    /// Reads at most one datagram from each socket; `true` if any was read.
    fn drain_once(&mut self, now: Instant) -> bool {
        let mut buf = [0u8; SSDP_MAX_PACKET_SIZE];
        let mut received = Vec::new();

        for socket in self.passive.iter().chain(self.request_sockets.values()) {
            match socket.recv_from(&mut buf) {
                Ok((len, from)) => received.push((buf[..len].to_vec(), from.ip())),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    // Windows reports ICMP port-unreachable as a reset here.
                    log::debug!("[ControlPoint] Receive failed: {}", e);
                }
            }
        }

        let any = !received.is_empty();
        for (payload, from) in received {
            self.handle_datagram(&payload, from, now);
        }
        any
    }

    /// Applies one SSDP datagram to the device tables.
    pub(crate) fn handle_datagram(&mut self, payload: &[u8], from: IpAddr, now: Instant) {
        let mut message = match SsdpMessage::parse(payload) {
            Ok(message) => message,
            Err(e) => {
                log::trace!("[SSDP] Ignoring datagram from {}: {}", from, e);
                return;
            }
        };

        match message.byebye_usn() {
            Ok(Some(usn)) => {
                log::debug!("[SSDP] byebye from {}: {}", from, usn);
                self.devices.remove(usn);
                self.pending.remove(usn);
                return;
            }
            Ok(None) => {}
            Err(e) => {
                log::debug!("[SSDP] Dropping byebye from {}: {}", from, e);
                return;
            }
        }

        if message.adjust_for_device_bugs(from) {
            return;
        }
        if !message.status_type().is_some_and(|t| t.starts_with("uuid:")) {
            return;
        }

        let mut device = match UpnpDevice::new(from, message, &self.config, now) {
            Ok(device) => device,
            Err(e) => {
                log::debug!("[SSDP] Dropping message from {}: {}", from, e);
                return;
            }
        };
        let usn = device.usn().to_string();

        let duplicate = device.handle_duplicates_early(
            self.devices.get_mut(&usn),
            self.pending.get_mut(&usn),
            now,
        );
        if !duplicate {
            log::debug!("[SSDP] Pending {} from {}", usn, from);
            device.poll_for_description(now);
            self.pending.insert(usn, device);
        }
    }

    /// Drops expired devices and re-searches for those about to expire.
    fn purge_expired(&mut self, now: Instant) {
        let mut about_to_expire = Vec::new();
        let mut expired_usns = Vec::new();
        for (usn, device) in &mut self.devices {
            if device.is_expired(now) {
                expired_usns.push(usn.clone());
            } else if device.wants_about_to_expire_search(now) {
                about_to_expire.push(usn.clone());
            }
        }

        for usn in about_to_expire {
            log::debug!("[ControlPoint] {} about to expire, searching", usn);
            self.active_search_at(&usn, now);
        }

        for usn in expired_usns {
            if let Some(device) = self.devices.remove(&usn) {
                log::info!("[ControlPoint] Expired: {} ({})", device.friendly_name(true), usn);
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Interface Maintenance
    // ─────────────────────────────────────────────────────────────────────────

    /// Tracks local address changes and sends any due `ssdp:all` searches.
    fn check_for_ip_changes(&mut self, now: Instant) {
        let old_ips: BTreeSet<Ipv4Addr> = self.request_sockets.keys().copied().collect();
        let new_ips = match self.interfaces.ipv4_addrs() {
            Ok(ips) => ips,
            Err(e) => {
                log::warn!("[ControlPoint] {}", e);
                old_ips.clone()
            }
        };

        if old_ips != new_ips {
            if let Some(passive) = &self.passive {
                for ip in new_ips.difference(&old_ips) {
                    join_ssdp_group(passive, *ip);
                }
            }
            self.maintain_request_sockets(&new_ips);

            for ip in old_ips.difference(&new_ips) {
                self.searches.remove(ip);
            }
            for ip in new_ips.difference(&old_ips) {
                self.searches.insert(
                    *ip,
                    SearchSchedule {
                        sent: 0,
                        next_at: now,
                    },
                );
            }
        }

        self.send_due_searches(now);
    }

    fn maintain_request_sockets(&mut self, new_ips: &BTreeSet<Ipv4Addr>) {
        self.request_sockets.retain(|ip, _| {
            let keep = new_ips.contains(ip);
            if !keep {
                log::debug!("[ControlPoint] Request socket removed: {}", ip);
            }
            keep
        });

        for ip in new_ips {
            if self.request_sockets.contains_key(ip) {
                continue;
            }
            // The address may already have vanished; retried next poll.
            match multicast_sender(*ip, SSDP_MULTICAST_TTL) {
                Ok(socket) => {
                    log::debug!("[ControlPoint] Request socket added: {}", ip);
                    self.request_sockets.insert(*ip, socket);
                }
                Err(e) => log::debug!("[ControlPoint] No request socket for {}: {}", ip, e),
            }
        }
    }

    fn send_due_searches(&mut self, now: Instant) {
        let request = search_request(SEARCH_TARGET_ALL);
        let min = self.config.search_min_interval_secs as f64;
        let max = self.config.search_max_interval_secs.max(self.config.search_min_interval_secs) as f64;
        let retries = self.config.search_retries;
        let target = self.search_target;
        let sockets = &self.request_sockets;
        let mut rng = rand::thread_rng();

        self.searches.retain(|ip, schedule| {
            if schedule.next_at > now {
                return true;
            }
            let Some(socket) = sockets.get(ip) else {
                log::debug!("[ControlPoint] Missing request socket for {}", ip);
                return false;
            };
            match socket.send_to(request.as_bytes(), target) {
                Ok(_) => {
                    schedule.sent += 1;
                    if schedule.sent >= retries {
                        return false;
                    }
                    schedule.next_at = now + Duration::from_secs_f64(rng.gen_range(min..=max));
                }
                Err(e) => log::debug!("[ControlPoint] Search on {} failed: {}", ip, e),
            }
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::StaticInterfaces;
    use crate::upnp::test_fixtures::{
        alive_notify, byebye_notify, http_response, search_reply, serve_once, CAMERA_DESCRIPTION,
    };
    use std::thread;

    const CAM_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20));

    /// A manager without sockets, fed through `handle_datagram`.
    fn offline() -> ControlPointManager {
        ControlPointManager::with_sockets(
            UpnpConfig::default(),
            Arc::new(StaticInterfaces::default()),
            None,
        )
    }

    /// Polls until `done` holds, with real time for the description fetch.
    fn poll_until(
        manager: &mut ControlPointManager,
        now: Instant,
        done: impl Fn(&ControlPointManager) -> bool,
    ) -> HashSet<String> {
        let mut changed = HashSet::new();
        for _ in 0..400 {
            let (c, _) = manager.poll_for_changes_at(now);
            changed.extend(c);
            if done(manager) {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        changed
    }

    #[test]
    fn test_refreshed_announcement_yields_one_device() {
        let (addr, _server) = serve_once(http_response(200, CAMERA_DESCRIPTION));
        let location = format!("http://{addr}/desc.xml");
        let mut manager = offline();
        let t0 = Instant::now();

        manager.handle_datagram(alive_notify("uuid:cam-1", &location, 1800).as_bytes(), CAM_IP, t0);
        let changed = poll_until(&mut manager, t0, |m| m.get_device("uuid:cam-1").is_some());
        assert_eq!(changed, HashSet::from(["uuid:cam-1".to_string()]));

        let t1 = t0 + Duration::from_secs(5);
        manager.handle_datagram(alive_notify("uuid:cam-1", &location, 1800).as_bytes(), CAM_IP, t1);
        let (changed, gone) = manager.poll_for_changes_at(t1);
        assert!(changed.is_empty());
        assert!(gone.is_empty());
        assert_eq!(manager.pending_count(), 0);

        let devices = manager.get_devices();
        assert_eq!(devices.len(), 1);
        let device = &devices["uuid:cam-1"];
        assert_eq!(device.expires_at(), t1 + Duration::from_secs(1800 + 60));
        assert_eq!(device.friendly_name(false), "Front Door");
    }

    #[test]
    fn test_byebye_removes_device() {
        let mut manager = offline();
        let now = Instant::now();
        // No location, so the device is promoted without a description.
        let msg = "NOTIFY * HTTP/1.1\r\nCACHE-CONTROL: max-age=1800\r\nLOCATION: \r\nNT: uuid:cam-2\r\nNTS: ssdp:alive\r\nSERVER: x\r\nUSN: uuid:cam-2\r\n\r\n";
        manager.handle_datagram(msg.as_bytes(), CAM_IP, now);
        assert_eq!(manager.pending_count(), 1);

        manager.handle_datagram(byebye_notify("uuid:cam-2").as_bytes(), CAM_IP, now);
        assert_eq!(manager.pending_count(), 0);
        assert!(manager.get_devices().is_empty());
    }

    #[test]
    fn test_byebye_removes_described_device() {
        let (addr, _server) = serve_once(http_response(200, CAMERA_DESCRIPTION));
        let location = format!("http://{addr}/desc.xml");
        let mut manager = offline();
        let now = Instant::now();

        manager.handle_datagram(alive_notify("uuid:cam-1", &location, 1800).as_bytes(), CAM_IP, now);
        poll_until(&mut manager, now, |m| m.get_device("uuid:cam-1").is_some());

        manager.handle_datagram(byebye_notify("uuid:cam-1").as_bytes(), CAM_IP, now);
        assert!(manager.get_device("uuid:cam-1").is_none());
    }

    #[test]
    fn test_byebye_on_passive_socket_is_reported_gone() {
        let (addr, _server) = serve_once(http_response(200, CAMERA_DESCRIPTION));
        let location = format!("http://{addr}/desc.xml");
        let passive = UdpSocket::bind("127.0.0.1:0").unwrap();
        passive.set_nonblocking(true).unwrap();
        let passive_addr = passive.local_addr().unwrap();
        let mut manager = ControlPointManager::with_sockets(
            UpnpConfig::default(),
            Arc::new(StaticInterfaces::default()),
            Some(passive),
        );
        let now = Instant::now();

        manager.handle_datagram(alive_notify("uuid:cam-1", &location, 1800).as_bytes(), CAM_IP, now);
        poll_until(&mut manager, now, |m| m.get_device("uuid:cam-1").is_some());
        assert!(manager.get_device("uuid:cam-1").is_some());

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender
            .send_to(byebye_notify("uuid:cam-1").as_bytes(), passive_addr)
            .unwrap();
        thread::sleep(Duration::from_millis(50));

        let (changed, gone) = manager.poll_for_changes_at(now);
        assert!(changed.is_empty());
        assert_eq!(gone, HashSet::from(["uuid:cam-1".to_string()]));
    }

    #[test]
    fn test_non_uuid_status_types_are_ignored() {
        let mut manager = offline();
        let now = Instant::now();
        let reply = search_reply(
            "uuid:cam-3::upnp:rootdevice",
            "upnp:rootdevice",
            "http://192.168.1.20/desc.xml",
            "Linux/2.6 UPnP/1.0 x/1",
        );
        manager.handle_datagram(reply.as_bytes(), CAM_IP, now);
        assert_eq!(manager.pending_count(), 0);
    }

    #[test]
    fn test_acti_root_device_reply_becomes_pending() {
        let mut manager = offline();
        let now = Instant::now();
        let reply = search_reply(
            "uuid:TCM4301-09J-X-00120::upnp:rootdevice",
            "upnp:rootdevice",
            "http://127.0.0.1:9/devicedesc.xml",
            "Linux, UPnP/1.0, ACTi libupnp",
        );
        manager.handle_datagram(reply.as_bytes(), CAM_IP, now);
        assert!(manager.pending.contains_key("uuid:TCM4301-09J-X-00120"));
    }

    #[test]
    fn test_linksys_hnap_announcement_is_dropped() {
        let mut manager = offline();
        let msg = "NOTIFY * HTTP/1.1\r\nCACHE-CONTROL: max-age=60\r\nLOCATION: http://192.168.1.20/HNAP1/\r\nNT: uuid:160F7BFB\r\nNTS: ssdp:alive\r\nSERVER: POSIX, UPnP/1.0 linux/5.10.56.51\r\nUSN: uuid:160F7BFB\r\n\r\n";
        manager.handle_datagram(msg.as_bytes(), CAM_IP, Instant::now());
        assert_eq!(manager.pending_count(), 0);
    }

    #[test]
    fn test_expired_devices_are_purged() {
        let mut manager = offline();
        let now = Instant::now();
        let msg = "NOTIFY * HTTP/1.1\r\nCACHE-CONTROL: max-age=60\r\nLOCATION: \r\nNT: uuid:cam-4\r\nNTS: ssdp:alive\r\nSERVER: x\r\nUSN: uuid:cam-4\r\n\r\n";
        manager.handle_datagram(msg.as_bytes(), CAM_IP, now);

        let (changed, _) = manager.poll_for_changes_at(now);
        assert_eq!(changed, HashSet::from(["uuid:cam-4".to_string()]));

        let (_, gone) = manager.poll_for_changes_at(now + Duration::from_secs(120));
        assert!(gone.is_empty(), "expires strictly after max-age plus slop");

        let (_, gone) = manager.poll_for_changes_at(now + Duration::from_secs(121));
        assert_eq!(gone, HashSet::from(["uuid:cam-4".to_string()]));
    }

    #[test]
    fn test_active_search_flags_verification() {
        let mut manager = offline();
        let now = Instant::now();
        for usn in ["uuid:a", "uuid:b"] {
            let msg = format!(
                "NOTIFY * HTTP/1.1\r\nCACHE-CONTROL: max-age=1800\r\nLOCATION: \r\nNT: {usn}\r\nNTS: ssdp:alive\r\nSERVER: x\r\nUSN: {usn}\r\n\r\n"
            );
            manager.handle_datagram(msg.as_bytes(), CAM_IP, now);
        }
        manager.poll_for_changes_at(now);

        manager.active_search_at("uuid:a", now);
        assert!(manager.devices["uuid:a"].needs_verify());
        assert!(!manager.devices["uuid:b"].needs_verify());

        manager.active_search_at(SEARCH_TARGET_ALL, now);
        assert!(manager.devices["uuid:b"].needs_verify());
    }

    #[test]
    fn test_new_address_gets_retried_searches() {
        let responder = UdpSocket::bind("127.0.0.1:0").unwrap();
        responder
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let interfaces = StaticInterfaces([Ipv4Addr::LOCALHOST].into_iter().collect());
        let mut manager =
            ControlPointManager::with_sockets(UpnpConfig::default(), Arc::new(interfaces), None)
                .with_search_target(responder.local_addr().unwrap());

        let now = Instant::now();
        manager.check_for_ip_changes(now);
        let mut buf = [0u8; 1024];
        let (len, _) = responder.recv_from(&mut buf).unwrap();
        assert!(std::str::from_utf8(&buf[..len]).unwrap().contains("ST: ssdp:all\r\n"));

        // Nothing more is due until the randomized retry interval passes.
        manager.check_for_ip_changes(now + Duration::from_secs(3));
        assert_eq!(manager.searches[&Ipv4Addr::LOCALHOST].sent, 1);

        manager.check_for_ip_changes(now + Duration::from_secs(12));
        assert!(manager.searches.is_empty());
        responder.recv_from(&mut buf).unwrap();
    }

    #[test]
    fn test_search_reply_over_request_socket_is_processed() {
        let interfaces = StaticInterfaces([Ipv4Addr::LOCALHOST].into_iter().collect());
        let device_side = UdpSocket::bind("127.0.0.1:0").unwrap();
        device_side
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut manager =
            ControlPointManager::with_sockets(UpnpConfig::default(), Arc::new(interfaces), None)
                .with_search_target(device_side.local_addr().unwrap());

        let now = Instant::now();
        manager.check_for_ip_changes(now);
        let mut buf = [0u8; 1024];
        let (_, searcher) = device_side.recv_from(&mut buf).unwrap();

        let msg = "HTTP/1.1 200 OK\r\nCACHE-CONTROL: max-age=1800\r\nEXT:\r\nLOCATION: \r\nSERVER: x\r\nST: uuid:cam-5\r\nUSN: uuid:cam-5\r\n\r\n";
        device_side.send_to(msg.as_bytes(), searcher).unwrap();

        let changed = poll_until(&mut manager, now, |m| m.get_device("uuid:cam-5").is_some());
        assert!(changed.contains("uuid:cam-5"));
        assert_eq!(manager.get_device("uuid:cam-5").unwrap().ssdp_ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
    }
}
