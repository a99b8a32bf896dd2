//! One-shot WS-Discovery run.
//!
//! A run opens one multicast socket per local IPv4 address and performs two
//! probe rounds: first restricted to `NetworkVideoTransmitter`, then
//! unrestricted. Each round lasts the configured timeout and resends its
//! probe a bounded number of times at random intervals. Responses are only
//! accepted if they relate to one of this run's probes.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use futures::future::select_all;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use uuid::Uuid;

use super::codec::{parse_probe_match, probe_request};
use super::state::{DeviceSettings, OnvifDeviceState};
use crate::config::OnvifConfig;
use crate::interfaces::{multicast_sender, InterfaceSource};
use crate::protocol_constants::{
    WS_DISCOVERY_MAX_PACKET_SIZE, WS_DISCOVERY_MULTICAST_ADDR, WS_DISCOVERY_MULTICAST_TTL,
    WS_DISCOVERY_PORT,
};
use crate::xml;

/// Where a discovery run reports what it finds.
pub trait DiscoverySink: Send + Sync {
    /// True while `endpoint` is cooling down after a deviceless response.
    fn device_blacklisted(&self, endpoint: &SocketAddr) -> bool;

    /// Starts the cool-down of `endpoint`.
    fn blacklist_device(&self, endpoint: SocketAddr);

    /// Current user settings for the device with `uuid`.
    fn device_settings(&self, uuid: &str) -> DeviceSettings;

    /// Called once per accepted probe match.
    fn on_device_discovered(&self, state: OnvifDeviceState);
}

/// A single discovery run for one generation.
pub struct OnvifDiscovery {
    generation: i64,
    config: OnvifConfig,
    interfaces: Arc<dyn InterfaceSource>,
    sink: Arc<dyn DiscoverySink>,
    target: SocketAddr,
    seen: HashSet<String>,
    log_prefix: String,
}

impl OnvifDiscovery {
    pub fn new(
        generation: i64,
        config: OnvifConfig,
        interfaces: Arc<dyn InterfaceSource>,
        sink: Arc<dyn DiscoverySink>,
    ) -> Self {
        let group = WS_DISCOVERY_MULTICAST_ADDR
            .parse::<Ipv4Addr>()
            .unwrap_or(Ipv4Addr::BROADCAST);
        Self {
            generation,
            config,
            interfaces,
            sink,
            target: SocketAddr::V4(SocketAddrV4::new(group, WS_DISCOVERY_PORT)),
            seen: HashSet::new(),
            log_prefix: format!("[WS-Discovery] gen {}", generation),
        }
    }

    /// Sends probes to `target` instead of the WS-Discovery group.
    pub(crate) fn with_target(mut self, target: SocketAddr) -> Self {
        self.target = target;
        self
    }

    pub fn generation(&self) -> i64 {
        self.generation
    }

    /// Runs both probe rounds and returns the uuids of every device seen.
    ///
    /// Never fails; setup problems are logged and yield an empty set.
    pub async fn run(mut self) -> HashSet<String> {
        let sockets = self.open_sockets();
        if sockets.is_empty() {
            log::warn!("{} - no multicast socket could be created", self.log_prefix);
            return self.seen;
        }

        let mut message_ids = HashSet::new();
        for with_types in [true, false] {
            let message_id = format!("uuid:{}", Uuid::new_v4());
            message_ids.insert(message_id.clone());
            let probe = probe_request(&message_id, with_types);
            if !self.probe_round(&sockets, &probe, &message_id, &message_ids).await {
                log::error!("{} - all probe requests failed to send", self.log_prefix);
                break;
            }
        }

        log::debug!("{} - done, {} devices seen", self.log_prefix, self.seen.len());
        self.seen
    }

    fn open_sockets(&self) -> Vec<UdpSocket> {
        let addrs = match self.interfaces.ipv4_addrs() {
            Ok(addrs) => addrs,
            Err(e) => {
                log::error!("{} - could not retrieve local IP addresses: {}", self.log_prefix, e);
                return Vec::new();
            }
        };
        if addrs.is_empty() {
            log::warn!("{} - no local IP addresses found", self.log_prefix);
        }

        addrs
            .into_iter()
            .filter(|ip| !ip.is_unspecified())
            .filter_map(|ip| {
                log::debug!("{} - creating multicast socket for {}", self.log_prefix, ip);
                let socket = multicast_sender(ip, WS_DISCOVERY_MULTICAST_TTL)
                    .map_err(|e| log::error!("{} - cannot create multicast socket on {}: {}", self.log_prefix, ip, e))
                    .ok()?;
                UdpSocket::from_std(socket)
                    .map_err(|e| log::error!("{} - cannot register socket on {}: {}", self.log_prefix, ip, e))
                    .ok()
            })
            .collect()
    }

    async fn send_probe(&self, sockets: &[UdpSocket], probe: &str, repeat: u32, message_id: &str) -> usize {
        let mut sent = 0;
        for socket in sockets {
            log::debug!(
                "{} - sending probe {}/{} ({})",
                self.log_prefix,
                repeat,
                self.config.probe_repeat,
                message_id
            );
            match socket.send_to(probe.as_bytes(), self.target).await {
                Ok(_) => sent += 1,
                Err(e) => log::error!("{} - failed to send probe: {}", self.log_prefix, e),
            }
        }
        sent
    }

    fn resend_delay(&self) -> Duration {
        let max_ms = u64::try_from(self.config.probe_max_delay().as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }

    /// One probe round. Returns false if the first send reached no socket.
    async fn probe_round(
        &mut self,
        sockets: &[UdpSocket],
        probe: &str,
        message_id: &str,
        message_ids: &HashSet<String>,
    ) -> bool {
        let mut repeat = 1;
        if self.send_probe(sockets, probe, repeat, message_id).await == 0 {
            return false;
        }
        repeat += 1;

        let deadline = Instant::now() + self.config.discovery_timeout();
        let mut next_send = Instant::now() + self.resend_delay();
        let mut buf = vec![0u8; WS_DISCOVERY_MAX_PACKET_SIZE];

        loop {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            if repeat <= self.config.probe_repeat && now >= next_send {
                self.send_probe(sockets, probe, repeat, message_id).await;
                repeat += 1;
                next_send = now + self.resend_delay();
            }
            let wake = if repeat <= self.config.probe_repeat {
                next_send.min(deadline)
            } else {
                deadline
            };

            let readable = select_all(sockets.iter().map(|s| Box::pin(s.readable())));
            let Ok((ready, index, _)) = tokio::time::timeout_at(wake, readable).await else {
                continue;
            };
            if let Err(e) = ready {
                log::error!("{} - socket wait failed: {}", self.log_prefix, e);
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }

            loop {
                match sockets[index].try_recv_from(&mut buf) {
                    Ok((len, endpoint)) => self.handle_response(&buf[..len], endpoint, message_ids),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        log::error!("{} - receive error: {}", self.log_prefix, e);
                        break;
                    }
                }
            }
        }
    }

    pub(crate) fn handle_response(&mut self, payload: &[u8], endpoint: SocketAddr, message_ids: &HashSet<String>) {
        if self.sink.device_blacklisted(&endpoint) {
            return;
        }
        let text = String::from_utf8_lossy(payload);
        log::debug!(
            "{} - payload from {}: {}...",
            self.log_prefix,
            endpoint,
            text.chars().take(16).collect::<String>()
        );

        let probe = match xml::parse(&text).and_then(|doc| parse_probe_match(&doc)) {
            Ok(probe) => probe,
            Err(e) => {
                log::debug!("{} - unusable response from {}: {}", self.log_prefix, endpoint, e);
                return;
            }
        };
        if !message_ids.contains(&probe.relates_to) {
            log::warn!("{} - message id mismatch ({})", self.log_prefix, probe.relates_to);
            return;
        }

        let settings = match probe.device_uuid.as_deref() {
            Some(uuid) if !uuid.is_empty() => self.sink.device_settings(uuid),
            _ => {
                log::warn!("{} - no device uuid in probe response from {}", self.log_prefix, endpoint);
                self.sink.blacklist_device(endpoint);
                return;
            }
        };
        let Some(state) =
            OnvifDeviceState::from_probe_match(&probe, self.generation, endpoint.ip().to_string(), settings)
        else {
            return;
        };

        let uuid = state.uuid.clone();
        self.sink.on_device_discovered(state);
        self.seen.insert(uuid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::StaticInterfaces;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    struct RecordingSink {
        blacklist: Mutex<HashMap<SocketAddr, usize>>,
        discovered: Mutex<Vec<OnvifDeviceState>>,
    }

    impl DiscoverySink for RecordingSink {
        fn device_blacklisted(&self, endpoint: &SocketAddr) -> bool {
            self.blacklist.lock().contains_key(endpoint)
        }

        fn blacklist_device(&self, endpoint: SocketAddr) {
            *self.blacklist.lock().entry(endpoint).or_default() += 1;
        }

        fn device_settings(&self, _uuid: &str) -> DeviceSettings {
            DeviceSettings::default()
        }

        fn on_device_discovered(&self, state: OnvifDeviceState) {
            self.discovered.lock().push(state);
        }
    }

    fn probe_match(relates_to: &str, address: Option<&str>) -> String {
        let address = address
            .map(|a| format!("<a:EndpointReference><a:Address>{a}</a:Address></a:EndpointReference>"))
            .unwrap_or_default();
        format!(
            r#"<?xml version="1.0"?><s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:a="http://schemas.xmlsoap.org/ws/2004/08/addressing" xmlns:d="http://schemas.xmlsoap.org/ws/2005/04/discovery"><s:Header><a:RelatesTo>{relates_to}</a:RelatesTo></s:Header><s:Body><d:ProbeMatches><d:ProbeMatch>{address}<d:Scopes>onvif://www.onvif.org/name/Cam</d:Scopes><d:XAddrs>http://127.0.0.1/onvif/device_service</d:XAddrs></d:ProbeMatch></d:ProbeMatches></s:Body></s:Envelope>"#
        )
    }

    fn discovery(sink: Arc<RecordingSink>) -> OnvifDiscovery {
        let config = OnvifConfig {
            discovery_timeout_secs: 1,
            probe_repeat: 1,
            ..Default::default()
        };
        OnvifDiscovery::new(
            7,
            config,
            Arc::new(StaticInterfaces([Ipv4Addr::LOCALHOST].into_iter().collect())),
            sink,
        )
    }

    #[test]
    fn only_related_responses_are_accepted() {
        let sink = Arc::new(RecordingSink::default());
        let mut run = discovery(sink.clone());
        let ids: HashSet<String> = ["uuid:mine".to_string()].into_iter().collect();
        let from: SocketAddr = "10.0.0.9:3702".parse().unwrap();

        run.handle_response(probe_match("uuid:other", Some("urn:uuid:a")).as_bytes(), from, &ids);
        run.handle_response(b"<not xml", from, &ids);
        assert!(sink.discovered.lock().is_empty());

        run.handle_response(probe_match("uuid:mine", Some("urn:uuid:a")).as_bytes(), from, &ids);
        let discovered = sink.discovered.lock();
        assert_eq!(discovered.len(), 1);
        assert_eq!(discovered[0].generation, 7);
        assert_eq!(discovered[0].wsdiscovery_ip, "10.0.0.9");
        assert!(run.seen.contains("urn:uuid:a"));
    }

    #[test]
    fn deviceless_response_blacklists_endpoint_once() {
        let sink = Arc::new(RecordingSink::default());
        let mut run = discovery(sink.clone());
        let ids: HashSet<String> = ["uuid:mine".to_string()].into_iter().collect();
        let from: SocketAddr = "10.0.0.9:3702".parse().unwrap();
        let payload = probe_match("uuid:mine", None);

        run.handle_response(payload.as_bytes(), from, &ids);
        run.handle_response(payload.as_bytes(), from, &ids);

        assert!(sink.discovered.lock().is_empty());
        assert_eq!(sink.blacklist.lock()[&from], 1);
        assert!(run.seen.is_empty());
    }

    #[tokio::test]
    async fn run_collects_devices_from_a_responder() {
        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = responder.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; WS_DISCOVERY_MAX_PACKET_SIZE];
            while let Ok((len, from)) = responder.recv_from(&mut buf).await {
                let text = String::from_utf8_lossy(&buf[..len]).into_owned();
                let Some(id) = xml::parse(&text).ok().and_then(|d| d.find_text("MessageID")) else {
                    continue;
                };
                let reply = probe_match(&id, Some("urn:uuid:loopback-cam"));
                let _ = responder.send_to(reply.as_bytes(), from).await;
            }
        });

        let sink = Arc::new(RecordingSink::default());
        let seen = discovery(sink.clone()).with_target(target).run().await;

        assert_eq!(seen.len(), 1);
        assert!(seen.contains("urn:uuid:loopback-cam"));
        // One match per probe round.
        assert_eq!(sink.discovered.lock().len(), 2);
    }
}
