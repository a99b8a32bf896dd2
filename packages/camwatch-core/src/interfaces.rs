//! Local interface enumeration and multicast socket setup.
//!
//! Both discovery engines open one sending socket per local IPv4 address, so
//! that probes and searches leave through every attached network. The set of
//! addresses is provided by an [`InterfaceSource`], which lets tests run the
//! engines without touching real interfaces.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use local_ip_address::list_afinet_netifas;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;

use crate::protocol_constants::{SSDP_MULTICAST_ADDR, SSDP_PORT};

/// Errors that can occur while setting up discovery sockets.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to bind UDP socket: {0}")]
    SocketBind(#[source] std::io::Error),

    #[error("failed to configure UDP socket: {0}")]
    SocketOption(#[source] std::io::Error),
}

pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Errors from interface enumeration.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("failed to list network interfaces: {0}")]
    Enumeration(String),
}

/// Source of the local IPv4 addresses discovery should use.
pub trait InterfaceSource: Send + Sync {
    /// Returns the current set of local IPv4 addresses.
    fn ipv4_addrs(&self) -> Result<BTreeSet<Ipv4Addr>, NetworkError>;
}

/// Reads addresses from the operating system.
///
/// Every IPv4 address is returned except `0.0.0.0`, which some platforms
/// report for disconnected interfaces. Loopback is kept so that devices
/// simulated on the same host are found.
#[derive(Debug, Clone, Default)]
pub struct SystemInterfaces;

impl SystemInterfaces {
    #[must_use]
    pub fn arc() -> Arc<dyn InterfaceSource> {
        Arc::new(Self)
    }
}

impl InterfaceSource for SystemInterfaces {
    fn ipv4_addrs(&self) -> Result<BTreeSet<Ipv4Addr>, NetworkError> {
        let interfaces =
            list_afinet_netifas().map_err(|e| NetworkError::Enumeration(e.to_string()))?;
        Ok(interfaces
            .into_iter()
            .filter_map(|(name, addr)| match addr {
                IpAddr::V4(ip) if !ip.is_unspecified() => {
                    log::trace!("[Interfaces] {} -> {}", name, ip);
                    Some(ip)
                }
                _ => None,
            })
            .collect())
    }
}

/// Fixed address list, for tests and for hosts where enumeration is unwanted.
#[derive(Debug, Clone, Default)]
pub struct StaticInterfaces(pub BTreeSet<Ipv4Addr>);

impl InterfaceSource for StaticInterfaces {
    fn ipv4_addrs(&self) -> Result<BTreeSet<Ipv4Addr>, NetworkError> {
        Ok(self.0.clone())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Socket Construction
// ─────────────────────────────────────────────────────────────────────────────

/// Creates a non-blocking UDP socket bound to `iface_ip` that sends multicast
/// out of that interface with the given TTL.
pub fn multicast_sender(iface_ip: Ipv4Addr, ttl: u32) -> DiscoveryResult<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(DiscoveryError::SocketBind)?;

    socket
        .set_multicast_ttl_v4(ttl)
        .map_err(DiscoveryError::SocketOption)?;

    let bind_addr = SocketAddr::V4(SocketAddrV4::new(iface_ip, 0));
    socket
        .bind(&bind_addr.into())
        .map_err(DiscoveryError::SocketBind)?;

    // Failing here still leaves a usable socket; the OS picks the route.
    if let Err(e) = socket.set_multicast_if_v4(&iface_ip) {
        log::warn!("[Interfaces] Failed to set multicast IF on {}: {}", iface_ip, e);
    }

    socket
        .set_nonblocking(true)
        .map_err(DiscoveryError::SocketOption)?;

    Ok(socket.into())
}

/// Creates the passive SSDP socket that receives `NOTIFY` announcements.
///
/// Group membership is added per interface afterwards via [`join_ssdp_group`].
pub fn ssdp_listener() -> DiscoveryResult<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(DiscoveryError::SocketBind)?;

    socket
        .set_reuse_address(true)
        .map_err(DiscoveryError::SocketOption)?;

    #[cfg(unix)]
    if let Err(e) = socket.set_reuse_port(true) {
        log::warn!("[Interfaces] Failed to set SO_REUSEPORT: {}", e);
    }

    // Binding to the group address filters unrelated unicast traffic on
    // Unix; Windows only accepts the wildcard.
    let group: Ipv4Addr = SSDP_MULTICAST_ADDR
        .parse()
        .map_err(|_| DiscoveryError::SocketBind(std::io::ErrorKind::InvalidInput.into()))?;
    let bind_ip = if cfg!(windows) {
        Ipv4Addr::UNSPECIFIED
    } else {
        group
    };
    socket
        .bind(&SocketAddr::V4(SocketAddrV4::new(bind_ip, SSDP_PORT)).into())
        .map_err(DiscoveryError::SocketBind)?;

    if let Err(e) = socket.set_multicast_loop_v4(true) {
        log::warn!("[Interfaces] Failed to enable multicast loop: {}", e);
    }

    socket
        .set_nonblocking(true)
        .map_err(DiscoveryError::SocketOption)?;

    Ok(socket.into())
}

/// Adds `iface_ip` to the SSDP multicast group on the passive socket.
///
/// A second address on an already-joined interface fails with
/// `EADDRINUSE`; that is expected on multi-homed hosts and only logged.
pub fn join_ssdp_group(socket: &std::net::UdpSocket, iface_ip: Ipv4Addr) {
    let Ok(group) = SSDP_MULTICAST_ADDR.parse::<Ipv4Addr>() else {
        return;
    };
    if let Err(e) = socket.join_multicast_v4(&group, &iface_ip) {
        log::debug!("[Interfaces] Group join on {} skipped: {}", iface_ip, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_interfaces_return_configured_set() {
        let source = StaticInterfaces([Ipv4Addr::new(10, 0, 0, 2)].into_iter().collect());
        let addrs = source.ipv4_addrs().unwrap();
        assert_eq!(addrs.len(), 1);
        assert!(addrs.contains(&Ipv4Addr::new(10, 0, 0, 2)));
    }

    #[test]
    fn system_interfaces_never_report_unspecified() {
        if let Ok(addrs) = SystemInterfaces.ipv4_addrs() {
            assert!(!addrs.contains(&Ipv4Addr::UNSPECIFIED));
        }
    }

    #[test]
    fn multicast_sender_binds_loopback() {
        let socket = multicast_sender(Ipv4Addr::LOCALHOST, 1).unwrap();
        let local = socket.local_addr().unwrap();
        assert_eq!(local.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_ne!(local.port(), 0);
    }
}
