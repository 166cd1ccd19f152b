//! Component configuration for the local channel, the LAN bus and the
//! dispatch loop.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

/// Default UDP port used for LAN announcements.
pub const DEFAULT_DISCOVERY_PORT: u16 = 9471;

/// Default port of the local application websocket.
pub const DEFAULT_LOCAL_PORT: u16 = 9000;

/// Configuration of the websocket channel to the local application.
#[derive(Debug, Clone)]
pub struct LocalChannelConfig {
    /// Feature switch. When off, reads and writes are no-ops.
    pub enabled: bool,
    /// Port on 127.0.0.1. `None` disables the channel as well.
    pub port: Option<u16>,
    /// Upper bound on a connection attempt.
    pub connect_timeout: Duration,
    /// Upper bound on one read.
    pub read_timeout: Duration,
    /// Pause after a failed connection attempt.
    pub retry_backoff: Duration,
}

impl Default for LocalChannelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: Some(DEFAULT_LOCAL_PORT),
            connect_timeout: Duration::from_millis(250),
            read_timeout: Duration::from_millis(50),
            retry_backoff: Duration::from_secs(1),
        }
    }
}

impl LocalChannelConfig {
    /// True when both the switch is on and a port is configured.
    pub fn is_active(&self) -> bool {
        self.enabled && self.port.is_some()
    }
}

/// Configuration of the LAN mesh bus.
#[derive(Debug, Clone)]
pub struct LanBusConfig {
    /// Websocket listen address. Port 0 picks a free port.
    pub listen_addr: SocketAddr,
    /// Address the discovery listener binds to.
    pub discovery_bind: SocketAddr,
    /// Destination of announcements, normally the LAN broadcast address.
    pub discovery_target: SocketAddr,
    /// Period between two announcements.
    pub announce_interval: Duration,
    /// Silence after which a peer is considered gone.
    pub peer_expiry: Duration,
    /// Upper bound on opening a websocket to a peer.
    pub connect_timeout: Duration,
}

impl Default for LanBusConfig {
    fn default() -> Self {
        Self::for_discovery_port(DEFAULT_DISCOVERY_PORT)
    }
}

impl LanBusConfig {
    /// Defaults with discovery on the given UDP port.
    pub fn for_discovery_port(port: u16) -> Self {
        Self {
            listen_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)),
            discovery_bind: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)),
            discovery_target: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, port)),
            announce_interval: Duration::from_secs(5),
            peer_expiry: Duration::from_secs(30),
            connect_timeout: Duration::from_millis(250),
        }
    }
}

/// Configuration of the dispatch loop.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Bounded wait on the internal queue, also used as the idle sleep
    /// while the local channel is disconnected.
    pub queue_wait: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_wait: Duration::from_millis(100),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
