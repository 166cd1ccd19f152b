//! LAN peer discovery via UDP broadcast.
//!
//! [`DiscoveryService`] periodically broadcasts an [`Announcement`] carrying
//! the node's mesh headers and listens for announcements from other nodes.
//! Discovered nodes are reported through an mpsc channel.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace, warn};

use crate::error::BridgeError;
use crate::headers::Headers;

/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Packet broadcast by a node on the LAN.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Announcement {
    /// Transport ident, fresh for every join.
    pub ident: String,
    /// Port of the node's websocket server.
    pub ws_port: u16,
    /// Mesh headers of the node.
    pub headers: Headers,
    /// Set once, when the node leaves the mesh.
    #[serde(default)]
    pub leaving: bool,
}

/// An announcement received from another node.
#[derive(Debug, Clone)]
pub struct DiscoveredPeer {
    pub announcement: Announcement,
    /// Source address of the UDP packet.
    pub source_addr: SocketAddr,
}

impl DiscoveredPeer {
    /// Websocket address of the announcing node.
    pub fn ws_addr(&self) -> SocketAddr {
        SocketAddr::new(self.source_addr.ip(), self.announcement.ws_port)
    }
}

/// Configuration for the discovery service.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Address the listener socket binds to.
    pub bind_addr: SocketAddr,
    /// Destination of announcements.
    pub target_addr: SocketAddr,
    /// How often to announce.
    pub interval: Duration,
    /// Our own announcement.
    pub announcement: Announcement,
}

/// LAN discovery service using UDP broadcast.
pub struct DiscoveryService;

impl DiscoveryService {
    /// Start the discovery service in the background and return the bound
    /// listener address.
    ///
    /// Spawns a broadcaster sending our announcement at the configured
    /// interval, and a listener forwarding other nodes' announcements to
    /// `discovered_tx`. Both exit on `shutdown`.
    pub async fn start(
        config: DiscoveryConfig,
        discovered_tx: mpsc::Sender<DiscoveredPeer>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<SocketAddr, BridgeError> {
        let listener_socket = UdpSocket::bind(config.bind_addr)
            .await
            .map_err(|e| BridgeError::Discovery(format!("Bind {} failed: {e}", config.bind_addr)))?;
        listener_socket
            .set_broadcast(true)
            .map_err(|e| BridgeError::Discovery(format!("Set broadcast: {e}")))?;
        let bound_addr = listener_socket.local_addr()?;

        info!("Discovery service listening on {bound_addr}");

        let sender_socket = broadcast_socket().await?;
        let our_ident = config.announcement.ident.clone();
        let announcement_bytes = encode_announcement(&config.announcement)?;
        let target_addr = config.target_addr;
        let mut ticker = tokio::time::interval(config.interval);

        let mut shutdown_bcast = shutdown.resubscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match sender_socket.send_to(&announcement_bytes, target_addr).await {
                            Ok(_) => trace!("Announcement sent"),
                            Err(e) => debug!("Announcement send failed: {e}"),
                        }
                    }
                    _ = shutdown_bcast.recv() => {
                        debug!("Discovery broadcaster shutting down");
                        break;
                    }
                }
            }
        });

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                tokio::select! {
                    result = listener_socket.recv_from(&mut buf) => {
                        match result {
                            Ok((len, source_addr)) => {
                                let announcement = match serde_json::from_slice::<Announcement>(&buf[..len]) {
                                    Ok(announcement) => announcement,
                                    Err(e) => {
                                        warn!("Ignoring {len} byte datagram from {source_addr}: {e}");
                                        continue;
                                    }
                                };
                                if announcement.ident == our_ident {
                                    continue;
                                }

                                trace!("Announcement from {} at {source_addr}", announcement.ident);
                                let discovered = DiscoveredPeer { announcement, source_addr };
                                if discovered_tx.send(discovered).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!("Discovery recv error: {e}");
                            }
                        }
                    }
                    _ = shutdown.recv() => {
                        debug!("Discovery listener shutting down");
                        break;
                    }
                }
            }
        });

        Ok(bound_addr)
    }

    /// Send a single announcement, used for the final `leaving` packet.
    pub async fn announce_once(
        target_addr: SocketAddr,
        announcement: &Announcement,
    ) -> Result<(), BridgeError> {
        let socket = broadcast_socket().await?;
        let bytes = encode_announcement(announcement)?;
        socket.send_to(&bytes, target_addr).await?;
        Ok(())
    }
}

fn encode_announcement(announcement: &Announcement) -> Result<Vec<u8>, BridgeError> {
    let bytes = serde_json::to_vec(announcement)?;
    if bytes.len() > MAX_DATAGRAM_SIZE {
        return Err(BridgeError::Discovery(format!(
            "Announcement of {} bytes exceeds {MAX_DATAGRAM_SIZE}",
            bytes.len()
        )));
    }
    Ok(bytes)
}

async fn broadcast_socket() -> Result<UdpSocket, BridgeError> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| BridgeError::Discovery(format!("Sender bind: {e}")))?;
    socket
        .set_broadcast(true)
        .map_err(|e| BridgeError::Discovery(format!("Set broadcast: {e}")))?;
    Ok(socket)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn make_announcement(ident: &str) -> Announcement {
        let mut headers = Headers::new();
        headers.insert("uuid".into(), format!("uuid-{ident}"));
        Announcement {
            ident: ident.into(),
            ws_port: 9470,
            headers,
            leaving: false,
        }
    }

    #[test]
    fn test_announcement_leaving_defaults_to_false() {
        let json = r#"{"ident":"a","ws_port":1,"headers":{}}"#;
        let announcement: Announcement = serde_json::from_str(json).unwrap();
        assert!(!announcement.leaving);
    }

    #[test]
    fn test_ws_addr_uses_source_ip() {
        let discovered = DiscoveredPeer {
            announcement: make_announcement("a"),
            source_addr: "192.168.1.30:50000".parse().unwrap(),
        };
        assert_eq!(discovered.ws_addr().to_string(), "192.168.1.30:9470");
    }

    #[tokio::test]
    async fn test_listener_reports_others_and_skips_self() {
        let (discovered_tx, mut discovered_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        // Announce to an unused socket so the broadcaster stays local.
        let sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = DiscoveryConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            target_addr: sink.local_addr().unwrap(),
            interval: Duration::from_secs(60),
            announcement: make_announcement("self"),
        };
        let bound = DiscoveryService::start(config, discovered_tx, shutdown_rx)
            .await
            .unwrap();

        DiscoveryService::announce_once(bound, &make_announcement("self"))
            .await
            .unwrap();
        DiscoveryService::announce_once(bound, &make_announcement("other"))
            .await
            .unwrap();

        let discovered = tokio::time::timeout(Duration::from_secs(2), discovered_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(discovered.announcement.ident, "other");
        assert_eq!(discovered.announcement.headers["uuid"], "uuid-other");

        let _ = shutdown_tx.send(());
    }

    #[tokio::test]
    async fn test_large_announcement_is_received_whole() {
        let (discovered_tx, mut discovered_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = DiscoveryConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            target_addr: sink.local_addr().unwrap(),
            interval: Duration::from_secs(60),
            announcement: make_announcement("self"),
        };
        let bound = DiscoveryService::start(config, discovered_tx, shutdown_rx)
            .await
            .unwrap();

        let mut big = make_announcement("big");
        big.headers.insert("apps".into(), "x".repeat(20_000));
        DiscoveryService::announce_once(bound, &big).await.unwrap();

        let discovered = tokio::time::timeout(Duration::from_secs(2), discovered_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(discovered.announcement, big);

        let _ = shutdown_tx.send(());
    }

    #[test]
    fn test_oversized_announcement_rejected() {
        let mut huge = make_announcement("huge");
        huge.headers.insert("apps".into(), "x".repeat(MAX_DATAGRAM_SIZE));
        assert!(matches!(
            encode_announcement(&huge),
            Err(BridgeError::Discovery(_))
        ));
        assert!(encode_announcement(&make_announcement("small")).is_ok());
    }

    #[tokio::test]
    async fn test_broadcaster_sends_announcement() {
        let (discovered_tx, _discovered_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let target = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = DiscoveryConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            target_addr: target.local_addr().unwrap(),
            interval: Duration::from_millis(50),
            announcement: make_announcement("node-a"),
        };
        DiscoveryService::start(config, discovered_tx, shutdown_rx)
            .await
            .unwrap();

        let mut buf = vec![0u8; 4096];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), target.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let received: Announcement = serde_json::from_slice(&buf[..len]).unwrap();
        assert_eq!(received, make_announcement("node-a"));

        let _ = shutdown_tx.send(());
    }
}
