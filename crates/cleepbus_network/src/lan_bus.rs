//! LanBus: [`MeshBus`] implementation over UDP discovery and websockets.
//!
//! [`LanBus`] manages:
//! - a websocket server receiving frames from other nodes
//! - lazily opened outbound connections, one per peer
//! - LAN discovery (periodic announcements carrying the mesh headers)
//! - peer expiry when announcements stop
//!
//! Background tasks only push into channels; [`MeshBus::pump_once`] drains
//! them without blocking.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Instant;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::bus::{BusEvent, MeshBus};
use crate::config::LanBusConfig;
use crate::discovery::{Announcement, DiscoveredPeer, DiscoveryConfig, DiscoveryService};
use crate::error::BridgeError;
use crate::headers::Headers;
use crate::message::{MessageRequest, MessageResponse};
use crate::transport::{self, BusFrame, PeerConnection};

/// A node seen through discovery.
#[derive(Debug, Clone)]
struct LanPeer {
    ws_addr: SocketAddr,
    last_seen: Instant,
}

/// Channels and addresses that only exist while joined.
struct Session {
    ident: String,
    announcement: Announcement,
    shutdown_tx: broadcast::Sender<()>,
    discovered_rx: mpsc::Receiver<DiscoveredPeer>,
    frame_tx: mpsc::Sender<BusFrame>,
    frame_rx: mpsc::Receiver<BusFrame>,
    ws_addr: SocketAddr,
    discovery_addr: SocketAddr,
}

/// The LAN mesh bus.
pub struct LanBus {
    config: LanBusConfig,
    session: Option<Session>,
    /// Known nodes keyed by transport ident.
    peers: HashMap<String, LanPeer>,
    /// Outbound connections keyed by transport ident.
    connections: HashMap<String, PeerConnection>,
    /// Nodes the owner asked to cut off.
    ignored: HashSet<String>,
}

impl LanBus {
    pub fn new(config: LanBusConfig) -> Self {
        Self {
            config,
            session: None,
            peers: HashMap::new(),
            connections: HashMap::new(),
            ignored: HashSet::new(),
        }
    }

    /// Transport ident of this node while joined.
    pub fn ident(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.ident.as_str())
    }

    /// Bound websocket server address while joined.
    pub fn ws_addr(&self) -> Option<SocketAddr> {
        self.session.as_ref().map(|s| s.ws_addr)
    }

    /// Bound discovery listener address while joined.
    pub fn discovery_addr(&self) -> Option<SocketAddr> {
        self.session.as_ref().map(|s| s.discovery_addr)
    }

    /// Number of nodes currently known.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    fn handle_discovered(&mut self, discovered: DiscoveredPeer, events: &mut Vec<BusEvent>) {
        let ws_addr = discovered.ws_addr();
        let DiscoveredPeer {
            announcement,
            source_addr,
        } = discovered;
        let ident = announcement.ident;
        if self.ignored.contains(&ident) {
            return;
        }

        if announcement.leaving {
            if self.peers.remove(&ident).is_some() {
                self.connections.remove(&ident);
                info!("Node {ident} left the mesh");
                events.push(BusEvent::PeerDisconnected { ident });
            }
            return;
        }

        match self.peers.get_mut(&ident) {
            Some(peer) => {
                peer.ws_addr = ws_addr;
                peer.last_seen = Instant::now();
            }
            None => {
                info!("Discovered node {ident} at {ws_addr}");
                self.peers.insert(
                    ident.clone(),
                    LanPeer {
                        ws_addr,
                        last_seen: Instant::now(),
                    },
                );
                events.push(BusEvent::PeerConnected {
                    ident,
                    ip: Some(source_addr.ip().to_string()),
                    headers: announcement.headers,
                });
            }
        }
    }

    fn handle_frame(frame: BusFrame) -> BusEvent {
        match frame {
            BusFrame::Request { from, request } => {
                let broadcast = request.get("to").is_none_or(|to| to.is_null());
                BusEvent::Message {
                    ident: from,
                    response: MessageResponse {
                        data: request,
                        broadcast,
                        ..MessageResponse::default()
                    },
                }
            }
            BusFrame::Response { from, response } => BusEvent::Message {
                ident: from,
                response,
            },
        }
    }

    fn expire_peers(&mut self, events: &mut Vec<BusEvent>) {
        let expiry = self.config.peer_expiry;
        let expired: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, peer)| peer.last_seen.elapsed() > expiry)
            .map(|(ident, _)| ident.clone())
            .collect();

        for ident in expired {
            self.peers.remove(&ident);
            self.connections.remove(&ident);
            info!("Node {ident} expired");
            events.push(BusEvent::PeerDisconnected { ident });
        }
    }

    async fn send_frame(&mut self, ident: &str, frame: &BusFrame) {
        if !self.connections.contains_key(ident) {
            let Some(peer) = self.peers.get(ident) else {
                return;
            };
            let Some(frame_tx) = self.session.as_ref().map(|s| s.frame_tx.clone()) else {
                return;
            };
            match transport::connect_to_peer(ident, peer.ws_addr, self.config.connect_timeout, frame_tx)
                .await
            {
                Ok(conn) => {
                    self.connections.insert(ident.to_string(), conn);
                }
                Err(e) => {
                    warn!("Cannot reach node {ident}: {e}");
                    return;
                }
            }
        }

        if let Some(conn) = self.connections.get_mut(ident) {
            if let Err(e) = conn.send(frame).await {
                warn!("{e}");
                self.connections.remove(ident);
            }
        }
    }
}

#[async_trait]
impl MeshBus for LanBus {
    async fn join(&mut self, headers: Headers) -> Result<(), BridgeError> {
        if self.session.is_some() {
            return Ok(());
        }

        let ident = uuid::Uuid::new_v4().to_string();
        let (shutdown_tx, _) = broadcast::channel(4);
        let (frame_tx, frame_rx) = mpsc::channel(256);
        let (discovered_tx, discovered_rx) = mpsc::channel(64);

        let listener = TcpListener::bind(self.config.listen_addr).await?;
        let ws_addr = listener.local_addr()?;
        tokio::spawn(transport::run_server(
            listener,
            frame_tx.clone(),
            shutdown_tx.subscribe(),
        ));

        let announcement = Announcement {
            ident: ident.clone(),
            ws_port: ws_addr.port(),
            headers,
            leaving: false,
        };
        let discovery_config = DiscoveryConfig {
            bind_addr: self.config.discovery_bind,
            target_addr: self.config.discovery_target,
            interval: self.config.announce_interval,
            announcement: announcement.clone(),
        };
        let discovery_addr =
            match DiscoveryService::start(discovery_config, discovered_tx, shutdown_tx.subscribe())
                .await
            {
                Ok(addr) => addr,
                Err(e) => {
                    let _ = shutdown_tx.send(());
                    return Err(e);
                }
            };

        info!("Joined LAN bus as {ident} (websocket {ws_addr}, discovery {discovery_addr})");
        self.session = Some(Session {
            ident,
            announcement,
            shutdown_tx,
            discovered_rx,
            frame_tx,
            frame_rx,
            ws_addr,
            discovery_addr,
        });
        Ok(())
    }

    async fn leave(&mut self) -> Result<(), BridgeError> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };

        let leaving = Announcement {
            leaving: true,
            ..session.announcement
        };
        if let Err(e) = DiscoveryService::announce_once(self.config.discovery_target, &leaving).await {
            warn!("Failed to announce departure: {e}");
        }
        let _ = session.shutdown_tx.send(());

        for (_, mut conn) in self.connections.drain() {
            debug!("Closing connection to {}", conn.ident());
            conn.close().await;
        }
        self.peers.clear();
        self.ignored.clear();

        info!("Left LAN bus as {}", session.ident);
        Ok(())
    }

    async fn send(&mut self, request: &MessageRequest) -> Result<(), BridgeError> {
        let ident = self
            .ident()
            .map(str::to_string)
            .ok_or_else(|| BridgeError::Transport("LAN bus not joined".into()))?;

        let targets: Vec<String> = match request.peer_infos.as_ref().and_then(|p| p.ident.clone()) {
            Some(target) => {
                if !self.peers.contains_key(&target) {
                    return Err(BridgeError::UnknownPeer(target));
                }
                vec![target]
            }
            None => self.peers.keys().cloned().collect(),
        };

        let frame = BusFrame::Request {
            from: ident,
            request: request.to_dict(false, None)?,
        };
        debug!("Sending {request} to {} node(s)", targets.len());
        for target in targets {
            self.send_frame(&target, &frame).await;
        }
        Ok(())
    }

    fn ignore(&mut self, ident: &str) {
        self.peers.remove(ident);
        self.connections.remove(ident);
        if self.ignored.insert(ident.to_string()) {
            debug!("Ignoring node {ident}");
        }
    }

    fn pump_once(&mut self) -> Vec<BusEvent> {
        let mut events = Vec::new();
        let Some(session) = self.session.as_mut() else {
            return events;
        };

        let mut discovered = Vec::new();
        while let Ok(peer) = session.discovered_rx.try_recv() {
            discovered.push(peer);
        }
        let mut frames = Vec::new();
        while let Ok(frame) = session.frame_rx.try_recv() {
            frames.push(frame);
        }

        for peer in discovered {
            self.handle_discovered(peer, &mut events);
        }
        events.extend(
            frames
                .into_iter()
                .filter(|frame| !self.ignored.contains(frame.sender()))
                .map(Self::handle_frame),
        );
        self.expire_peers(&mut events);

        events
    }

    fn mac_addresses(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir("/sys/class/net") else {
            return Vec::new();
        };

        let mut macs: Vec<String> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| std::fs::read_to_string(entry.path().join("address")).ok())
            .map(|address| address.trim().to_lowercase())
            .filter(|address| !address.is_empty() && address != "00:00:00:00:00:00")
            .collect();
        macs.sort();
        macs.dedup();
        macs
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
