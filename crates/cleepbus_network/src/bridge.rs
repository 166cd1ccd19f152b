//! Mesh bridge: peer lifecycle and message forwarding between the mesh bus
//! and the internal queue.

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::bus::{BusEvent, MeshBus};
use crate::error::BridgeError;
use crate::headers::{Headers, announcement_headers, decode_peer_infos};
use crate::message::{
    ContentType, InternalMessage, InternalMessageContent, MessageRequest, MessageResponse,
};
use crate::peer::{ExtraValue, PeerDirectory, PeerInfos};
use crate::queue::QueueSender;

/// Hostname a device keeps until the user configures it.
pub const UNCONFIGURED_HOSTNAME: &str = "cleepdevice";

/// Bridge between a [`MeshBus`] and the internal queue.
///
/// Owns the peer directory. Inbound bus events become `TO_LOCAL` queue
/// items; requests from the local application are handed to the bus.
pub struct MeshBridge<B> {
    bus: B,
    queue: QueueSender,
    uuid: String,
    hostname: String,
    directory: PeerDirectory,
}

impl<B: MeshBus> MeshBridge<B> {
    /// Create a bridge. Without a configured `uuid` a random one is used
    /// for this run.
    pub fn new(bus: B, queue: QueueSender, uuid: Option<String>) -> Self {
        let uuid = uuid
            .filter(|u| !u.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "localhost".to_string());

        Self {
            bus,
            queue,
            uuid,
            hostname,
            directory: PeerDirectory::new(),
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn directory(&self) -> &PeerDirectory {
        &self.directory
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    /// Headers announced to the mesh.
    pub fn headers(&self) -> Headers {
        announcement_headers(
            &self.uuid,
            env!("CARGO_PKG_VERSION"),
            &self.hostname,
            &self.bus.mac_addresses(),
        )
    }

    /// Join the mesh bus.
    pub async fn start(&mut self) -> Result<(), BridgeError> {
        let headers = self.headers();
        debug!("Announcement headers: {headers:?}");
        self.bus.join(headers).await?;
        info!("Mesh bridge {} joined the bus", self.uuid);
        Ok(())
    }

    /// Leave the mesh bus.
    pub async fn stop(&mut self) -> Result<(), BridgeError> {
        self.bus.leave().await?;
        info!("Mesh bridge {} left the bus", self.uuid);
        Ok(())
    }

    /// Register a newly connected peer and notify the local application.
    ///
    /// Other bridge instances and peers without uuid are ignored. Bridge
    /// instances are also cut off at the bus.
    pub fn on_peer_connected(&mut self, ident: &str, mut infos: PeerInfos) -> Result<(), BridgeError> {
        if infos.cleepdesktop {
            debug!("Dropping bridge instance {ident}");
            self.bus.ignore(ident);
            return Ok(());
        }
        if infos.uuid.as_deref().is_none_or(str::is_empty) {
            warn!("Peer {ident} announced no uuid, ignoring it");
            return Ok(());
        }

        let configured = infos
            .hostname
            .as_deref()
            .is_some_and(|h| !h.trim().is_empty() && h != UNCONFIGURED_HOSTNAME);
        infos.ident = Some(ident.to_string());
        infos.online = true;
        infos
            .extra
            .insert("connectedat".into(), ExtraValue::Int(chrono::Utc::now().timestamp()));
        infos
            .extra
            .insert("configured".into(), ExtraValue::Bool(configured));

        for mut stale in self.directory.upsert(infos.clone())? {
            info!("Peer {:?} replaces stale record {:?}", infos.uuid, stale.uuid);
            stale.online = false;
            self.queue.push(InternalMessage::to_local(InternalMessageContent::new(
                ContentType::PeerDisconnected,
                Some(stale),
                None,
            )))?;
        }
        info!("Peer connected: {infos}");

        self.queue.push(InternalMessage::to_local(InternalMessageContent::new(
            ContentType::PeerConnected,
            Some(infos),
            None,
        )))
    }

    /// Flip a peer offline and notify the local application, even when the
    /// peer never registered.
    pub fn on_peer_disconnected(&mut self, ident: &str) -> Result<(), BridgeError> {
        let infos = self.directory.mark_offline(ident).cloned();
        match &infos {
            Some(peer) => info!("Peer disconnected: {peer}"),
            None => debug!("Unregistered peer {ident} disconnected"),
        }

        self.queue.push(InternalMessage::to_local(InternalMessageContent::new(
            ContentType::PeerDisconnected,
            infos,
            None,
        )))
    }

    /// Forward a message from a registered peer to the local application.
    pub fn on_message_received(
        &mut self,
        ident: &str,
        response: MessageResponse,
    ) -> Result<(), BridgeError> {
        let infos = self
            .directory
            .get_by_ident(ident)
            .cloned()
            .ok_or_else(|| BridgeError::UnknownPeer(ident.to_string()))?;
        debug!("Message from {ident}: {response:?}");

        self.queue.push(InternalMessage::to_local(InternalMessageContent::new(
            ContentType::MessageResponse,
            Some(infos),
            Some(response),
        )))
    }

    /// Convert a local payload into a request and hand it to the bus.
    pub async fn send_message(&mut self, payload: &Value) -> Result<(), BridgeError> {
        let request = MessageRequest::from_dict(payload)?;
        request.validate()?;
        debug!("Sending to mesh: {request}");
        self.bus.send(&request).await
    }

    /// Pump the bus once and route every pending event. Returns the number
    /// of events seen.
    pub fn read_messages(&mut self) -> usize {
        let events = self.bus.pump_once();
        let count = events.len();

        for event in events {
            match self.route_event(event) {
                Ok(()) => {}
                Err(e) if e.is_protocol_misuse() => error!("Dropping mesh event: {e}"),
                Err(e) if e.is_transient() => warn!("Failed to handle mesh event: {e}"),
                Err(e) => error!("Mesh event lost: {e}"),
            }
        }

        count
    }

    fn route_event(&mut self, event: BusEvent) -> Result<(), BridgeError> {
        match event {
            BusEvent::PeerConnected { ident, ip, headers } => {
                let mut infos = decode_peer_infos(&headers);
                infos.ip = ip;
                self.on_peer_connected(&ident, infos)
            }
            BusEvent::PeerDisconnected { ident } => self.on_peer_disconnected(&ident),
            BusEvent::Message { ident, response } => self.on_message_received(&ident, response),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
