//! Mesh bus contract.
//!
//! The bridge never talks to a concrete transport. It joins with string
//! headers, polls [`MeshBus::pump_once`] once per tick and routes the returned
//! [`BusEvent`]s, and sends [`MessageRequest`]s.

use async_trait::async_trait;

use crate::error::BridgeError;
use crate::headers::Headers;
use crate::message::{MessageRequest, MessageResponse};

/// Something that happened on the mesh since the previous pump.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    PeerConnected {
        ident: String,
        ip: Option<String>,
        headers: Headers,
    },
    PeerDisconnected {
        ident: String,
    },
    Message {
        ident: String,
        response: MessageResponse,
    },
}

/// A discovery and messaging substrate connecting nodes on the LAN.
#[async_trait]
pub trait MeshBus: Send {
    /// Join the mesh, announcing `headers` to other nodes.
    async fn join(&mut self, headers: Headers) -> Result<(), BridgeError>;

    /// Leave the mesh and release every resource.
    async fn leave(&mut self) -> Result<(), BridgeError>;

    /// Send a request to `request.peer_infos.ident`, or to every peer when
    /// no peer is set.
    async fn send(&mut self, request: &MessageRequest) -> Result<(), BridgeError>;

    /// Stop exchanging anything with node `ident`: no further events from
    /// it and no frames to it, broadcasts included.
    fn ignore(&mut self, ident: &str);

    /// Collect pending events without blocking.
    fn pump_once(&mut self) -> Vec<BusEvent>;

    /// Hardware addresses of the local interfaces.
    fn mac_addresses(&self) -> Vec<String>;
}
