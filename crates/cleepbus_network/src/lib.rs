//! Cleepbus Network: bridge between the mesh bus and the local application.
//!
//! This crate relays structured messages between a LAN mesh of devices and
//! a single local desktop application, over a bounded internal queue.
//!
//! # Architecture
//!
//! - **Envelope model**: requests, responses, peer descriptors and internal
//!   queue items, with their JSON wire shapes.
//! - **Mesh bridge**: peer directory and header codec on top of any
//!   [`MeshBus`]; inbound bus events become queue items.
//! - **Local channel**: reconnecting websocket client to the local
//!   application.
//! - **Dispatch loop**: single cooperative loop polling both sides and
//!   draining the queue.
//! - **LAN bus**: UDP broadcast discovery plus websocket messaging,
//!   implementing [`MeshBus`].
//!
//! # Quick start
//!
//! ```rust,no_run
//! use cleepbus_network::{
//!     DispatchConfig, Dispatcher, LanBus, LanBusConfig, LocalChannel, LocalChannelConfig,
//!     MeshBridge, message_queue,
//! };
//!
//! # async fn example() {
//! let (tx, rx) = message_queue(100);
//! let bridge = MeshBridge::new(LanBus::new(LanBusConfig::default()), tx.clone(), None);
//! let local = LocalChannel::new(LocalChannelConfig::default(), tx);
//! let mut dispatcher = Dispatcher::new(bridge, local, rx, DispatchConfig::default());
//!
//! dispatcher.run_until(tokio::signal::ctrl_c()).await.unwrap();
//! # }
//! ```

pub mod bridge;
pub mod bus;
pub mod config;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod headers;
pub mod lan_bus;
pub mod local;
pub mod message;
pub mod peer;
pub mod queue;
pub mod transport;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use bridge::MeshBridge;
pub use bus::{BusEvent, MeshBus};
pub use config::{DispatchConfig, LanBusConfig, LocalChannelConfig};
pub use dispatch::{Dispatcher, TickOutcome};
pub use error::BridgeError;
pub use headers::Headers;
pub use lan_bus::LanBus;
pub use local::LocalChannel;
pub use message::{
    Content, ContentType, InternalMessage, InternalMessageContent, MessageRequest,
    MessageResponse, MessageType, STOP_SENTINEL,
};
pub use peer::{ExtraValue, PeerDirectory, PeerInfos};
pub use queue::{QueueReceiver, QueueSender, message_queue};
