//! Local channel: reconnecting websocket client to the desktop application.
//!
//! The channel is either disconnected or connected. Each read tick either
//! attempts one connection or performs one bounded read; failures only move
//! the channel back to disconnected.

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::config::LocalChannelConfig;
use crate::error::BridgeError;
use crate::message::InternalMessage;
use crate::queue::QueueSender;

type LocalSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Websocket channel to the local application on `127.0.0.1`.
pub struct LocalChannel {
    config: LocalChannelConfig,
    queue: QueueSender,
    socket: Option<LocalSocket>,
}

impl LocalChannel {
    pub fn new(config: LocalChannelConfig, queue: QueueSender) -> Self {
        if !config.is_active() {
            info!("Local channel disabled");
        }
        Self {
            config,
            queue,
            socket: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    /// Connect when disconnected, otherwise read at most one frame into the
    /// queue. A timeout with no data is not an error.
    pub async fn read_message(&mut self) -> Result<(), BridgeError> {
        let Some(port) = self.config.port.filter(|_| self.config.enabled) else {
            return Ok(());
        };
        let Some(socket) = self.socket.as_mut() else {
            self.connect(port).await;
            return Ok(());
        };

        match tokio::time::timeout(self.config.read_timeout, socket.next()).await {
            Err(_) => Ok(()),
            Ok(Some(Ok(Message::Text(text)))) => self.enqueue(text.as_str().to_owned()),
            Ok(Some(Ok(Message::Binary(bytes)))) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => self.enqueue(text),
                Err(e) => {
                    warn!("Dropping non UTF-8 frame from local application: {e}");
                    Ok(())
                }
            },
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                info!("Local application closed the connection");
                self.socket = None;
                Ok(())
            }
            Ok(Some(Ok(_))) => Ok(()), // Ignore ping/pong
            Ok(Some(Err(e))) => {
                warn!("Local channel read failed: {e}");
                self.socket = None;
                Ok(())
            }
        }
    }

    /// Send the full envelope as one JSON text frame. Dropped without error
    /// when disabled or disconnected.
    pub async fn write(&mut self, message: &InternalMessage) -> Result<(), BridgeError> {
        if !self.config.is_active() {
            return Ok(());
        }
        let Some(socket) = self.socket.as_mut() else {
            debug!("Local application not connected, dropping {message}");
            return Ok(());
        };

        let json = message.to_json()?;
        debug!("Sending to local application: {json}");
        if let Err(e) = socket.send(Message::Text(json.into())).await {
            warn!("Local channel write failed: {e}");
            self.socket = None;
        }
        Ok(())
    }

    /// Close the connection if any.
    pub async fn stop(&mut self) -> Result<(), BridgeError> {
        if let Some(mut socket) = self.socket.take() {
            socket
                .close(None)
                .await
                .map_err(|e| BridgeError::Transport(format!("Close failed: {e}")))?;
            info!("Disconnected from local application");
        }
        Ok(())
    }

    async fn connect(&mut self, port: u16) {
        let url = format!("ws://127.0.0.1:{port}");
        match tokio::time::timeout(self.config.connect_timeout, connect_async(&url)).await {
            Ok(Ok((socket, _))) => {
                info!("Connected to local application at {url}");
                self.socket = Some(socket);
            }
            Ok(Err(e)) => {
                debug!("Local application unreachable at {url}: {e}");
                tokio::time::sleep(self.config.retry_backoff).await;
            }
            Err(_) => {
                debug!("Connection to {url} timed out");
                tokio::time::sleep(self.config.retry_backoff).await;
            }
        }
    }

    fn enqueue(&self, raw: String) -> Result<(), BridgeError> {
        debug!("Received from local application: {raw}");
        match self.queue.push(InternalMessage::from_local(raw)) {
            Err(BridgeError::QueueFull) => {
                warn!("Internal queue full, dropping local message");
                Ok(())
            }
            other => other,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::message::{ContentType, InternalMessageContent, MessageType};
    use crate::queue::{QueueReceiver, message_queue};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;
    use tokio_tungstenite::accept_async;

    type ServerSocket = WebSocketStream<TcpStream>;

    fn test_config(port: Option<u16>) -> LocalChannelConfig {
        LocalChannelConfig {
            enabled: true,
            port,
            connect_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_millis(50),
            retry_backoff: Duration::from_millis(10),
        }
    }

    async fn local_server() -> (u16, JoinHandle<ServerSocket>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            accept_async(stream).await.unwrap()
        });
        (port, handle)
    }

    async fn connected_channel() -> (LocalChannel, QueueReceiver, ServerSocket) {
        let (port, handle) = local_server().await;
        let (tx, rx) = message_queue(10);
        let mut channel = LocalChannel::new(test_config(Some(port)), tx);
        channel.read_message().await.unwrap();
        assert!(channel.is_connected());
        let server = handle.await.unwrap();
        (channel, rx, server)
    }

    fn peer_message() -> InternalMessage {
        InternalMessage::to_local(InternalMessageContent::new(
            ContentType::PeerDisconnected,
            None,
            None,
        ))
    }

    #[tokio::test]
    async fn test_disabled_channel_is_noop() {
        let (tx, rx) = message_queue(10);
        let mut channel = LocalChannel::new(
            LocalChannelConfig {
                enabled: false,
                ..test_config(Some(1))
            },
            tx.clone(),
        );
        channel.read_message().await.unwrap();
        channel.write(&peer_message()).await.unwrap();
        assert!(!channel.is_connected());

        let mut no_port = LocalChannel::new(test_config(None), tx);
        no_port.read_message().await.unwrap();
        no_port.write(&peer_message()).await.unwrap();
        assert!(!no_port.is_connected());
        assert!(rx.is_empty());
    }

    #[tokio::test]
    async fn test_refused_connection_is_not_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (tx, _rx) = message_queue(10);
        let mut channel = LocalChannel::new(test_config(Some(port)), tx);
        channel.read_message().await.unwrap();
        assert!(!channel.is_connected());
    }

    #[tokio::test]
    async fn test_read_enqueues_from_local() {
        let (mut channel, mut rx, mut server) = connected_channel().await;
        server
            .send(Message::Text(r#"{"command":"ping"}"#.into()))
            .await
            .unwrap();

        for _ in 0..20 {
            channel.read_message().await.unwrap();
            if !rx.is_empty() {
                break;
            }
        }

        let message = rx.pop(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(message.message_type, MessageType::FromLocal);
        assert_eq!(message, InternalMessage::from_local(r#"{"command":"ping"}"#));
    }

    #[tokio::test]
    async fn test_read_timeout_keeps_connection() {
        let (mut channel, rx, _server) = connected_channel().await;
        channel.read_message().await.unwrap();
        assert!(channel.is_connected());
        assert!(rx.is_empty());
    }

    #[tokio::test]
    async fn test_write_sends_full_envelope() {
        let (mut channel, _rx, mut server) = connected_channel().await;
        channel.write(&peer_message()).await.unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(2), server.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(frame.to_text().unwrap()).unwrap();
        assert_eq!(value["message_type"], "TO_LOCAL");
        assert_eq!(value["content"]["content_type"], "PEER_DISCONNECTED");
    }

    #[tokio::test]
    async fn test_write_while_disconnected_is_dropped() {
        let (port, handle) = local_server().await;
        let (tx, _rx) = message_queue(10);
        let mut channel = LocalChannel::new(test_config(Some(port)), tx);

        channel.write(&peer_message()).await.unwrap();

        channel.read_message().await.unwrap();
        assert!(channel.is_connected());
        let mut server = handle.await.unwrap();
        let nothing = tokio::time::timeout(Duration::from_millis(100), server.next()).await;
        assert!(nothing.is_err(), "dropped message must not be delivered later");
    }

    #[tokio::test]
    async fn test_server_close_disconnects() {
        let (mut channel, _rx, mut server) = connected_channel().await;
        server.close(None).await.unwrap();

        for _ in 0..20 {
            channel.read_message().await.unwrap();
            if !channel.is_connected() {
                break;
            }
        }
        assert!(!channel.is_connected());
    }

    #[tokio::test]
    async fn test_full_queue_drops_frame() {
        let (port, handle) = local_server().await;
        let (tx, rx) = message_queue(1);
        tx.push(InternalMessage::from_local("filler")).unwrap();
        let mut channel = LocalChannel::new(test_config(Some(port)), tx);
        channel.read_message().await.unwrap();
        let mut server = handle.await.unwrap();

        server.send(Message::Text("overflow".into())).await.unwrap();
        for _ in 0..5 {
            channel.read_message().await.unwrap();
        }
        assert!(channel.is_connected());
        assert_eq!(rx.len(), 1);
    }

    #[tokio::test]
    async fn test_stop_closes_socket() {
        let (mut channel, _rx, _server) = connected_channel().await;
        channel.stop().await.unwrap();
        assert!(!channel.is_connected());
        channel.stop().await.unwrap();
    }
}
