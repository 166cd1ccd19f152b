//! WebSocket transport for the LAN bus: server and client connections.
//!
//! Every node runs a server accepting frames from other nodes. Outbound
//! traffic goes through client connections opened on demand; the read half
//! of each connection forwards frames into the same channel as the server.

use std::net::SocketAddr;
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, accept_async, connect_async};
use tracing::{debug, error, info, warn};

use crate::error::BridgeError;
use crate::message::MessageResponse;

/// Write half of a client-side WebSocket.
type ClientWsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// A frame exchanged between two LAN bus nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BusFrame {
    /// A command or event, in its wire dict form.
    Request { from: String, request: Value },
    /// The answer to a command.
    Response {
        from: String,
        response: MessageResponse,
    },
}

impl BusFrame {
    /// Transport ident of the sending node.
    pub fn sender(&self) -> &str {
        match self {
            Self::Request { from, .. } | Self::Response { from, .. } => from,
        }
    }

    pub fn to_json(&self) -> Result<String, BridgeError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, BridgeError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// A handle to an outbound WebSocket connection with a peer.
pub struct PeerConnection {
    ident: String,
    sink: ClientWsSink,
}

impl PeerConnection {
    /// Transport ident of the remote node.
    pub fn ident(&self) -> &str {
        &self.ident
    }

    /// Send one frame.
    pub async fn send(&mut self, frame: &BusFrame) -> Result<(), BridgeError> {
        let json = frame.to_json()?;
        self.sink
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| BridgeError::Transport(format!("Send to {} failed: {e}", self.ident)))
    }

    /// Close the connection gracefully.
    pub async fn close(&mut self) {
        let _ = self.sink.send(Message::Close(None)).await;
    }
}

/// Accept connections on `listener` until `shutdown` fires, forwarding every
/// decoded frame into `frame_tx`.
pub async fn run_server(
    listener: TcpListener,
    frame_tx: mpsc::Sender<BusFrame>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let local_addr = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();
    info!("LAN bus server listening on {local_addr}");

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        let frame_tx = frame_tx.clone();
                        tokio::spawn(async move {
                            match accept_async(stream).await {
                                Ok(ws_stream) => {
                                    let (_sink, stream) = ws_stream.split();
                                    read_frames(stream, peer_addr, frame_tx).await;
                                }
                                Err(e) => {
                                    error!("WebSocket accept failed for {peer_addr}: {e}");
                                }
                            }
                        });
                    }
                    Err(e) => {
                        error!("TCP accept failed: {e}");
                    }
                }
            }
            _ = shutdown.recv() => {
                info!("LAN bus server shutting down");
                break;
            }
        }
    }
}

/// Open a connection to the node `ident` listening at `addr`.
pub async fn connect_to_peer(
    ident: &str,
    addr: SocketAddr,
    connect_timeout: Duration,
    frame_tx: mpsc::Sender<BusFrame>,
) -> Result<PeerConnection, BridgeError> {
    let url = format!("ws://{addr}");
    let (ws_stream, _) = tokio::time::timeout(connect_timeout, connect_async(&url))
        .await
        .map_err(|_| BridgeError::Timeout(connect_timeout))?
        .map_err(|e| BridgeError::Transport(format!("Connect to {url} failed: {e}")))?;

    let (sink, stream) = ws_stream.split();
    tokio::spawn(read_frames(stream, addr, frame_tx));

    debug!("Connected to peer {ident} at {addr}");
    Ok(PeerConnection {
        ident: ident.to_string(),
        sink,
    })
}

async fn read_frames<S>(mut stream: S, peer_addr: SocketAddr, frame_tx: mpsc::Sender<BusFrame>)
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => match BusFrame::from_json(&text) {
                Ok(frame) => {
                    if frame_tx.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Bad frame from {peer_addr}: {e}");
                }
            },
            Ok(Message::Close(_)) => {
                debug!("Peer {peer_addr} sent close");
                break;
            }
            Ok(_) => {} // Ignore binary/ping/pong
            Err(e) => {
                debug!("Read error from {peer_addr}: {e}");
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
