//! Dispatch loop: the single control loop of the bridge.
//!
//! One tick reads the local channel, pumps the mesh bridge, then drains at
//! most one queue item when the local application is connected.

use std::future::Future;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::bridge::MeshBridge;
use crate::bus::MeshBus;
use crate::config::DispatchConfig;
use crate::error::BridgeError;
use crate::local::LocalChannel;
use crate::message::{Content, InternalMessage, MessageType};
use crate::queue::QueueReceiver;

/// Whether the loop keeps going after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    Stop,
}

/// Owns both adapters and the consumer side of the internal queue.
pub struct Dispatcher<B> {
    bridge: MeshBridge<B>,
    local: LocalChannel,
    queue: QueueReceiver,
    config: DispatchConfig,
}

impl<B: MeshBus> Dispatcher<B> {
    pub fn new(
        bridge: MeshBridge<B>,
        local: LocalChannel,
        queue: QueueReceiver,
        config: DispatchConfig,
    ) -> Self {
        Self {
            bridge,
            local,
            queue,
            config,
        }
    }

    pub fn bridge(&self) -> &MeshBridge<B> {
        &self.bridge
    }

    pub fn local(&self) -> &LocalChannel {
        &self.local
    }

    /// Join the mesh.
    pub async fn start(&mut self) -> Result<(), BridgeError> {
        self.bridge.start().await
    }

    /// Run one tick.
    ///
    /// Protocol misuse while routing is logged and the tick still succeeds;
    /// any other error is returned and is fatal to the loop.
    pub async fn tick(&mut self) -> Result<TickOutcome, BridgeError> {
        self.local.read_message().await?;
        self.bridge.read_messages();

        if !self.local.is_connected() {
            tokio::time::sleep(self.config.queue_wait).await;
            return Ok(TickOutcome::Continue);
        }

        let Some(message) = self.queue.pop(self.config.queue_wait).await? else {
            return Ok(TickOutcome::Continue);
        };

        let description = message.to_string();
        match self.route(message).await {
            Err(e) if e.is_protocol_misuse() => {
                error!("Dropping {description}: {e}");
                Ok(TickOutcome::Continue)
            }
            other => other,
        }
    }

    /// Tick until the stop sentinel arrives or an error is fatal.
    pub async fn run(&mut self) -> Result<(), BridgeError> {
        loop {
            if self.tick().await? == TickOutcome::Stop {
                info!("Stop requested by local application");
                return Ok(());
            }
        }
    }

    /// Start, then run until the loop ends or `interrupt` completes. Both
    /// adapters are stopped on every path.
    pub async fn run_until<F>(&mut self, interrupt: F) -> Result<(), BridgeError>
    where
        F: Future,
    {
        let result = async {
            self.start().await?;
            tokio::select! {
                result = self.run() => result,
                _ = interrupt => {
                    info!("Interrupted, shutting down");
                    Ok(())
                }
            }
        }
        .await;

        if let Err(e) = &result {
            error!("Dispatch loop failed: {e}");
        }
        self.shutdown().await;
        result
    }

    /// Stop both adapters. Failures are logged and swallowed.
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.local.stop().await {
            warn!("Local channel stop failed: {e}");
        }
        if let Err(e) = self.bridge.stop().await {
            warn!("Mesh bridge stop failed: {e}");
        }
        info!("Dispatcher stopped");
    }

    async fn route(&mut self, message: InternalMessage) -> Result<TickOutcome, BridgeError> {
        if message.is_stop() {
            return Ok(TickOutcome::Stop);
        }

        match (message.message_type, &message.content) {
            (MessageType::FromLocal, Content::Raw(raw)) => {
                let payload: Value = serde_json::from_str(raw).map_err(|e| {
                    BridgeError::InvalidMessage(format!("local payload is not JSON: {e}"))
                })?;
                self.bridge.send_message(&payload).await?;
            }
            (MessageType::FromLocal, Content::Typed(_)) => {
                return Err(BridgeError::InvalidMessage(
                    "local messages must be raw".into(),
                ));
            }
            (MessageType::ToLocal, _) => {
                debug!("Routing {message} to local application");
                self.local.write(&message).await?;
            }
        }

        Ok(TickOutcome::Continue)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
