use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use cleepbus_core::config::BridgeConfig;
use cleepbus_core::logging;
use cleepbus_network::{
    DispatchConfig, Dispatcher, LanBus, LanBusConfig, LocalChannel, LocalChannelConfig,
    MeshBridge, message_queue,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

// ---------------------------------------------------------------------------
// Component wiring
// ---------------------------------------------------------------------------

fn lan_bus_config(config: &BridgeConfig) -> LanBusConfig {
    LanBusConfig {
        listen_addr: config.mesh_listen_addr,
        announce_interval: Duration::from_secs(config.announce_interval_secs.max(1)),
        peer_expiry: Duration::from_secs(config.peer_expiry_secs.max(1)),
        ..LanBusConfig::for_discovery_port(config.discovery_port)
    }
}

fn local_channel_config(config: &BridgeConfig) -> LocalChannelConfig {
    LocalChannelConfig {
        enabled: config.local_channel_enabled,
        port: config.local_channel_port,
        ..LocalChannelConfig::default()
    }
}

fn build_dispatcher(config: &BridgeConfig) -> Dispatcher<LanBus> {
    let (tx, rx) = message_queue(config.queue_capacity);
    let bus = LanBus::new(lan_bus_config(config));
    let bridge = MeshBridge::new(bus, tx.clone(), config.uuid.clone());
    let local = LocalChannel::new(local_channel_config(config), tx);
    Dispatcher::new(bridge, local, rx, DispatchConfig::default())
}

async fn run(config: BridgeConfig) -> Result<()> {
    let mut dispatcher = build_dispatcher(&config);
    info!("Bridge uuid {}", dispatcher.bridge().uuid());

    dispatcher
        .run_until(tokio::signal::ctrl_c())
        .await
        .context("Dispatch loop failed")
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // Config problems are reported once logging is up
    let (config, config_warning) =
        BridgeConfig::load().unwrap_or_else(|e| (BridgeConfig::default(), Some(e)));

    let _log_guard = match logging::init_logging(config.debug) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Failed to initialize logging: {e:#}");
            None
        }
    };
    info!("========== cleepbus v{VERSION} started ==========");
    if let Some(e) = config_warning {
        warn!("Using default config: {e:#}");
    }

    match run(config).await {
        Ok(()) => {
            info!("cleepbus stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("cleepbus stopped on error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
