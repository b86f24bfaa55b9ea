// MIT License - Copyright (c) 2026 Peter Wright
// MQTT bridge

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use smartdoor_bridge::config::{load_credential, ConnConfig};
use smartdoor_bridge::conn::Conn;
use smartdoor_bridge::fsm::{
    should_elide, terminal_event_for_position, CoverEvent, CoverState, DeviceFsm, DeviceRegistry,
};
use smartdoor_bridge::mqtt::{self, MqttHandler};
use smartdoor_bridge::status::{fetch_basic_info, run_status_loop, BasicInfo, DoorStatus};

/// Broker connection attempts before giving up at startup.
const MQTT_CONNECT_ATTEMPTS: u32 = 5;

#[derive(Parser)]
#[command(name = "smartdoor2mqtt")]
#[command(about = "Bridge between a SmartDoor basestation and MQTT")]
struct Cli {
    /// Path to the credentials file
    #[arg(long, default_value = "creds.json")]
    creds: String,

    /// Basestation host to connect to
    #[arg(long)]
    host: String,

    /// MQTT broker host
    #[arg(long)]
    mqtt: String,

    /// MQTT broker port
    #[arg(long, default_value_t = 1883)]
    mqtt_port: u16,

    /// MQTT username
    #[arg(long)]
    mqtt_user: Option<String>,

    /// MQTT password
    #[arg(long)]
    mqtt_password: Option<String>,

    /// Prefix for MQTT topics
    #[arg(long, default_value = "dd-door")]
    mqtt_prefix: String,

    /// Publish a discovery tombstone for this entity ID and exit
    #[arg(long)]
    remove_entity: Option<String>,

    /// Debug mode
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let creds = load_credential(&cli.creds)
        .with_context(|| format!("can't open credentials file {}", cli.creds))?;

    let (handler, mut event_loop) = MqttHandler::new(
        "smartdoor2mqtt",
        &cli.mqtt,
        cli.mqtt_port,
        cli.mqtt_user.as_deref(),
        cli.mqtt_password.as_deref(),
    );
    mqtt::await_connection(&mut event_loop, &handler, MQTT_CONNECT_ATTEMPTS)
        .await
        .context("failed to connect to mqtt broker")?;
    info!(broker = %cli.mqtt, port = cli.mqtt_port, "mqtt connected");

    if let Some(entity_id) = &cli.remove_entity {
        handler
            .remove_entity(entity_id)
            .await
            .context("failed to publish discovery tombstone")?;
        handler.disconnect().await;
        return Ok(());
    }

    let config = ConnConfig::builder()
        .host(&cli.host)
        .debug(cli.debug)
        .build();
    let conn = Arc::new(Conn::new(config, creds).context("failed to build connection")?);

    conn.connect().await.context("failed to connect")?;
    info!("basestation session established");

    let info = fetch_basic_info(&conn)
        .await
        .context("could not get basic info")?;
    info!(bsid = %info.basestation, name = %info.name, "basic info");

    let registry = Arc::new(DeviceRegistry::default());

    // Command dispatch and resubscription live on the broker event loop.
    let subscribe_topic = mqtt::command_subscription(&cli.mqtt_prefix);
    handler
        .subscribe(&subscribe_topic)
        .await
        .context("failed to subscribe to command topic")?;
    info!(topic = %subscribe_topic, "subscribed");
    let event_loop_handle = mqtt::spawn_event_loop(
        event_loop,
        Arc::clone(&handler),
        Arc::clone(&registry),
        cli.mqtt_prefix.clone(),
    );

    // Status updates flow from the poll loop into the main loop.
    let (status_tx, mut status_rx) = mpsc::channel::<DoorStatus>(8);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let status_handle = tokio::spawn(run_status_loop(
        Arc::clone(&conn),
        status_tx,
        shutdown_rx.clone(),
    ));

    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutting down gracefully...");
        let _ = shutdown_tx.send(true);
    });

    info!("bridge running");
    let mut shutdown_rx = shutdown_rx;
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            status = status_rx.recv() => {
                match status {
                    Some(status) => {
                        handle_status(&status, &registry, &conn, &handler, &cli.mqtt_prefix, &info).await;
                    }
                    None => break,
                }
            }
        }
    }

    // Mark every known device offline (retained) before dropping the
    // broker session.
    for fsm in registry.drain() {
        if let Err(e) = fsm.trigger(CoverEvent::GoOffline).await {
            debug!(device = fsm.id(), error = %e, "offline transition skipped");
        }
    }
    status_handle.abort();
    event_loop_handle.abort();
    handler.disconnect().await;
    tokio::time::sleep(std::time::Duration::from_millis(250)).await;

    info!("shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "no SIGTERM handler, falling back to ctrl-c");
            let _ = ctrl_c.await;
        }
    }
}

/// Apply one status snapshot: make sure every reported device has a
/// configured state machine, then drive terminal transitions from the
/// reported position and publish it.
async fn handle_status(
    status: &DoorStatus,
    registry: &Arc<DeviceRegistry>,
    conn: &Arc<Conn>,
    handler: &Arc<MqttHandler>,
    prefix: &str,
    info: &BasicInfo,
) {
    if status.is_admin() {
        debug!("ignoring admin-only status payload");
        return;
    }

    for device in &status.devices {
        let fsm = match registry.get(&device.id) {
            Some(fsm) => {
                if fsm.current() == CoverState::Offline {
                    let _ = fsm.trigger(CoverEvent::GoOnline).await;
                }
                fsm
            }
            None => {
                mqtt::publish_discovery(handler, prefix, device, info).await;
                let fsm = Arc::new(DeviceFsm::new(
                    device.id.clone(),
                    prefix.to_string(),
                    Arc::clone(conn),
                    Arc::clone(handler),
                ));
                registry.insert(Arc::clone(&fsm));
                if let Err(e) = fsm.trigger(CoverEvent::GoOnline).await {
                    warn!(device = %device.id, error = %e, "could not bring device online");
                }
                fsm
            }
        };

        let position = device.position();
        if let Some(event) = terminal_event_for_position(position) {
            if !should_elide(fsm.current(), event) {
                // Illegal transitions are already logged by the FSM.
                let _ = fsm.trigger(event).await;
            }
        }

        if let Err(e) = handler.publish_position(prefix, &device.id, position).await {
            debug!(device = %device.id, error = %e, "position publish failed");
        }
    }
}
