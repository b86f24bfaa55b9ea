// MIT License - Copyright (c) 2026 Peter Wright

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS};
use serde_json::json;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::error::{BridgeError, Result};
use crate::fsm::{CoverEvent, DeviceRegistry};
use crate::status::{BasicInfo, DoorStatusDevice};

/// Bounded wait for a publish to be accepted; detects a stalled broker
/// connection without queueing forever.
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

/// Discovery publishes retry a few times with exponential backoff, since
/// broker and network may be slow right after startup.
const DISCOVERY_RETRY_ATTEMPTS: u32 = 5;

pub fn command_topic(prefix: &str, id: &str) -> String {
    format!("{}/{}/command", prefix, id)
}

pub fn state_topic(prefix: &str, id: &str) -> String {
    format!("{}/{}/state", prefix, id)
}

pub fn position_topic(prefix: &str, id: &str) -> String {
    format!("{}/{}/position", prefix, id)
}

pub fn set_position_topic(prefix: &str, id: &str) -> String {
    format!("{}/{}/set_position", prefix, id)
}

pub fn availability_topic(prefix: &str, id: &str) -> String {
    format!("{}/{}/availability", prefix, id)
}

pub fn discovery_topic(id: &str) -> String {
    format!("homeassistant/cover/{}/config", id)
}

/// The wildcard subscription covering every device's command topic.
pub fn command_subscription(prefix: &str) -> String {
    format!("{}/+/command", prefix)
}

/// Map an inbound command payload to a state machine event.
///
/// Payloads are upper-cased first; anything unrecognized is dropped by
/// the caller.
pub fn parse_bus_command(payload: &str) -> Option<CoverEvent> {
    match payload.to_uppercase().as_str() {
        "ONLINE" => Some(CoverEvent::GoOnline),
        "OFFLINE" => Some(CoverEvent::GoOffline),
        "GO_OPEN" => Some(CoverEvent::GoOpen),
        "GO_CLOSE" => Some(CoverEvent::GoClose),
        "STOP" => Some(CoverEvent::GoStop),
        _ => None,
    }
}

/// Extract the device ID from a `{prefix}/{id}/command` topic.
pub fn device_id_from_command_topic<'a>(topic: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix('/')?;
    let (id, tail) = rest.split_once('/')?;
    (tail == "command" && !id.is_empty()).then_some(id)
}

/// The Home Assistant discovery document for a cover device.
pub fn discovery_payload(
    prefix: &str,
    device: &DoorStatusDevice,
    info: &BasicInfo,
) -> serde_json::Value {
    json!({
        "name": device.name,
        "command_topic": command_topic(prefix, &device.id),
        "state_topic": state_topic(prefix, &device.id),
        "availability_topic": availability_topic(prefix, &device.id),
        "availability_mode": "latest",
        "payload_open": "go_open",
        "payload_close": "go_close",
        "state_open": "open",
        "state_closed": "closed",
        "state_opening": "opening",
        "state_closing": "closing",
        "state_stopping": "stopping",
        "payload_available": "online",
        "payload_not_available": "offline",
        "optimistic": false,
        "retain": false,
        "device_class": "garage",
        "expire_after": 60,
        "unique_id": format!("cover_{}", device.id),
        "scan_interval": 10,
        "device": {
            "identifiers": [format!("garage_door_{}", device.id)],
            "name": info.name,
            "manufacturer": "smartdoor",
        },
        "icon": "mdi:garage",
    })
}

/// Centralizes MQTT publish operations.
///
/// All publishes use QoS 0 with a bounded wait; when the connection is
/// down they are skipped rather than queued indefinitely. A mutex
/// serializes calls into the client.
pub struct MqttHandler {
    client: AsyncClient,
    connected: AtomicBool,
    publish_lock: Mutex<()>,
}

impl MqttHandler {
    /// Build the client with a persistent session and a stable client ID.
    pub fn new(
        client_id: &str,
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
    ) -> (Arc<Self>, EventLoop) {
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_session(false);
        if let (Some(user), Some(pass)) = (username, password) {
            options.set_credentials(user, pass);
        }
        let (client, event_loop) = AsyncClient::new(options, 256);
        (
            Arc::new(Self {
                client,
                connected: AtomicBool::new(false),
                publish_lock: Mutex::new(()),
            }),
            event_loop,
        )
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub async fn subscribe(&self, topic: &str) -> Result<()> {
        self.client
            .subscribe(topic, QoS::AtMostOnce)
            .await
            .map_err(|e| BridgeError::BusSubscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            warn!(error = %e, "mqtt disconnect failed");
        }
    }

    async fn publish(&self, topic: &str, retain: bool, payload: Vec<u8>) -> Result<()> {
        let _guard = self.publish_lock.lock().await;

        if !self.is_connected() {
            let err = BridgeError::BusPublish {
                topic: topic.to_string(),
                reason: "not connected".to_string(),
            };
            error!(topic, "publish skipped: not connected");
            return Err(err);
        }

        match timeout(
            PUBLISH_TIMEOUT,
            self.client.publish(topic, QoS::AtMostOnce, retain, payload),
        )
        .await
        {
            Ok(Ok(())) => {
                debug!(topic, retain, "message published");
                Ok(())
            }
            Ok(Err(e)) => Err(BridgeError::BusPublish {
                topic: topic.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(BridgeError::BusPublish {
                topic: topic.to_string(),
                reason: format!("timed out after {:?}", PUBLISH_TIMEOUT),
            }),
        }
    }

    /// Publish a device's state string (not retained).
    pub async fn publish_status(&self, prefix: &str, id: &str, status: &str) -> Result<()> {
        self.publish(&state_topic(prefix, id), false, status.into()).await
    }

    /// Publish a device's position (not retained).
    pub async fn publish_position(&self, prefix: &str, id: &str, position: i32) -> Result<()> {
        self.publish(&position_topic(prefix, id), false, position.to_string().into())
            .await
    }

    /// Publish a device's availability (retained).
    pub async fn publish_availability(&self, prefix: &str, id: &str, availability: &str) -> Result<()> {
        self.publish(&availability_topic(prefix, id), true, availability.into())
            .await
    }

    /// Remove the Home Assistant entity by clearing the retained
    /// discovery document.
    pub async fn remove_entity(&self, id: &str) -> Result<()> {
        let result = self.publish(&discovery_topic(id), true, Vec::new()).await;
        match &result {
            Ok(()) => info!(device = id, "removed entity"),
            Err(e) => error!(device = id, error = %e, "failed to remove entity"),
        }
        result
    }
}

/// Publish the discovery document (retained), retrying in the background
/// on failure; broker and network may still be settling at startup.
pub async fn publish_discovery(
    handler: &Arc<MqttHandler>,
    prefix: &str,
    device: &DoorStatusDevice,
    info: &BasicInfo,
) {
    let topic = discovery_topic(&device.id);
    let payload = match serde_json::to_vec(&discovery_payload(prefix, device, info)) {
        Ok(payload) => payload,
        Err(e) => {
            error!(error = %e, "couldn't encode config payload");
            return;
        }
    };

    if handler.publish(&topic, true, payload.clone()).await.is_ok() {
        info!(device = %device.id, name = %device.name, "device configured");
        return;
    }

    warn!(device = %device.id, "couldn't publish config; will retry in background");
    let handler = Arc::clone(handler);
    tokio::spawn(async move {
        for attempt in 1..=DISCOVERY_RETRY_ATTEMPTS {
            sleep(Duration::from_secs(1 << attempt)).await;
            if handler.publish(&topic, true, payload.clone()).await.is_ok() {
                info!(attempt, "published config successfully after retry");
                return;
            }
            warn!(attempt, "retry to publish config failed");
        }
    });
}

/// Wait for the initial broker session, with a bounded number of
/// reconnect attempts. Authentication rejections fail hard.
pub async fn await_connection(
    event_loop: &mut EventLoop,
    handler: &Arc<MqttHandler>,
    max_attempts: u32,
) -> Result<()> {
    let mut attempts = 0;
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    handler.set_connected(true);
                    return Ok(());
                }
                return Err(BridgeError::BusAuth(format!("{:?}", ack.code)));
            }
            Ok(_) => {}
            Err(ConnectionError::ConnectionRefused(code)) => {
                return Err(BridgeError::BusAuth(format!("{:?}", code)));
            }
            Err(e) => {
                attempts += 1;
                if attempts >= max_attempts {
                    return Err(BridgeError::BusConnect(e.to_string()));
                }
                warn!(attempts, error = %e, "mqtt connect failed, retrying");
                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

/// Drive the broker event loop: track connection state, resubscribe on
/// every (re)connect, and dispatch inbound device commands.
pub fn spawn_event_loop(
    mut event_loop: EventLoop,
    handler: Arc<MqttHandler>,
    registry: Arc<DeviceRegistry>,
    prefix: String,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    handler.set_connected(true);
                    let topic = command_subscription(&prefix);
                    match handler.subscribe(&topic).await {
                        Ok(()) => info!(%topic, "subscribed to command topic"),
                        Err(e) => error!(error = %e, "resubscribe failed"),
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if publish.retain {
                        continue; // ignore retained leftovers
                    }
                    handle_command(&registry, &prefix, &publish.topic, &publish.payload);
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    handler.set_connected(false);
                    warn!("broker sent disconnect");
                }
                Ok(_) => {}
                Err(e) => {
                    handler.set_connected(false);
                    error!(error = %e, "mqtt event loop error");
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }
    })
}

fn handle_command(registry: &Arc<DeviceRegistry>, prefix: &str, topic: &str, payload: &[u8]) {
    let Some(id) = device_id_from_command_topic(topic, prefix) else {
        return;
    };
    let payload = String::from_utf8_lossy(payload);
    info!(device = id, payload = %payload, "got bus command");

    let Some(event) = parse_bus_command(payload.trim()) else {
        warn!(device = id, payload = %payload, "unknown bus command");
        return;
    };

    match registry.get(id) {
        Some(fsm) => {
            tokio::spawn(async move {
                if let Err(e) = fsm.trigger(event).await {
                    warn!(error = %e, "bus command rejected");
                }
            });
        }
        None => warn!(device = id, "command for unknown device"),
    }
}
