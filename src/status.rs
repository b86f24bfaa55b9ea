// MIT License - Copyright (c) 2026 Peter Wright

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::conn::{Conn, Target, DEVICES_FETCH_PATH, SDK_INFO_PATH};
use crate::error::Result;

/// How often the status loop drains the server-side message queue.
const MESSAGE_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// The status of a single device.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DoorStatusDevice {
    #[serde(rename = "deviceId")]
    pub id: String,
    #[serde(rename = "screenFormat")]
    pub screen_format: i32,
    pub time: i64,
    pub hash: i64,
    pub name: String,

    pub buttons: Vec<DoorStatusButton>,
    pub aux: Vec<DoorStatusButton>,

    pub device: DevicePosition,
    pub log: DeviceLog,
}

impl DoorStatusDevice {
    /// Reported door position, 0 (closed) to 100 (open).
    pub fn position(&self) -> i32 {
        self.device.position
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DevicePosition {
    pub position: i32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DeviceLog {
    #[serde(rename = "logId")]
    pub id: i64,
    pub alert: i32,
    pub text: String,
    pub time: i64,
}

/// A button displayed in the app UI.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DoorStatusButton {
    pub action: ButtonAction,
    pub title: String,
    pub icon: String,
    pub hide: i32,
    pub row: i32,
    pub col: i32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ButtonAction {
    pub base: i32,
    #[serde(rename = "cmd")]
    pub command: i32,
}

/// A user available to the environment.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DoorStatusUser {
    pub enabled: bool,
    #[serde(rename = "userName")]
    pub username: String,
}

/// The top-level status structure for all devices.
///
/// Emitted regularly as a status broadcast (no process ID) and also the
/// reply type for the device fetch path.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DoorStatus {
    #[serde(rename = "deviceOrder")]
    pub device_order: Vec<String>,
    pub devices: Vec<DoorStatusDevice>,

    /// We might also _just_ see users (the admin update payload).
    pub users: Vec<DoorStatusUser>,
}

impl DoorStatus {
    /// Whether this is an admin-only payload with no device content.
    pub fn is_admin(&self) -> bool {
        self.device_order.is_empty() && !self.users.is_empty()
    }

    /// Look up a device by ID.
    pub fn get(&self, id: &str) -> Option<&DoorStatusDevice> {
        self.devices.iter().find(|d| d.id == id)
    }
}

/// Basic device information from the SDK endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BasicInfo {
    #[serde(rename = "bsid")]
    pub basestation: String,
    pub mono: i64,
    pub clock: i64,
    pub name: String,
    pub version: i32,
}

/// Fetch basic device information from the SDK endpoint.
pub async fn fetch_basic_info(conn: &Conn) -> Result<BasicInfo> {
    conn.simple_request::<(), _>(Target::Sdk, SDK_INFO_PATH, None)
        .await
}

/// Fetch the full device status over the signed RPC channel.
pub async fn fetch_status(conn: &Conn) -> Result<DoorStatus> {
    conn.rpc::<(), _>(DEVICES_FETCH_PATH, None).await
}

/// Emit status snapshots until cancelled.
///
/// An initial full fetch seeds the channel; after that the loop drains
/// the message queue every few seconds and forwards every decoded status
/// broadcast. Individual fetch and poll failures are logged and the loop
/// keeps going; only cancellation ends it.
pub async fn run_status_loop(
    conn: Arc<Conn>,
    status_tx: mpsc::Sender<DoorStatus>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut broadcast_rx = conn.subscribe_status();

    match fetch_status(&conn).await {
        Ok(status) => {
            if status_tx.send(status).await.is_err() {
                return;
            }
        }
        Err(e) => warn!(error = %e, "initial status fetch failed"),
    }

    let mut ticker = interval(MESSAGE_POLL_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("status loop cancelled");
                    return;
                }
            }
            _ = ticker.tick() => {
                if let Err(e) = conn.poll_messages().await {
                    warn!(error = %e, "status message poll failed");
                }
            }
            received = broadcast_rx.recv() => {
                match received {
                    Ok(bytes) => {
                        match serde_json::from_slice::<DoorStatus>(&bytes) {
                            Ok(status) => {
                                if status_tx.send(status).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => debug!(error = %e, "undecodable status broadcast"),
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "status receiver lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        info!("status channel closed");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_is_admin() {
        let admin = DoorStatus {
            users: vec![DoorStatusUser {
                enabled: true,
                username: "admin".to_string(),
            }],
            ..Default::default()
        };
        assert!(admin.is_admin());

        let with_devices = DoorStatus {
            device_order: vec!["device1".to_string()],
            users: vec![DoorStatusUser {
                enabled: true,
                username: "user".to_string(),
            }],
            ..Default::default()
        };
        assert!(!with_devices.is_admin());

        assert!(!DoorStatus::default().is_admin());
    }

    #[test]
    fn test_get_device() {
        let status = DoorStatus {
            devices: vec![
                DoorStatusDevice {
                    id: "device1".to_string(),
                    name: "Front Door".to_string(),
                    ..Default::default()
                },
                DoorStatusDevice {
                    id: "device2".to_string(),
                    name: "Back Door".to_string(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };

        assert_eq!(status.get("device1").unwrap().name, "Front Door");
        assert_eq!(status.get("device2").unwrap().name, "Back Door");
        assert!(status.get("device3").is_none());
        assert!(status.get("").is_none());
    }

    #[test]
    fn test_status_wire_format() {
        let raw = json!({
            "deviceOrder": ["abc"],
            "devices": [{
                "deviceId": "abc",
                "screenFormat": 1,
                "name": "Garage",
                "device": {"position": 42},
                "buttons": [{
                    "action": {"base": 0, "cmd": 2},
                    "title": "Open", "icon": "open", "hide": 0, "row": 0, "col": 0
                }],
                "log": {"logId": 9, "alert": 0, "text": "opened", "time": 100}
            }],
            "users": []
        });

        let status: DoorStatus = serde_json::from_value(raw).unwrap();
        assert_eq!(status.device_order, vec!["abc"]);
        let device = status.get("abc").unwrap();
        assert_eq!(device.position(), 42);
        assert_eq!(device.buttons[0].action.command, 2);
        assert_eq!(device.log.text, "opened");
    }

    #[test]
    fn test_basic_info_wire_format() {
        let info: BasicInfo = serde_json::from_value(json!({
            "bsid": "bs01",
            "mono": 123,
            "clock": 456,
            "name": "Home",
            "version": 2
        }))
        .unwrap();
        assert_eq!(info.basestation, "bs01");
        assert_eq!(info.name, "Home");
    }
}
