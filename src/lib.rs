// MIT License - Copyright (c) 2026 Peter Wright
//
//! # smartdoor-bridge
//!
//! Talks to a SmartDoor garage-door basestation over its local encrypted
//! HTTPS protocol and bridges it onto an MQTT bus.
//!
//! The library owns the session-oriented RPC client (encrypted, signed,
//! timestamp-coordinated requests with asynchronous reply correlation
//! over a message poll), a per-device cover state machine, and the MQTT
//! adaptation layer used by the `smartdoor2mqtt` binary.
//!
//! ## Quick start
//!
//! ```no_run
//! use smartdoor_bridge::{load_credential, Conn, ConnConfig};
//! use smartdoor_bridge::status::{fetch_basic_info, fetch_status};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cred = load_credential("creds.json")?;
//!     let config = ConnConfig::builder().host("192.168.3.205").build();
//!
//!     let conn = Conn::new(config, cred)?;
//!     let info = fetch_basic_info(&conn).await?;
//!     println!("basestation: {}", info.basestation);
//!
//!     conn.connect().await?;
//!     let status = fetch_status(&conn).await?;
//!     for device in &status.devices {
//!         println!("{}: position {}", device.name, device.position());
//!     }
//!     Ok(())
//! }
//! ```

pub mod commands;
pub mod config;
pub mod conn;
pub mod crypto;
pub mod error;
pub mod fsm;
pub mod mqtt;
pub mod protocol;
pub mod pump;
pub mod status;

// Re-exports for convenience
pub use commands::{command_for_position, command_for_ratio, parse_command, Command};
pub use config::{load_credential, ConnConfig, ConnConfigBuilder, Credential};
pub use conn::{Conn, Target};
pub use error::{BridgeError, Result};
pub use fsm::{CoverEvent, CoverState, DeviceFsm, DeviceRegistry};
pub use protocol::{DataPayload, Message};
pub use status::{BasicInfo, DoorStatus, DoorStatusDevice};
