// MIT License - Copyright (c) 2026 Peter Wright

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// Default app version reported to the basestation.
pub const DEFAULT_VERSION: &str = "2.21.1";

/// Local encrypted RPC endpoint port.
pub const DEFAULT_RPC_PORT: u16 = 8989;

/// Local unencrypted SDK info endpoint port.
pub const DEFAULT_SDK_PORT: u16 = 8991;

/// Login/connect credential material, provisioned during registration and
/// loaded once at startup. Read-only thereafter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Credential {
    #[serde(rename = "phoneSecret", default)]
    pub phone_secret: String,
    #[serde(default)]
    pub bsid: String,
    #[serde(rename = "phoneId", default)]
    pub phone: String,
    #[serde(rename = "phonePassword", default)]
    pub phone_password: String,
    #[serde(rename = "userPassword", default)]
    pub user_password: String,
}

/// Load a credential file produced by the registration utility.
///
/// The phone secret must be present: without it no signed request can be
/// constructed.
pub fn load_credential(path: impl AsRef<Path>) -> Result<Credential> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|e| BridgeError::Credential {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let cred: Credential =
        serde_json::from_str(&text).map_err(|e| BridgeError::Credential {
            path: path.display().to_string(),
            reason: format!("parse: {}", e),
        })?;
    if cred.phone_secret.is_empty() {
        return Err(BridgeError::Credential {
            path: path.display().to_string(),
            reason: "missing phoneSecret".to_string(),
        });
    }
    Ok(cred)
}

/// Configuration for a basestation connection.
#[derive(Debug, Clone)]
pub struct ConnConfig {
    /// Basestation hostname or IP on the local network.
    pub host: String,
    /// App version reported in headers.
    pub version: String,
    /// Local encrypted RPC port (default: 8989).
    pub rpc_port: u16,
    /// Local SDK info port (default: 8991).
    pub sdk_port: u16,
    /// Base URL for the online service (registration and relay), if any.
    pub remote_url: Option<String>,
    /// Route local commands through the `/app/res/request` relay wrapper.
    pub request_mode: bool,
    /// Extra CA certificate (PEM) trusted in addition to the insecure
    /// device tolerance.
    pub ca_pem_path: Option<String>,
    /// Hard deadline for a signed RPC reply.
    pub rpc_timeout: Duration,
    /// Whether to log raw request/response bodies.
    pub debug: bool,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            version: DEFAULT_VERSION.to_string(),
            rpc_port: DEFAULT_RPC_PORT,
            sdk_port: DEFAULT_SDK_PORT,
            remote_url: None,
            request_mode: false,
            ca_pem_path: None,
            rpc_timeout: Duration::from_secs(20),
            debug: false,
        }
    }
}

impl ConnConfig {
    pub fn builder() -> ConnConfigBuilder {
        ConnConfigBuilder::default()
    }
}

/// Builder for [`ConnConfig`].
#[derive(Debug, Clone, Default)]
pub struct ConnConfigBuilder {
    config: ConnConfig,
}

impl ConnConfigBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.config.version = version.into();
        self
    }

    pub fn rpc_port(mut self, port: u16) -> Self {
        self.config.rpc_port = port;
        self
    }

    pub fn sdk_port(mut self, port: u16) -> Self {
        self.config.sdk_port = port;
        self
    }

    pub fn remote_url(mut self, url: impl Into<String>) -> Self {
        self.config.remote_url = Some(url.into());
        self
    }

    pub fn request_mode(mut self, request_mode: bool) -> Self {
        self.config.request_mode = request_mode;
        self
    }

    pub fn ca_pem_path(mut self, path: impl Into<String>) -> Self {
        self.config.ca_pem_path = Some(path.into());
        self
    }

    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.config.rpc_timeout = timeout;
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.config.debug = debug;
        self
    }

    pub fn build(self) -> ConnConfig {
        self.config
    }
}
