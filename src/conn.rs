// MIT License - Copyright (c) 2026 Peter Wright

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::{ConnConfig, Credential};
use crate::crypto::{derive_key, CbcEncrypter, HubSignature};
use crate::error::{BridgeError, Result};
use crate::protocol::{
    ConnectData, DataPayload, GenericResponse, RegisterRequest, RegisterResponse, RequestEnvelope,
    StatusReply,
};
use crate::pump::ReplyRouter;

pub const CONNECT_PATH: &str = "app/connect";
pub const MESSAGES_PATH: &str = "app/res/messages";
pub const DEVICES_FETCH_PATH: &str = "app/res/devices/fetch";
pub const ACTION_PATH: &str = "app/res/action";
pub const REQUEST_PATH: &str = "app/res/request";
pub const SDK_INFO_PATH: &str = "sdk/info";
pub const REMOTE_REGISTER_PATH: &str = "app/remoteregister";

/// Where a [`Conn::simple_request`] is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Local encrypted RPC endpoint (port 8989).
    Rpc,
    /// Local unencrypted SDK info endpoint (port 8991).
    Sdk,
    /// The online service (registration and relay).
    Remote,
}

/// Server-issued session identity plus the request scheduling cursor.
#[derive(Debug, Default)]
struct SessionState {
    session_id: String,
    session_secret: Vec<u8>,
    /// Millisecond timestamp for the next signed request. Never decreases
    /// within a session.
    next_access: i64,
    /// Per-connect prefix; the suffix makes each process ID unique.
    process_prefix: String,
    sequence_suffix: u64,
}

/// A connection to the basestation service.
///
/// One instance per basestation; all methods take `&self` and are safe to
/// call concurrently. Signing and sending of signed requests is serialized
/// by an internal mutex so `next_access` and the sequence suffix stay
/// strictly monotonic; waiting for replies happens outside that mutex so
/// concurrent RPCs interleave freely.
pub struct Conn {
    cfg: ConnConfig,
    http: reqwest::Client,
    cred: Credential,
    /// MD5 of the phone secret: the AES key.
    phone_key: Vec<u8>,
    /// Raw phone secret bytes: the phone signature HMAC key.
    phone_secret_raw: Vec<u8>,
    session: Mutex<SessionState>,
    send_lock: Mutex<()>,
    router: ReplyRouter,
}

impl Conn {
    /// Build a connection. The basestation presents a self-signed
    /// certificate, so invalid certificates are tolerated; a CA from the
    /// config is added to the trust store when configured.
    pub fn new(cfg: ConnConfig, cred: Credential) -> Result<Self> {
        let mut builder = reqwest::Client::builder().danger_accept_invalid_certs(true);
        if let Some(path) = &cfg.ca_pem_path {
            let pem = std::fs::read(path).map_err(|e| BridgeError::Credential {
                path: path.clone(),
                reason: format!("ca pem: {}", e),
            })?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        }
        let http = builder.build()?;

        let phone_key = derive_key(&cred.phone_secret);
        let phone_secret_raw = cred.phone_secret.clone().into_bytes();

        Ok(Self {
            cfg,
            http,
            cred,
            phone_key,
            phone_secret_raw,
            session: Mutex::new(SessionState::default()),
            send_lock: Mutex::new(()),
            router: ReplyRouter::default(),
        })
    }

    fn base_url(&self, target: Target) -> Result<String> {
        match target {
            Target::Rpc => Ok(format!("https://{}:{}", self.cfg.host, self.cfg.rpc_port)),
            Target::Sdk => Ok(format!("https://{}:{}", self.cfg.host, self.cfg.sdk_port)),
            Target::Remote => self
                .cfg
                .remote_url
                .clone()
                .ok_or(BridgeError::NoRemoteTarget),
        }
    }

    fn user_agent(&self) -> String {
        format!("sddAndroid-{}-LGE Nexus 5X(28)", self.cfg.version)
    }

    async fn post(&self, url: &str, path: &str, body: Vec<u8>) -> Result<Vec<u8>> {
        if self.cfg.debug {
            debug!(url, body = %String::from_utf8_lossy(&body), "sending");
        }
        let response = self
            .http
            .post(url)
            .header("User-Agent", self.user_agent())
            .header("Content-Type", "application/json")
            .header("version", &self.cfg.version)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let bytes = response.bytes().await?;
        if self.cfg.debug {
            debug!(code = status.as_u16(), body = %String::from_utf8_lossy(&bytes), "got raw response");
        }
        if !status.is_success() {
            return Err(BridgeError::ProtocolStatus {
                path: path.to_string(),
                status: status.as_u16(),
                len: bytes.len(),
            });
        }
        Ok(bytes.to_vec())
    }

    /// POST an envelope, parse the response envelope, and pump any
    /// piggy-backed messages through the reply router.
    async fn dispatch(
        &self,
        target: Target,
        url_part: &str,
        envelope: &RequestEnvelope,
    ) -> Result<GenericResponse> {
        let url = format!(
            "{}/{}",
            self.base_url(target)?,
            url_part.trim_start_matches('/')
        );
        let body = serde_json::to_vec(envelope)?;
        let bytes = self.post(&url, url_part, body).await?;

        let response: GenericResponse = serde_json::from_slice(&bytes)?;
        for message in response.messages()? {
            let decoded = message.payload.read_data(&self.phone_key)?;
            if self.cfg.debug {
                debug!(pid = %message.process_id, body = %String::from_utf8_lossy(&decoded), "got message");
            }
            self.router.dispatch(&message, decoded).await;
        }

        if !response.message.is_empty() {
            return Err(BridgeError::ServerMessage(response.message.clone()));
        }
        Ok(response)
    }

    /// An unsigned, target-routed request. The body is the bare input
    /// JSON and the response body is parsed directly as the output.
    pub async fn simple_request<I, O>(&self, target: Target, path: &str, input: Option<&I>) -> Result<O>
    where
        I: Serialize,
        O: DeserializeOwned,
    {
        let url = format!("{}/{}", self.base_url(target)?, path.trim_start_matches('/'));
        let body = match input {
            Some(input) => serde_json::to_vec(input)?,
            None => b"{}".to_vec(),
        };
        let bytes = self.post(&url, path, body).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Register against the online service. No session required.
    pub async fn remote_register(&self, request: &RegisterRequest) -> Result<RegisterResponse> {
        self.simple_request(Target::Remote, REMOTE_REGISTER_PATH, Some(request))
            .await
    }

    /// Pass credentials to the basestation and set up session secrets.
    ///
    /// The encrypted connect payload carries `userAccess.nextAccess`,
    /// which seeds the session's scheduling cursor.
    pub async fn connect(&self) -> Result<()> {
        if self.cred.phone_secret.is_empty() {
            return Err(BridgeError::Credential {
                path: String::new(),
                reason: "missing phoneSecret".to_string(),
            });
        }

        {
            let mut session = self.session.lock().await;
            let now = Utc::now();
            session.process_prefix =
                format!("{}-E-{}", now.timestamp(), now.timestamp_subsec_nanos());
            session.sequence_suffix = 0;
            session.session_id.clear();
            session.session_secret.clear();
        }

        let envelope = RequestEnvelope {
            basestation: self.cred.bsid.clone(),
            phone: self.cred.phone.clone(),
            phone_password: self.cred.phone_password.clone(),
            user_password: self.cred.user_password.clone(),
            communication_type: 3, // 1 and 3 are valid
            path: CONNECT_PATH.to_string(),
            ..Default::default()
        };

        let response = self.dispatch(Target::Rpc, CONNECT_PATH, &envelope).await?;
        if response.payload.data.is_empty() {
            return Err(BridgeError::EmptyPayload);
        }
        let data: ConnectData = response.payload.decode(&self.phone_key)?;

        let mut session = self.session.lock().await;
        session.session_id = response.session_id;
        session.session_secret = response.session_secret.into_bytes();
        session.next_access = data.user_access.next_access;
        Ok(())
    }

    /// Construct a signed envelope for `path` carrying `data`.
    ///
    /// The scheduling timestamp, the envelope time and the HMAC `t`
    /// component are all the same value, and that value strictly
    /// increases across requests; the sequence suffix makes the process
    /// ID unique. Returns the envelope, the URL segment to POST to, and
    /// the process ID.
    async fn build_signed(
        &self,
        path: &str,
        data: &[u8],
        request_if_online: bool,
    ) -> Result<(RequestEnvelope, String, String)> {
        let mut session = self.session.lock().await;
        if session.session_id.is_empty() {
            return Err(BridgeError::NotConnected);
        }

        let now = Utc::now().timestamp_millis();
        session.next_access = session.next_access.max(now) + 1000;
        let t = session.next_access;
        session.sequence_suffix += 1;
        let process_id = format!("{}-{}", session.process_prefix, session.sequence_suffix);

        let mut cipher = CbcEncrypter::new(&self.phone_key, t)?;
        let enc_data = BASE64.encode(cipher.encrypt(data));
        let session_sig = HubSignature::new(session.session_secret.clone()).sign(t, &enc_data);
        let phone_sig = HubSignature::new(self.phone_secret_raw.clone()).sign(t, &enc_data);

        let mut envelope = RequestEnvelope {
            basestation: self.cred.bsid.clone(),
            session_id: session.session_id.clone(),
            process_id: process_id.clone(),
            session_sig,
            phone_sig,
            path: path.to_string(),
            payload: DataPayload {
                is_encrypted: true,
                time: t,
                data: enc_data,
            },
            ..Default::default()
        };

        // Online mode wraps local commands via the relay endpoint, which
        // needs the real path inside the envelope. Direct requests carry
        // the path in the URL instead.
        let url_part = if self.cfg.request_mode && request_if_online {
            REQUEST_PATH.to_string()
        } else {
            let part = envelope.path.clone();
            envelope.path = String::new();
            part
        };

        debug!(path, pid = %process_id, "generated signed request");
        Ok((envelope, url_part, process_id))
    }

    /// Issue a signed RPC and wait for its correlated reply.
    ///
    /// The reply may arrive inline in the HTTP response or out-of-band on
    /// a later message poll; the caller drives polling itself while it
    /// waits, on a widening schedule, up to the configured deadline.
    pub async fn rpc<I, O>(&self, path: &str, input: Option<&I>) -> Result<O>
    where
        I: Serialize,
        O: DeserializeOwned,
    {
        let data = match input {
            Some(input) => serde_json::to_vec(input)?,
            None => Vec::new(),
        };
        let bytes = self.rpc_raw(path, &data).await?;

        // Replies report failures as {code, description}; anything else
        // parses as the zero default.
        let status: StatusReply = serde_json::from_slice(&bytes).unwrap_or_default();
        if status.code != 0 {
            return Err(BridgeError::Server {
                path: path.to_string(),
                code: status.code,
                description: status.description,
            });
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn rpc_raw(&self, path: &str, data: &[u8]) -> Result<Vec<u8>> {
        let (mut rx, process_id) = {
            let _guard = self.send_lock.lock().await;
            let (envelope, url_part, process_id) = self.build_signed(path, data, true).await?;
            // Register before the response body is processed: the reply
            // may come back inline.
            let rx = self.router.register(&process_id).await;
            if let Err(e) = self.dispatch(Target::Rpc, &url_part, &envelope).await {
                self.router.forget(&process_id).await;
                return Err(e);
            }
            (rx, process_id)
        };

        let deadline = tokio::time::Instant::now() + self.cfg.rpc_timeout;
        let mut poll = 0usize;
        loop {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                self.router.forget(&process_id).await;
                return Err(BridgeError::Timeout);
            }
            let wait = poll_delay(poll).min(deadline - now);

            match tokio::time::timeout(wait, &mut rx).await {
                Ok(Ok(bytes)) => return Ok(bytes),
                Ok(Err(_)) => return Err(BridgeError::ChannelClosed),
                Err(_) => {
                    poll += 1;
                    if let Err(e) = self.poll_messages().await {
                        warn!(path, error = %e, "message poll failed while waiting for reply");
                    }
                }
            }
        }
    }

    /// Drain the server-side message queue.
    ///
    /// Any returned messages are routed by the pump: correlated replies
    /// complete their waiting RPCs, status broadcasts reach the status
    /// subscribers.
    pub async fn poll_messages(&self) -> Result<()> {
        let _guard = self.send_lock.lock().await;
        let (envelope, url_part, _process_id) =
            self.build_signed(MESSAGES_PATH, &[], false).await?;
        self.dispatch(Target::Rpc, &url_part, &envelope).await?;
        Ok(())
    }

    /// Subscribe to decoded status broadcasts.
    pub fn subscribe_status(&self) -> tokio::sync::broadcast::Receiver<Vec<u8>> {
        self.router.subscribe()
    }
}

/// Reply poll schedule: a fast first check, then a widening back-off.
fn poll_delay(poll: usize) -> Duration {
    match poll {
        0 => Duration::from_millis(350),
        1 => Duration::from_secs(1),
        2 => Duration::from_secs(2),
        _ => Duration::from_secs(5),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CbcDecrypter;

    fn test_conn() -> Conn {
        let cfg = ConnConfig::builder().host("192.168.3.205").build();
        let cred = Credential {
            phone_secret: "AjXEy8OcGOrwwEdQ".to_string(),
            bsid: "bs01".to_string(),
            phone: "phone01".to_string(),
            phone_password: "pp".to_string(),
            user_password: "up".to_string(),
        };
        Conn::new(cfg, cred).unwrap()
    }

    async fn seed_session(conn: &Conn, next_access: i64) {
        let mut session = conn.session.lock().await;
        session.session_id = "sess01".to_string();
        session.session_secret = b"GznHzaWnOwrQx3KJA3U8Ly".to_vec();
        session.next_access = next_access;
        session.process_prefix = "1520743556-E-9".to_string();
        session.sequence_suffix = 0;
    }

    #[test]
    fn test_target_urls() {
        let conn = test_conn();
        assert_eq!(
            conn.base_url(Target::Rpc).unwrap(),
            "https://192.168.3.205:8989"
        );
        assert_eq!(
            conn.base_url(Target::Sdk).unwrap(),
            "https://192.168.3.205:8991"
        );
        assert!(matches!(
            conn.base_url(Target::Remote),
            Err(BridgeError::NoRemoteTarget)
        ));
    }

    #[test]
    fn test_user_agent_identifies_mobile_client() {
        let conn = test_conn();
        assert_eq!(conn.user_agent(), "sddAndroid-2.21.1-LGE Nexus 5X(28)");
    }

    #[tokio::test]
    async fn test_signed_request_requires_session() {
        let conn = test_conn();
        let err = conn.build_signed(ACTION_PATH, b"{}", true).await.unwrap_err();
        assert!(matches!(err, BridgeError::NotConnected));
    }

    #[tokio::test]
    async fn test_next_access_and_suffix_monotonic() {
        let conn = test_conn();
        seed_session(&conn, 0).await;

        let mut last_time = 0;
        let mut pids = std::collections::HashSet::new();
        for n in 1..=5u64 {
            let (envelope, _, pid) = conn.build_signed(ACTION_PATH, b"{}", true).await.unwrap();
            assert!(envelope.payload.time > last_time, "time must strictly increase");
            last_time = envelope.payload.time;
            assert_eq!(pid, format!("1520743556-E-9-{}", n));
            assert!(pids.insert(pid), "process ids must be unique");
        }
    }

    #[tokio::test]
    async fn test_next_access_respects_future_cursor() {
        let conn = test_conn();
        // A cursor far in the future wins over the wall clock and still
        // gets bumped by at least a second per request.
        let future = Utc::now().timestamp_millis() + 10_000_000;
        seed_session(&conn, future).await;

        let (first, _, _) = conn.build_signed(ACTION_PATH, b"{}", true).await.unwrap();
        assert_eq!(first.payload.time, future + 1000);
        let (second, _, _) = conn.build_signed(ACTION_PATH, b"{}", true).await.unwrap();
        assert_eq!(second.payload.time, future + 2000);
    }

    #[tokio::test]
    async fn test_signatures_and_payload_agree_on_time() {
        let conn = test_conn();
        seed_session(&conn, 0).await;

        let input = br#"{"deviceId":"abc"}"#;
        let (envelope, _, _) = conn.build_signed(ACTION_PATH, input, true).await.unwrap();
        let t = envelope.payload.time;

        // Both signatures recompute from (t, data) alone.
        let session_sig =
            HubSignature::new(b"GznHzaWnOwrQx3KJA3U8Ly".to_vec()).sign(t, &envelope.payload.data);
        let phone_sig =
            HubSignature::new(b"AjXEy8OcGOrwwEdQ".to_vec()).sign(t, &envelope.payload.data);
        assert_eq!(envelope.session_sig, session_sig);
        assert_eq!(envelope.phone_sig, phone_sig);

        // And the ciphertext decrypts with the same t as the IV basis.
        let cipher_bytes = BASE64.decode(&envelope.payload.data).unwrap();
        let mut cipher = CbcDecrypter::new(&conn.phone_key, t).unwrap();
        assert_eq!(cipher.decrypt(&cipher_bytes).unwrap(), input);
    }

    #[tokio::test]
    async fn test_signed_envelope_omits_passwords() {
        let conn = test_conn();
        seed_session(&conn, 0).await;

        let (envelope, _, _) = conn.build_signed(ACTION_PATH, b"{}", true).await.unwrap();
        assert_eq!(envelope.basestation, "bs01");
        assert!(envelope.phone.is_empty());
        assert!(envelope.phone_password.is_empty());
        assert!(envelope.user_password.is_empty());
    }

    #[tokio::test]
    async fn test_direct_routing_clears_inner_path() {
        let conn = test_conn();
        seed_session(&conn, 0).await;

        let (envelope, url_part, _) = conn.build_signed(ACTION_PATH, b"{}", true).await.unwrap();
        assert_eq!(url_part, ACTION_PATH);
        assert!(envelope.path.is_empty());
    }

    #[tokio::test]
    async fn test_request_mode_wraps_through_relay() {
        let cfg = ConnConfig::builder()
            .host("example")
            .request_mode(true)
            .build();
        let cred = Credential {
            phone_secret: "AjXEy8OcGOrwwEdQ".to_string(),
            ..Default::default()
        };
        let conn = Conn::new(cfg, cred).unwrap();
        seed_session(&conn, 0).await;

        let (envelope, url_part, _) = conn.build_signed(ACTION_PATH, b"{}", true).await.unwrap();
        assert_eq!(url_part, REQUEST_PATH);
        assert_eq!(envelope.path, ACTION_PATH);

        // Message polls are never relayed.
        let (envelope, url_part, _) =
            conn.build_signed(MESSAGES_PATH, b"", false).await.unwrap();
        assert_eq!(url_part, MESSAGES_PATH);
        assert!(envelope.path.is_empty());
    }

    #[test]
    fn test_poll_schedule_widens() {
        assert_eq!(poll_delay(0), Duration::from_millis(350));
        assert_eq!(poll_delay(1), Duration::from_secs(1));
        assert_eq!(poll_delay(2), Duration::from_secs(2));
        assert_eq!(poll_delay(3), Duration::from_secs(5));
        assert_eq!(poll_delay(9), Duration::from_secs(5));
    }
}
