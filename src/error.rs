// MIT License - Copyright (c) 2026 Peter Wright

/// All errors that can occur in the smartdoor-bridge library.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("credential file {path}: {reason}")]
    Credential { path: String, reason: String },

    #[error("not connected")]
    NotConnected,

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("non-2xx status code for {path}: {status} (len={len})")]
    ProtocolStatus { path: String, status: u16, len: usize },

    #[error("cipher init failed: {0}")]
    CryptoInit(String),

    #[error("crypto decode failed: {0}")]
    CryptoDecode(String),

    #[error("no data to unmarshal from payload")]
    EmptyPayload,

    #[error("unmarshal failed: {0}")]
    Unmarshal(#[from] serde_json::Error),

    /// The server rejected a decoded RPC reply with a nonzero status code.
    #[error("server error for {path}: code={code} ({description})")]
    Server {
        path: String,
        code: i32,
        description: String,
    },

    /// The response envelope itself carried an error message.
    #[error("got error message: {0}")]
    ServerMessage(String),

    #[error("timeout waiting for reply")]
    Timeout,

    #[error("reply channel closed")]
    ChannelClosed,

    #[error("remote target not configured")]
    NoRemoteTarget,

    #[error("mqtt publish to {topic} failed: {reason}")]
    BusPublish { topic: String, reason: String },

    #[error("mqtt subscribe to {topic} failed: {reason}")]
    BusSubscribe { topic: String, reason: String },

    #[error("mqtt broker rejected credentials: {0}")]
    BusAuth(String),

    #[error("mqtt broker unreachable: {0}")]
    BusConnect(String),

    #[error("illegal transition {event} from state {from}")]
    IllegalTransition {
        event: &'static str,
        from: &'static str,
    },

    #[error("unknown device: {0}")]
    UnknownDevice(String),

    #[error("unknown command: {0}")]
    UnknownCommand(String),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
