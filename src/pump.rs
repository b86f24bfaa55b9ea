// MIT License - Copyright (c) 2026 Peter Wright

use std::collections::HashMap;

use tokio::sync::{broadcast, oneshot};
use tracing::debug;

use crate::protocol::Message;

/// Capacity of the status broadcast channel. Slow subscribers lag rather
/// than blocking the pump.
const STATUS_CHANNEL_CAPACITY: usize = 64;

/// Routes decoded basestation messages to their consumers.
///
/// Replies to in-flight requests are matched by process ID against a
/// correlation table of oneshot senders, so delivery happens exactly once
/// and the pump never blocks. Messages with no process ID are status
/// broadcasts and fan out to subscribers; in-progress intermediates and
/// replies nobody is waiting for are dropped.
pub struct ReplyRouter {
    waiters: tokio::sync::Mutex<HashMap<String, oneshot::Sender<Vec<u8>>>>,
    status_tx: broadcast::Sender<Vec<u8>>,
}

impl Default for ReplyRouter {
    fn default() -> Self {
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            waiters: tokio::sync::Mutex::new(HashMap::new()),
            status_tx,
        }
    }
}

impl ReplyRouter {
    /// Register a waiter for the given process ID.
    ///
    /// Must happen before the request's HTTP response body is processed:
    /// the server is allowed to return the reply inline.
    pub async fn register(&self, process_id: &str) -> oneshot::Receiver<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.insert(process_id.to_string(), tx);
        rx
    }

    /// Drop a waiter that gave up (timeout or send failure).
    pub async fn forget(&self, process_id: &str) {
        self.waiters.lock().await.remove(process_id);
    }

    /// Subscribe to status broadcasts (decoded message bytes).
    pub fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
        self.status_tx.subscribe()
    }

    /// Route a single decoded message.
    pub async fn dispatch(&self, message: &Message, decoded: Vec<u8>) {
        if message.is_status() {
            if self.status_tx.send(decoded).is_err() {
                debug!("status message dropped: no subscribers");
            }
            return;
        }

        if message.is_intermediate() {
            debug!(
                pid = %message.process_id,
                state = message.process_state.unwrap_or_default(),
                "dropping in-progress message"
            );
            return;
        }

        match self.waiters.lock().await.remove(&message.process_id) {
            Some(tx) => {
                if tx.send(decoded).is_err() {
                    debug!(pid = %message.process_id, "waiter went away before reply");
                }
            }
            None => {
                debug!(pid = %message.process_id, "got message for unknown process id");
            }
        }
    }
}
