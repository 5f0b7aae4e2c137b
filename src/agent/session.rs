//! DashMap-based per-connection session store.
//!
//! Each live websocket connection owns one entry of string-keyed JSON values
//! (client address, auth claims, bound worker id). Outbound event senders are
//! kept in a second map so liveness checks and event delivery need no access
//! to the value state.

use std::collections::HashMap;

use chrono::Utc;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;

use crate::agent::protocol::OutboundEvent;

/// Session key holding the client address
pub(crate) const KEY_IP: &str = "ip";

/// Session key holding the connection timestamp
pub(crate) const KEY_CONNECTED_AT: &str = "connected_at";

/// Session key flagging a validated token
pub(crate) const KEY_VALID: &str = "valid";

/// Session key holding the id of the bound relay worker
pub(crate) const KEY_WORKER_ID: &str = "worker_id";

/// Concurrent store of per-connection state.
///
/// Uses two `DashMap` instances:
/// - Value state: conn_id -> HashMap<key, JSON value>
/// - Senders: conn_id -> outbound event channel for that connection
pub struct SessionStore {
    values: DashMap<String, HashMap<String, Value>>,
    senders: DashMap<String, UnboundedSender<OutboundEvent>>,
}

impl SessionStore {
    /// Create a new session store instance.
    pub fn new() -> Self {
        Self {
            values: DashMap::new(),
            senders: DashMap::new(),
        }
    }

    /// Register a fresh connection: its outbound sender plus the initial
    /// client-address state.
    pub fn open(&self, conn_id: &str, ip: &str, tx: UnboundedSender<OutboundEvent>) {
        self.senders.insert(conn_id.to_string(), tx);
        self.update(
            conn_id,
            HashMap::from([
                (KEY_IP.to_string(), Value::String(ip.to_string())),
                (
                    KEY_CONNECTED_AT.to_string(),
                    Value::String(Utc::now().to_rfc3339()),
                ),
            ]),
        );
    }

    /// Fetch one value; absent if the connection id is unknown.
    pub fn get(&self, conn_id: &str, key: &str) -> Option<Value> {
        self.values
            .get(conn_id)
            .and_then(|entry| entry.get(key).cloned())
    }

    /// Merge `partial` into the connection's state, creating the entry if
    /// absent. Existing keys not named in `partial` survive. Returns the
    /// merged state.
    pub fn update(
        &self,
        conn_id: &str,
        partial: HashMap<String, Value>,
    ) -> HashMap<String, Value> {
        let mut entry = self.values.entry(conn_id.to_string()).or_default();
        entry.extend(partial);
        entry.clone()
    }

    /// Drop every key not listed in `keep`. No-op for unknown connections.
    pub fn clear(&self, conn_id: &str, keep: &[&str]) {
        if let Some(mut entry) = self.values.get_mut(conn_id) {
            entry.retain(|key, _| keep.contains(&key.as_str()));
        }
    }

    /// Whether the connection's outbound channel is still open.
    pub fn is_connected(&self, conn_id: &str) -> bool {
        self.senders
            .get(conn_id)
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }

    /// Queue an event for the connection's writer task. Returns false if the
    /// connection is unknown or its channel already closed.
    pub fn send(&self, conn_id: &str, event: OutboundEvent) -> bool {
        match self.senders.get(conn_id) {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Whether the connection holds a validated token.
    pub fn is_valid(&self, conn_id: &str) -> bool {
        matches!(self.get(conn_id, KEY_VALID), Some(Value::Bool(true)))
    }

    /// Forget the connection entirely.
    pub fn remove(&self, conn_id: &str) {
        self.values.remove(conn_id);
        self.senders.remove(conn_id);
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Global session store instance.
pub static SESSION_STORE: Lazy<SessionStore> = Lazy::new(SessionStore::new);
