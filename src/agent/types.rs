//! Core identity and destination types shared across the agent.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// An authenticated user as seen from one client address.
///
/// The fingerprint keys capacity accounting: every live SSH session is
/// attributed to exactly one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// User id issued by the bridge service
    pub id: i64,
    /// Client address the websocket arrived from
    pub ip: String,
}

impl Identity {
    /// Stable hex digest over the identity fields.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("{}{}", self.id, self.ip));
        hex::encode(hasher.finalize())
    }
}

/// Everything that makes one SSH target distinct from another.
///
/// Two connections with equal descriptors share a pool slot; any differing
/// field forces a separate worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub identity: Identity,
    /// Source address of the websocket client
    pub src: String,
    /// Host the SSH session dials
    pub dest: String,
    /// Account name on the SSH server
    pub ssh_user: String,
    pub port: u16,
}

impl Destination {
    /// Stable hex digest keying the pool registry.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!(
            "{}{}{}{}{}",
            self.identity.fingerprint(),
            self.src,
            self.dest,
            self.ssh_user,
            self.port
        ));
        hex::encode(hasher.finalize())
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<Destination {}, {} to {}@{}:{}>",
            self.identity.id, self.src, self.ssh_user, self.dest, self.port
        )
    }
}

/// Token verdict returned by the bridge auth endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthClaims {
    #[serde(rename = "userId")]
    pub user_id: i64,
    pub email: String,
    /// Issue timestamp, relayed opaquely
    #[serde(rename = "issuedAt")]
    pub issued_at: String,
    /// Expiry timestamp, relayed opaquely
    #[serde(rename = "expiredAt")]
    pub expired_at: String,
    pub valid: bool,
}

/// SSH credentials for the local container, issued by the bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub cont_user: String,
    pub cont_auth_type: String,
    pub cont_auth: String,
}
