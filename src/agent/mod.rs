//! Agent modules for the websocket-to-SSH relay.
//!
//! This module is organized into the following submodules:
//!
//! - `types`: identities, destination descriptors, and external DTOs
//! - `config`: configuration resolution with environment variable support
//! - `error`: failure taxonomy, relay stop reasons, retry classification
//! - `protocol`: websocket event vocabulary and wire encoding
//! - `session`: per-connection session store
//! - `client`: SSH connection, authentication, and shell channel setup
//! - `relay`: the relay worker owning one SSH session and its forwarding loop
//! - `pool`: worker registry, capacity enforcement, recycling
//! - `gate`: guard chain evaluated in front of relay commands
//! - `bridge`: auth-service and bridge-service HTTP calls
//! - `ws`: the websocket endpoint and event dispatch
//! - `http`: plain HTTP endpoints (health, init, execution hooks)
//! - `os`: OS account password rotation

pub mod bridge;
pub(crate) mod client;
pub mod config;
pub(crate) mod error;
pub mod gate;
pub mod http;
pub(crate) mod os;
pub mod pool;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod types;
pub mod ws;
