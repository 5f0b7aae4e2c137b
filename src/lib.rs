//! termgate: a per-machine agent that lets a browser open an interactive
//! shell to the local SSH server through a websocket tunnel, brokered by a
//! remote bridge/authentication service.

pub mod agent;
