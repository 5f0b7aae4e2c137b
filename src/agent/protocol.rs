//! Websocket event protocol.
//!
//! Control events travel as JSON text envelopes `{"event": NAME, "data": ...}`.
//! Terminal byte streams travel as raw binary frames so arbitrary pty output
//! survives untouched: an inbound binary frame carries keystrokes, an outbound
//! binary frame carries remote shell output.

use poem::web::websocket::Message;
use serde_json::{Value, json};
use thiserror::Error;

/// Payload tag on disconnect notices.
pub(crate) const SSH_DOWN_TYPE: &str = "ssh closed";

/// Category tag carried in `ERROR` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Auth,
    Unknown,
    MissingField,
    Common,
    Ssh,
    InitNeeded,
}

impl ErrorKind {
    pub(crate) fn tag(self) -> &'static str {
        match self {
            ErrorKind::Auth => "auth",
            ErrorKind::Unknown => "unknown",
            ErrorKind::MissingField => "missing field",
            ErrorKind::Common => "common",
            ErrorKind::Ssh => "ssh",
            ErrorKind::InitNeeded => "InitNeeded",
        }
    }
}

/// Events the browser sends to the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Authenticate { token: String },
    SshConnect,
    /// Raw keystrokes for the remote shell
    Ssh(Vec<u8>),
    SshResize { cols: u32, rows: u32 },
}

/// Events the agent sends to the browser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundEvent {
    /// Plain informational string (e.g. the connection ack)
    Message(String),
    Error { kind: ErrorKind, message: String },
    /// Acknowledges a successful `AUTHENTICATE`
    AuthenticateAck(String),
    /// Raw bytes from the remote pty
    SshRelay(Vec<u8>),
    /// Relay loop terminated; carries the disconnect reason
    SshDown { message: String },
}

impl OutboundEvent {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        OutboundEvent::Error {
            kind,
            message: message.into(),
        }
    }

    pub fn ssh_down(message: impl Into<String>) -> Self {
        OutboundEvent::SshDown {
            message: message.into(),
        }
    }
}

/// Why an inbound frame could not be turned into an event.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Unknown event `{0}`")]
    UnknownEvent(String),

    /// Display matches the user-facing message verbatim
    #[error("`{0}` is missing")]
    MissingField(String),
}

impl DecodeError {
    /// The `ERROR` tag a failed decode is reported under.
    pub(crate) fn kind(&self) -> ErrorKind {
        match self {
            DecodeError::Malformed(_) => ErrorKind::Common,
            DecodeError::UnknownEvent(_) => ErrorKind::Unknown,
            DecodeError::MissingField(_) => ErrorKind::MissingField,
        }
    }
}

/// Serialize an outbound event into a websocket frame.
pub fn encode_frame(event: OutboundEvent) -> Message {
    match event {
        OutboundEvent::SshRelay(bytes) => Message::binary(bytes),
        OutboundEvent::Message(text) => envelope("MESSAGE", json!(text)),
        OutboundEvent::AuthenticateAck(text) => envelope("AUTHENTICATE", json!(text)),
        OutboundEvent::Error { kind, message } => envelope(
            "ERROR",
            json!({"type": kind.tag(), "message": message}),
        ),
        OutboundEvent::SshDown { message } => envelope(
            "SSH_DOWN",
            json!({"type": SSH_DOWN_TYPE, "message": message}),
        ),
    }
}

fn envelope(event: &str, data: Value) -> Message {
    Message::text(json!({"event": event, "data": data}).to_string())
}

/// Parse an inbound websocket frame into an event.
///
/// Ping/Pong/Close frames belong to the transport and are handled before this
/// point; they decode as malformed here.
pub fn decode_frame(msg: Message) -> Result<InboundEvent, DecodeError> {
    match msg {
        Message::Binary(bytes) => Ok(InboundEvent::Ssh(bytes)),
        Message::Text(text) => decode_text(&text),
        other => Err(DecodeError::Malformed(format!(
            "unsupported frame: {other:?}"
        ))),
    }
}

fn decode_text(text: &str) -> Result<InboundEvent, DecodeError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    let event = value
        .get("event")
        .and_then(Value::as_str)
        .ok_or_else(|| DecodeError::Malformed("frame has no event name".to_string()))?;
    let data = value.get("data").cloned().unwrap_or(Value::Null);

    match event {
        "AUTHENTICATE" => {
            let token = data
                .get("token")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| DecodeError::MissingField("token".to_string()))?;
            Ok(InboundEvent::Authenticate { token })
        }
        "SSH_CONNECT" => Ok(InboundEvent::SshConnect),
        // Keystrokes normally arrive as binary frames; a text variant with a
        // string payload is accepted for clients that cannot send binary.
        "SSH" => {
            let keys = data
                .as_str()
                .ok_or_else(|| DecodeError::MissingField("data".to_string()))?;
            Ok(InboundEvent::Ssh(keys.as_bytes().to_vec()))
        }
        "SSH_RESIZE" => {
            let cols = data
                .get("cols")
                .and_then(Value::as_u64)
                .ok_or_else(|| DecodeError::MissingField("cols".to_string()))?;
            let rows = data
                .get("rows")
                .and_then(Value::as_u64)
                .ok_or_else(|| DecodeError::MissingField("rows".to_string()))?;
            Ok(InboundEvent::SshResize {
                cols: cols as u32,
                rows: rows as u32,
            })
        }
        name => Err(DecodeError::UnknownEvent(name.to_string())),
    }
}
