//! Websocket relay endpoint.
//!
//! One session task per connection: it owns the inbound dispatch loop, while
//! a writer task owns the sink so relayed pty bytes and control events
//! interleave without tearing frames. Outbound traffic from anywhere (the
//! dispatcher, the relay worker's forwarding loop) funnels through one
//! unbounded queue per connection.

use std::collections::HashMap;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use poem::web::websocket::{Message, WebSocket, WebSocketStream};
use poem::web::{Data, RemoteAddr};
use poem::{IntoResponse, handler};
use serde_json::{Value, json};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::bridge::BridgeApi;
use crate::agent::config::{
    AgentState, resolve_max_connections, resolve_ssh_host, resolve_ssh_port,
};
use crate::agent::error::REASON_WS_DISCONNECTED;
use crate::agent::gate::{GateChain, GateContext};
use crate::agent::pool::WORKER_POOL;
use crate::agent::protocol::{ErrorKind, InboundEvent, OutboundEvent, decode_frame, encode_frame};
use crate::agent::relay::RelayWorker;
use crate::agent::session::{KEY_IP, KEY_WORKER_ID, SESSION_STORE};
use crate::agent::types::{AuthClaims, Destination, Identity};

/// Session key carrying the authenticated user id.
const KEY_USER_ID: &str = "userId";

/// `GET /ssh` websocket upgrade.
#[handler]
pub async fn ssh_upgrade(
    ws: WebSocket,
    state: Data<&Arc<AgentState>>,
    bridge: Data<&Arc<dyn BridgeApi>>,
    remote: &RemoteAddr,
) -> impl IntoResponse {
    let state = state.0.clone();
    let bridge = bridge.0.clone();
    let ip = client_ip(remote);
    ws.on_upgrade(move |socket| run_session(socket, state, bridge, ip))
}

fn client_ip(remote: &RemoteAddr) -> String {
    remote
        .as_socket_addr()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| remote.to_string())
}

async fn run_session(
    socket: WebSocketStream,
    state: Arc<AgentState>,
    bridge: Arc<dyn BridgeApi>,
    ip: String,
) {
    let conn_id = Uuid::new_v4().to_string();
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<OutboundEvent>();

    SESSION_STORE.open(&conn_id, &ip, tx.clone());
    info!(conn_id, ip, "websocket connected");

    // Exits when the socket dies or every sender (session, store, worker)
    // is gone
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if sink.send(encode_frame(event)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut session = WsSession {
        conn_id,
        ip,
        state,
        bridge,
        tx,
        connect_gates: GateChain::new().with_init().with_auth(),
        relay_gates: GateChain::new().with_auth(),
        worker: None,
    };
    session.emit(OutboundEvent::Message("connected".to_string()));

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
            other => session.dispatch(other).await,
        }
    }

    session.finish().await;
}

/// Per-connection dispatcher state.
struct WsSession {
    conn_id: String,
    ip: String,
    state: Arc<AgentState>,
    bridge: Arc<dyn BridgeApi>,
    tx: UnboundedSender<OutboundEvent>,
    /// Full chain for `SSH_CONNECT`
    connect_gates: GateChain,
    /// Auth-only chain for keystrokes and resizes
    relay_gates: GateChain,
    worker: Option<Arc<RelayWorker>>,
}

impl WsSession {
    async fn dispatch(&mut self, msg: Message) {
        match decode_frame(msg) {
            Ok(InboundEvent::Authenticate { token }) => self.authenticate(&token).await,
            Ok(InboundEvent::SshConnect) => self.ssh_connect().await,
            Ok(InboundEvent::Ssh(bytes)) => self.forward(&bytes).await,
            Ok(InboundEvent::SshResize { cols, rows }) => self.resize(cols, rows).await,
            Err(e) => {
                debug!(conn_id = %self.conn_id, error = %e, "frame rejected");
                self.emit(OutboundEvent::error(e.kind(), e.to_string()));
            }
        }
    }

    async fn authenticate(&mut self, token: &str) {
        match self.bridge.validate_token(token).await {
            Ok(claims) if claims.valid => {
                SESSION_STORE.update(&self.conn_id, claims_map(&claims));
                info!(conn_id = %self.conn_id, user_id = claims.user_id, "token accepted");
                self.emit(OutboundEvent::AuthenticateAck("Authenticated".to_string()));
            }
            Ok(_) => {
                SESSION_STORE.clear(&self.conn_id, &[KEY_IP]);
                self.emit(OutboundEvent::error(ErrorKind::Auth, "Invalid token"));
            }
            Err(e) => {
                warn!(conn_id = %self.conn_id, error = %e, "auth service unavailable");
                SESSION_STORE.clear(&self.conn_id, &[KEY_IP]);
                self.emit(OutboundEvent::error(ErrorKind::Common, "Try again later"));
            }
        }
    }

    async fn ssh_connect(&mut self) {
        let ctx = GateContext {
            state: &self.state,
            store: &SESSION_STORE,
            conn_id: &self.conn_id,
        };
        if let Err(event) = self.connect_gates.check(&ctx) {
            self.emit(event);
            return;
        }

        let info = match self.bridge.container_info(&self.state.bridge_key()).await {
            Ok(info) => info,
            Err(e) => {
                warn!(conn_id = %self.conn_id, error = %e, "container credentials unavailable");
                self.emit(OutboundEvent::error(ErrorKind::Ssh, "Connection failed"));
                return;
            }
        };

        let Some(user_id) = SESSION_STORE
            .get(&self.conn_id, KEY_USER_ID)
            .and_then(|v| v.as_i64())
        else {
            // Auth gate passed but claims vanished; session was cleared mid-flight
            self.emit(OutboundEvent::error(ErrorKind::Auth, "Not authorized"));
            return;
        };

        let destination = Destination {
            identity: Identity {
                id: user_id,
                ip: self.ip.clone(),
            },
            src: self.ip.clone(),
            dest: resolve_ssh_host(None),
            ssh_user: info.cont_user.clone(),
            port: resolve_ssh_port(None),
        };

        // A repeated connect replaces the previous binding
        if let Some(previous) = self.worker.take() {
            previous.stop(REASON_WS_DISCONNECTED).await;
        }

        let acquired = WORKER_POOL
            .acquire(
                &self.conn_id,
                self.tx.clone(),
                destination,
                &info.cont_auth_type,
                &info.cont_auth,
                resolve_max_connections(None),
            )
            .await;

        match acquired {
            Ok(worker) => {
                SESSION_STORE.update(
                    &self.conn_id,
                    HashMap::from([(KEY_WORKER_ID.to_string(), json!(worker.id.clone()))]),
                );
                worker.start_relay_loop().await;
                info!(conn_id = %self.conn_id, worker_id = %worker.id, "relay started");
                self.worker = Some(worker);
            }
            Err(e) => {
                warn!(conn_id = %self.conn_id, error = ?e, "ssh connect failed");
                self.emit(OutboundEvent::error(ErrorKind::Ssh, e.to_string()));
            }
        }
    }

    async fn forward(&self, bytes: &[u8]) {
        let ctx = GateContext {
            state: &self.state,
            store: &SESSION_STORE,
            conn_id: &self.conn_id,
        };
        if let Err(event) = self.relay_gates.check(&ctx) {
            self.emit(event);
            return;
        }
        match &self.worker {
            Some(worker) => worker.send_to_remote(bytes).await,
            // Keystrokes before SSH_CONNECT have nowhere to go
            None => debug!(conn_id = %self.conn_id, "dropped input without a bound worker"),
        }
    }

    async fn resize(&self, cols: u32, rows: u32) {
        let ctx = GateContext {
            state: &self.state,
            store: &SESSION_STORE,
            conn_id: &self.conn_id,
        };
        if let Err(event) = self.relay_gates.check(&ctx) {
            self.emit(event);
            return;
        }
        if let Some(worker) = &self.worker {
            worker.resize(cols, rows).await;
        }
    }

    /// Detach from the worker (back to the pool) and drop the session entry.
    async fn finish(self) {
        if let Some(worker) = &self.worker {
            worker.stop(REASON_WS_DISCONNECTED).await;
        }
        SESSION_STORE.remove(&self.conn_id);
        info!(conn_id = %self.conn_id, "websocket disconnected");
    }

    fn emit(&self, event: OutboundEvent) {
        if self.tx.send(event).is_err() {
            debug!(conn_id = %self.conn_id, "outbound queue closed");
        }
    }
}

fn claims_map(claims: &AuthClaims) -> HashMap<String, Value> {
    match serde_json::to_value(claims) {
        Ok(Value::Object(map)) => map.into_iter().collect(),
        _ => HashMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::mpsc::UnboundedReceiver;

    use crate::agent::error::BridgeError;
    use crate::agent::types::ContainerInfo;

    struct StubBridge {
        verdict: Option<AuthClaims>,
        info_calls: AtomicU32,
    }

    impl StubBridge {
        fn accepting() -> Self {
            Self::with_verdict(Some(claims(true)))
        }

        fn rejecting() -> Self {
            Self::with_verdict(Some(claims(false)))
        }

        fn unreachable() -> Self {
            Self::with_verdict(None)
        }

        fn with_verdict(verdict: Option<AuthClaims>) -> Self {
            Self {
                verdict,
                info_calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl BridgeApi for StubBridge {
        async fn validate_token(&self, _token: &str) -> Result<AuthClaims, BridgeError> {
            match &self.verdict {
                Some(claims) => Ok(claims.clone()),
                None => Err(BridgeError::Malformed("stubbed outage".to_string())),
            }
        }

        async fn container_info(&self, _bridge_key: &str) -> Result<ContainerInfo, BridgeError> {
            self.info_calls.fetch_add(1, Ordering::SeqCst);
            Ok(ContainerInfo {
                cont_user: "together".to_string(),
                cont_auth_type: "password".to_string(),
                cont_auth: "pw".to_string(),
            })
        }
    }

    fn claims(valid: bool) -> AuthClaims {
        AuthClaims {
            user_id: 42,
            email: "dev@example.com".to_string(),
            issued_at: "2022-04-06T09:57:03.000+00:00".to_string(),
            expired_at: "2022-05-06T09:57:03.000+00:00".to_string(),
            valid,
        }
    }

    fn initialized_state() -> Arc<AgentState> {
        let state = AgentState::new();
        state.install_bridge_key("bridge-key");
        Arc::new(state)
    }

    fn session_with(
        bridge: Arc<StubBridge>,
        state: Arc<AgentState>,
    ) -> (WsSession, UnboundedReceiver<OutboundEvent>) {
        let conn_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        SESSION_STORE.open(&conn_id, "10.0.0.3", tx.clone());
        let session = WsSession {
            conn_id,
            ip: "10.0.0.3".to_string(),
            state,
            bridge,
            tx,
            connect_gates: GateChain::new().with_init().with_auth(),
            relay_gates: GateChain::new().with_auth(),
            worker: None,
        };
        (session, rx)
    }

    fn next_event(rx: &mut UnboundedReceiver<OutboundEvent>) -> OutboundEvent {
        rx.try_recv().expect("an event should have been emitted")
    }

    fn assert_drained(rx: &mut UnboundedReceiver<OutboundEvent>) {
        assert!(rx.try_recv().is_err(), "unexpected extra event");
    }

    async fn authenticate(session: &mut WsSession, rx: &mut UnboundedReceiver<OutboundEvent>) {
        session
            .dispatch(Message::text(
                r#"{"event":"AUTHENTICATE","data":{"token":"t"}}"#,
            ))
            .await;
        assert_eq!(
            next_event(rx),
            OutboundEvent::AuthenticateAck("Authenticated".to_string())
        );
    }

    mod authentication {
        use super::*;

        #[tokio::test]
        async fn test_valid_token_marks_session_and_acks() {
            let stub = Arc::new(StubBridge::accepting());
            let (mut session, mut rx) = session_with(Arc::clone(&stub), initialized_state());

            authenticate(&mut session, &mut rx).await;
            assert!(SESSION_STORE.is_valid(&session.conn_id));
            assert_eq!(
                SESSION_STORE
                    .get(&session.conn_id, KEY_USER_ID)
                    .and_then(|v| v.as_i64()),
                Some(42)
            );
        }

        #[tokio::test]
        async fn test_invalid_token_clears_session_but_keeps_ip() {
            let stub = Arc::new(StubBridge::rejecting());
            let (mut session, mut rx) = session_with(Arc::clone(&stub), initialized_state());

            session
                .dispatch(Message::text(
                    r#"{"event":"AUTHENTICATE","data":{"token":"t"}}"#,
                ))
                .await;

            assert_eq!(
                next_event(&mut rx),
                OutboundEvent::error(ErrorKind::Auth, "Invalid token")
            );
            assert!(!SESSION_STORE.is_valid(&session.conn_id));
            assert!(SESSION_STORE.get(&session.conn_id, KEY_IP).is_some());
        }

        #[tokio::test]
        async fn test_auth_outage_asks_for_retry() {
            let stub = Arc::new(StubBridge::unreachable());
            let (mut session, mut rx) = session_with(Arc::clone(&stub), initialized_state());

            session
                .dispatch(Message::text(
                    r#"{"event":"AUTHENTICATE","data":{"token":"t"}}"#,
                ))
                .await;

            assert_eq!(
                next_event(&mut rx),
                OutboundEvent::error(ErrorKind::Common, "Try again later")
            );
            assert!(!SESSION_STORE.is_valid(&session.conn_id));
        }

        #[tokio::test]
        async fn test_missing_token_field_names_the_field() {
            let stub = Arc::new(StubBridge::accepting());
            let (mut session, mut rx) = session_with(Arc::clone(&stub), initialized_state());

            session
                .dispatch(Message::text(r#"{"event":"AUTHENTICATE","data":{}}"#))
                .await;

            assert_eq!(
                next_event(&mut rx),
                OutboundEvent::error(ErrorKind::MissingField, "`token` is missing")
            );
        }
    }

    mod gates {
        use super::*;

        #[tokio::test]
        async fn test_connect_without_auth_emits_single_auth_error() {
            let stub = Arc::new(StubBridge::accepting());
            let (mut session, mut rx) = session_with(Arc::clone(&stub), initialized_state());

            session
                .dispatch(Message::text(r#"{"event":"SSH_CONNECT"}"#))
                .await;

            assert_eq!(
                next_event(&mut rx),
                OutboundEvent::error(ErrorKind::Auth, "Not authorized")
            );
            assert_drained(&mut rx);
            // The credential fetch never ran
            assert_eq!(stub.info_calls.load(Ordering::SeqCst), 0);
        }

        #[tokio::test]
        async fn test_connect_before_init_emits_init_needed() {
            let stub = Arc::new(StubBridge::accepting());
            let (mut session, mut rx) = session_with(Arc::clone(&stub), Arc::new(AgentState::new()));

            authenticate(&mut session, &mut rx).await;
            session
                .dispatch(Message::text(r#"{"event":"SSH_CONNECT"}"#))
                .await;

            assert_eq!(
                next_event(&mut rx),
                OutboundEvent::error(ErrorKind::InitNeeded, "Server is not initialized.")
            );
            assert_eq!(stub.info_calls.load(Ordering::SeqCst), 0);
        }

        #[tokio::test]
        async fn test_unknown_event_is_reported() {
            let stub = Arc::new(StubBridge::accepting());
            let (mut session, mut rx) = session_with(Arc::clone(&stub), initialized_state());

            session.dispatch(Message::text(r#"{"event":"REBOOT"}"#)).await;

            assert_eq!(
                next_event(&mut rx),
                OutboundEvent::error(ErrorKind::Unknown, "Unknown event `REBOOT`")
            );
        }
    }

    mod relay_input {
        use super::*;

        #[tokio::test]
        async fn test_keystrokes_require_auth() {
            let stub = Arc::new(StubBridge::accepting());
            let (mut session, mut rx) = session_with(Arc::clone(&stub), initialized_state());

            session.dispatch(Message::binary(b"ls\n".to_vec())).await;

            assert_eq!(
                next_event(&mut rx),
                OutboundEvent::error(ErrorKind::Auth, "Not authorized")
            );
        }

        #[tokio::test]
        async fn test_keystrokes_without_worker_are_dropped() {
            let stub = Arc::new(StubBridge::accepting());
            let (mut session, mut rx) = session_with(Arc::clone(&stub), initialized_state());

            authenticate(&mut session, &mut rx).await;
            session.dispatch(Message::binary(b"ls\n".to_vec())).await;

            assert_drained(&mut rx);
        }

        #[tokio::test]
        async fn test_resize_requires_auth() {
            let stub = Arc::new(StubBridge::accepting());
            let (mut session, mut rx) = session_with(Arc::clone(&stub), initialized_state());

            session
                .dispatch(Message::text(
                    r#"{"event":"SSH_RESIZE","data":{"cols":120,"rows":40}}"#,
                ))
                .await;

            assert_eq!(
                next_event(&mut rx),
                OutboundEvent::error(ErrorKind::Auth, "Not authorized")
            );
        }
    }

    mod lifecycle {
        use super::*;

        #[tokio::test]
        async fn test_finish_drops_the_session_entry() {
            let stub = Arc::new(StubBridge::accepting());
            let (session, _rx) = session_with(Arc::clone(&stub), initialized_state());
            let conn_id = session.conn_id.clone();

            assert!(SESSION_STORE.is_connected(&conn_id));
            session.finish().await;
            assert!(!SESSION_STORE.is_connected(&conn_id));
            assert!(SESSION_STORE.get(&conn_id, KEY_IP).is_none());
        }
    }
}
