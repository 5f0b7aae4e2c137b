//! Bridge-facing HTTP endpoints and the shared bridge-key guard.
//!
//! `/init` is the first-boot handshake: the bridge hands over its key, the
//! agent rotates the managed account's password and returns it. Every other
//! bridge-only endpoint goes through [`bridge_key_guard`].

use std::sync::Arc;

use poem::http::{HeaderMap, StatusCode};
use poem::web::{Data, Json};
use poem::{IntoResponse, Response, handler};
use serde_json::json;
use tracing::{error, info};

use crate::agent::config::{AgentState, resolve_os_username};
use crate::agent::os::change_password;

/// Header carrying the bridge key on bridge-only endpoints.
pub(crate) const BRIDGE_KEY_HEADER: &str = "X-API-KEY";

/// `GET /ping` health check.
#[handler]
pub async fn ping() -> impl IntoResponse {
    Json(json!({ "ping": "pong" }))
}

/// `POST /init`: install the bridge key and rotate the managed account's
/// password, returning the new password to the bridge. A failed rotation
/// leaves the agent uninitialized so the bridge can call again.
#[handler]
pub async fn init(state: Data<&Arc<AgentState>>, headers: &HeaderMap) -> Response {
    let key = headers
        .get(BRIDGE_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    match change_password(&resolve_os_username(None)).await {
        Ok(password) => {
            state.install_bridge_key(key);
            info!("bridge key installed, account password rotated");
            Json(json!({ "pw": password })).into_response()
        }
        Err(e) => {
            error!(error = %e, "password rotation failed");
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .finish()
        }
    }
}

/// `POST /execute` pre-execution hook.
#[handler]
pub async fn execute(state: Data<&Arc<AgentState>>, headers: &HeaderMap) -> Response {
    match bridge_key_guard(state.0, headers) {
        Ok(()) => Json(json!({})).into_response(),
        Err(rejection) => rejection,
    }
}

/// `POST /execute/suspend` pre-suspension hook.
#[handler]
pub async fn execute_suspend(state: Data<&Arc<AgentState>>, headers: &HeaderMap) -> Response {
    match bridge_key_guard(state.0, headers) {
        Ok(()) => Json(json!({})).into_response(),
        Err(rejection) => rejection,
    }
}

/// Reject bridge-only requests that do not carry the installed key.
///
/// An installed-but-empty key drops the agent back to uninitialized; the
/// bridge is expected to run `/init` again before retrying.
fn bridge_key_guard(state: &AgentState, headers: &HeaderMap) -> Result<(), Response> {
    if !state.is_initialized() {
        return Err(reject(
            StatusCode::BAD_REQUEST,
            "Init Needed",
            "Server is not initialized.",
        ));
    }

    let expected = state.bridge_key();
    if expected.is_empty() {
        state.mark_uninitialized();
        return Err(reject(
            StatusCode::BAD_REQUEST,
            "Init Error",
            "Server needs to be re-initialized.",
        ));
    }

    match headers.get(BRIDGE_KEY_HEADER).and_then(|v| v.to_str().ok()) {
        None => Err(reject(
            StatusCode::UNAUTHORIZED,
            "Authorization Failed",
            "X-API-KEY is missing",
        )),
        Some(key) if key != expected => Err(reject(
            StatusCode::UNAUTHORIZED,
            "Authorization Failed",
            "Not authorized key",
        )),
        Some(_) => Ok(()),
    }
}

fn reject(status: StatusCode, kind: &str, msg: &str) -> Response {
    (status, Json(json!({ "type": kind, "msg": msg }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use poem::listener::{Acceptor, Listener, TcpListener};
    use poem::{EndpointExt, Route, Server, get, post};
    use serde_json::Value;

    fn header_with(key: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            BRIDGE_KEY_HEADER,
            key.parse().expect("valid header value"),
        );
        headers
    }

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().into_vec().await.expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    mod guard_ladder {
        use super::*;

        #[tokio::test]
        async fn test_uninitialized_agent_rejects_even_with_a_key() {
            let state = AgentState::new();

            let rejection = bridge_key_guard(&state, &header_with("whatever")).unwrap_err();

            assert_eq!(rejection.status(), StatusCode::BAD_REQUEST);
            let body = body_json(rejection).await;
            assert_eq!(body["type"], "Init Needed");
            assert_eq!(body["msg"], "Server is not initialized.");
        }

        #[tokio::test]
        async fn test_empty_installed_key_forces_reinitialization() {
            let state = AgentState::new();
            state.install_bridge_key("");

            let rejection = bridge_key_guard(&state, &header_with("whatever")).unwrap_err();

            assert_eq!(rejection.status(), StatusCode::BAD_REQUEST);
            let body = body_json(rejection).await;
            assert_eq!(body["type"], "Init Error");
            assert_eq!(body["msg"], "Server needs to be re-initialized.");
            // The agent fell back to the uninitialized branch
            assert!(!state.is_initialized());
            let again = bridge_key_guard(&state, &header_with("whatever")).unwrap_err();
            assert_eq!(body_json(again).await["type"], "Init Needed");
        }

        #[tokio::test]
        async fn test_missing_header_is_unauthorized() {
            let state = AgentState::new();
            state.install_bridge_key("bridge-key");

            let rejection = bridge_key_guard(&state, &HeaderMap::new()).unwrap_err();

            assert_eq!(rejection.status(), StatusCode::UNAUTHORIZED);
            let body = body_json(rejection).await;
            assert_eq!(body["type"], "Authorization Failed");
            assert_eq!(body["msg"], "X-API-KEY is missing");
        }

        #[tokio::test]
        async fn test_wrong_key_is_unauthorized() {
            let state = AgentState::new();
            state.install_bridge_key("bridge-key");

            let rejection = bridge_key_guard(&state, &header_with("other-key")).unwrap_err();

            assert_eq!(rejection.status(), StatusCode::UNAUTHORIZED);
            assert_eq!(body_json(rejection).await["msg"], "Not authorized key");
        }

        #[tokio::test]
        async fn test_matching_key_passes() {
            let state = AgentState::new();
            state.install_bridge_key("bridge-key");

            assert!(bridge_key_guard(&state, &header_with("bridge-key")).is_ok());
            assert!(state.is_initialized());
        }
    }

    mod endpoints {
        use super::*;

        async fn spawn_agent(state: Arc<AgentState>) -> String {
            let acceptor = TcpListener::bind("127.0.0.1:0")
                .into_acceptor()
                .await
                .unwrap();
            let addr = acceptor
                .local_addr()
                .first()
                .and_then(|a| a.as_socket_addr().cloned())
                .unwrap();

            let app = Route::new()
                .at("/ping", get(ping))
                .at("/execute", post(execute))
                .at("/execute/suspend", post(execute_suspend))
                .data(state);
            tokio::spawn(async move {
                let _ = Server::new_with_acceptor(acceptor).run(app).await;
            });

            format!("http://{addr}")
        }

        #[tokio::test]
        async fn test_ping_pongs_without_credentials() {
            let base = spawn_agent(Arc::new(AgentState::new())).await;

            let response = reqwest::get(format!("{base}/ping")).await.unwrap();

            assert_eq!(response.status(), reqwest::StatusCode::OK);
            let body: Value = response.json().await.unwrap();
            assert_eq!(body["ping"], "pong");
        }

        #[tokio::test]
        async fn test_execute_rejects_before_init() {
            let base = spawn_agent(Arc::new(AgentState::new())).await;

            let response = reqwest::Client::new()
                .post(format!("{base}/execute"))
                .send()
                .await
                .unwrap();

            assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
            let body: Value = response.json().await.unwrap();
            assert_eq!(body["type"], "Init Needed");
        }

        #[tokio::test]
        async fn test_execute_accepts_the_installed_key() {
            let state = Arc::new(AgentState::new());
            state.install_bridge_key("bridge-key");
            let base = spawn_agent(state).await;

            let response = reqwest::Client::new()
                .post(format!("{base}/execute"))
                .header(BRIDGE_KEY_HEADER, "bridge-key")
                .send()
                .await
                .unwrap();

            assert_eq!(response.status(), reqwest::StatusCode::OK);
            let body: Value = response.json().await.unwrap();
            assert_eq!(body, json!({}));
        }

        #[tokio::test]
        async fn test_suspend_shares_the_guard() {
            let state = Arc::new(AgentState::new());
            state.install_bridge_key("bridge-key");
            let base = spawn_agent(state).await;

            let response = reqwest::Client::new()
                .post(format!("{base}/execute/suspend"))
                .header(BRIDGE_KEY_HEADER, "wrong-key")
                .send()
                .await
                .unwrap();

            assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
            let body: Value = response.json().await.unwrap();
            assert_eq!(body["msg"], "Not authorized key");
        }
    }
}
