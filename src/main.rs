#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use dotenv::dotenv;
use poem::{
    EndpointExt, Route, Server, get, listener::TcpListener, middleware::Tracing, post,
};
use termgate::agent::bridge::{BridgeApi, HttpBridge};
use termgate::agent::config::AgentState;
use termgate::agent::http::{execute, execute_suspend, init, ping};
use termgate::agent::pool::WORKER_POOL;
use termgate::agent::relay::SHUTDOWN;
use termgate::agent::ws::ssh_upgrade;
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    // Initialize logging with proper tracing default
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("valid directive")),
        )
        .init();

    let port: u16 = std::env::var("TERMGATE_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8989);
    let addr = format!("0.0.0.0:{}", port);
    info!("Starting terminal gateway agent on {}", addr);

    let state = Arc::new(AgentState::new());
    let bridge: Arc<dyn BridgeApi> = Arc::new(HttpBridge::from_env());

    let app = Route::new()
        .at("/ping", get(ping))
        .at("/init", post(init))
        .at("/execute", post(execute))
        .at("/execute/suspend", post(execute_suspend))
        .at("/ssh", get(ssh_upgrade))
        .data(state)
        .data(bridge)
        .with(Tracing);

    Server::new(TcpListener::bind(addr))
        .name("termgate")
        .run_with_graceful_shutdown(app, shutdown_signal(), Some(Duration::from_secs(5)))
        .await?;

    // Stop relay loops and hang up pooled SSH sessions before exiting
    SHUTDOWN.cancel();
    WORKER_POOL.retire_all().await;
    info!("Terminal gateway agent stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received SIGINT"),
        () = terminate => info!("received SIGTERM"),
    }
}
