//! SSH client connection and authentication.
//!
//! The agent dials the SSH server on its own machine and drives a password
//! login with the credentials the bridge issued. Connection attempts use
//! exponential backoff with jitter via the `backon` crate; authentication
//! failures are never retried.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use russh::{Channel, client, keys};
use tracing::{error, info, warn};

use crate::agent::config::MAX_RETRY_DELAY;
use crate::agent::error::{AcquireError, RelayError, is_retryable_error};

/// Client handler for russh that accepts all host keys.
///
/// The agent only ever connects to the SSH server of the machine it runs on,
/// so there is no known_hosts to check against.
pub struct SshClientHandler;

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Build russh client configuration for interactive relay sessions.
///
/// Inactivity timeout is disabled: a browser terminal may sit idle for hours
/// and the session must survive it. Keepalives detect dead peers instead.
pub(crate) fn build_client_config() -> Arc<client::Config> {
    let preferred = russh::Preferred {
        compression: (&[russh::compression::NONE][..]).into(),
        ..Default::default()
    };

    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        preferred,
        ..Default::default()
    })
}

/// Connect and authenticate with retry on transient failures.
///
/// Uses exponential backoff starting from `min_delay`, capped at
/// [`MAX_RETRY_DELAY`], with random jitter. Only connection errors classified
/// as retryable are redialed; `AuthFailed` surfaces immediately.
pub(crate) async fn connect_with_retry(
    host: &str,
    port: u16,
    username: &str,
    password: &str,
    timeout: Duration,
    max_retries: u32,
    min_delay: Duration,
) -> Result<client::Handle<SshClientHandler>, AcquireError> {
    let attempt_counter = AtomicU32::new(0);

    let backoff = ExponentialBuilder::default()
        .with_min_delay(min_delay)
        .with_max_delay(MAX_RETRY_DELAY)
        .with_max_times(max_retries as usize)
        .with_jitter();

    let result = (|| async {
        let current_attempt = attempt_counter.fetch_add(1, Ordering::SeqCst);

        if current_attempt > 0 {
            warn!(
                "SSH connection retry attempt {} to {}@{}:{}",
                current_attempt, username, host, port
            );
        }

        connect_and_auth(host, port, username, password, timeout).await
    })
    .retry(backoff)
    .when(|e| match e {
        AcquireError::ConnectFailed(detail) => is_retryable_error(detail),
        _ => false,
    })
    .notify(|err, dur| {
        warn!("SSH connection failed: {}. Retrying in {:?}", err, dur);
    })
    .await;

    let total_attempts = attempt_counter.load(Ordering::SeqCst);
    let retry_count = total_attempts.saturating_sub(1);

    match result {
        Ok(handle) => {
            if retry_count > 0 {
                info!(
                    "SSH connection to {}@{}:{} succeeded after {} retry attempt(s)",
                    username, host, port, retry_count
                );
            }
            Ok(handle)
        }
        Err(e) => {
            let detail = match &e {
                AcquireError::ConnectFailed(detail) => detail.clone(),
                other => other.to_string(),
            };
            error!(
                "SSH connection to {}@{}:{} failed after {} attempt(s): {}",
                username, host, port, total_attempts, detail
            );
            Err(e)
        }
    }
}

/// One connection attempt: TCP + SSH handshake under the configured timeout,
/// then a password login.
async fn connect_and_auth(
    host: &str,
    port: u16,
    username: &str,
    password: &str,
    timeout: Duration,
) -> Result<client::Handle<SshClientHandler>, AcquireError> {
    let config = build_client_config();
    let connect_future = client::connect(config, (host, port), SshClientHandler);

    let mut handle = tokio::time::timeout(timeout, connect_future)
        .await
        .map_err(|_| {
            AcquireError::ConnectFailed(format!("Connection timed out after {timeout:?}"))
        })?
        .map_err(|e| AcquireError::ConnectFailed(format!("Failed to connect: {e}")))?;

    let auth_result = handle
        .authenticate_password(username, password)
        .await
        .map_err(|e| AcquireError::ConnectFailed(format!("Failed to authenticate: {e}")))?;

    if !auth_result.success() {
        return Err(AcquireError::AuthFailed);
    }

    Ok(handle)
}

/// Open an interactive shell channel with a pty of the given dimensions.
pub(crate) async fn open_shell_channel(
    handle: &client::Handle<SshClientHandler>,
    cols: u32,
    rows: u32,
) -> Result<Channel<client::Msg>, RelayError> {
    let channel = handle
        .channel_open_session()
        .await
        .map_err(|e| RelayError::ChannelCreate(e.to_string()))?;

    channel
        .request_pty(true, "xterm-256color", cols, rows, 0, 0, &[])
        .await
        .map_err(|e| RelayError::ChannelCreate(format!("pty request failed: {e}")))?;

    channel
        .request_shell(true)
        .await
        .map_err(|e| RelayError::ChannelCreate(format!("shell request failed: {e}")))?;

    Ok(channel)
}
