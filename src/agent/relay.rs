//! SSH relay worker: one pooled SSH session plus the forwarding task that
//! streams remote pty output to the bound websocket connection.
//!
//! A worker outlives the connection that created it. On websocket disconnect
//! it parks in the pool (status `Disconnected`, handles kept) and a later
//! connection to the same destination takes it over. Retirement is terminal:
//! handles are closed and the pool drops the worker.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::time::Duration;

use once_cell::sync::Lazy;
use russh::{Channel, ChannelMsg, Disconnect, client};
use tokio::sync::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::client::{SshClientHandler, open_shell_channel};
use crate::agent::config::{
    CHANNEL_RETRY_BUDGET, DEFAULT_PTY_COLS, DEFAULT_PTY_ROWS, RELAY_POLL_INTERVAL,
    RELAY_READ_BUF_SIZE,
};
use crate::agent::error::{
    REASON_CHANNEL_CLOSED, REASON_SERVER_DOWN, REASON_SSH_DOWN, REASON_WS_DISCONNECTED,
    RelayError,
};
use crate::agent::protocol::OutboundEvent;
use crate::agent::types::Destination;

/// Process-wide shutdown signal; cancelled once by `main` on termination.
/// Every forwarding loop observes it and exits with a server-down notice.
pub static SHUTDOWN: Lazy<CancellationToken> = Lazy::new(CancellationToken::new);

/// Worker lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerStatus {
    /// Idle in the pool, reusable
    Disconnected = 0,
    /// Bound to a live connection, forwarding loop running
    Connected = 1,
    /// Terminal; handles closed, removed from the pool
    Retired = 2,
}

impl WorkerStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => WorkerStatus::Disconnected,
            1 => WorkerStatus::Connected,
            _ => WorkerStatus::Retired,
        }
    }
}

/// Atomic status cell enforcing the worker's legal transitions.
struct StatusCell(AtomicU8);

impl StatusCell {
    fn new() -> Self {
        StatusCell(AtomicU8::new(WorkerStatus::Disconnected as u8))
    }

    fn get(&self) -> WorkerStatus {
        WorkerStatus::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Claim an idle worker: Disconnected -> Connected. Exactly one of two
    /// racing claimers wins.
    fn claim(&self) -> bool {
        self.0
            .compare_exchange(
                WorkerStatus::Disconnected as u8,
                WorkerStatus::Connected as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Connected -> Disconnected. True only on the transition, so callers can
    /// emit the disconnect notice exactly once.
    fn disconnect(&self) -> bool {
        self.0
            .compare_exchange(
                WorkerStatus::Connected as u8,
                WorkerStatus::Disconnected as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Unconditional -> Connected; used when binding a freshly built worker.
    fn set_connected(&self) {
        self.0.store(WorkerStatus::Connected as u8, Ordering::SeqCst);
    }

    /// Any state -> Retired. Absorbing.
    fn retire(&self) {
        self.0.store(WorkerStatus::Retired as u8, Ordering::SeqCst);
    }
}

/// The connection currently receiving this worker's output.
struct BoundConn {
    conn_id: String,
    tx: UnboundedSender<OutboundEvent>,
}

/// One pooled SSH session relaying between a websocket connection and the
/// remote interactive shell.
pub struct RelayWorker {
    pub id: String,
    pub destination: Destination,
    /// Cached so capacity counting never rehashes
    identity_fp: String,
    status: StatusCell,
    bound: Mutex<Option<BoundConn>>,
    handle: client::Handle<SshClientHandler>,
    /// Shell channel; `None` after the remote closed it, lazily recreated
    channel: Mutex<Option<Channel<client::Msg>>>,
    /// Channel re-creation budget; negative means permanently exhausted
    retry_budget: AtomicI32,
    cancel: Mutex<CancellationToken>,
    stop_reason: Mutex<Option<String>>,
    relay_task: Mutex<Option<JoinHandle<()>>>,
}

impl RelayWorker {
    pub(crate) fn new(
        destination: Destination,
        handle: client::Handle<SshClientHandler>,
        channel: Channel<client::Msg>,
    ) -> Arc<Self> {
        let identity_fp = destination.identity.fingerprint();
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            destination,
            identity_fp,
            status: StatusCell::new(),
            bound: Mutex::new(None),
            handle,
            channel: Mutex::new(Some(channel)),
            retry_budget: AtomicI32::new(CHANNEL_RETRY_BUDGET),
            cancel: Mutex::new(CancellationToken::new()),
            stop_reason: Mutex::new(None),
            relay_task: Mutex::new(None),
        })
    }

    pub fn status(&self) -> WorkerStatus {
        self.status.get()
    }

    pub(crate) fn identity_fingerprint(&self) -> &str {
        &self.identity_fp
    }

    /// Atomically claim this idle worker for rebinding.
    pub(crate) fn try_claim(&self) -> bool {
        self.status.claim()
    }

    /// Whether an idle worker can be handed to a new connection: live client
    /// handle, open shell channel, retry budget left.
    pub(crate) async fn is_usable(&self) -> bool {
        if self.handle.is_closed() {
            return false;
        }
        if self.retry_budget.load(Ordering::SeqCst) < 0 {
            return false;
        }
        self.channel.lock().await.is_some()
    }

    /// Attach the worker to a connection's outbound queue and mark it live.
    pub(crate) async fn bind(&self, conn_id: &str, tx: UnboundedSender<OutboundEvent>) {
        *self.bound.lock().await = Some(BoundConn {
            conn_id: conn_id.to_string(),
            tx,
        });
        *self.stop_reason.lock().await = None;
        self.status.set_connected();
        info!(worker_id = %self.id, conn_id, destination = %self.destination, "worker bound");
    }

    /// Forward a terminal-resize request to the remote pty. Side effect only;
    /// a dead channel shows up through subsequent I/O, not here.
    pub(crate) async fn resize(&self, cols: u32, rows: u32) {
        let slot = self.channel.lock().await;
        if let Some(channel) = slot.as_ref()
            && let Err(e) = channel.window_change(cols, rows, 0, 0).await
        {
            debug!(worker_id = %self.id, error = %e, "pty resize failed");
        }
    }

    /// Write keystrokes to the remote shell, lazily recreating the channel if
    /// the remote closed it. Write errors are swallowed; the forwarding loop
    /// observes the outage and reports it.
    pub(crate) async fn send_to_remote(&self, bytes: &[u8]) {
        let mut slot = self.channel.lock().await;
        match self.ensure_channel(&mut slot).await {
            Ok(()) => {
                if let Some(channel) = slot.as_ref()
                    && let Err(e) = channel.data(bytes).await
                {
                    debug!(worker_id = %self.id, error = %e, "write to shell failed");
                }
            }
            Err(RelayError::RetryExhausted) => {
                drop(slot);
                self.cleanup(REASON_SSH_DOWN, true).await;
            }
            Err(e) => {
                debug!(worker_id = %self.id, error = %e, "channel unavailable for write");
            }
        }
    }

    /// Spawn the SSH->client forwarding task. One task per worker; the
    /// inbound direction is written synchronously by the session task.
    pub(crate) async fn start_relay_loop(self: &Arc<Self>) {
        let cancel = CancellationToken::new();
        *self.cancel.lock().await = cancel.clone();

        let worker = Arc::clone(self);
        let task = tokio::spawn(async move {
            let reason = worker.relay_loop(cancel).await;
            worker.cleanup(&reason, true).await;
        });
        *self.relay_task.lock().await = Some(task);
    }

    /// Cancel the forwarding task, recording `reason` as the cause.
    pub(crate) async fn stop(&self, reason: &str) {
        *self.stop_reason.lock().await = Some(reason.to_string());
        self.cancel.lock().await.cancel();
    }

    /// Park the worker: status Disconnected, handles kept for reuse. If
    /// `notify` and the bound connection is still live, emits one `SSH_DOWN`
    /// carrying `reason`. Idempotent; only the Connected -> Disconnected
    /// transition does anything.
    pub(crate) async fn cleanup(&self, reason: &str, notify: bool) {
        if !self.status.disconnect() {
            return;
        }

        info!(worker_id = %self.id, reason, "relay worker disconnected");

        let mut bound = self.bound.lock().await;
        if notify
            && let Some(conn) = bound.as_ref()
            && !conn.tx.is_closed()
            && conn.tx.send(OutboundEvent::ssh_down(reason)).is_err()
        {
            debug!(worker_id = %self.id, conn_id = %conn.conn_id, "disconnect notice dropped");
        }
        // A parked worker holds no connection
        *bound = None;
    }

    /// Tear the worker down for good: cancel the loop, close the channel and
    /// the SSH client, status Retired. The pool drops it afterwards.
    pub(crate) async fn destruct(&self) {
        self.status.retire();
        self.cancel.lock().await.cancel();
        *self.bound.lock().await = None;

        if let Some(task) = self.relay_task.lock().await.take() {
            task.abort();
        }

        if let Some(channel) = self.channel.lock().await.take()
            && let Err(e) = channel.close().await
        {
            debug!(worker_id = %self.id, error = %e, "channel close failed during retirement");
        }

        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "worker retired", "en")
            .await
        {
            debug!(worker_id = %self.id, error = %e, "ssh disconnect failed during retirement");
        }

        info!(worker_id = %self.id, destination = %self.destination, "relay worker retired");
    }

    /// Body of the forwarding task. Returns the disconnect reason.
    async fn relay_loop(&self, cancel: CancellationToken) -> String {
        info!(worker_id = %self.id, "relay loop started");

        loop {
            if self.status.get() != WorkerStatus::Connected {
                return self
                    .take_stop_reason()
                    .await
                    .unwrap_or_else(|| REASON_CHANNEL_CLOSED.to_string());
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return self
                        .take_stop_reason()
                        .await
                        .unwrap_or_else(|| REASON_WS_DISCONNECTED.to_string());
                }
                _ = SHUTDOWN.cancelled() => {
                    return REASON_SERVER_DOWN.to_string();
                }
                _ = tokio::time::sleep(RELAY_POLL_INTERVAL) => {}
            }

            let chunk = {
                let mut slot = self.channel.lock().await;
                match self.ensure_channel(&mut slot).await {
                    Ok(()) => drain_channel(&mut slot).await,
                    Err(RelayError::RetryExhausted) => {
                        warn!(worker_id = %self.id, "channel retries exhausted, giving up");
                        return REASON_SSH_DOWN.to_string();
                    }
                    // Transient create failure; budget already charged
                    Err(_) => continue,
                }
            };

            if !chunk.is_empty() {
                self.emit(OutboundEvent::SshRelay(chunk)).await;
            }
        }
    }

    /// Recreate the shell channel if the remote closed it, charging the retry
    /// budget on failure. `RetryExhausted` is permanent for this worker.
    async fn ensure_channel(
        &self,
        slot: &mut Option<Channel<client::Msg>>,
    ) -> Result<(), RelayError> {
        if slot.is_some() {
            return Ok(());
        }

        if self.retry_budget.load(Ordering::SeqCst) < 0 {
            return Err(RelayError::RetryExhausted);
        }

        match open_shell_channel(&self.handle, DEFAULT_PTY_COLS, DEFAULT_PTY_ROWS).await {
            Ok(channel) => {
                info!(worker_id = %self.id, "shell channel recreated");
                *slot = Some(channel);
                Ok(())
            }
            Err(e) => {
                let remaining = self.retry_budget.fetch_sub(1, Ordering::SeqCst) - 1;
                warn!(worker_id = %self.id, error = %e, remaining, "shell channel recreate failed");
                if remaining < 0 {
                    Err(RelayError::RetryExhausted)
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn emit(&self, event: OutboundEvent) {
        let bound = self.bound.lock().await;
        if let Some(conn) = bound.as_ref()
            && conn.tx.send(event).is_err()
        {
            debug!(worker_id = %self.id, conn_id = %conn.conn_id, "bound connection gone, output dropped");
        }
    }

    async fn take_stop_reason(&self) -> Option<String> {
        self.stop_reason.lock().await.take()
    }
}

/// Non-blocking drain of whatever the remote buffered, up to the per-tick
/// read bound. A closed/EOF channel empties the slot so the next tick
/// recreates it lazily.
async fn drain_channel(slot: &mut Option<Channel<client::Msg>>) -> Vec<u8> {
    let mut buf = Vec::new();

    loop {
        if buf.len() >= RELAY_READ_BUF_SIZE {
            break;
        }
        let Some(channel) = slot.as_mut() else { break };

        // Zero timeout polls the channel once without waiting
        let polled = tokio::time::timeout(Duration::ZERO, channel.wait()).await;
        match polled {
            Err(_) => break,
            Ok(Some(ChannelMsg::Data { data })) => buf.extend_from_slice(&data),
            Ok(Some(ChannelMsg::ExtendedData { data, .. })) => buf.extend_from_slice(&data),
            Ok(Some(ChannelMsg::Eof | ChannelMsg::Close)) | Ok(None) => {
                debug!("shell channel closed by remote");
                *slot = None;
                break;
            }
            // Exit status and similar control messages carry no pty bytes
            Ok(Some(_)) => {}
        }
    }

    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    mod status_cell {
        use super::*;

        #[test]
        fn test_starts_disconnected() {
            assert_eq!(StatusCell::new().get(), WorkerStatus::Disconnected);
        }

        #[test]
        fn test_claim_wins_once() {
            let cell = StatusCell::new();
            assert!(cell.claim());
            assert_eq!(cell.get(), WorkerStatus::Connected);
            // A raced second claim loses
            assert!(!cell.claim());
        }

        #[test]
        fn test_disconnect_true_only_on_transition() {
            let cell = StatusCell::new();
            cell.claim();
            assert!(cell.disconnect());
            // Double cleanup is a no-op
            assert!(!cell.disconnect());
            assert_eq!(cell.get(), WorkerStatus::Disconnected);
        }

        #[test]
        fn test_disconnect_without_connection_is_noop() {
            let cell = StatusCell::new();
            assert!(!cell.disconnect());
            assert_eq!(cell.get(), WorkerStatus::Disconnected);
        }

        #[test]
        fn test_retire_is_absorbing() {
            let cell = StatusCell::new();
            cell.claim();
            cell.retire();
            assert_eq!(cell.get(), WorkerStatus::Retired);
            assert!(!cell.claim());
            assert!(!cell.disconnect());
            assert_eq!(cell.get(), WorkerStatus::Retired);
        }
    }

    mod status_repr {
        use super::*;

        #[test]
        fn test_roundtrip() {
            for status in [
                WorkerStatus::Disconnected,
                WorkerStatus::Connected,
                WorkerStatus::Retired,
            ] {
                assert_eq!(WorkerStatus::from_u8(status as u8), status);
            }
        }

        #[test]
        fn test_unknown_raw_maps_to_retired() {
            assert_eq!(WorkerStatus::from_u8(250), WorkerStatus::Retired);
        }
    }
}
