//! Connection pool: registry of relay workers keyed by destination
//! fingerprint, with a per-identity capacity ceiling.
//!
//! Reuse rules: a `Disconnected` worker for the same destination is claimed,
//! rebound and nudged with a pty resize; a claimed worker whose SSH handles
//! died is retired on the spot and replaced with a fresh dial. Capacity is
//! counted over live workers attributed to the identity plus dials still in
//! flight, so two racing acquires cannot both squeeze past the ceiling.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use rand::Rng;
use tokio::sync::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

use crate::agent::client::{connect_with_retry, open_shell_channel};
use crate::agent::config::{
    DEFAULT_PTY_COLS, DEFAULT_PTY_ROWS, resolve_connect_timeout, resolve_max_retries,
    resolve_retry_delay_ms,
};
use crate::agent::error::AcquireError;
use crate::agent::protocol::OutboundEvent;
use crate::agent::relay::{RelayWorker, WorkerStatus};
use crate::agent::types::Destination;

/// The only SSH auth scheme the agent can drive
pub(crate) const PASSWORD_AUTH_TYPE: &str = "password";

struct PoolInner {
    /// destination fingerprint -> workers for that destination
    registry: HashMap<String, Vec<Arc<RelayWorker>>>,
    /// identity fingerprint -> dials currently in flight
    pending: HashMap<String, usize>,
}

impl PoolInner {
    fn connected_count(&self, identity_fp: &str) -> usize {
        self.registry
            .values()
            .flatten()
            .filter(|w| {
                w.identity_fingerprint() == identity_fp && w.status() == WorkerStatus::Connected
            })
            .count()
    }

    fn reserve(&mut self, identity_fp: &str) {
        *self.pending.entry(identity_fp.to_string()).or_insert(0) += 1;
    }

    fn unreserve(&mut self, identity_fp: &str) {
        if let Some(count) = self.pending.get_mut(identity_fp) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.pending.remove(identity_fp);
            }
        }
    }
}

/// Capacity decision: live sessions plus in-flight dials must stay under the
/// ceiling.
fn admit(connected: usize, pending: usize, limit: usize) -> bool {
    connected + pending < limit
}

/// Jittered dimensions for the rebind resize, so the remote repaints its
/// screen for the new client.
fn recycle_dimensions() -> (u32, u32) {
    let mut rng = rand::thread_rng();
    (
        DEFAULT_PTY_COLS + rng.gen_range(0..10),
        DEFAULT_PTY_ROWS + rng.gen_range(0..10),
    )
}

/// Pool of SSH relay workers shared by all websocket connections.
pub struct WorkerPool {
    inner: Mutex<PoolInner>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                registry: HashMap::new(),
                pending: HashMap::new(),
            }),
        }
    }

    /// Hand out a worker for `destination`, bound to `conn_id`.
    ///
    /// Order of failure checks: capacity first, then (when a fresh dial is
    /// needed) the declared auth scheme, then connection/authentication
    /// errors from the dial itself.
    pub async fn acquire(
        &self,
        conn_id: &str,
        tx: UnboundedSender<OutboundEvent>,
        destination: Destination,
        auth_type: &str,
        auth_secret: &str,
        limit: usize,
    ) -> Result<Arc<RelayWorker>, AcquireError> {
        let fingerprint = destination.fingerprint();
        let identity_fp = destination.identity.fingerprint();

        let mut to_retire: Vec<Arc<RelayWorker>> = Vec::new();
        let mut claimed: Option<Arc<RelayWorker>> = None;

        {
            let mut inner = self.inner.lock().await;

            let connected = inner.connected_count(&identity_fp);
            let pending = inner.pending.get(&identity_fp).copied().unwrap_or(0);
            if !admit(connected, pending, limit) {
                warn!(conn_id, identity_fp = %identity_fp, connected, pending, limit,
                    "connection ceiling reached");
                return Err(AcquireError::OverCapacity);
            }

            if let Some(workers) = inner.registry.get_mut(&fingerprint) {
                let mut index = 0;
                while index < workers.len() {
                    let worker = &workers[index];
                    if worker.try_claim() {
                        if worker.is_usable().await {
                            claimed = Some(Arc::clone(worker));
                            break;
                        }
                        // Claimed a corpse; pull it out and keep scanning
                        to_retire.push(workers.remove(index));
                        continue;
                    }
                    index += 1;
                }
            }

            if claimed.is_none() {
                if auth_type != PASSWORD_AUTH_TYPE {
                    return Err(AcquireError::AuthMethodUnsupported(auth_type.to_string()));
                }
                // Reserve a capacity slot while the dial is in flight
                inner.reserve(&identity_fp);
            }
        }

        for worker in to_retire {
            warn!(worker_id = %worker.id, "retiring unusable pooled worker");
            worker.destruct().await;
        }

        if let Some(worker) = claimed {
            worker.bind(conn_id, tx).await;
            let (cols, rows) = recycle_dimensions();
            worker.resize(cols, rows).await;
            info!(worker_id = %worker.id, conn_id, destination = %worker.destination,
                "reusing pooled worker");
            return Ok(worker);
        }

        // Fresh dial, outside the registry lock
        let dialed = self.connect_worker(&destination, auth_secret).await;

        let mut inner = self.inner.lock().await;
        inner.unreserve(&identity_fp);
        match dialed {
            Ok(worker) => {
                // Claim before registering so a concurrent acquire cannot
                // steal the brand-new worker
                worker.try_claim();
                inner
                    .registry
                    .entry(fingerprint)
                    .or_default()
                    .push(Arc::clone(&worker));
                drop(inner);

                worker.bind(conn_id, tx).await;
                info!(worker_id = %worker.id, conn_id, destination = %worker.destination,
                    "created relay worker");
                Ok(worker)
            }
            Err(e) => Err(e),
        }
    }

    async fn connect_worker(
        &self,
        destination: &Destination,
        password: &str,
    ) -> Result<Arc<RelayWorker>, AcquireError> {
        let timeout = Duration::from_secs(resolve_connect_timeout(None));
        let max_retries = resolve_max_retries(None);
        let min_delay = Duration::from_millis(resolve_retry_delay_ms(None));

        let handle = connect_with_retry(
            &destination.dest,
            destination.port,
            &destination.ssh_user,
            password,
            timeout,
            max_retries,
            min_delay,
        )
        .await?;

        let channel = open_shell_channel(&handle, DEFAULT_PTY_COLS, DEFAULT_PTY_ROWS)
            .await
            .map_err(|e| AcquireError::ConnectFailed(e.to_string()))?;

        Ok(RelayWorker::new(destination.clone(), handle, channel))
    }

    /// Tear down every pooled worker. Called once on process shutdown.
    pub async fn retire_all(&self) {
        let workers: Vec<Arc<RelayWorker>> = {
            let mut inner = self.inner.lock().await;
            inner.registry.drain().flat_map(|(_, list)| list).collect()
        };
        for worker in workers {
            worker.destruct().await;
        }
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Global worker pool instance.
pub static WORKER_POOL: Lazy<WorkerPool> = Lazy::new(WorkerPool::new);
