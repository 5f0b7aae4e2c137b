//! Configuration resolution for the relay agent.
//!
//! Values are resolved with a three-tier priority system:
//!
//! 1. **Parameter** - Explicitly provided function parameter (highest priority)
//! 2. **Environment Variable** - Value from environment variable
//! 3. **Default** - Built-in default value (lowest priority)
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `API_URL` | `http://api.together-coding.com` | Bridge/auth service base URL |
//! | `SSH_HOST` | `127.0.0.1` | SSH server the agent relays onto |
//! | `SSH_PORT` | 22 | SSH server port |
//! | `MAX_SSH_CONNECTIONS` | 5 | Per-identity ceiling of live SSH sessions |
//! | `OS_USERNAME` | `together` | OS account whose password `/init` rotates |
//! | `SSH_CONNECT_TIMEOUT` | 30s | Connection timeout in seconds |
//! | `SSH_MAX_RETRIES` | 3 | Maximum retry attempts |
//! | `SSH_RETRY_DELAY_MS` | 1000ms | Initial retry delay in milliseconds |
//!
//! The listen port (`TERMGATE_PORT`, default 8989) is read directly by the
//! binary entrypoint.

use std::env;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Default bridge/auth service base URL
pub(crate) const DEFAULT_API_URL: &str = "http://api.together-coding.com";

/// Default SSH server host (the agent relays onto its own machine)
pub(crate) const DEFAULT_SSH_HOST: &str = "127.0.0.1";

/// Default SSH server port
pub(crate) const DEFAULT_SSH_PORT: u16 = 22;

/// Default per-identity ceiling of concurrently connected SSH sessions
pub(crate) const DEFAULT_MAX_SSH_CONNECTIONS: usize = 5;

/// Default OS account managed by the initialization endpoint
pub(crate) const DEFAULT_OS_USERNAME: &str = "together";

/// Default SSH connection timeout in seconds
pub(crate) const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default maximum retry attempts for SSH connection
pub(crate) const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default retry delay in milliseconds
pub(crate) const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

/// Maximum retry delay cap
pub(crate) const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Yield interval of the SSH->client forwarding loop
pub(crate) const RELAY_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Upper bound on bytes drained from the channel per loop tick
pub(crate) const RELAY_READ_BUF_SIZE: usize = 32 * 1024;

/// Channel re-creation attempts a worker may consume before giving up
pub(crate) const CHANNEL_RETRY_BUDGET: i32 = 5;

/// Bounded wait on the OS password-change helper
pub(crate) const PASSWD_WAIT: Duration = Duration::from_secs(5);

/// Initial pty dimensions requested for new shell channels
pub(crate) const DEFAULT_PTY_COLS: u32 = 80;
pub(crate) const DEFAULT_PTY_ROWS: u32 = 24;

/// Environment variable name for the bridge/auth service base URL
pub(crate) const API_URL_ENV_VAR: &str = "API_URL";

/// Environment variable name for the SSH server host
pub(crate) const SSH_HOST_ENV_VAR: &str = "SSH_HOST";

/// Environment variable name for the SSH server port
pub(crate) const SSH_PORT_ENV_VAR: &str = "SSH_PORT";

/// Environment variable name for the per-identity session ceiling
pub(crate) const MAX_CONNECTIONS_ENV_VAR: &str = "MAX_SSH_CONNECTIONS";

/// Environment variable name for the managed OS account
pub(crate) const OS_USERNAME_ENV_VAR: &str = "OS_USERNAME";

/// Environment variable name for SSH connection timeout
pub(crate) const CONNECT_TIMEOUT_ENV_VAR: &str = "SSH_CONNECT_TIMEOUT";

/// Environment variable name for SSH max retries
pub(crate) const MAX_RETRIES_ENV_VAR: &str = "SSH_MAX_RETRIES";

/// Environment variable name for SSH retry delay in milliseconds
pub(crate) const RETRY_DELAY_MS_ENV_VAR: &str = "SSH_RETRY_DELAY_MS";

/// Resolve the bridge/auth service base URL with priority: parameter -> env var -> default
pub fn resolve_api_url(url_param: Option<String>) -> String {
    if let Some(url) = url_param {
        return url;
    }

    if let Ok(url) = env::var(API_URL_ENV_VAR)
        && !url.is_empty()
    {
        return url;
    }

    DEFAULT_API_URL.to_string()
}

/// Resolve the SSH server host with priority: parameter -> env var -> default
pub fn resolve_ssh_host(host_param: Option<String>) -> String {
    if let Some(host) = host_param {
        return host;
    }

    if let Ok(host) = env::var(SSH_HOST_ENV_VAR)
        && !host.is_empty()
    {
        return host;
    }

    DEFAULT_SSH_HOST.to_string()
}

/// Resolve the SSH server port with priority: parameter -> env var -> default
pub fn resolve_ssh_port(port_param: Option<u16>) -> u16 {
    if let Some(port) = port_param {
        return port;
    }

    if let Ok(env_port) = env::var(SSH_PORT_ENV_VAR)
        && let Ok(port) = env_port.parse::<u16>()
    {
        return port;
    }

    DEFAULT_SSH_PORT
}

/// Resolve the per-identity connection ceiling with priority: parameter -> env var -> default
pub fn resolve_max_connections(limit_param: Option<usize>) -> usize {
    if let Some(limit) = limit_param {
        return limit;
    }

    if let Ok(env_limit) = env::var(MAX_CONNECTIONS_ENV_VAR)
        && let Ok(limit) = env_limit.parse::<usize>()
    {
        return limit;
    }

    DEFAULT_MAX_SSH_CONNECTIONS
}

/// Resolve the managed OS account name with priority: parameter -> env var -> default
pub fn resolve_os_username(username_param: Option<String>) -> String {
    if let Some(username) = username_param {
        return username;
    }

    if let Ok(username) = env::var(OS_USERNAME_ENV_VAR)
        && !username.is_empty()
    {
        return username;
    }

    DEFAULT_OS_USERNAME.to_string()
}

/// Resolve the connection timeout value with priority: parameter -> env var -> default
pub fn resolve_connect_timeout(timeout_param: Option<u64>) -> u64 {
    if let Some(timeout) = timeout_param {
        return timeout;
    }

    if let Ok(env_timeout) = env::var(CONNECT_TIMEOUT_ENV_VAR)
        && let Ok(timeout) = env_timeout.parse::<u64>()
    {
        return timeout;
    }

    DEFAULT_CONNECT_TIMEOUT_SECS
}

/// Resolve the max retries value with priority: parameter -> env var -> default
pub fn resolve_max_retries(max_retries_param: Option<u32>) -> u32 {
    if let Some(max_retries) = max_retries_param {
        return max_retries;
    }

    if let Ok(env_retries) = env::var(MAX_RETRIES_ENV_VAR)
        && let Ok(retries) = env_retries.parse::<u32>()
    {
        return retries;
    }

    DEFAULT_MAX_RETRIES
}

/// Resolve the retry delay value with priority: parameter -> env var -> default
pub fn resolve_retry_delay_ms(retry_delay_param: Option<u64>) -> u64 {
    if let Some(delay) = retry_delay_param {
        return delay;
    }

    if let Ok(env_delay) = env::var(RETRY_DELAY_MS_ENV_VAR)
        && let Ok(delay) = env_delay.parse::<u64>()
    {
        return delay;
    }

    DEFAULT_RETRY_DELAY_MS
}

/// Process-wide initialization state installed by the bridge.
///
/// The bridge calls `/init` exactly once per boot, handing over the shared
/// API key; until then every gated relay command and bridge-only HTTP
/// endpoint is refused. Constructed in `main` and injected into handlers so
/// tests can build independent instances.
pub struct AgentState {
    server_init: AtomicBool,
    bridge_key: RwLock<String>,
}

impl AgentState {
    /// Create a fresh, uninitialized state (no bridge key).
    pub fn new() -> Self {
        Self {
            server_init: AtomicBool::new(false),
            bridge_key: RwLock::new(String::new()),
        }
    }

    /// Whether first-boot initialization has completed.
    pub fn is_initialized(&self) -> bool {
        self.server_init.load(Ordering::SeqCst)
    }

    /// Current bridge key; empty until installed.
    pub fn bridge_key(&self) -> String {
        self.bridge_key
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Store the bridge key and mark the agent initialized.
    pub fn install_bridge_key(&self, key: &str) {
        let mut slot = self.bridge_key.write().unwrap_or_else(|e| e.into_inner());
        *slot = key.to_string();
        drop(slot);
        self.server_init.store(true, Ordering::SeqCst);
    }

    /// Revoke initialization; used when the stored key turns out empty.
    pub fn mark_uninitialized(&self) {
        self.server_init.store(false, Ordering::SeqCst);
    }
}

impl Default for AgentState {
    fn default() -> Self {
        Self::new()
    }
}
