//! Guard chain for inbound relay commands.
//!
//! Gates are evaluated in the order they were added. The first failing gate
//! short-circuits the chain and yields the `ERROR` event to emit in place of
//! running the command.

use tracing::debug;

use crate::agent::config::AgentState;
use crate::agent::protocol::{ErrorKind, OutboundEvent};
use crate::agent::session::SessionStore;

/// Everything a gate may inspect when deciding whether a command proceeds.
pub struct GateContext<'a> {
    pub state: &'a AgentState,
    pub store: &'a SessionStore,
    pub conn_id: &'a str,
}

/// Guard predicate wrapping a websocket command.
pub trait Gate: Send + Sync {
    /// `Ok(())` lets the command run; `Err` carries the `ERROR` event to emit
    /// instead.
    fn check(&self, ctx: &GateContext<'_>) -> Result<(), OutboundEvent>;

    /// Gate name, for logging.
    fn name(&self) -> &'static str;
}

/// Passes only after first-boot initialization installed a bridge key.
pub struct InitGate;

impl Gate for InitGate {
    fn check(&self, ctx: &GateContext<'_>) -> Result<(), OutboundEvent> {
        if ctx.state.is_initialized() && !ctx.state.bridge_key().is_empty() {
            Ok(())
        } else {
            Err(OutboundEvent::error(
                ErrorKind::InitNeeded,
                "Server is not initialized.",
            ))
        }
    }

    fn name(&self) -> &'static str {
        "init"
    }
}

/// Passes only for connections whose token validation left `valid: true` in
/// the session store.
pub struct AuthGate;

impl Gate for AuthGate {
    fn check(&self, ctx: &GateContext<'_>) -> Result<(), OutboundEvent> {
        if ctx.store.is_valid(ctx.conn_id) {
            Ok(())
        } else {
            Err(OutboundEvent::error(ErrorKind::Auth, "Not authorized"))
        }
    }

    fn name(&self) -> &'static str {
        "auth"
    }
}

/// Ordered chain of gates guarding a command.
///
/// # Example
///
/// ```ignore
/// let chain = GateChain::new().with_init().with_auth();
///
/// if let Err(event) = chain.check(&ctx) {
///     return emit(event);
/// }
/// ```
pub struct GateChain {
    gates: Vec<Box<dyn Gate>>,
}

impl GateChain {
    /// Create a new empty gate chain.
    pub fn new() -> Self {
        Self { gates: Vec::new() }
    }

    /// Require first-boot initialization.
    pub fn with_init(mut self) -> Self {
        self.gates.push(Box::new(InitGate));
        self
    }

    /// Require an authenticated session.
    pub fn with_auth(mut self) -> Self {
        self.gates.push(Box::new(AuthGate));
        self
    }

    /// Check if the chain has any gates.
    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }

    /// Get the number of gates in the chain.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.gates.len()
    }

    /// Run every gate in order; the first rejection wins.
    pub fn check(&self, ctx: &GateContext<'_>) -> Result<(), OutboundEvent> {
        for gate in &self.gates {
            if let Err(event) = gate.check(ctx) {
                debug!(gate = gate.name(), conn_id = ctx.conn_id, "gate rejected command");
                return Err(event);
            }
        }
        Ok(())
    }
}

impl Default for GateChain {
    fn default() -> Self {
        Self::new()
    }
}
