//! Tunables for the session core. On-disk configuration layout is owned by
//! the embedding server; the core only sees these resolved structs.

use std::collections::HashMap;
use std::time::Duration;

use oppi_protocol::RiskLevel;

use crate::policy::RuleAction;

/// Timeouts governing the permission gate's fail-closed behavior.
#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Hard ceiling on how long a tool call may wait for the user. Elapsing
    /// resolves the request as deny with reason `timeout`.
    pub ask_timeout: Duration,

    /// How long a request may stay pending while the session has zero
    /// subscribers before it is denied with reason `no_client`.
    pub no_client_grace: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            ask_timeout: Duration::from_secs(10 * 60),
            no_client_grace: Duration::from_secs(60),
        }
    }
}

/// Retention limits for the per-session event ring.
#[derive(Debug, Clone)]
pub struct FanoutConfig {
    /// Maximum retained events per session.
    pub max_events: usize,

    /// Maximum retained serialized bytes per session. Whichever limit is hit
    /// first evicts FIFO.
    pub max_bytes: usize,

    /// Capacity of each subscriber's delivery channel. A subscriber that
    /// falls this far behind live publishing is dropped with `overflow`.
    pub subscriber_capacity: usize,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            max_events: 4096,
            max_bytes: 10 * 1024 * 1024,
            subscriber_capacity: 256,
        }
    }
}

/// Per-tool override of the default classification. Risk tiers are policy
/// configuration, not gate code.
#[derive(Debug, Clone, Copy)]
pub struct ToolDefault {
    pub action: RuleAction,
    pub risk: RiskLevel,
}

#[derive(Debug, Clone, Default)]
pub struct PolicyConfig {
    /// Exact tool name → override of the built-in class table.
    pub tool_overrides: HashMap<String, ToolDefault>,
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// A `ready` session with zero subscribers for this long is stopped.
    pub idle_timeout: Duration,

    /// How long a terminal session remains in the registry so reconnecting
    /// clients can still replay its ring.
    pub terminal_ttl: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30 * 60),
            terminal_ttl: Duration::from_secs(5 * 60),
        }
    }
}

/// Aggregate configuration handed to [`crate::SessionRegistry`].
#[derive(Debug, Clone, Default)]
pub struct CoreConfig {
    pub gate: GateConfig,
    pub fanout: FanoutConfig,
    pub policy: PolicyConfig,
    pub supervisor: SupervisorConfig,
}
