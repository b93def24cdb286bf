//! The seam between the session core and the agent engine.
//!
//! The engine (the LLM-driven tool-calling loop) is an external
//! collaborator. The core instantiates it through [`EngineFactory`] with the
//! permission gate bound as its [`ToolInterceptor`], then drives it one turn
//! at a time and translates its native [`EngineEvent`] stream into session
//! events.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use oppi_protocol::Attachment;
use oppi_protocol::TokenUsage;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum EngineError {
    /// The engine can no longer make progress; terminal for the session.
    #[error("agent engine crashed: {0}")]
    Crashed(String),

    /// The engine rejected this input; the session itself is fine.
    #[error("agent engine rejected input: {0}")]
    Rejected(String),
}

/// Parameters for instantiating an engine for one session.
#[derive(Debug, Clone)]
pub struct EngineSpec {
    pub session_id: String,
    pub workspace_id: String,
    pub model: String,
}

/// One user-originated turn handed to the engine.
#[derive(Debug, Clone, Default)]
pub struct TurnInput {
    pub message: String,
    pub attachments: Vec<Attachment>,
}

/// A tool invocation the engine is about to execute.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub tool_call_id: String,
    pub tool: String,
    pub input: Value,
}

/// Verdict returned to the engine for an intercepted tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct InterceptDecision {
    pub block: bool,
    pub reason: Option<String>,
}

impl InterceptDecision {
    pub fn pass() -> Self {
        Self {
            block: false,
            reason: None,
        }
    }

    pub fn block(reason: impl Into<String>) -> Self {
        Self {
            block: true,
            reason: Some(reason.into()),
        }
    }
}

/// Awaited by the engine before executing any tool call. Implemented by the
/// permission gate; suspends the calling tool task while the user decides.
#[async_trait]
pub trait ToolInterceptor: Send + Sync {
    async fn intercept(&self, call: ToolCall) -> InterceptDecision;
}

/// Usage and accounting the engine reports when a turn completes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnUsage {
    pub usage: Option<TokenUsage>,
    pub cost_usd: Option<f64>,
    pub context_used: Option<u64>,
}

/// The engine's native event set. The supervisor translates these losslessly
/// into session events; [`EngineEvent::Other`] is the forward-compatibility
/// sentinel for engine builds newer than this adapter and surfaces as an
/// `unknown_event` error, never a silent drop.
///
/// Streaming text is append-only: an engine with replace-style partial
/// results must diff on its side of this seam.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    TextDelta {
        delta: String,
    },
    ThinkingDelta {
        delta: String,
    },
    ToolStart {
        call_id: String,
        tool: String,
        input: Value,
    },
    ToolOutput {
        call_id: String,
        chunk: String,
    },
    ToolEnd {
        call_id: String,
        success: bool,
        /// Set when the gate blocked the call.
        blocked: bool,
        message: Option<String>,
    },
    /// One assistant message is complete.
    MessageEnd,
    /// The engine wants the client to render custom UI.
    ExtensionUiRequest {
        id: String,
        payload: Value,
    },
    /// Non-fatal engine problem surfaced to subscribers.
    Warning {
        message: String,
    },
    /// The turn finished cleanly.
    TurnComplete {
        usage: TurnUsage,
        last_message: Option<String>,
    },
    /// Anything this adapter does not recognize; `raw` carries the original
    /// record including its type tag.
    Other {
        raw: Value,
    },
}

/// The in-process agent engine for one session.
#[async_trait]
pub trait AgentEngine: Send + Sync {
    /// Resolves once the engine can accept its first turn.
    async fn wait_ready(&self) -> Result<(), EngineError>;

    /// Run one turn to completion, emitting events into `events`. Returns
    /// when the turn is complete or was aborted.
    async fn run_turn(
        &self,
        input: TurnInput,
        events: mpsc::Sender<EngineEvent>,
    ) -> Result<(), EngineError>;

    /// Inject a steering interrupt into the currently running turn.
    async fn steer(&self, message: String) -> Result<(), EngineError>;

    /// Ask the engine to stop the current turn. Idempotent.
    async fn abort_turn(&self);

    /// Deliver the client's answer to an extension UI request.
    async fn extension_ui_response(&self, id: String, value: Value);

    /// Path of the engine's persistent session trace, the core's sole
    /// persisted handle.
    fn trace_path(&self) -> PathBuf;

    /// Model context window, when the engine knows it.
    fn context_window(&self) -> Option<u64> {
        None
    }
}

/// Creates engines with the gate interceptor already bound.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create(
        &self,
        spec: EngineSpec,
        interceptor: Arc<dyn ToolInterceptor>,
    ) -> anyhow::Result<Arc<dyn AgentEngine>>;
}
