use std::io;

use thiserror::Error;
use tokio::task::JoinError;

pub type Result<T> = std::result::Result<T, OppiErr>;

#[derive(Error, Debug)]
pub enum OppiErr {
    #[error("no session with id: {0}")]
    SessionNotFound(String),

    /// The addressed session is in a terminal state and accepts no further
    /// operations. Turn operations never surface this through the transport;
    /// they are acknowledged as dropped instead.
    #[error("session {0} is terminal")]
    SessionTerminal(String),

    #[error("no permission request with id: {0}")]
    PermissionNotFound(String),

    #[error("no extension ui request with id: {0}")]
    ExtensionUiNotFound(String),

    #[error("agent engine failed: {0}")]
    Engine(String),

    /// Supervisor loop died unexpectedly; the session can no longer make
    /// progress.
    #[error("internal error; session supervisor died unexpectedly")]
    SupervisorDied,

    #[error("rule store error: {0}")]
    RuleStore(String),

    // -----------------------------------------------------------------
    // Automatic conversions for common external error types
    // -----------------------------------------------------------------
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    TokioJoin(#[from] JoinError),
}
