//! One session's coordinator.
//!
//! The supervisor owns the lifecycle state machine, wires the agent engine
//! to the gate and the fan-out, and serializes user-originated turn
//! operations against the running agent loop. Cross-session code never
//! holds a reference into a supervisor; the registry maps ids to
//! supervisors and drops the entry when one terminates.

// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

use chrono::DateTime;
use chrono::Utc;
use oppi_protocol::ApprovalScope;
use oppi_protocol::Attachment;
use oppi_protocol::DropReason;
use oppi_protocol::ErrorKind;
use oppi_protocol::PermissionAction;
use oppi_protocol::SessionEvent;
use oppi_protocol::SessionInfo;
use oppi_protocol::SessionStatus;
use oppi_protocol::SubscriptionLevel;
use oppi_protocol::ToolError;
use oppi_protocol::TurnStage;
use tokio::sync::Notify;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::config::CoreConfig;
use crate::engine::AgentEngine;
use crate::engine::EngineError;
use crate::engine::EngineEvent;
use crate::engine::EngineFactory;
use crate::engine::EngineSpec;
use crate::engine::ToolInterceptor;
use crate::engine::TurnInput;
use crate::error::OppiErr;
use crate::error::Result;
use crate::fanout::EventFanout;
use crate::fanout::SubscriptionHandle;
use crate::gate::PermissionGate;
use crate::gate::REASON_SESSION_STOPPED;
use crate::gate::REASON_TURN_ABORTED;
use crate::gate::Resolution;
use crate::policy::PolicyEngine;
use crate::turns::Admission;
use crate::turns::QueuedTurn;
use crate::turns::TurnOpKind;
use crate::turns::TurnScheduler;

/// Non-fatal session conditions surfaced through `SessionInfo.warnings`.
#[derive(Clone, Default)]
pub struct SharedWarnings(Arc<Mutex<Vec<String>>>);

impl SharedWarnings {
    pub fn push(&self, warning: String) {
        self.0.lock().unwrap().push(warning);
    }

    fn snapshot(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

/// Parameters for starting a new session.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub workspace_id: String,
    pub model: String,
}

#[derive(Debug)]
struct Accounting {
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    message_count: u64,
    input_tokens: u64,
    output_tokens: u64,
    cost_usd: f64,
    context_used: u64,
}

struct RunningTurn {
    client_turn_id: String,
    handle: AbortHandle,
}

struct SupervisorState {
    status: SessionStatus,
    status_cause: Option<String>,
    scheduler: TurnScheduler,
    current_turn: Option<RunningTurn>,
    pending_ui: HashSet<String>,
    accounting: Accounting,
}

pub struct SessionSupervisor {
    /// Back-reference for spawning turn tasks that outlive the caller.
    me: Weak<SessionSupervisor>,
    session_id: String,
    workspace_id: String,
    model: String,
    config: CoreConfig,
    policy: Arc<PolicyEngine>,
    fanout: Arc<EventFanout>,
    gate: Arc<PermissionGate>,
    engine: Arc<dyn AgentEngine>,
    warnings: SharedWarnings,
    state: Mutex<SupervisorState>,
    state_changed: Notify,
    closed: CancellationToken,
}

impl std::fmt::Debug for SessionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSupervisor")
            .field("session_id", &self.session_id)
            .field("workspace_id", &self.workspace_id)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl SessionSupervisor {
    /// Construct the session: bind the gate as the engine's interceptor,
    /// instantiate the engine, and start the supervisor loop. The session is
    /// `starting` until the engine signals readiness.
    pub async fn spawn(
        params: SessionParams,
        config: CoreConfig,
        policy: Arc<PolicyEngine>,
        factory: &dyn EngineFactory,
    ) -> Result<Arc<Self>> {
        let session_id = Uuid::new_v4().to_string();
        let fanout = Arc::new(EventFanout::new(&session_id, config.fanout.clone()));
        let warnings = SharedWarnings::default();
        let gate = Arc::new(PermissionGate::new(
            &session_id,
            config.gate.clone(),
            policy.clone(),
            fanout.clone(),
            warnings.clone(),
        ));
        policy.register_session(&session_id, &params.workspace_id);

        let spec = EngineSpec {
            session_id: session_id.clone(),
            workspace_id: params.workspace_id.clone(),
            model: params.model.clone(),
        };
        let interceptor: Arc<dyn ToolInterceptor> = gate.clone();
        let engine = match factory.create(spec, interceptor).await {
            Ok(engine) => engine,
            Err(e) => {
                policy.unregister_session(&session_id);
                return Err(OppiErr::Engine(format!("{e:#}")));
            }
        };

        let now = Utc::now();
        let supervisor = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            session_id: session_id.clone(),
            workspace_id: params.workspace_id,
            model: params.model,
            config,
            policy,
            fanout,
            gate,
            engine,
            warnings,
            state: Mutex::new(SupervisorState {
                status: SessionStatus::Starting,
                status_cause: None,
                scheduler: TurnScheduler::default(),
                current_turn: None,
                pending_ui: HashSet::new(),
                accounting: Accounting {
                    created_at: now,
                    last_activity: now,
                    message_count: 0,
                    input_tokens: 0,
                    output_tokens: 0,
                    cost_usd: 0.0,
                    context_used: 0,
                },
            }),
            state_changed: Notify::new(),
            closed: CancellationToken::new(),
        });

        info!(session_id = %session_id, "session supervisor starting");
        supervisor.publish_state();
        tokio::spawn(run_loop(supervisor.clone()));
        Ok(supervisor)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn status(&self) -> SessionStatus {
        self.state.lock().unwrap().status
    }

    /// Cancelled once the session reaches a terminal state.
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn pending_permissions(&self) -> usize {
        self.gate.pending_count()
    }

    pub fn subscriber_count(&self) -> usize {
        self.fanout.subscriber_count()
    }

    /// Current snapshot of the session.
    pub fn info(&self) -> SessionInfo {
        let state = self.state.lock().unwrap();
        SessionInfo {
            id: self.session_id.clone(),
            workspace_id: self.workspace_id.clone(),
            status: state.status,
            created_at: state.accounting.created_at,
            last_activity: state.accounting.last_activity,
            message_count: state.accounting.message_count,
            input_tokens: state.accounting.input_tokens,
            output_tokens: state.accounting.output_tokens,
            cost_usd: state.accounting.cost_usd,
            model: self.model.clone(),
            context_window: self.engine.context_window(),
            context_used: state.accounting.context_used,
            trace_path: self.engine.trace_path(),
            warnings: self.warnings.snapshot(),
        }
    }

    /// Attach a subscriber. Reconnects (an explicit `since_seq`) receive a
    /// synthetic baseline `state` record first so the client has a known
    /// starting point even when the ring has moved on.
    pub fn subscribe(
        &self,
        since_seq: Option<u64>,
        level: SubscriptionLevel,
    ) -> SubscriptionHandle {
        let baseline = since_seq.map(|_| self.state_event());
        self.fanout.subscribe(since_seq.unwrap_or(0), level, baseline)
    }

    pub fn unsubscribe(&self, handle_id: u64) {
        self.fanout.unsubscribe(handle_id);
    }

    pub async fn prompt(
        &self,
        client_turn_id: &str,
        message: String,
        attachments: Vec<Attachment>,
    ) {
        self.submit(
            TurnOpKind::Prompt,
            client_turn_id,
            TurnInput {
                message,
                attachments,
            },
        )
        .await;
    }

    pub async fn steer(&self, client_turn_id: &str, message: String) {
        self.submit(
            TurnOpKind::Steer,
            client_turn_id,
            TurnInput {
                message,
                attachments: Vec::new(),
            },
        )
        .await;
    }

    pub async fn follow_up(&self, client_turn_id: &str, message: String) {
        self.submit(
            TurnOpKind::FollowUp,
            client_turn_id,
            TurnInput {
                message,
                attachments: Vec::new(),
            },
        )
        .await;
    }

    /// Ask the engine to stop the current turn; the session returns to
    /// `ready` when the engine unwinds. Pending permission requests resolve
    /// as denied, and the interrupted turn is acknowledged as dropped.
    pub async fn abort(&self) -> Result<()> {
        if self.status().is_terminal() {
            return Err(OppiErr::SessionTerminal(self.session_id.clone()));
        }
        debug!(session_id = %self.session_id, "abort requested");
        let aborted_turn = {
            let state = self.state.lock().unwrap();
            state
                .current_turn
                .as_ref()
                .map(|turn| turn.client_turn_id.clone())
        };
        // Ack before releasing the gate so the drop precedes the turn's
        // remaining events.
        if let Some(client_turn_id) = aborted_turn {
            self.ack(&client_turn_id, TurnStage::Dropped, Some(DropReason::Aborted));
        }
        self.gate.cancel_all(REASON_TURN_ABORTED);
        self.engine.abort_turn().await;
        Ok(())
    }

    pub fn has_permission(&self, id: &str) -> bool {
        self.gate.knows(id)
    }

    pub async fn respond_permission(
        &self,
        id: &str,
        action: PermissionAction,
        scope: ApprovalScope,
    ) -> Result<Resolution> {
        self.gate.respond(id, action, scope).await
    }

    pub fn has_extension_ui(&self, id: &str) -> bool {
        self.state.lock().unwrap().pending_ui.contains(id)
    }

    pub async fn respond_extension_ui(&self, id: &str, value: serde_json::Value) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if !state.pending_ui.remove(id) {
                return Err(OppiErr::ExtensionUiNotFound(id.to_string()));
            }
        }
        self.fanout.publish(SessionEvent::ExtensionUiResponse {
            id: id.to_string(),
            value: value.clone(),
        });
        self.engine.extension_ui_response(id.to_string(), value).await;
        Ok(())
    }

    /// Graceful stop: drain in-flight tool calls (fail-closed), drop queued
    /// follow-ups, then go terminal. Idempotent.
    pub async fn stop(&self, cause: Option<String>) {
        {
            let mut state = self.state.lock().unwrap();
            if state.status.is_terminal() || state.status == SessionStatus::Stopping {
                return;
            }
            state.status = SessionStatus::Stopping;
            state.status_cause = cause.clone();
        }
        info!(session_id = %self.session_id, ?cause, "session stopping");
        self.publish_state();

        self.engine.abort_turn().await;
        self.gate.cancel_all(REASON_SESSION_STOPPED);

        let (dropped, running) = {
            let mut state = self.state.lock().unwrap();
            (
                state.scheduler.drain_follow_ups(),
                state.current_turn.take(),
            )
        };
        for turn in dropped {
            self.ack(
                &turn.client_turn_id,
                TurnStage::Dropped,
                Some(DropReason::SessionTerminal),
            );
        }
        if let Some(turn) = running {
            if !turn.handle.is_finished() {
                turn.handle.abort();
            }
        }

        {
            let mut state = self.state.lock().unwrap();
            state.status = SessionStatus::Stopped;
        }
        self.publish_state();
        self.policy.unregister_session(&self.session_id);
        self.closed.cancel();
    }

    /// Unrecoverable engine failure: terminal for the session, never for
    /// the process.
    fn fail(&self, cause: String) {
        {
            let mut state = self.state.lock().unwrap();
            if state.status.is_terminal() {
                return;
            }
            state.status = SessionStatus::Error;
            state.status_cause = Some(cause.clone());
        }
        warn!(session_id = %self.session_id, %cause, "session failed");
        self.publish_state();
        self.gate.cancel_all(REASON_SESSION_STOPPED);
        let dropped = {
            let mut state = self.state.lock().unwrap();
            state.current_turn = None;
            state.scheduler.drain_follow_ups()
        };
        for turn in dropped {
            self.ack(
                &turn.client_turn_id,
                TurnStage::Dropped,
                Some(DropReason::SessionTerminal),
            );
        }
        self.policy.unregister_session(&self.session_id);
        self.closed.cancel();
    }

    async fn submit(&self, op: TurnOpKind, client_turn_id: &str, input: TurnInput) {
        let admission = {
            let mut state = self.state.lock().unwrap();
            let status = state.status;
            let admission = state.scheduler.admit(op, client_turn_id, status);
            if admission == Admission::Start {
                // Claim the turn while the lock is held so concurrent
                // prompts cannot both start.
                state.status = SessionStatus::Busy;
                state.status_cause = None;
            }
            admission
        };

        match admission {
            Admission::Drop(reason) => {
                debug!(client_turn_id, ?reason, "turn operation dropped");
                self.ack(client_turn_id, TurnStage::Dropped, Some(reason));
            }
            Admission::Start => {
                self.ack(client_turn_id, TurnStage::Received, None);
                self.publish_state();
                self.start_turn(client_turn_id.to_string(), input);
            }
            Admission::Inject => {
                self.ack(client_turn_id, TurnStage::Received, None);
                match self.engine.steer(input.message).await {
                    Ok(()) => {
                        self.bump_message_count();
                        self.ack(client_turn_id, TurnStage::Scheduled, None);
                        self.ack(client_turn_id, TurnStage::Delivered, None);
                    }
                    Err(e) => {
                        warn!(client_turn_id, "steer rejected by engine: {e}");
                        self.ack(
                            client_turn_id,
                            TurnStage::Dropped,
                            Some(DropReason::Precondition),
                        );
                    }
                }
            }
            Admission::Enqueue => {
                self.ack(client_turn_id, TurnStage::Received, None);
                let mut state = self.state.lock().unwrap();
                state.scheduler.push_follow_up(QueuedTurn {
                    client_turn_id: client_turn_id.to_string(),
                    input,
                });
            }
        }
    }

    fn start_turn(&self, client_turn_id: String, input: TurnInput) {
        self.bump_message_count();
        let Some(supervisor) = self.me.upgrade() else {
            return;
        };
        let turn_id = client_turn_id.clone();
        let handle = tokio::spawn(async move {
            run_turn_task(supervisor, turn_id, input).await;
        })
        .abort_handle();
        let mut state = self.state.lock().unwrap();
        state.current_turn = Some(RunningTurn {
            client_turn_id,
            handle,
        });
    }

    /// The engine finished (or unwound from) a turn: hand off to the next
    /// queued follow-up, or return to `ready`.
    fn finish_turn(&self, client_turn_id: &str) {
        let (next, became_ready) = {
            let mut state = self.state.lock().unwrap();
            if state
                .current_turn
                .as_ref()
                .is_some_and(|turn| turn.client_turn_id == client_turn_id)
            {
                state.current_turn = None;
            }
            if state.status != SessionStatus::Busy {
                (None, false)
            } else if let Some(queued) = state.scheduler.pop_follow_up() {
                (Some(queued), false)
            } else {
                state.status = SessionStatus::Ready;
                state.status_cause = None;
                (None, true)
            }
        };
        match next {
            Some(queued) => {
                debug!(
                    session_id = %self.session_id,
                    client_turn_id = %queued.client_turn_id,
                    "delivering queued follow-up"
                );
                self.start_turn(queued.client_turn_id, queued.input);
            }
            None if became_ready => self.publish_state(),
            None => {}
        }
    }

    fn handle_engine_event(&self, event: EngineEvent) {
        let session_event = match event {
            EngineEvent::TextDelta { delta } => SessionEvent::TextDelta { delta },
            EngineEvent::ThinkingDelta { delta } => SessionEvent::ThinkingDelta { delta },
            EngineEvent::ToolStart {
                call_id,
                tool,
                input,
            } => SessionEvent::ToolStart {
                call_id,
                tool,
                input,
            },
            EngineEvent::ToolOutput { call_id, chunk } => {
                SessionEvent::ToolOutput { call_id, chunk }
            }
            EngineEvent::ToolEnd {
                call_id,
                success,
                blocked,
                message,
            } => SessionEvent::ToolEnd {
                call_id,
                success,
                error: match (success, blocked) {
                    (true, _) => None,
                    (false, true) => Some(ToolError {
                        kind: ErrorKind::PolicyDenied,
                        message: message.unwrap_or_else(|| "blocked by policy".to_string()),
                    }),
                    (false, false) => Some(ToolError {
                        kind: ErrorKind::Internal,
                        message: message.unwrap_or_else(|| "tool failed".to_string()),
                    }),
                },
            },
            EngineEvent::MessageEnd => {
                self.bump_message_count();
                SessionEvent::MessageEnd
            }
            EngineEvent::ExtensionUiRequest { id, payload } => {
                self.state.lock().unwrap().pending_ui.insert(id.clone());
                SessionEvent::ExtensionUiRequest { id, payload }
            }
            EngineEvent::Warning { message } => {
                self.warnings.push(message.clone());
                SessionEvent::Error {
                    kind: ErrorKind::Internal,
                    message,
                }
            }
            EngineEvent::TurnComplete {
                usage,
                last_message,
            } => {
                {
                    let mut state = self.state.lock().unwrap();
                    if let Some(tokens) = usage.usage {
                        state.accounting.input_tokens += tokens.input_tokens;
                        state.accounting.output_tokens += tokens.output_tokens;
                    }
                    if let Some(cost) = usage.cost_usd {
                        state.accounting.cost_usd += cost;
                    }
                    if let Some(context) = usage.context_used {
                        state.accounting.context_used = context;
                    }
                }
                SessionEvent::AgentEnd {
                    usage: usage.usage,
                    last_message,
                }
            }
            EngineEvent::Other { raw } => {
                let tag = raw
                    .get("type")
                    .and_then(|value| value.as_str())
                    .unwrap_or("unknown");
                SessionEvent::Error {
                    kind: ErrorKind::UnknownEvent,
                    message: format!("unknown engine event: {tag}"),
                }
            }
        };
        self.touch();
        self.fanout.publish(session_event);
    }

    fn state_event(&self) -> SessionEvent {
        let (status, cause) = {
            let state = self.state.lock().unwrap();
            (state.status, state.status_cause.clone())
        };
        SessionEvent::State {
            status,
            cause,
            session: self.info(),
        }
    }

    fn publish_state(&self) {
        self.touch();
        let event = self.state_event();
        self.fanout.publish(event);
        self.state_changed.notify_waiters();
    }

    fn ack(&self, client_turn_id: &str, stage: TurnStage, reason: Option<DropReason>) {
        self.fanout.publish(SessionEvent::TurnAck {
            client_turn_id: client_turn_id.to_string(),
            stage,
            reason,
        });
    }

    fn bump_message_count(&self) {
        let mut state = self.state.lock().unwrap();
        state.accounting.message_count += 1;
    }

    fn touch(&self) {
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();
        if now > state.accounting.last_activity {
            state.accounting.last_activity = now;
        }
    }

    fn set_ready(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.status != SessionStatus::Starting {
                return;
            }
            state.status = SessionStatus::Ready;
        }
        info!(session_id = %self.session_id, "session ready");
        self.publish_state();
    }
}

/// Supervisor background loop: engine readiness, then the idle-timeout
/// watch. Turn completion is handled by the turn tasks themselves.
async fn run_loop(supervisor: Arc<SessionSupervisor>) {
    match supervisor.engine.wait_ready().await {
        Ok(()) => supervisor.set_ready(),
        Err(e) => {
            supervisor.fail(format!("engine failed to start: {e}"));
            return;
        }
    }

    let mut subscribers = supervisor.fanout.subscriber_watch();
    loop {
        let idle_armed = supervisor.status() == SessionStatus::Ready
            && *subscribers.borrow_and_update() == 0;
        tokio::select! {
            _ = supervisor.closed.cancelled() => break,
            changed = subscribers.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = supervisor.state_changed.notified() => {}
            _ = tokio::time::sleep(supervisor.config.supervisor.idle_timeout), if idle_armed => {
                info!(session_id = %supervisor.session_id, "idle with no subscribers; stopping");
                supervisor.stop(Some("idle_timeout".to_string())).await;
                break;
            }
        }
    }
    debug!(session_id = %supervisor.session_id, "supervisor loop exited");
}

/// Drives one engine turn: pumps the engine's event stream into the
/// fan-out, emits ack stages, and settles the session state afterwards.
async fn run_turn_task(
    supervisor: Arc<SessionSupervisor>,
    client_turn_id: String,
    input: TurnInput,
) {
    supervisor.ack(&client_turn_id, TurnStage::Scheduled, None);
    supervisor.touch();
    supervisor.fanout.publish(SessionEvent::AgentStart {
        client_turn_id: Some(client_turn_id.clone()),
    });

    let (tx, mut rx) = mpsc::channel::<EngineEvent>(64);
    let engine = supervisor.engine.clone();
    let run = tokio::spawn(async move { engine.run_turn(input, tx).await });

    let mut delivered = false;
    while let Some(event) = rx.recv().await {
        if !delivered {
            delivered = true;
            supervisor.ack(&client_turn_id, TurnStage::Delivered, None);
        }
        supervisor.handle_engine_event(event);
    }

    match run.await {
        Ok(Ok(())) => supervisor.finish_turn(&client_turn_id),
        Ok(Err(EngineError::Rejected(message))) => {
            supervisor.fanout.publish(SessionEvent::Error {
                kind: ErrorKind::Internal,
                message,
            });
            supervisor.finish_turn(&client_turn_id);
        }
        Ok(Err(EngineError::Crashed(message))) => supervisor.fail(message),
        Err(join_error) => {
            supervisor.fail(format!("turn task failed: {join_error}"));
        }
    }
}
