//! Per-session policy interception for tool calls.
//!
//! Every tool call the agent engine makes is awaited through
//! [`PermissionGate::intercept`]. Policy `ask` verdicts suspend the calling
//! tool task on a single-use oneshot keyed by the permission id until the
//! client responds or a fail-closed timer fires. Exactly one resolver, at
//! most one waiter, idempotent subsequent resolves.

// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use oppi_protocol::ApprovalScope;
use oppi_protocol::PermissionAction;
use oppi_protocol::PermissionRequest;
use oppi_protocol::PermissionState;
use oppi_protocol::RiskLevel;
use oppi_protocol::SessionEvent;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::config::GateConfig;
use crate::engine::InterceptDecision;
use crate::engine::ToolCall;
use crate::engine::ToolInterceptor;
use crate::error::OppiErr;
use crate::error::Result;
use crate::fanout::EventFanout;
use crate::policy;
use crate::policy::PolicyEngine;
use crate::policy::RuleAction;
use crate::supervisor::SharedWarnings;

pub const REASON_NO_CLIENT: &str = "no_client";
pub const REASON_TIMEOUT: &str = "timeout";
pub const REASON_SESSION_STOPPED: &str = "session_stopped";
pub const REASON_TURN_ABORTED: &str = "aborted";

/// Terminal outcome of a permission request.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub action: PermissionAction,
    pub reason: Option<String>,
    pub scope: Option<ApprovalScope>,
    pub state: PermissionState,
}

struct PendingEntry {
    tx: oneshot::Sender<Resolution>,
    request: PermissionRequest,
}

#[derive(Default)]
struct GateState {
    pending: HashMap<String, PendingEntry>,
    /// tool_call_id → permission id; at most one pending request per call.
    call_index: HashMap<String, String>,
    resolved: HashMap<String, Resolution>,
}

pub struct PermissionGate {
    session_id: String,
    config: GateConfig,
    policy: Arc<PolicyEngine>,
    fanout: Arc<EventFanout>,
    warnings: SharedWarnings,
    state: Mutex<GateState>,
}

impl PermissionGate {
    pub fn new(
        session_id: impl Into<String>,
        config: GateConfig,
        policy: Arc<PolicyEngine>,
        fanout: Arc<EventFanout>,
        warnings: SharedWarnings,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            config,
            policy,
            fanout,
            warnings,
            state: Mutex::new(GateState::default()),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    /// Whether this gate minted the given permission id (pending or
    /// resolved). The mux routes `permission_respond` by id alone.
    pub fn knows(&self, id: &str) -> bool {
        let state = self.state.lock().unwrap();
        state.pending.contains_key(id) || state.resolved.contains_key(id)
    }

    /// Resolve one pending request with the client's decision. Idempotent:
    /// a duplicate respond returns the prior resolution and emits nothing.
    pub async fn respond(
        &self,
        id: &str,
        action: PermissionAction,
        scope: ApprovalScope,
    ) -> Result<Resolution> {
        let (entry, resolution) = {
            let mut state = self.state.lock().unwrap();
            if let Some(prior) = state.resolved.get(id) {
                debug!(permission_id = id, "duplicate respond; returning prior decision");
                return Ok(prior.clone());
            }
            let Some(entry) = state.pending.remove(id) else {
                return Err(OppiErr::PermissionNotFound(id.to_string()));
            };
            state.call_index.remove(&entry.request.tool_call_id);
            let resolution = Resolution {
                action,
                reason: None,
                scope: (scope != ApprovalScope::Once).then_some(scope),
                state: PermissionState::Resolved,
            };
            state.resolved.insert(id.to_string(), resolution.clone());
            (entry, resolution)
        };

        info!(
            permission_id = id,
            %action,
            %scope,
            "permission request resolved by client"
        );
        self.fanout.publish(SessionEvent::PermissionResolved {
            id: id.to_string(),
            action,
            reason: None,
            scope: resolution.scope,
        });

        if scope != ApprovalScope::Once {
            let rule_action = match action {
                PermissionAction::Allow => RuleAction::Allow,
                PermissionAction::Deny => RuleAction::Deny,
            };
            let rule = policy::rule_for_remembered_decision(
                &entry.request.tool,
                &entry.request.input,
                rule_action,
                entry.request.risk,
            );
            if let Err(e) = self.policy.learn(&self.session_id, rule, scope).await {
                warn!("failed to persist learned rule: {e}");
                self.warnings
                    .push(format!("learned rule not persisted: {e}"));
            }
        }

        // Release the suspended tool task last so learned rules are already
        // visible when the engine issues its next call.
        let _ = entry.tx.send(resolution.clone());
        Ok(resolution)
    }

    /// Deny every pending request, e.g. on session stop or turn abort.
    /// Returns how many requests were cancelled.
    pub fn cancel_all(&self, reason: &str) -> usize {
        let entries: Vec<(String, PendingEntry)> = {
            let mut state = self.state.lock().unwrap();
            state.call_index.clear();
            let drained: Vec<(String, PendingEntry)> = state.pending.drain().collect();
            for (id, _) in &drained {
                state.resolved.insert(
                    id.clone(),
                    Resolution {
                        action: PermissionAction::Deny,
                        reason: Some(reason.to_string()),
                        scope: None,
                        state: PermissionState::Expired,
                    },
                );
            }
            drained
        };
        let cancelled = entries.len();
        for (id, entry) in entries {
            let resolution = Resolution {
                action: PermissionAction::Deny,
                reason: Some(reason.to_string()),
                scope: None,
                state: PermissionState::Expired,
            };
            let _ = entry.tx.send(resolution);
            self.fanout.publish(SessionEvent::PermissionResolved {
                id,
                action: PermissionAction::Deny,
                reason: Some(reason.to_string()),
                scope: None,
            });
        }
        if cancelled > 0 {
            info!(count = cancelled, reason, "cancelled pending permission requests");
        }
        cancelled
    }

    async fn ask(&self, call: ToolCall, risk: RiskLevel) -> InterceptDecision {
        let (id, rx, request) = {
            let mut state = self.state.lock().unwrap();
            if state.call_index.contains_key(&call.tool_call_id) {
                return InterceptDecision::block("tool call already pending approval");
            }
            // Ids are minted process-unique: clients address a permission
            // respond by id alone, without a session id.
            let id = Uuid::new_v4().to_string();
            let (tx, rx) = oneshot::channel();
            let request = PermissionRequest {
                id: id.clone(),
                session_id: self.session_id.clone(),
                tool: call.tool.clone(),
                input: call.input.clone(),
                tool_call_id: call.tool_call_id.clone(),
                risk,
                display_summary: policy::display_summary(&call.tool, &call.input),
                created_at: Utc::now(),
                state: PermissionState::Pending,
            };
            state
                .call_index
                .insert(call.tool_call_id.clone(), id.clone());
            state.pending.insert(
                id.clone(),
                PendingEntry {
                    tx,
                    request: request.clone(),
                },
            );
            (id, rx, request)
        };

        info!(
            permission_id = %id,
            tool = %call.tool,
            "tool call blocked on user approval"
        );
        self.fanout
            .publish(SessionEvent::PermissionRequest { request });

        let resolution = self.wait_for_resolution(&id, rx).await;
        match resolution.action {
            PermissionAction::Allow => InterceptDecision::pass(),
            PermissionAction::Deny => InterceptDecision::block(
                resolution
                    .reason
                    .unwrap_or_else(|| "denied by user".to_string()),
            ),
        }
    }

    async fn wait_for_resolution(
        &self,
        id: &str,
        mut rx: oneshot::Receiver<Resolution>,
    ) -> Resolution {
        let hard_deadline = tokio::time::sleep(self.config.ask_timeout);
        tokio::pin!(hard_deadline);
        let no_client = self.no_client_elapsed();
        tokio::pin!(no_client);

        tokio::select! {
            res = &mut rx => match res {
                Ok(resolution) => resolution,
                // Sender dropped without a decision; treat as a stop.
                Err(_) => self.expire(id, REASON_SESSION_STOPPED),
            },
            _ = &mut hard_deadline => self.expire(id, REASON_TIMEOUT),
            _ = &mut no_client => self.expire(id, REASON_NO_CLIENT),
        }
    }

    /// Resolves once the session has had zero subscribers continuously for
    /// the configured grace window. Pends forever while a client is
    /// connected.
    async fn no_client_elapsed(&self) {
        let mut subscribers = self.fanout.subscriber_watch();
        loop {
            if *subscribers.borrow_and_update() == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.no_client_grace) => return,
                    changed = subscribers.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            } else if subscribers.changed().await.is_err() {
                return;
            }
        }
    }

    /// Auto-deny a request that timed out or lost its arbiter. Races with
    /// [`Self::respond`] are settled by whichever records the resolution
    /// first.
    fn expire(&self, id: &str, reason: &str) -> Resolution {
        let entry = {
            let mut state = self.state.lock().unwrap();
            if let Some(existing) = state.resolved.get(id) {
                return existing.clone();
            }
            let Some(entry) = state.pending.remove(id) else {
                // Neither pending nor resolved: the id was never minted.
                return Resolution {
                    action: PermissionAction::Deny,
                    reason: Some(reason.to_string()),
                    scope: None,
                    state: PermissionState::Expired,
                };
            };
            state.call_index.remove(&entry.request.tool_call_id);
            let resolution = Resolution {
                action: PermissionAction::Deny,
                reason: Some(reason.to_string()),
                scope: None,
                state: PermissionState::Expired,
            };
            state.resolved.insert(id.to_string(), resolution);
            entry
        };
        drop(entry.tx);

        info!(permission_id = id, reason, "permission request auto-denied");
        self.fanout.publish(SessionEvent::PermissionResolved {
            id: id.to_string(),
            action: PermissionAction::Deny,
            reason: Some(reason.to_string()),
            scope: None,
        });
        Resolution {
            action: PermissionAction::Deny,
            reason: Some(reason.to_string()),
            scope: None,
            state: PermissionState::Expired,
        }
    }
}

#[async_trait]
impl ToolInterceptor for PermissionGate {
    async fn intercept(&self, call: ToolCall) -> InterceptDecision {
        let verdict = self
            .policy
            .evaluate(&self.session_id, &call.tool, &call.input);
        debug!(
            tool = %call.tool,
            action = ?verdict.action,
            risk = %verdict.risk,
            "policy verdict"
        );
        match verdict.action {
            RuleAction::Allow => InterceptDecision::pass(),
            RuleAction::Deny => InterceptDecision::block(verdict.reason),
            RuleAction::Ask => self.ask(call, verdict.risk).await,
        }
    }
}
