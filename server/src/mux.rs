//! Per-client stream multiplexer.
//!
//! One [`ClientConnection`] owns a single authenticated client: it demuxes
//! inbound messages to the addressed supervisor, forwards subscribed session
//! events outbound, acknowledges every request-bearing message with exactly
//! one `command_result`, and probes liveness with periodic pings. A client
//! disconnect only detaches subscriptions; sessions keep running.

// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use oppi_core::SessionRegistry;
use oppi_core::error::OppiErr;
use oppi_protocol::ClientMessage;
use oppi_protocol::CommandResult;
use oppi_protocol::Ping;
use oppi_protocol::ServerMessage;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::outgoing::OutgoingSender;

#[derive(Debug, Clone)]
pub struct MuxConfig {
    pub ping_interval: Duration,
    /// Unanswered pings tolerated before subscriptions are torn down.
    pub max_missed_pongs: u64,
    /// Outbound queue depth; overflowing it disconnects the client.
    pub outbound_capacity: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            max_missed_pongs: 2,
            outbound_capacity: 128,
        }
    }
}

struct SubscriptionEntry {
    handle_id: u64,
    forwarder: AbortHandle,
}

#[derive(Default)]
struct Liveness {
    pings_sent: u64,
    pongs_received: u64,
}

pub struct ClientConnection {
    registry: Arc<SessionRegistry>,
    outgoing: OutgoingSender,
    disconnect: CancellationToken,
    subscriptions: Mutex<HashMap<String, SubscriptionEntry>>,
    liveness: Mutex<Liveness>,
}

impl ClientConnection {
    pub fn new(
        registry: Arc<SessionRegistry>,
        outgoing: OutgoingSender,
        disconnect: CancellationToken,
    ) -> Self {
        Self {
            registry,
            outgoing,
            disconnect,
            subscriptions: Mutex::new(HashMap::new()),
            liveness: Mutex::new(Liveness::default()),
        }
    }

    /// Parse and dispatch one inbound frame. Unrecognized `type` tags parse
    /// to the `unknown` sentinel and are skipped; a parse error here means a
    /// recognized type with a malformed payload.
    pub async fn handle_frame(&self, raw: &str) {
        let raw = raw.trim();
        if raw.is_empty() {
            return;
        }
        match serde_json::from_str::<ClientMessage>(raw) {
            Ok(message) => self.process(message).await,
            Err(e) => {
                warn!("malformed client message: {e}");
                // The ack contract still owes a result when the frame
                // carried a request id.
                if let Some(request_id) = raw_request_id(raw) {
                    self.outgoing
                        .result(CommandResult::err(request_id, "malformed message"));
                }
            }
        }
    }

    async fn process(&self, message: ClientMessage) {
        match message {
            ClientMessage::Subscribe {
                session_id,
                level,
                since_seq,
                request_id,
            } => {
                let supervisor = match self.registry.get(&session_id).await {
                    Ok(supervisor) => supervisor,
                    Err(e) => {
                        self.outgoing
                            .result(CommandResult::err(request_id, reason(&e)));
                        return;
                    }
                };
                // A re-subscribe replaces the previous subscription.
                self.detach(&session_id).await;

                // Ack before the forwarder starts so the result precedes the
                // replayed events.
                self.outgoing.result(CommandResult::ok(request_id));

                let mut handle = supervisor.subscribe(since_seq, level);
                let handle_id = handle.id;
                let outgoing = self.outgoing.clone();
                let forwarder = tokio::spawn(async move {
                    while let Some(envelope) = handle.rx.recv().await {
                        outgoing.send(ServerMessage::Event((*envelope).clone()));
                    }
                })
                .abort_handle();
                self.subscriptions.lock().unwrap().insert(
                    session_id,
                    SubscriptionEntry {
                        handle_id,
                        forwarder,
                    },
                );
            }

            ClientMessage::Unsubscribe {
                session_id,
                request_id,
            } => {
                if self.detach(&session_id).await {
                    self.outgoing.result(CommandResult::ok(request_id));
                } else {
                    self.outgoing
                        .result(CommandResult::err(request_id, "not subscribed"));
                }
            }

            ClientMessage::Prompt {
                session_id,
                client_turn_id,
                request_id,
                message,
                attachments,
            } => match self.registry.get(&session_id).await {
                Ok(supervisor) => {
                    self.outgoing.result(CommandResult::ok(request_id));
                    supervisor
                        .prompt(&client_turn_id, message, attachments.unwrap_or_default())
                        .await;
                }
                Err(e) => self
                    .outgoing
                    .result(CommandResult::err(request_id, reason(&e))),
            },

            ClientMessage::Steer {
                session_id,
                client_turn_id,
                request_id,
                message,
            } => match self.registry.get(&session_id).await {
                Ok(supervisor) => {
                    self.outgoing.result(CommandResult::ok(request_id));
                    supervisor.steer(&client_turn_id, message).await;
                }
                Err(e) => self
                    .outgoing
                    .result(CommandResult::err(request_id, reason(&e))),
            },

            ClientMessage::FollowUp {
                session_id,
                client_turn_id,
                request_id,
                message,
            } => match self.registry.get(&session_id).await {
                Ok(supervisor) => {
                    self.outgoing.result(CommandResult::ok(request_id));
                    supervisor.follow_up(&client_turn_id, message).await;
                }
                Err(e) => self
                    .outgoing
                    .result(CommandResult::err(request_id, reason(&e))),
            },

            ClientMessage::Abort {
                session_id,
                request_id,
            } => {
                let outcome = match self.registry.get(&session_id).await {
                    Ok(supervisor) => supervisor.abort().await,
                    Err(e) => Err(e),
                };
                match outcome {
                    Ok(()) => self.outgoing.result(CommandResult::ok(request_id)),
                    Err(e) => self
                        .outgoing
                        .result(CommandResult::err(request_id, reason(&e))),
                }
            }

            ClientMessage::PermissionRespond {
                permission_id,
                action,
                scope,
                request_id,
            } => match self
                .registry
                .respond_permission(&permission_id, action, scope)
                .await
            {
                Ok(resolution) => self.outgoing.result(
                    CommandResult::ok(request_id).with_payload(serde_json::json!({
                        "action": resolution.action,
                        "reason": resolution.reason,
                    })),
                ),
                Err(e) => self
                    .outgoing
                    .result(CommandResult::err(request_id, reason(&e))),
            },

            ClientMessage::ExtensionUiResponse { request_id, value } => {
                match self
                    .registry
                    .respond_extension_ui(&request_id, value)
                    .await
                {
                    Ok(()) => self.outgoing.result(CommandResult::ok(request_id)),
                    Err(e) => self
                        .outgoing
                        .result(CommandResult::err(request_id, reason(&e))),
                }
            }

            ClientMessage::ListSessions { request_id } => {
                let sessions = self.registry.list().await;
                let payload =
                    serde_json::to_value(sessions).unwrap_or(serde_json::Value::Null);
                self.outgoing
                    .result(CommandResult::ok(request_id).with_payload(payload));
            }

            ClientMessage::Pong { ping_id } => {
                let mut liveness = self.liveness.lock().unwrap();
                if ping_id > liveness.pongs_received {
                    liveness.pongs_received = ping_id;
                }
            }

            ClientMessage::Unknown { raw_type } => {
                warn!(%raw_type, "skipping unrecognized client message type");
            }

            // `ClientMessage` is non-exhaustive; variants newer than this
            // build are logged and skipped too.
            other => {
                warn!("skipping unsupported client message: {other:?}");
            }
        }
    }

    /// Periodic liveness probe. Too many unanswered pings tears down this
    /// connection's subscriptions and disconnects; supervisors stay alive.
    pub(crate) async fn ping_loop(self: Arc<Self>, interval: Duration, max_missed: u64) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.disconnect.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let overdue = {
                let liveness = self.liveness.lock().unwrap();
                liveness.pings_sent.saturating_sub(liveness.pongs_received) > max_missed
            };
            if overdue {
                warn!("client missed liveness pings; tearing down subscriptions");
                self.teardown().await;
                self.disconnect.cancel();
                return;
            }
            let ping_id = {
                let mut liveness = self.liveness.lock().unwrap();
                liveness.pings_sent += 1;
                liveness.pings_sent
            };
            self.outgoing.send(ServerMessage::Ping(Ping { ping_id }));
        }
    }

    /// Detach every subscription, e.g. on disconnect. Synchronous from the
    /// fan-out's point of view; in-flight forwarded events are dropped with
    /// the forwarder task.
    pub async fn teardown(&self) {
        let entries: Vec<(String, SubscriptionEntry)> = {
            let mut subscriptions = self.subscriptions.lock().unwrap();
            subscriptions.drain().collect()
        };
        for (session_id, entry) in entries {
            entry.forwarder.abort();
            if let Ok(supervisor) = self.registry.get(&session_id).await {
                supervisor.unsubscribe(entry.handle_id);
            }
        }
        debug!("connection subscriptions detached");
    }

    async fn detach(&self, session_id: &str) -> bool {
        let entry = self.subscriptions.lock().unwrap().remove(session_id);
        match entry {
            Some(entry) => {
                entry.forwarder.abort();
                if let Ok(supervisor) = self.registry.get(session_id).await {
                    supervisor.unsubscribe(entry.handle_id);
                }
                true
            }
            None => false,
        }
    }
}

/// Wire-facing rejection reasons.
fn reason(err: &OppiErr) -> String {
    match err {
        OppiErr::SessionNotFound(_) => "session_not_found".to_string(),
        OppiErr::SessionTerminal(_) => "session_terminal".to_string(),
        OppiErr::PermissionNotFound(_) => "permission_not_found".to_string(),
        OppiErr::ExtensionUiNotFound(_) => "unknown_request".to_string(),
        other => other.to_string(),
    }
}

fn raw_request_id(raw: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    value.get("requestId")?.as_str().map(str::to_owned)
}
