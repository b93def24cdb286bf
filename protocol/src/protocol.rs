//! Defines the protocol between the Oppi server and its remote clients.
//!
//! Both directions are text frames, each a single self-delimited JSON record.
//! The two message families are [`ClientMessage`] (client → server) and
//! [`ServerMessage`] (server → client); both are tagged unions discriminated
//! by a `type` field. A consumer that does not recognize a `type` must log
//! and skip the frame, never reject the stream.

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;

/// Lifecycle state of a session, owned by its supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionStatus {
    /// Supervisor constructed, agent engine not yet ready.
    Starting,
    /// Idle, accepting `prompt`.
    Ready,
    /// Agent engine is streaming a turn.
    Busy,
    /// Abort or shutdown requested; in-flight tool calls are draining.
    Stopping,
    /// Terminal. Events may still be replayed from the fan-out ring.
    Stopped,
    /// Terminal, with a structured cause.
    Error,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Stopped | SessionStatus::Error)
    }
}

/// Risk classification assigned by the policy engine to a tool call.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// The user's decision in response to a permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PermissionAction {
    Allow,
    Deny,
}

/// How long a permission decision should be remembered. Anything beyond
/// `Once` appends a learned policy rule at the corresponding scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ApprovalScope {
    #[default]
    Once,
    Session,
    Workspace,
    Global,
}

/// Lifecycle of a [`PermissionRequest`]. `Pending` holds exactly while the
/// agent engine's corresponding tool call is blocked on the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PermissionState {
    Pending,
    Resolved,
    Expired,
}

/// Acknowledgement stages for a user-originated turn operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TurnStage {
    /// Accepted into the scheduler.
    Received,
    /// Handed to the agent engine.
    Scheduled,
    /// The agent emitted the first event for this turn.
    Delivered,
    /// Rejected; carries a [`DropReason`].
    Dropped,
}

/// Why a turn operation was dropped instead of scheduled, or why a running
/// turn ended early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DropReason {
    Duplicate,
    Precondition,
    SessionTerminal,
    /// The turn was stopped by an `abort` request.
    Aborted,
}

/// Error classification carried by `error` events and failed tool calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    PolicyDenied,
    NoClient,
    Timeout,
    CatchupTruncated,
    Overflow,
    AgentCrash,
    UnknownEvent,
    SessionNotFound,
    Internal,
}

/// What a subscriber wants delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SubscriptionLevel {
    /// Every session event, including streaming deltas.
    #[default]
    Full,
    /// Only state changes, turn acks, permission lifecycle and errors.
    Notifications,
}

/// Aggregate token usage reported by the agent engine at the end of a turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Snapshot of one session, as owned by its supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub workspace_id: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    /// Monotonically non-decreasing.
    pub last_activity: DateTime<Utc>,
    pub message_count: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_window: Option<u64>,
    pub context_used: u64,
    /// The agent engine's persistent session trace. The core's sole
    /// persisted handle; clients reconcile truncated catch-ups against it.
    pub trace_path: std::path::PathBuf,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// A tool call held at the gate awaiting the user's decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    /// Unique within the session.
    pub id: String,
    pub session_id: String,
    pub tool: String,
    /// Opaque structured tool input, forwarded verbatim.
    pub input: serde_json::Value,
    pub tool_call_id: String,
    pub risk: RiskLevel,
    pub display_summary: String,
    pub created_at: DateTime<Utc>,
    pub state: PermissionState,
}

/// Structured failure attached to a `tool_end` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Events emitted by a session supervisor, sequenced by the fan-out.
///
/// The `seq` lives on the enclosing [`EventEnvelope`]; within a session it is
/// strictly increasing and dense.
///
/// Deserialization is forward-compatible: an unrecognized `type` tag yields
/// [`SessionEvent::Unknown`] instead of an error, so consumers can log and
/// skip. A recognized tag with a malformed payload still fails loudly.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Display)]
#[serde(
    tag = "type",
    rename_all = "snake_case",
    rename_all_fields = "camelCase",
    remote = "Self"
)]
#[strum(serialize_all = "snake_case")]
pub enum SessionEvent {
    /// Session status change, with a full snapshot so reconnecting clients
    /// have a known baseline.
    State {
        status: SessionStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        cause: Option<String>,
        session: SessionInfo,
    },

    /// The agent engine started streaming a turn.
    AgentStart {
        #[serde(skip_serializing_if = "Option::is_none")]
        client_turn_id: Option<String>,
    },

    /// Append-only chunk of agent output text.
    TextDelta { delta: String },

    /// Append-only chunk of agent reasoning.
    ThinkingDelta { delta: String },

    /// The agent is invoking a tool (already past the gate).
    ToolStart {
        call_id: String,
        tool: String,
        input: serde_json::Value,
    },

    /// Incremental tool output.
    ToolOutput { call_id: String, chunk: String },

    ToolEnd {
        call_id: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ToolError>,
    },

    /// The turn finished; carries usage accounting when the engine reports it.
    AgentEnd {
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<TokenUsage>,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_message: Option<String>,
    },

    /// One assistant message within the turn is complete.
    MessageEnd,

    /// Acknowledgement stage for a user-originated turn operation.
    TurnAck {
        client_turn_id: String,
        stage: TurnStage,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<DropReason>,
    },

    /// A tool call is blocked on the gate awaiting the user's decision.
    /// Nested rather than flattened: the request carries its own
    /// `sessionId`, which would collide with the envelope's.
    PermissionRequest { request: PermissionRequest },

    /// Terminal outcome of a permission request. Emitted exactly once per id.
    PermissionResolved {
        id: String,
        action: PermissionAction,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        scope: Option<ApprovalScope>,
    },

    /// The agent engine is asking the client to render custom UI.
    ExtensionUiRequest {
        id: String,
        payload: serde_json::Value,
    },

    /// Echo of the client's answer to an `extension_ui_request`.
    ExtensionUiResponse {
        id: String,
        value: serde_json::Value,
    },

    Error { kind: ErrorKind, message: String },

    /// Sentinel for an event type newer than this build; carries the raw
    /// tag so consumers can log and skip instead of rejecting the stream.
    Unknown { raw_type: String },
}

/// Type tags this build understands; anything else deserializes to the
/// `unknown` sentinel.
const SESSION_EVENT_TYPES: &[&str] = &[
    "state",
    "agent_start",
    "text_delta",
    "thinking_delta",
    "tool_start",
    "tool_output",
    "tool_end",
    "agent_end",
    "message_end",
    "turn_ack",
    "permission_request",
    "permission_resolved",
    "extension_ui_request",
    "extension_ui_response",
    "error",
    "unknown",
];

impl Serialize for SessionEvent {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        SessionEvent::serialize(self, serializer)
    }
}

impl<'de> Deserialize<'de> for SessionEvent {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        match SessionEvent::deserialize(&value) {
            Ok(event) => Ok(event),
            Err(err) => match value.get("type").and_then(serde_json::Value::as_str) {
                Some(tag) if !SESSION_EVENT_TYPES.contains(&tag) => Ok(SessionEvent::Unknown {
                    raw_type: tag.to_string(),
                }),
                _ => Err(serde::de::Error::custom(err)),
            },
        }
    }
}

impl SessionEvent {
    /// Whether a `notifications`-level subscriber receives this event.
    pub fn is_notification(&self) -> bool {
        matches!(
            self,
            SessionEvent::State { .. }
                | SessionEvent::AgentEnd { .. }
                | SessionEvent::TurnAck { .. }
                | SessionEvent::PermissionRequest { .. }
                | SessionEvent::PermissionResolved { .. }
                | SessionEvent::Error { .. }
        )
    }
}

/// A [`SessionEvent`] stamped with its session and sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub session_id: String,
    pub seq: u64,
    #[serde(flatten)]
    pub event: SessionEvent,
}

/// Attachment supplied with a `prompt`, forwarded to the agent engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Pre-encoded data URI or a server-visible path.
    pub data: String,
}

/// Messages from a connected client, demuxed to the addressed session.
///
/// Every request-bearing variant carries a `request_id` and is acknowledged
/// by exactly one [`CommandResult`] for that id. An unrecognized `type` tag
/// deserializes to [`ClientMessage::Unknown`] so the server can log and
/// skip it without rejecting the stream.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "snake_case",
    rename_all_fields = "camelCase",
    remote = "Self"
)]
pub enum ClientMessage {
    Subscribe {
        session_id: String,
        #[serde(default)]
        level: SubscriptionLevel,
        /// Replay events with `seq` greater than this; absent means from the
        /// start of the retained ring.
        #[serde(skip_serializing_if = "Option::is_none")]
        since_seq: Option<u64>,
        request_id: String,
    },

    Unsubscribe {
        session_id: String,
        request_id: String,
    },

    /// Start a new agent turn. Precondition: session is `ready`.
    Prompt {
        session_id: String,
        client_turn_id: String,
        request_id: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        attachments: Option<Vec<Attachment>>,
    },

    /// Interrupt injected into the current turn. Precondition: `busy`.
    Steer {
        session_id: String,
        client_turn_id: String,
        request_id: String,
        message: String,
    },

    /// Enqueue a message delivered after the current turn ends. FIFO per
    /// session. Precondition: `busy`.
    FollowUp {
        session_id: String,
        client_turn_id: String,
        request_id: String,
        message: String,
    },

    /// Stop the current turn. Valid in any non-terminal state.
    Abort {
        session_id: String,
        request_id: String,
    },

    PermissionRespond {
        permission_id: String,
        action: PermissionAction,
        #[serde(default)]
        scope: ApprovalScope,
        request_id: String,
    },

    /// Answer to an `extension_ui_request`; `request_id` is the id minted by
    /// the server for that request and doubles as the ack id.
    ExtensionUiResponse {
        request_id: String,
        value: serde_json::Value,
    },

    ListSessions {
        request_id: String,
    },

    /// Liveness reply to a server `ping`.
    Pong { ping_id: u64 },

    /// Sentinel for a message type newer than this build; carries the raw
    /// tag. Logged and skipped, never a transport error.
    Unknown { raw_type: String },
}

/// Type tags this build understands; anything else deserializes to the
/// `unknown` sentinel.
const CLIENT_MESSAGE_TYPES: &[&str] = &[
    "subscribe",
    "unsubscribe",
    "prompt",
    "steer",
    "follow_up",
    "abort",
    "permission_respond",
    "extension_ui_response",
    "list_sessions",
    "pong",
    "unknown",
];

impl Serialize for ClientMessage {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        ClientMessage::serialize(self, serializer)
    }
}

impl<'de> Deserialize<'de> for ClientMessage {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        match ClientMessage::deserialize(&value) {
            Ok(message) => Ok(message),
            Err(err) => match value.get("type").and_then(serde_json::Value::as_str) {
                Some(tag) if !CLIENT_MESSAGE_TYPES.contains(&tag) => Ok(ClientMessage::Unknown {
                    raw_type: tag.to_string(),
                }),
                _ => Err(serde::de::Error::custom(err)),
            },
        }
    }
}

impl ClientMessage {
    /// The `request_id` this message must be acknowledged with, if any.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            ClientMessage::Subscribe { request_id, .. }
            | ClientMessage::Unsubscribe { request_id, .. }
            | ClientMessage::Prompt { request_id, .. }
            | ClientMessage::Steer { request_id, .. }
            | ClientMessage::FollowUp { request_id, .. }
            | ClientMessage::Abort { request_id, .. }
            | ClientMessage::PermissionRespond { request_id, .. }
            | ClientMessage::ExtensionUiResponse { request_id, .. }
            | ClientMessage::ListSessions { request_id } => Some(request_id),
            ClientMessage::Pong { .. } | ClientMessage::Unknown { .. } => None,
        }
    }
}

/// Acknowledgement for a request-bearing [`ClientMessage`]. Rejection is a
/// `success: false` result with a reason, not a transport-level error.
/// Carries no `seq`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "command_result", rename_all = "camelCase")]
pub struct CommandResult {
    pub request_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Structured payload for informational commands (`list_sessions`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl CommandResult {
    pub fn ok(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            success: true,
            error: None,
            payload: None,
        }
    }

    pub fn err(request_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            success: false,
            error: Some(reason.into()),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Periodic liveness probe from the server. Clients answer with
/// [`ClientMessage::Pong`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "ping", rename_all = "camelCase")]
pub struct Ping {
    pub ping_id: u64,
}

/// Messages from the server: every [`SessionEvent`] variant (wrapped in its
/// envelope) plus [`CommandResult`] and [`Ping`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    CommandResult(CommandResult),
    Ping(Ping),
    Event(EventEnvelope),
}

/// Best-effort peek at a raw frame's `type` discriminator, for logging
/// unrecognized messages before skipping them.
pub fn frame_type(raw: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    value.get("type")?.as_str().map(str::to_owned)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn session_event_round_trips_with_camel_case_fields() {
        let event = SessionEvent::TurnAck {
            client_turn_id: "t1".to_string(),
            stage: TurnStage::Dropped,
            reason: Some(DropReason::Duplicate),
        };
        let raw = serde_json::to_value(&event).unwrap();
        assert_eq!(
            raw,
            json!({
                "type": "turn_ack",
                "clientTurnId": "t1",
                "stage": "dropped",
                "reason": "duplicate",
            })
        );
        let back: SessionEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn envelope_flattens_event_beside_seq() {
        let envelope = EventEnvelope {
            session_id: "s1".to_string(),
            seq: 7,
            event: SessionEvent::TextDelta {
                delta: "hi".to_string(),
            },
        };
        let raw = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            raw,
            json!({
                "sessionId": "s1",
                "seq": 7,
                "type": "text_delta",
                "delta": "hi",
            })
        );
    }

    #[test]
    fn client_message_parses_spec_shapes() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "subscribe",
            "sessionId": "s1",
            "level": "notifications",
            "sinceSeq": 42,
            "requestId": "r1",
        }))
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::Subscribe {
                session_id: "s1".to_string(),
                level: SubscriptionLevel::Notifications,
                since_seq: Some(42),
                request_id: "r1".to_string(),
            }
        );

        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "permission_respond",
            "permissionId": "p1",
            "action": "allow",
            "scope": "once",
            "requestId": "r2",
        }))
        .unwrap();
        assert_eq!(msg.request_id(), Some("r2"));
    }

    #[test]
    fn server_message_discriminates_untagged_variants() {
        let raw =
            serde_json::to_string(&ServerMessage::CommandResult(CommandResult::ok("r1"))).unwrap();
        assert!(raw.contains("\"type\":\"command_result\""));
        let back: ServerMessage = serde_json::from_str(&raw).unwrap();
        assert!(matches!(back, ServerMessage::CommandResult(_)));

        let raw = serde_json::to_string(&ServerMessage::Event(EventEnvelope {
            session_id: "s1".to_string(),
            seq: 1,
            event: SessionEvent::MessageEnd,
        }))
        .unwrap();
        let back: ServerMessage = serde_json::from_str(&raw).unwrap();
        assert!(matches!(back, ServerMessage::Event(_)));
    }

    #[test]
    fn unknown_types_fall_back_to_the_sentinel() {
        let raw = r#"{"type":"hologram","payload":1}"#;
        assert_eq!(frame_type(raw).as_deref(), Some("hologram"));

        let message: ClientMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(
            message,
            ClientMessage::Unknown {
                raw_type: "hologram".to_string(),
            }
        );
        assert_eq!(message.request_id(), None);

        let event: SessionEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(
            event,
            SessionEvent::Unknown {
                raw_type: "hologram".to_string(),
            }
        );

        // A recognized tag with a malformed payload still fails loudly.
        assert!(serde_json::from_str::<SessionEvent>(r#"{"type":"text_delta"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"subscribe"}"#).is_err());
    }

    #[test]
    fn server_message_with_unknown_event_type_still_parses() {
        let raw = r#"{"sessionId":"s1","seq":3,"type":"hologram","x":1}"#;
        let back: ServerMessage = serde_json::from_str(raw).unwrap();
        let ServerMessage::Event(envelope) = back else {
            panic!("expected an event");
        };
        assert_eq!(envelope.session_id, "s1");
        assert_eq!(envelope.seq, 3);
        assert_eq!(
            envelope.event,
            SessionEvent::Unknown {
                raw_type: "hologram".to_string(),
            }
        );
    }

    #[test]
    fn permission_request_envelope_round_trips() {
        let request = PermissionRequest {
            id: "p1".to_string(),
            session_id: "s1".to_string(),
            tool: "write_file".to_string(),
            input: json!({"path": "/tmp/x"}),
            tool_call_id: "c1".to_string(),
            risk: RiskLevel::Medium,
            display_summary: "write_file /tmp/x".to_string(),
            created_at: DateTime::<Utc>::MIN_UTC,
            state: PermissionState::Pending,
        };
        let envelope = EventEnvelope {
            session_id: "s1".to_string(),
            seq: 9,
            event: SessionEvent::PermissionRequest { request },
        };
        let raw = serde_json::to_value(&envelope).unwrap();
        assert_eq!(raw["type"], "permission_request");
        assert_eq!(raw["request"]["id"], "p1");
        assert_eq!(raw["request"]["risk"], "medium");
        let back: EventEnvelope = serde_json::from_value(raw).unwrap();
        assert_eq!(back, envelope);
    }
}
