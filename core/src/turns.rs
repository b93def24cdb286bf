//! Ordering of user-originated inputs against the agent loop.
//!
//! The scheduler itself is synchronous; the supervisor linearizes calls
//! through its state lock. It owns the `(clientTurnId)` dedupe set and the
//! FIFO follow-up queue drained when the current turn ends.

use std::collections::HashSet;
use std::collections::VecDeque;

use oppi_protocol::DropReason;
use oppi_protocol::SessionStatus;

use crate::engine::TurnInput;

/// A follow-up waiting for the current turn to end.
#[derive(Debug)]
pub(crate) struct QueuedTurn {
    pub client_turn_id: String,
    pub input: TurnInput,
}

/// Which turn operation the client sent. `abort` has no turn id and never
/// enters the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TurnOpKind {
    Prompt,
    Steer,
    FollowUp,
}

/// What the scheduler decided to do with an operation.
#[derive(Debug, PartialEq)]
pub(crate) enum Admission {
    /// Start a new turn now.
    Start,
    /// Inject into the running turn.
    Inject,
    /// Queue until the current turn ends.
    Enqueue,
    Drop(DropReason),
}

#[derive(Default)]
pub(crate) struct TurnScheduler {
    seen: HashSet<String>,
    queue: VecDeque<QueuedTurn>,
}

impl TurnScheduler {
    /// Dedupe and precondition check.
    ///
    /// Only accepted ids are recorded: a precondition drop may be retried
    /// with the same `clientTurnId` after the state changes, while an
    /// accepted id stays unique for the lifetime of the session and
    /// redelivery re-acks as a duplicate drop.
    pub fn admit(
        &mut self,
        op: TurnOpKind,
        client_turn_id: &str,
        status: SessionStatus,
    ) -> Admission {
        if self.seen.contains(client_turn_id) {
            return Admission::Drop(DropReason::Duplicate);
        }
        if status.is_terminal() {
            return Admission::Drop(DropReason::SessionTerminal);
        }
        let admission = match (op, status) {
            (TurnOpKind::Prompt, SessionStatus::Ready) => Admission::Start,
            (TurnOpKind::Steer, SessionStatus::Busy) => Admission::Inject,
            (TurnOpKind::FollowUp, SessionStatus::Busy) => Admission::Enqueue,
            _ => Admission::Drop(DropReason::Precondition),
        };
        if !matches!(admission, Admission::Drop(_)) {
            self.seen.insert(client_turn_id.to_string());
        }
        admission
    }

    pub fn push_follow_up(&mut self, turn: QueuedTurn) {
        self.queue.push_back(turn);
    }

    pub fn pop_follow_up(&mut self) -> Option<QueuedTurn> {
        self.queue.pop_front()
    }

    /// Empty the queue, e.g. when the session stops; callers ack each
    /// dropped turn.
    pub fn drain_follow_ups(&mut self) -> Vec<QueuedTurn> {
        self.queue.drain(..).collect()
    }
}
