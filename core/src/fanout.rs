//! Sequenced event broadcast for one session.
//!
//! Every published event is stamped with a per-session `seq` (strictly
//! increasing, dense), appended to a bounded ring, and delivered to each
//! live subscriber without ever suspending the publisher. Subscribers that
//! cannot keep up are dropped, not waited on.

// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

use oppi_protocol::ErrorKind;
use oppi_protocol::EventEnvelope;
use oppi_protocol::SessionEvent;
use oppi_protocol::SubscriptionLevel;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tracing::debug;
use tracing::warn;

use crate::config::FanoutConfig;

struct RingEntry {
    envelope: Arc<EventEnvelope>,
    bytes: usize,
}

struct SubscriberEntry {
    id: u64,
    level: SubscriptionLevel,
    tx: mpsc::Sender<Arc<EventEnvelope>>,
    last_seen_seq: u64,
}

#[derive(Default)]
struct FanoutState {
    /// Seq of the next published event; the first event gets seq 1.
    next_seq: u64,
    ring: VecDeque<RingEntry>,
    ring_bytes: usize,
    subscribers: Vec<SubscriberEntry>,
    next_handle_id: u64,
}

/// Receiving side of one subscription. Events arrive in publish order;
/// synthetic catch-up records are stamped with the subscription's own
/// `since_seq` so delivery stays monotone.
pub struct SubscriptionHandle {
    pub id: u64,
    pub rx: mpsc::Receiver<Arc<EventEnvelope>>,
    /// Set when `since_seq` predated the retained ring; the subscriber also
    /// received an `error` event of kind `catchup_truncated` and is expected
    /// to reconcile from the agent engine's persistent trace.
    pub catchup_incomplete: bool,
}

pub struct EventFanout {
    session_id: String,
    config: FanoutConfig,
    state: Mutex<FanoutState>,
    sub_count: watch::Sender<usize>,
}

impl EventFanout {
    pub fn new(session_id: impl Into<String>, config: FanoutConfig) -> Self {
        let (sub_count, _) = watch::channel(0);
        Self {
            session_id: session_id.into(),
            config,
            state: Mutex::new(FanoutState {
                next_seq: 1,
                ..Default::default()
            }),
            sub_count,
        }
    }

    /// Observed subscriber count; the gate's fail-closed clock watches this.
    pub fn subscriber_watch(&self) -> watch::Receiver<usize> {
        self.sub_count.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        *self.sub_count.borrow()
    }

    /// Seq of the most recently published event, 0 if none yet.
    pub fn head_seq(&self) -> u64 {
        self.state.lock().unwrap().next_seq - 1
    }

    /// Assign the next seq, append to the ring, and deliver to every current
    /// subscriber. Never suspends: a subscriber whose channel is full is
    /// dropped with a best-effort `overflow` error.
    pub fn publish(&self, event: SessionEvent) -> u64 {
        let mut state = self.state.lock().unwrap();
        let seq = state.next_seq;
        state.next_seq += 1;

        let envelope = Arc::new(EventEnvelope {
            session_id: self.session_id.clone(),
            seq,
            event,
        });
        let bytes = serde_json::to_vec(&*envelope).map(|raw| raw.len()).unwrap_or(0);
        state.ring.push_back(RingEntry {
            envelope: envelope.clone(),
            bytes,
        });
        state.ring_bytes += bytes;
        while state.ring.len() > 1
            && (state.ring.len() > self.config.max_events
                || state.ring_bytes > self.config.max_bytes)
        {
            if let Some(evicted) = state.ring.pop_front() {
                state.ring_bytes -= evicted.bytes;
            }
        }

        let mut dropped = Vec::new();
        for (index, subscriber) in state.subscribers.iter_mut().enumerate() {
            if !Self::wants(subscriber.level, &envelope.event) {
                subscriber.last_seen_seq = seq;
                continue;
            }
            // The last slot of every subscriber channel is reserved for a
            // final `overflow` record, so the drop is observable.
            if subscriber.tx.capacity() <= 1 {
                warn!(
                    session_id = %self.session_id,
                    subscriber = subscriber.id,
                    "subscriber channel full; dropping subscriber"
                );
                dropped.push((index, true));
                continue;
            }
            match subscriber.tx.try_send(envelope.clone()) {
                Ok(()) => subscriber.last_seen_seq = seq,
                Err(_) => dropped.push((index, false)),
            }
        }
        for (index, overflowed) in dropped.into_iter().rev() {
            let subscriber = state.subscribers.remove(index);
            if overflowed {
                let _ = subscriber.tx.try_send(Arc::new(EventEnvelope {
                    session_id: self.session_id.clone(),
                    seq: subscriber.last_seen_seq,
                    event: SessionEvent::Error {
                        kind: ErrorKind::Overflow,
                        message: "subscriber too slow; events dropped".to_string(),
                    },
                }));
            }
        }
        self.sub_count.send_if_modified(|count| {
            let len = state.subscribers.len();
            if *count != len {
                *count = len;
                true
            } else {
                false
            }
        });

        seq
    }

    /// Begin delivering events with `seq > since_seq`. The retained suffix
    /// is replayed immediately; `baseline` (when given) is delivered first
    /// as a subscriber-local synthetic record.
    pub fn subscribe(
        &self,
        since_seq: u64,
        level: SubscriptionLevel,
        baseline: Option<SessionEvent>,
    ) -> SubscriptionHandle {
        let mut state = self.state.lock().unwrap();
        let id = state.next_handle_id;
        state.next_handle_id += 1;

        let head_seq = state.next_seq - 1;
        let truncated = match state.ring.front() {
            Some(front) => since_seq < head_seq && front.envelope.seq > since_seq + 1,
            None => since_seq < head_seq,
        };
        let backlog: Vec<Arc<EventEnvelope>> = state
            .ring
            .iter()
            .filter(|entry| entry.envelope.seq > since_seq)
            .filter(|entry| Self::wants(level, &entry.envelope.event))
            .map(|entry| entry.envelope.clone())
            .collect();

        // Room for the replayed backlog, synthetic records, the live budget,
        // and one reserved slot for a final `overflow` record.
        let capacity = self.config.subscriber_capacity + backlog.len() + 3;
        let (tx, rx) = mpsc::channel(capacity);

        if let Some(event) = baseline {
            let _ = tx.try_send(Arc::new(EventEnvelope {
                session_id: self.session_id.clone(),
                seq: since_seq,
                event,
            }));
        }
        if truncated {
            debug!(
                session_id = %self.session_id,
                since_seq,
                "catch-up truncated; ring has evicted requested range"
            );
            let _ = tx.try_send(Arc::new(EventEnvelope {
                session_id: self.session_id.clone(),
                seq: since_seq,
                event: SessionEvent::Error {
                    kind: ErrorKind::CatchupTruncated,
                    message: "requested events evicted; reconcile from session trace".to_string(),
                },
            }));
        }
        for envelope in backlog {
            let _ = tx.try_send(envelope);
        }

        state.subscribers.push(SubscriberEntry {
            id,
            level,
            tx,
            last_seen_seq: head_seq,
        });
        self.sub_count.send_if_modified(|count| {
            let len = state.subscribers.len();
            if *count != len {
                *count = len;
                true
            } else {
                false
            }
        });

        SubscriptionHandle {
            id,
            rx,
            catchup_incomplete: truncated,
        }
    }

    /// Detach synchronously; no further events are delivered.
    pub fn unsubscribe(&self, handle_id: u64) {
        let mut state = self.state.lock().unwrap();
        state.subscribers.retain(|entry| entry.id != handle_id);
        self.sub_count.send_if_modified(|count| {
            let len = state.subscribers.len();
            if *count != len {
                *count = len;
                true
            } else {
                false
            }
        });
    }

    fn wants(level: SubscriptionLevel, event: &SessionEvent) -> bool {
        match level {
            SubscriptionLevel::Full => true,
            SubscriptionLevel::Notifications => event.is_notification(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oppi_protocol::TurnStage;
    use pretty_assertions::assert_eq;

    fn fanout() -> EventFanout {
        EventFanout::new("s1", FanoutConfig::default())
    }

    fn delta(text: &str) -> SessionEvent {
        SessionEvent::TextDelta {
            delta: text.to_string(),
        }
    }

    fn drain(handle: &mut SubscriptionHandle) -> Vec<Arc<EventEnvelope>> {
        let mut out = Vec::new();
        while let Ok(envelope) = handle.rx.try_recv() {
            out.push(envelope);
        }
        out
    }

    #[tokio::test]
    async fn seq_is_dense_and_strictly_increasing() {
        let fanout = fanout();
        let seqs: Vec<u64> = (0..5).map(|i| fanout.publish(delta(&i.to_string()))).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        assert_eq!(fanout.head_seq(), 5);
    }

    #[tokio::test]
    async fn round_trip_replays_everything_in_the_ring() {
        let fanout = fanout();
        for i in 0..10 {
            fanout.publish(delta(&i.to_string()));
        }
        let mut handle = fanout.subscribe(0, SubscriptionLevel::Full, None);
        assert!(!handle.catchup_incomplete);
        let got = drain(&mut handle);
        assert_eq!(got.len(), 10);
        let seqs: Vec<u64> = got.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, (1..=10).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn live_events_follow_replay_in_order() {
        let fanout = fanout();
        fanout.publish(delta("a"));
        let mut handle = fanout.subscribe(0, SubscriptionLevel::Full, None);
        fanout.publish(delta("b"));
        fanout.publish(delta("c"));
        let seqs: Vec<u64> = drain(&mut handle).iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn eviction_marks_catchup_truncated() {
        let config = FanoutConfig {
            max_events: 4,
            ..FanoutConfig::default()
        };
        let fanout = EventFanout::new("s1", config);
        for i in 0..8 {
            fanout.publish(delta(&i.to_string()));
        }
        // Ring now holds seqs 5..=8.
        let mut handle = fanout.subscribe(2, SubscriptionLevel::Full, None);
        assert!(handle.catchup_incomplete);
        let got = drain(&mut handle);
        assert!(matches!(
            got[0].event,
            SessionEvent::Error {
                kind: ErrorKind::CatchupTruncated,
                ..
            }
        ));
        assert_eq!(got[0].seq, 2);
        let seqs: Vec<u64> = got[1..].iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![5, 6, 7, 8]);
    }

    #[tokio::test]
    async fn subscribe_at_head_is_not_truncated() {
        let config = FanoutConfig {
            max_events: 2,
            ..FanoutConfig::default()
        };
        let fanout = EventFanout::new("s1", config);
        for i in 0..6 {
            fanout.publish(delta(&i.to_string()));
        }
        let handle = fanout.subscribe(6, SubscriptionLevel::Full, None);
        assert!(!handle.catchup_incomplete);
    }

    #[tokio::test]
    async fn byte_budget_evicts_fifo() {
        let config = FanoutConfig {
            max_events: 1024,
            max_bytes: 400,
            ..FanoutConfig::default()
        };
        let fanout = EventFanout::new("s1", config);
        for _ in 0..16 {
            fanout.publish(delta(&"x".repeat(64)));
        }
        let mut handle = fanout.subscribe(0, SubscriptionLevel::Full, None);
        assert!(handle.catchup_incomplete);
        let got = drain(&mut handle);
        // Newest event is always retained.
        assert_eq!(got.last().map(|e| e.seq), Some(16));
    }

    #[tokio::test]
    async fn slow_subscriber_is_dropped_with_overflow() {
        let config = FanoutConfig {
            subscriber_capacity: 2,
            ..FanoutConfig::default()
        };
        let fanout = EventFanout::new("s1", config);
        let mut slow = fanout.subscribe(0, SubscriptionLevel::Full, None);
        let mut healthy = fanout.subscribe(0, SubscriptionLevel::Full, None);
        assert_eq!(fanout.subscriber_count(), 2);

        for i in 0..8 {
            fanout.publish(delta(&i.to_string()));
            // Keep the healthy subscriber drained so only `slow` overflows.
            drain(&mut healthy);
        }
        assert_eq!(fanout.subscriber_count(), 1);

        let got = drain(&mut slow);
        assert!(
            got.iter().any(|e| matches!(
                e.event,
                SessionEvent::Error {
                    kind: ErrorKind::Overflow,
                    ..
                }
            )),
            "expected an overflow error for the slow subscriber"
        );
    }

    #[tokio::test]
    async fn unsubscribe_detaches_synchronously() {
        let fanout = fanout();
        let mut handle = fanout.subscribe(0, SubscriptionLevel::Full, None);
        assert_eq!(fanout.subscriber_count(), 1);
        fanout.unsubscribe(handle.id);
        assert_eq!(fanout.subscriber_count(), 0);
        fanout.publish(delta("late"));
        assert!(drain(&mut handle).is_empty());
    }

    #[tokio::test]
    async fn notification_level_filters_deltas() {
        let fanout = fanout();
        let mut handle = fanout.subscribe(0, SubscriptionLevel::Notifications, None);
        fanout.publish(delta("noise"));
        fanout.publish(SessionEvent::TurnAck {
            client_turn_id: "t1".to_string(),
            stage: TurnStage::Received,
            reason: None,
        });
        let got = drain(&mut handle);
        assert_eq!(got.len(), 1);
        assert!(matches!(got[0].event, SessionEvent::TurnAck { .. }));
    }

    #[tokio::test]
    async fn baseline_is_delivered_before_replay() {
        let fanout = fanout();
        for i in 0..3 {
            fanout.publish(delta(&i.to_string()));
        }
        let mut handle = fanout.subscribe(
            1,
            SubscriptionLevel::Full,
            Some(SessionEvent::MessageEnd),
        );
        let got = drain(&mut handle);
        assert!(matches!(got[0].event, SessionEvent::MessageEnd));
        assert_eq!(got[0].seq, 1);
        let seqs: Vec<u64> = got[1..].iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![2, 3]);
    }
}
