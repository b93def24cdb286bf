//! Deterministic scripted agent engine used by the integration suites.

#![allow(clippy::unwrap_used, clippy::expect_used)]
#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use oppi_core::MemoryRuleStore;
use oppi_core::SessionRegistry;
use oppi_core::SubscriptionHandle;
use oppi_core::config::CoreConfig;
use oppi_core::engine::AgentEngine;
use oppi_core::engine::EngineError;
use oppi_core::engine::EngineEvent;
use oppi_core::engine::EngineFactory;
use oppi_core::engine::EngineSpec;
use oppi_core::engine::ToolCall;
use oppi_core::engine::ToolInterceptor;
use oppi_core::engine::TurnInput;
use oppi_core::engine::TurnUsage;
use oppi_protocol::EventEnvelope;
use oppi_protocol::SessionEvent;
use oppi_protocol::TokenUsage;
use serde_json::Value;
use tokio::sync::mpsc;

/// One scripted step of a turn.
#[derive(Clone, Debug)]
pub enum Step {
    Text(&'static str),
    Thinking(&'static str),
    /// Emits `tool_start`, runs the call through the interceptor, then
    /// emits `tool_output`/`tool_end` according to the verdict.
    Tool {
        call_id: &'static str,
        tool: &'static str,
        input: Value,
    },
    MessageEnd,
    Warning(&'static str),
    ExtensionUi {
        id: &'static str,
        payload: Value,
    },
    /// Forward-compat sentinel: an event type this adapter does not know.
    Unknown(Value),
    Crash(&'static str),
}

pub type TurnScript = Vec<Step>;

pub struct ScriptedEngine {
    turns: Mutex<VecDeque<TurnScript>>,
    interceptor: Arc<dyn ToolInterceptor>,
    aborted: AtomicBool,
    pub steered: Mutex<Vec<String>>,
    pub ui_responses: Mutex<Vec<(String, Value)>>,
    trace: PathBuf,
}

#[async_trait]
impl AgentEngine for ScriptedEngine {
    async fn wait_ready(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn run_turn(
        &self,
        _input: TurnInput,
        events: mpsc::Sender<EngineEvent>,
    ) -> Result<(), EngineError> {
        self.aborted.store(false, Ordering::SeqCst);
        let steps = self.turns.lock().unwrap().pop_front().unwrap_or_default();
        for step in steps {
            if self.aborted.load(Ordering::SeqCst) {
                return Ok(());
            }
            match step {
                Step::Text(text) => {
                    let _ = events
                        .send(EngineEvent::TextDelta {
                            delta: text.to_string(),
                        })
                        .await;
                }
                Step::Thinking(text) => {
                    let _ = events
                        .send(EngineEvent::ThinkingDelta {
                            delta: text.to_string(),
                        })
                        .await;
                }
                Step::Tool {
                    call_id,
                    tool,
                    input,
                } => {
                    let _ = events
                        .send(EngineEvent::ToolStart {
                            call_id: call_id.to_string(),
                            tool: tool.to_string(),
                            input: input.clone(),
                        })
                        .await;
                    let decision = self
                        .interceptor
                        .intercept(ToolCall {
                            tool_call_id: call_id.to_string(),
                            tool: tool.to_string(),
                            input,
                        })
                        .await;
                    if decision.block {
                        let _ = events
                            .send(EngineEvent::ToolEnd {
                                call_id: call_id.to_string(),
                                success: false,
                                blocked: true,
                                message: decision.reason,
                            })
                            .await;
                    } else {
                        let _ = events
                            .send(EngineEvent::ToolOutput {
                                call_id: call_id.to_string(),
                                chunk: "ok".to_string(),
                            })
                            .await;
                        let _ = events
                            .send(EngineEvent::ToolEnd {
                                call_id: call_id.to_string(),
                                success: true,
                                blocked: false,
                                message: None,
                            })
                            .await;
                    }
                }
                Step::MessageEnd => {
                    let _ = events.send(EngineEvent::MessageEnd).await;
                }
                Step::Warning(message) => {
                    let _ = events
                        .send(EngineEvent::Warning {
                            message: message.to_string(),
                        })
                        .await;
                }
                Step::ExtensionUi { id, payload } => {
                    let _ = events
                        .send(EngineEvent::ExtensionUiRequest {
                            id: id.to_string(),
                            payload,
                        })
                        .await;
                }
                Step::Unknown(raw) => {
                    let _ = events.send(EngineEvent::Other { raw }).await;
                }
                Step::Crash(message) => {
                    return Err(EngineError::Crashed(message.to_string()));
                }
            }
        }
        if !self.aborted.load(Ordering::SeqCst) {
            let _ = events
                .send(EngineEvent::TurnComplete {
                    usage: TurnUsage {
                        usage: Some(TokenUsage {
                            input_tokens: 12,
                            output_tokens: 34,
                        }),
                        cost_usd: Some(0.01),
                        context_used: Some(128),
                    },
                    last_message: Some("done".to_string()),
                })
                .await;
        }
        Ok(())
    }

    async fn steer(&self, message: String) -> Result<(), EngineError> {
        self.steered.lock().unwrap().push(message);
        Ok(())
    }

    async fn abort_turn(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    async fn extension_ui_response(&self, id: String, value: Value) {
        self.ui_responses.lock().unwrap().push((id, value));
    }

    fn trace_path(&self) -> PathBuf {
        self.trace.clone()
    }

    fn context_window(&self) -> Option<u64> {
        Some(200_000)
    }
}

/// Hands each created engine the next script in order.
pub struct ScriptedFactory {
    scripts: Mutex<VecDeque<Vec<TurnScript>>>,
    pub engines: Mutex<Vec<Arc<ScriptedEngine>>>,
    trace_dir: tempfile::TempDir,
}

impl ScriptedFactory {
    pub fn new(scripts: Vec<Vec<TurnScript>>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            engines: Mutex::new(Vec::new()),
            trace_dir: tempfile::tempdir().expect("create trace dir"),
        })
    }

    pub fn engine(&self, index: usize) -> Arc<ScriptedEngine> {
        self.engines.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl EngineFactory for ScriptedFactory {
    async fn create(
        &self,
        spec: EngineSpec,
        interceptor: Arc<dyn ToolInterceptor>,
    ) -> anyhow::Result<Arc<dyn AgentEngine>> {
        let turns = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
        let engine = Arc::new(ScriptedEngine {
            turns: Mutex::new(turns.into()),
            interceptor,
            aborted: AtomicBool::new(false),
            steered: Mutex::new(Vec::new()),
            ui_responses: Mutex::new(Vec::new()),
            trace: self
                .trace_dir
                .path()
                .join(format!("{}.jsonl", spec.session_id)),
        });
        self.engines.lock().unwrap().push(engine.clone());
        Ok(engine)
    }
}

pub async fn registry_with(
    config: CoreConfig,
    scripts: Vec<Vec<TurnScript>>,
) -> (Arc<SessionRegistry>, Arc<ScriptedFactory>) {
    let factory = ScriptedFactory::new(scripts);
    let registry = SessionRegistry::new(
        config,
        Arc::new(MemoryRuleStore::default()),
        factory.clone(),
    )
    .await
    .expect("build registry");
    (Arc::new(registry), factory)
}

/// Spin until the engine has signalled readiness. The supervisor loop sets
/// `ready` asynchronously after `start_session` returns.
pub async fn wait_until_ready(supervisor: &Arc<oppi_core::SessionSupervisor>) {
    for _ in 0..10_000 {
        if supervisor.status() == oppi_protocol::SessionStatus::Ready {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("session never became ready");
}

pub async fn recv_event(handle: &mut SubscriptionHandle) -> EventEnvelope {
    tokio::time::timeout(Duration::from_secs(5), handle.rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream closed")
        .as_ref()
        .clone()
}

/// Collect events until `pred` matches; the matching event is included.
pub async fn wait_for_event<F>(handle: &mut SubscriptionHandle, mut pred: F) -> Vec<EventEnvelope>
where
    F: FnMut(&SessionEvent) -> bool,
{
    let mut seen = Vec::new();
    loop {
        let envelope = recv_event(handle).await;
        let done = pred(&envelope.event);
        seen.push(envelope);
        if done {
            return seen;
        }
    }
}

/// Assert the `seq` numbers of published events are strictly increasing and
/// dense, ignoring subscriber-local synthetic records (which reuse the
/// subscription's `since_seq`).
pub fn assert_dense(seqs: &[u64]) {
    for pair in seqs.windows(2) {
        assert_eq!(
            pair[1],
            pair[0] + 1,
            "seq gap or reorder in {seqs:?}"
        );
    }
}
