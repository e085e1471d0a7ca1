//! Agent runtime: the turn loop that drives a conversation
//!
//! `send()` runs one user request to completion: call the provider, stream
//! text out as events, execute any tool calls, feed results back, repeat.
//! The loop ends with exactly one terminal event (`Done` or
//! `Error { done: true }`) unless it is cancelled, in which case it stops
//! emitting and returns.

use std::sync::Arc;
use std::sync::LazyLock;

use async_trait::async_trait;
use futures::StreamExt;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sigil_ai::{Message, Provider, ToolCall};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::events::{AgentEvent, JudgePhase};
use crate::log::ConversationLog;
use crate::nudge::{CommonFailures, FailureCatalogue};
use crate::registry::ToolRegistry;
use crate::tool::OutputSink;

/// Hard cap on provider round-trips per `send`
pub const DEFAULT_MAX_TURNS: u32 = 50;

/// How many quality-gate rejections trigger a re-loop before giving up
pub const DEFAULT_MAX_QUALITY_GATE_RETRIES: u32 = 3;

/// Estimated-token threshold that triggers compaction
pub const DEFAULT_COMPACT_THRESHOLD: u32 = 24_000;

/// Models that cannot emit structured tool calls fall back to this text
/// pattern. Non-greedy, so a literal `]` inside the JSON ends the match
/// early; callers live with that limitation.
static TOOL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[TOOL:(\w+)\|(.+?)\]").unwrap());

/// Outcome of a quality-gate review
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub status: String,
    #[serde(default)]
    pub feedback: String,
}

impl Verdict {
    pub fn passed(&self) -> bool {
        self.status.eq_ignore_ascii_case("pass")
    }
}

/// Reviews a finished response against the original goal
#[async_trait]
pub trait Judge: Send + Sync {
    async fn review(&self, goal: &str, content: &str, cancel: CancellationToken) -> Verdict;
}

/// Tunable bounds for the turn loop
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub max_turns: u32,
    pub max_quality_gate_retries: u32,
    pub compact_threshold: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_turns: DEFAULT_MAX_TURNS,
            max_quality_gate_retries: DEFAULT_MAX_QUALITY_GATE_RETRIES,
            compact_threshold: DEFAULT_COMPACT_THRESHOLD,
        }
    }
}

/// The agent runtime.
///
/// Cheap to share behind an `Arc`; all mutable state is interior. One
/// `send` runs at a time per runtime (the confirmation receiver is taken
/// under an async lock for the duration).
pub struct AgentRuntime {
    provider: Arc<dyn Provider>,
    registry: Arc<ToolRegistry>,
    log: ConversationLog,
    config: RuntimeConfig,
    judge: Option<Arc<dyn Judge>>,
    failures: Arc<dyn FailureCatalogue>,
    confirm_tx: mpsc::Sender<bool>,
    confirm_rx: tokio::sync::Mutex<mpsc::Receiver<bool>>,
    event_sink: Arc<parking_lot::Mutex<Option<mpsc::Sender<AgentEvent>>>>,
    /// First user request; the quality gate reviews against this
    goal: parking_lot::Mutex<Option<String>>,
    depth: u32,
}

impl AgentRuntime {
    pub fn new(
        provider: Arc<dyn Provider>,
        registry: Arc<ToolRegistry>,
        system_prompt: impl Into<String>,
    ) -> Self {
        // Capacity 1 so a host can queue exactly one pending decision
        let (confirm_tx, confirm_rx) = mpsc::channel(1);
        Self {
            provider,
            registry,
            log: ConversationLog::with_system(system_prompt),
            config: RuntimeConfig::default(),
            judge: None,
            failures: Arc::new(CommonFailures),
            confirm_tx,
            confirm_rx: tokio::sync::Mutex::new(confirm_rx),
            event_sink: Arc::new(parking_lot::Mutex::new(None)),
            goal: parking_lot::Mutex::new(None),
            depth: 0,
        }
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Install a quality gate reviewed on turns that produce no tool calls
    pub fn with_judge(mut self, judge: Arc<dyn Judge>) -> Self {
        self.judge = Some(judge);
        self
    }

    pub fn with_failure_catalogue(mut self, failures: Arc<dyn FailureCatalogue>) -> Self {
        self.failures = failures;
        self
    }

    /// Nesting depth when run as a sub-agent (0 for the root)
    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn log(&self) -> &ConversationLog {
        &self.log
    }

    /// Sender for answering `ConfirmRequest` events (`true` = approve)
    pub fn confirmations(&self) -> mpsc::Sender<bool> {
        self.confirm_tx.clone()
    }

    /// Wire an input channel to an interactive tool.
    ///
    /// Returns a sender the host writes user input lines to; the tool's
    /// input-request notification surfaces as an `InputRequest` event on
    /// whatever sink the current `send` is using.
    pub fn connect_input(&self, tool_name: &str) -> Option<mpsc::Sender<String>> {
        let tool = self.registry.get(tool_name)?;
        let (tx, rx) = mpsc::channel(8);
        tool.set_input_channel(rx);

        let sink = self.event_sink.clone();
        let name = tool_name.to_string();
        tool.set_input_request(Arc::new(move || {
            if let Some(events) = sink.lock().as_ref() {
                let _ = events.try_send(AgentEvent::InputRequest {
                    tool_name: name.clone(),
                });
            }
        }));
        Some(tx)
    }

    /// Run one user request to completion.
    ///
    /// Emits progress on `events` and returns once a terminal event has
    /// been sent (or the token was cancelled). The sink must be buffered
    /// with capacity above 1; an unbuffered sink would deadlock the loop
    /// against a consumer that only polls between sends, so it is rejected
    /// up front without calling the provider.
    pub async fn send(
        &self,
        input: &str,
        events: mpsc::Sender<AgentEvent>,
        cancel: CancellationToken,
    ) -> crate::error::Result<()> {
        if events.max_capacity() <= 1 {
            let _ = events.try_send(AgentEvent::Error {
                message: "event sink must be a buffered channel (capacity > 1)".to_string(),
                done: true,
            });
            return Err(Error::EventSink(
                "event sink must be a buffered channel (capacity > 1)".to_string(),
            ));
        }

        *self.event_sink.lock() = Some(events.clone());
        self.log.append_user(input);
        let goal = {
            let mut goal = self.goal.lock();
            goal.get_or_insert_with(|| input.to_string()).clone()
        };

        let mut judge_retries = 0u32;
        let mut turn = 0u32;

        loop {
            turn += 1;
            if turn > self.config.max_turns {
                self.emit(
                    &events,
                    &cancel,
                    AgentEvent::Error {
                        message: format!(
                            "agent did not finish within {} turns",
                            self.config.max_turns
                        ),
                        done: true,
                    },
                )
                .await;
                return Err(Error::BoundExceeded(format!(
                    "max turns ({}) exceeded",
                    self.config.max_turns
                )));
            }

            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            if self.log.estimate_tokens() >= self.config.compact_threshold {
                self.log.compact(self.config.compact_threshold);
            }

            // The reminder is part of the request only, never the log
            let mut snapshot = self.log.snapshot();
            snapshot.push(Message::system(format!(
                "Turn {}/{}. If a previous command failed, try a different approach \
                 instead of repeating it.",
                turn, self.config.max_turns
            )));

            let tools = self.registry.tool_defs();
            let mut stream = match self.provider.chat(&snapshot, &tools, cancel.clone()).await {
                Ok(s) => s,
                Err(e) => {
                    self.emit(
                        &events,
                        &cancel,
                        AgentEvent::Error {
                            message: e.to_string(),
                            done: true,
                        },
                    )
                    .await;
                    return Err(e.into());
                }
            };

            let mut text = String::new();
            let mut tool_calls: Vec<ToolCall> = Vec::new();
            let mut stream_error: Option<String> = None;

            while let Some(chunk) = stream.next().await {
                if let Some(delta) = chunk.delta {
                    text.push_str(&delta);
                    self.emit(&events, &cancel, AgentEvent::Delta { text: delta })
                        .await;
                }
                if let Some(thinking) = chunk.thinking {
                    self.emit(&events, &cancel, AgentEvent::Thinking { text: thinking })
                        .await;
                }
                if chunk.done {
                    stream_error = chunk.error;
                    tool_calls = chunk.tool_calls;
                    break;
                }
            }

            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            if let Some(message) = stream_error {
                self.emit(
                    &events,
                    &cancel,
                    AgentEvent::Error {
                        message: message.clone(),
                        done: true,
                    },
                )
                .await;
                return Err(Error::Other(message));
            }

            // Models without structured tool support embed calls in text
            if tool_calls.is_empty() {
                tool_calls = extract_text_tool_calls(&text);
            }

            // A bare wrap-up turn (no text, no calls) adds nothing worth
            // keeping in the transcript.
            if !text.is_empty() || !tool_calls.is_empty() {
                self.log.append_assistant(text.clone(), tool_calls.clone());
            }

            if tool_calls.is_empty() {
                let Some(judge) = &self.judge else {
                    self.emit(&events, &cancel, AgentEvent::Done).await;
                    return Ok(());
                };

                self.emit(
                    &events,
                    &cancel,
                    AgentEvent::JudgeCall {
                        phase: JudgePhase::Evaluating,
                        feedback: None,
                    },
                )
                .await;

                let verdict = judge.review(&goal, &text, cancel.clone()).await;

                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }

                if verdict.passed() {
                    let feedback = (!verdict.feedback.is_empty()).then_some(verdict.feedback);
                    self.emit(
                        &events,
                        &cancel,
                        AgentEvent::JudgeCall {
                            phase: JudgePhase::Passed,
                            feedback,
                        },
                    )
                    .await;
                    self.emit(&events, &cancel, AgentEvent::Done).await;
                    return Ok(());
                }

                judge_retries += 1;
                if judge_retries >= self.config.max_quality_gate_retries {
                    self.emit(
                        &events,
                        &cancel,
                        AgentEvent::Error {
                            message: format!(
                                "Quality Gate Rejected: {} (retry limit of {} reached)",
                                verdict.feedback, self.config.max_quality_gate_retries
                            ),
                            done: true,
                        },
                    )
                    .await;
                    return Err(Error::BoundExceeded(format!(
                        "quality gate retries ({}) exceeded",
                        self.config.max_quality_gate_retries
                    )));
                }

                self.emit(
                    &events,
                    &cancel,
                    AgentEvent::Error {
                        message: format!("Quality Gate Rejected: {}", verdict.feedback),
                        done: false,
                    },
                )
                .await;
                self.log.append_system(format!(
                    "Your previous response was rejected by a reviewer: {}\n\
                     Address the feedback and answer again.",
                    verdict.feedback
                ));
                continue;
            }

            self.run_tool_calls(tool_calls, &events, &cancel).await;

            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
        }
    }

    /// Split a turn's tool calls into the concurrent read-only group and
    /// the ordered sequential group, then run both.
    async fn run_tool_calls(
        &self,
        calls: Vec<ToolCall>,
        events: &mpsc::Sender<AgentEvent>,
        cancel: &CancellationToken,
    ) {
        let (parallel, sequential): (Vec<ToolCall>, Vec<ToolCall>) = calls
            .into_iter()
            .partition(|c| self.registry.is_parallel_safe(&c.name));

        if !parallel.is_empty() {
            self.run_parallel(parallel, events, cancel).await;
        }
        if !sequential.is_empty() {
            self.run_sequential(sequential, events, cancel).await;
        }
    }

    /// Fan out read-only tools concurrently; results land in completion
    /// order, each carrying its originating call id. The parallel-safe set
    /// is read-only, so no confirmation applies. On cancellation the
    /// remaining tasks are aborted rather than awaited, so a tool that
    /// never polls its token cannot pin the loop.
    async fn run_parallel(
        &self,
        calls: Vec<ToolCall>,
        events: &mpsc::Sender<AgentEvent>,
        cancel: &CancellationToken,
    ) {
        let mut set = JoinSet::new();

        for call in &calls {
            self.emit(
                events,
                cancel,
                AgentEvent::ToolCall {
                    tool_call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    arguments: pretty_arguments(&call.arguments),
                },
            )
            .await;

            let registry = self.registry.clone();
            let events = events.clone();
            let cancel = cancel.clone();
            let call = call.clone();
            set.spawn(async move {
                let sink = OutputSink::new(events, call.id.clone(), call.name.clone());
                let result = registry
                    .execute(&call.name, &call.arguments, cancel, Some(sink))
                    .await;
                (call, result)
            });
        }

        let mut pending = calls;
        loop {
            let joined = tokio::select! {
                _ = cancel.cancelled() => {
                    set.abort_all();
                    for call in &pending {
                        self.log
                            .append_tool_result(&call.id, "Skipped: operation cancelled");
                    }
                    return;
                }
                joined = set.join_next() => joined,
            };
            match joined {
                None => {
                    // A panicked task never reported; keep the chain intact
                    for call in &pending {
                        self.log.append_tool_result(&call.id, "tool failed: task panicked");
                    }
                    return;
                }
                Some(Ok((call, result))) => {
                    pending.retain(|c| c.id != call.id);
                    self.record_tool_result(&call, result, events, cancel).await;
                }
                Some(Err(e)) => {
                    tracing::warn!("tool task panicked or was aborted: {}", e);
                }
            }
        }
    }

    /// Run tools one at a time, gating side-effecting ones on confirmation
    async fn run_sequential(
        &self,
        calls: Vec<ToolCall>,
        events: &mpsc::Sender<AgentEvent>,
        cancel: &CancellationToken,
    ) {
        for call in calls {
            if cancel.is_cancelled() {
                // Keep the call/result chain intact for the next request
                self.log
                    .append_tool_result(&call.id, "Skipped: operation cancelled");
                continue;
            }

            self.emit(
                events,
                cancel,
                AgentEvent::ToolCall {
                    tool_call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    arguments: pretty_arguments(&call.arguments),
                },
            )
            .await;

            if self.registry.needs_confirmation(&call.name) {
                self.emit(
                    events,
                    cancel,
                    AgentEvent::ConfirmRequest {
                        tool_call_id: call.id.clone(),
                        tool_name: call.name.clone(),
                        arguments: pretty_arguments(&call.arguments),
                    },
                )
                .await;

                if !self.await_confirmation(cancel).await {
                    let denied = "User denied this operation.";
                    self.emit(
                        events,
                        cancel,
                        AgentEvent::ToolResult {
                            tool_call_id: call.id.clone(),
                            tool_name: call.name.clone(),
                            output: denied.to_string(),
                            is_error: true,
                        },
                    )
                    .await;
                    self.log.append_tool_result(&call.id, denied);
                    continue;
                }
            }

            let sink = OutputSink::new(events.clone(), call.id.clone(), call.name.clone());
            // Race the tool against cancellation; a tool that ignores its
            // token is abandoned, not awaited.
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    self.log
                        .append_tool_result(&call.id, "Skipped: operation cancelled");
                    continue;
                }
                result = self
                    .registry
                    .execute(&call.name, &call.arguments, cancel.clone(), Some(sink)) => result,
            };
            self.record_tool_result(&call, result, events, cancel).await;
        }
    }

    /// Convert an execution outcome into an event plus a log entry
    async fn record_tool_result(
        &self,
        call: &ToolCall,
        result: crate::error::Result<crate::tool::ToolResult>,
        events: &mpsc::Sender<AgentEvent>,
        cancel: &CancellationToken,
    ) {
        let (mut output, is_error) = match result {
            Ok(r) => {
                let is_error = r.is_error();
                (r.model_text(), is_error)
            }
            Err(e) => (format!("tool failed: {}", e), true),
        };
        if is_error {
            output = self.failures.apply(&output);
        }

        self.emit(
            events,
            cancel,
            AgentEvent::ToolResult {
                tool_call_id: call.id.clone(),
                tool_name: call.name.clone(),
                output: output.clone(),
                is_error,
            },
        )
        .await;
        self.log.append_tool_result(&call.id, output);
    }

    /// Wait for the host's approve/deny. Cancellation or a closed channel
    /// counts as denial.
    async fn await_confirmation(&self, cancel: &CancellationToken) -> bool {
        let mut rx = self.confirm_rx.lock().await;
        tokio::select! {
            _ = cancel.cancelled() => false,
            answer = rx.recv() => answer.unwrap_or(false),
        }
    }

    /// Emit an event, never blocking past cancellation. A closed sink is
    /// the host's choice and only logged.
    async fn emit(
        &self,
        events: &mpsc::Sender<AgentEvent>,
        cancel: &CancellationToken,
        event: AgentEvent,
    ) {
        tokio::select! {
            _ = cancel.cancelled() => {}
            sent = events.send(event) => {
                if sent.is_err() {
                    tracing::debug!("event sink closed, dropping event");
                }
            }
        }
    }
}

/// Pretty-print JSON arguments for display, passing through anything that
/// does not parse.
fn pretty_arguments(raw: &str) -> String {
    serde_json::from_str::<serde_json::Value>(raw)
        .and_then(|v| serde_json::to_string_pretty(&v))
        .unwrap_or_else(|_| raw.to_string())
}

/// Extract `[TOOL:name|{json args}]` calls embedded in assistant text
fn extract_text_tool_calls(text: &str) -> Vec<ToolCall> {
    let millis = chrono::Utc::now().timestamp_millis();
    TOOL_PATTERN
        .captures_iter(text)
        .enumerate()
        .map(|(n, caps)| {
            ToolCall::new(format!("fallback-{}-{}", millis, n), &caps[1], &caps[2])
        })
        .collect()
}


#[cfg(test)]
mod tests {
    use super::harness::*;
    use super::*;
    use crate::tool::{Tool, ToolResult};
    use sigil_ai::{Role, StreamChunk};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct EchoTool {
        tool_name: String,
        confirm: bool,
        calls: Arc<AtomicU32>,
        delay: Duration,
        ignore_cancel: bool,
    }

    impl EchoTool {
        fn named(name: &str) -> (Arc<Self>, Arc<AtomicU32>) {
            Self::build(name, false, Duration::ZERO, false)
        }

        fn confirmed(name: &str) -> (Arc<Self>, Arc<AtomicU32>) {
            Self::build(name, true, Duration::ZERO, false)
        }

        fn slow(name: &str, delay: Duration) -> (Arc<Self>, Arc<AtomicU32>) {
            Self::build(name, false, delay, false)
        }

        /// Sleeps without ever polling its cancellation token
        fn stubborn(name: &str, delay: Duration) -> (Arc<Self>, Arc<AtomicU32>) {
            Self::build(name, false, delay, true)
        }

        fn build(
            name: &str,
            confirm: bool,
            delay: Duration,
            ignore_cancel: bool,
        ) -> (Arc<Self>, Arc<AtomicU32>) {
            let calls = Arc::new(AtomicU32::new(0));
            (
                Arc::new(Self {
                    tool_name: name.to_string(),
                    confirm,
                    calls: calls.clone(),
                    delay,
                    ignore_cancel,
                }),
                calls,
            )
        }
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            &self.tool_name
        }
        fn description(&self) -> &str {
            "Echoes its arguments"
        }
        fn parameters(&self) -> serde_json::Value {
            serde_json::json!({ "type": "object" })
        }
        fn needs_confirmation(&self) -> bool {
            self.confirm
        }
        async fn execute(
            &self,
            arguments: &str,
            cancel: CancellationToken,
        ) -> crate::error::Result<ToolResult> {
            if !self.delay.is_zero() {
                if self.ignore_cancel {
                    tokio::time::sleep(self.delay).await;
                } else {
                    tokio::select! {
                        _ = tokio::time::sleep(self.delay) => {}
                        _ = cancel.cancelled() => {
                            return Ok(ToolResult::soft_error("cancelled"));
                        }
                    }
                }
            }
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ToolResult::ok(format!("echo: {}", arguments)))
        }
    }

    fn runtime_with(
        provider: Arc<ScriptedProvider>,
        tools: Vec<Arc<EchoTool>>,
    ) -> (AgentRuntime, Arc<ToolRegistry>) {
        let registry = Arc::new(ToolRegistry::new());
        for t in tools {
            registry.register(t);
        }
        let runtime = AgentRuntime::new(provider, registry.clone(), "You are helpful.");
        (runtime, registry)
    }

    #[tokio::test]
    async fn test_plain_answer_ends_with_done() {
        let provider = Arc::new(ScriptedProvider::new(vec![ScriptedProvider::text_turn(
            "hello there",
        )]));
        let (runtime, _) = runtime_with(provider.clone(), vec![]);

        let (tx, mut rx) = mpsc::channel(64);
        runtime
            .send("hi", tx, CancellationToken::new())
            .await
            .unwrap();

        let events = drain(&mut rx);
        assert!(matches!(events.last(), Some(AgentEvent::Done)));
        let deltas: String = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::Delta { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(deltas, "hello there");
        // Exactly one terminal event
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn test_unbuffered_sink_rejected_without_provider_call() {
        let provider = Arc::new(ScriptedProvider::new(vec![ScriptedProvider::text_turn(
            "unused",
        )]));
        let (runtime, _) = runtime_with(provider.clone(), vec![]);

        let (tx, mut rx) = mpsc::channel(1);
        let result = runtime.send("hi", tx, CancellationToken::new()).await;
        assert!(result.is_err());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            AgentEvent::Error { done: true, .. }
        ));
    }

    #[tokio::test]
    async fn test_text_pattern_fallback_executes_tool() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            ScriptedProvider::text_turn(r#"Let me look. [TOOL:web_search|{"query": "rust"}]"#),
            ScriptedProvider::text_turn("The answer is 42."),
        ]));
        let (search, search_calls) = EchoTool::named("web_search");
        let (runtime, _) = runtime_with(provider.clone(), vec![search]);

        let (tx, mut rx) = mpsc::channel(64);
        runtime
            .send("find rust", tx, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(search_calls.load(Ordering::SeqCst), 1);
        let events = drain(&mut rx);
        let tool_call = events.iter().find_map(|e| match e {
            AgentEvent::ToolCall {
                tool_call_id,
                tool_name,
                ..
            } => Some((tool_call_id.clone(), tool_name.clone())),
            _ => None,
        });
        let (id, name) = tool_call.expect("tool call event");
        assert!(id.starts_with("fallback-"));
        assert_eq!(name, "web_search");
        assert!(matches!(events.last(), Some(AgentEvent::Done)));

        // The synthesized call and its result are both in the log
        let log = runtime.log().snapshot();
        assert!(log.iter().any(|m| m.role == Role::Assistant && !m.tool_calls.is_empty()));
        assert!(log.iter().any(|m| m.role == Role::Tool));
    }

    #[tokio::test]
    async fn test_turn_reminder_in_request_not_in_log() {
        let provider = Arc::new(ScriptedProvider::new(vec![ScriptedProvider::text_turn(
            "ok",
        )]));
        let (runtime, _) = runtime_with(provider.clone(), vec![]);

        let (tx, _rx) = mpsc::channel(64);
        runtime
            .send("hi", tx, CancellationToken::new())
            .await
            .unwrap();

        let request = provider.last_request.lock().clone();
        let reminder = request.last().expect("non-empty request");
        assert_eq!(reminder.role, Role::System);
        assert!(reminder.content.starts_with("Turn 1/"));

        assert!(
            !runtime
                .log()
                .snapshot()
                .iter()
                .any(|m| m.content.starts_with("Turn 1/")),
            "reminder must not be persisted"
        );
    }

    #[tokio::test]
    async fn test_quality_gate_reject_then_pass() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            ScriptedProvider::text_turn("first draft"),
            ScriptedProvider::text_turn("better draft"),
        ]));
        let judge = Arc::new(ScriptedJudge::new(vec![
            ScriptedJudge::fail("too vague"),
            ScriptedJudge::pass(),
        ]));
        let (runtime, _) = runtime_with(provider.clone(), vec![]);
        let runtime = runtime.with_judge(judge.clone());

        let (tx, mut rx) = mpsc::channel(64);
        runtime
            .send("write a summary", tx, CancellationToken::new())
            .await
            .unwrap();

        let events = drain(&mut rx);
        let judge_events: Vec<&JudgePhase> = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::JudgeCall { phase, .. } => Some(phase),
                _ => None,
            })
            .collect();
        assert_eq!(
            judge_events,
            vec![
                &JudgePhase::Evaluating,
                &JudgePhase::Evaluating,
                &JudgePhase::Passed
            ]
        );

        // One non-terminal rejection error, then Done
        let rejections: Vec<_> = events
            .iter()
            .filter(|e| {
                matches!(e, AgentEvent::Error { message, done: false }
                    if message.starts_with("Quality Gate Rejected:"))
            })
            .collect();
        assert_eq!(rejections.len(), 1);
        assert!(matches!(events.last(), Some(AgentEvent::Done)));

        // Both reviews judged against the original goal
        assert_eq!(
            judge.goals.lock().as_slice(),
            &["write a summary".to_string(), "write a summary".to_string()]
        );

        // The feedback was fed back as a system message
        assert!(
            runtime
                .log()
                .snapshot()
                .iter()
                .any(|m| m.role == Role::System && m.content.contains("too vague"))
        );
    }

    #[tokio::test]
    async fn test_quality_gate_retries_exhausted() {
        let scripts = (0..8)
            .map(|i| ScriptedProvider::text_turn(&format!("draft {}", i)))
            .collect();
        let provider = Arc::new(ScriptedProvider::new(scripts));
        let judge = Arc::new(ScriptedJudge::new(
            (0..8).map(|_| ScriptedJudge::fail("still wrong")).collect(),
        ));
        let (runtime, _) = runtime_with(provider.clone(), vec![]);
        let runtime = runtime.with_judge(judge);

        let (tx, mut rx) = mpsc::channel(64);
        let result = runtime.send("task", tx, CancellationToken::new()).await;
        assert!(result.is_err());

        let events = drain(&mut rx);
        let non_terminal = events
            .iter()
            .filter(|e| matches!(e, AgentEvent::Error { done: false, .. }))
            .count();
        // The final rejection is terminal, so one fewer re-loop than the cap
        assert_eq!(non_terminal, DEFAULT_MAX_QUALITY_GATE_RETRIES as usize - 1);
        assert!(matches!(
            events.last(),
            Some(AgentEvent::Error { done: true, message })
                if message.starts_with("Quality Gate Rejected:")
                    && message.contains("retry limit of 3")
        ));
        assert_eq!(
            provider.calls.load(Ordering::SeqCst),
            DEFAULT_MAX_QUALITY_GATE_RETRIES
        );
    }

    #[tokio::test]
    async fn test_confirmation_denied() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            ScriptedProvider::tool_turn(vec![ToolCall::new(
                "call-1",
                "file_write",
                r#"{"path": "/etc/passwd"}"#,
            )]),
            ScriptedProvider::text_turn("understood"),
        ]));
        let (write, write_calls) = EchoTool::confirmed("file_write");
        let (runtime, _) = runtime_with(provider.clone(), vec![write]);

        // Queue the denial before the loop asks
        runtime.confirmations().send(false).await.unwrap();

        let (tx, mut rx) = mpsc::channel(64);
        runtime
            .send("wipe the file", tx, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(write_calls.load(Ordering::SeqCst), 0);
        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(e, AgentEvent::ConfirmRequest { .. })));
        assert!(events.iter().any(|e| {
            matches!(e, AgentEvent::ToolResult { output, is_error: true, .. }
                if output == "User denied this operation.")
        }));
        assert!(
            runtime
                .log()
                .snapshot()
                .iter()
                .any(|m| m.role == Role::Tool && m.content == "User denied this operation.")
        );
    }

    #[tokio::test]
    async fn test_confirmation_approved_runs_tool() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            ScriptedProvider::tool_turn(vec![ToolCall::new("call-1", "file_write", "{}")]),
            ScriptedProvider::text_turn("done"),
        ]));
        let (write, write_calls) = EchoTool::confirmed("file_write");
        let (runtime, _) = runtime_with(provider.clone(), vec![write]);

        runtime.confirmations().send(true).await.unwrap();

        let (tx, mut rx) = mpsc::channel(64);
        runtime
            .send("write it", tx, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(write_calls.load(Ordering::SeqCst), 1);
        let events = drain(&mut rx);
        assert!(matches!(events.last(), Some(AgentEvent::Done)));
    }

    #[tokio::test]
    async fn test_parallel_group_runs_all_and_logs_results() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            ScriptedProvider::tool_turn(vec![
                ToolCall::new("call-a", "web_search", r#"{"query": "a"}"#),
                ToolCall::new("call-b", "file_read", r#"{"path": "b"}"#),
            ]),
            ScriptedProvider::text_turn("combined"),
        ]));
        let (search, search_calls) = EchoTool::named("web_search");
        let (read, read_calls) = EchoTool::named("file_read");
        let (runtime, _) = runtime_with(provider.clone(), vec![search, read]);

        let (tx, mut rx) = mpsc::channel(64);
        runtime
            .send("gather", tx, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(search_calls.load(Ordering::SeqCst), 1);
        assert_eq!(read_calls.load(Ordering::SeqCst), 1);

        let events = drain(&mut rx);
        let results = events
            .iter()
            .filter(|e| matches!(e, AgentEvent::ToolResult { .. }))
            .count();
        assert_eq!(results, 2);

        let log = runtime.log().snapshot();
        assert_eq!(log.iter().filter(|m| m.role == Role::Tool).count(), 2);
    }

    #[tokio::test]
    async fn test_mixed_batch_partitions_by_safety() {
        // One read-only call and one confirmed side-effecting call in the
        // same turn: the former fans out, the latter waits for approval.
        let provider = Arc::new(ScriptedProvider::new(vec![
            ScriptedProvider::tool_turn(vec![
                ToolCall::new("call-w", "file_write", "{}"),
                ToolCall::new("call-r", "file_read", "{}"),
            ]),
            ScriptedProvider::text_turn("done"),
        ]));
        let (write, write_calls) = EchoTool::confirmed("file_write");
        let (read, read_calls) = EchoTool::named("file_read");
        let (runtime, _) = runtime_with(provider.clone(), vec![write, read]);

        runtime.confirmations().send(true).await.unwrap();

        let (tx, mut rx) = mpsc::channel(64);
        runtime
            .send("both", tx, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(write_calls.load(Ordering::SeqCst), 1);
        assert_eq!(read_calls.load(Ordering::SeqCst), 1);

        let events = drain(&mut rx);
        // Only the side-effecting call asked for confirmation
        let confirms: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::ConfirmRequest { tool_name, .. } => Some(tool_name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(confirms, vec!["file_write"]);
        // And both results made it into the log
        let log = runtime.log().snapshot();
        assert_eq!(log.iter().filter(|m| m.role == Role::Tool).count(), 2);
    }

    #[tokio::test]
    async fn test_cancellation_is_silent_and_prompt() {
        let provider = Arc::new(ScriptedProvider::new(vec![ScriptedProvider::tool_turn(
            vec![
                ToolCall::new("call-a", "web_search", "{}"),
                ToolCall::new("call-b", "file_read", "{}"),
            ],
        )]));
        let (search, _) = EchoTool::slow("web_search", Duration::from_secs(60));
        let (read, _) = EchoTool::slow("file_read", Duration::from_secs(60));
        let (runtime, _) = runtime_with(provider.clone(), vec![search, read]);
        let runtime = Arc::new(runtime);

        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(64);
        let handle = {
            let runtime = runtime.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { runtime.send("gather", tx, cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("send must unwind within 2s of cancellation")
            .unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));

        // Cancellation terminates silently: no terminal event
        let events = drain(&mut rx);
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_bounded_when_tool_ignores_token() {
        // One call in each execution path; neither tool ever polls its
        // token, so the runtime must abandon them rather than wait.
        let provider = Arc::new(ScriptedProvider::new(vec![ScriptedProvider::tool_turn(
            vec![
                ToolCall::new("call-a", "web_search", "{}"),
                ToolCall::new("call-b", "bash", "{}"),
            ],
        )]));
        let (search, _) = EchoTool::stubborn("web_search", Duration::from_secs(60));
        let (bash, _) = EchoTool::stubborn("bash", Duration::from_secs(60));
        let (runtime, _) = runtime_with(provider.clone(), vec![search, bash]);
        let runtime = Arc::new(runtime);

        let cancel = CancellationToken::new();
        let (tx, _rx) = mpsc::channel(64);
        let handle = {
            let runtime = runtime.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { runtime.send("gather", tx, cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("send must unwind even when tools ignore cancellation")
            .unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));

        // Both calls got placeholder results so the chain stays intact
        let log = runtime.log().snapshot();
        let skipped: Vec<_> = log
            .iter()
            .filter(|m| m.role == Role::Tool && m.content == "Skipped: operation cancelled")
            .collect();
        assert_eq!(skipped.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_wrap_up_turn_not_logged() {
        // A tool turn followed by an empty reply must leave the log at
        // [system, user, assistant(tool_calls), tool], with no trailing
        // empty assistant message.
        let provider = Arc::new(ScriptedProvider::new(vec![
            ScriptedProvider::tool_turn(vec![ToolCall::new("call-1", "web_search", "{}")]),
            vec![StreamChunk::finished(vec![], None)],
        ]));
        let (search, _) = EchoTool::named("web_search");
        let (runtime, _) = runtime_with(provider.clone(), vec![search]);

        let (tx, mut rx) = mpsc::channel(64);
        runtime
            .send("look it up", tx, CancellationToken::new())
            .await
            .unwrap();

        let events = drain(&mut rx);
        assert!(matches!(events.last(), Some(AgentEvent::Done)));

        let roles: Vec<Role> = runtime.log().snapshot().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant, Role::Tool]);
    }

    #[tokio::test]
    async fn test_max_turns_exceeded() {
        // Every turn issues another tool call, so the loop never settles
        let scripts = (0..4)
            .map(|i| {
                ScriptedProvider::tool_turn(vec![ToolCall::new(
                    format!("call-{}", i),
                    "web_search",
                    "{}",
                )])
            })
            .collect();
        let provider = Arc::new(ScriptedProvider::new(scripts));
        let (search, _) = EchoTool::named("web_search");
        let registry = Arc::new(ToolRegistry::new());
        registry.register(search);
        let runtime = AgentRuntime::new(provider, registry, "sys").with_config(RuntimeConfig {
            max_turns: 2,
            ..RuntimeConfig::default()
        });

        let (tx, mut rx) = mpsc::channel(64);
        let result = runtime.send("loop", tx, CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::BoundExceeded(_))));

        let events = drain(&mut rx);
        assert!(matches!(
            events.last(),
            Some(AgentEvent::Error { done: true, message }) if message.contains("2 turns")
        ));
    }

    #[tokio::test]
    async fn test_unknown_tool_nudge_in_result() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            ScriptedProvider::tool_turn(vec![ToolCall::new("call-1", "fetch", "{}")]),
            ScriptedProvider::text_turn("ok"),
        ]));
        let (runtime, _) = runtime_with(provider.clone(), vec![]);

        let (tx, mut rx) = mpsc::channel(64);
        runtime
            .send("fetch it", tx, CancellationToken::new())
            .await
            .unwrap();

        let events = drain(&mut rx);
        let output = events
            .iter()
            .find_map(|e| match e {
                AgentEvent::ToolResult {
                    output, is_error, ..
                } if *is_error => Some(output.clone()),
                _ => None,
            })
            .expect("error tool result");
        assert!(output.contains("unknown tool: fetch"));
        assert!(output.contains("web_fetch"), "alias hint applied: {}", output);
    }

    #[test]
    fn test_extract_text_tool_calls() {
        let calls = extract_text_tool_calls(
            r#"first [TOOL:web_search|{"q": "a"}] then [TOOL:file_read|{"path": "b"}]"#,
        );
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "web_search");
        assert_eq!(calls[0].arguments, r#"{"q": "a"}"#);
        assert_eq!(calls[1].name, "file_read");
        assert!(calls[0].id.starts_with("fallback-"));
        assert!(calls[0].id.ends_with("-0"));
        assert!(calls[1].id.ends_with("-1"));
    }

    #[test]
    fn test_extract_ignores_malformed_patterns() {
        assert!(extract_text_tool_calls("no tools here").is_empty());
        assert!(extract_text_tool_calls("[TOOL:missing_pipe]").is_empty());
        // Tool names with spaces do not match
        assert!(extract_text_tool_calls("[TOOL:bad name|{}]").is_empty());
    }

    #[test]
    fn test_pretty_arguments() {
        let pretty = pretty_arguments(r#"{"a":1}"#);
        assert!(pretty.contains("\"a\": 1"));
        assert_eq!(pretty_arguments("not json"), "not json");
    }
}
