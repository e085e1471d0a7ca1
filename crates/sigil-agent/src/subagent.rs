//! Sub-agent manager: background child agents for delegated tasks
//!
//! A sub-agent is a child `AgentRuntime` driven on its own task. Children
//! run without confirmation prompts (an auto-approval task answers for
//! them), are capped in depth and concurrency, and leave a record the
//! parent can poll, cancel, and clean up.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sigil_ai::Provider;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::events::AgentEvent;
use crate::registry::ToolRegistry;
use crate::runtime::AgentRuntime;

/// Deepest allowed nesting of sub-agents under the root agent
pub const MAX_DEPTH: u32 = 3;

/// How many sub-agents may run at once under one manager
pub const DEFAULT_MAX_CONCURRENT: usize = 3;

/// Context files are truncated to this many bytes each
const CONTEXT_FILE_LIMIT: usize = 5 * 1024;

const DEFAULT_SUB_AGENT_PROMPT: &str = "You are a focused assistant working on a \
delegated task. Complete the task and report your findings as plain text.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubAgentStatus {
    Running,
    Done,
    Failed,
    Cancelled,
}

impl SubAgentStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SubAgentStatus::Running)
    }
}

/// Snapshot of one sub-agent's lifecycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentRecord {
    pub id: String,
    pub task: String,
    pub status: SubAgentStatus,
    /// Accumulated assistant text (or the failure reason)
    pub output: String,
    pub created_at: DateTime<Utc>,
    pub depth: u32,
}

/// Looks up system prompts for named agent personas.
///
/// The store itself lives with the host; `None` falls back to the default
/// sub-agent prompt.
pub trait PersonaStore: Send + Sync {
    fn system_prompt(&self, agent_name: &str) -> Option<String>;
}

/// Store with no personas; every agent gets the default prompt
#[derive(Debug, Default)]
pub struct NoPersonas;

impl PersonaStore for NoPersonas {
    fn system_prompt(&self, _agent_name: &str) -> Option<String> {
        None
    }
}

/// The spawning surface consumers depend on, so the quality gate and any
/// spawn-tool never hold the concrete manager.
#[async_trait]
pub trait AgentSpawner: Send + Sync {
    async fn spawn(
        &self,
        task: &str,
        context_files: &[String],
        agent_name: Option<&str>,
    ) -> crate::error::Result<String>;

    fn get(&self, id: &str) -> Option<SubAgentRecord>;

    /// Returns false when the id is unknown or already terminal
    fn cancel(&self, id: &str) -> bool;
}

struct Entry {
    record: SubAgentRecord,
    cancel: CancellationToken,
}

#[derive(Default)]
struct ManagerState {
    entries: HashMap<String, Entry>,
    next_id: u64,
}

pub struct SubAgentManager {
    provider: Arc<dyn Provider>,
    registry: Arc<ToolRegistry>,
    personas: Arc<dyn PersonaStore>,
    state: Arc<Mutex<ManagerState>>,
    max_concurrent: usize,
    max_depth: u32,
    /// Depth of the agent that owns this manager; children run one deeper
    depth: u32,
}

impl SubAgentManager {
    pub fn new(provider: Arc<dyn Provider>, registry: Arc<ToolRegistry>) -> Self {
        Self {
            provider,
            registry,
            personas: Arc::new(NoPersonas),
            state: Arc::new(Mutex::new(ManagerState::default())),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            max_depth: MAX_DEPTH,
            depth: 0,
        }
    }

    pub fn with_personas(mut self, personas: Arc<dyn PersonaStore>) -> Self {
        self.personas = personas;
        self
    }

    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    /// Every known record, newest first
    pub fn list(&self) -> Vec<SubAgentRecord> {
        let state = self.state.lock();
        let mut records: Vec<SubAgentRecord> =
            state.entries.values().map(|e| e.record.clone()).collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
    }

    /// Drop terminal records older than `max_age`
    pub fn cleanup(&self, max_age: Duration) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::zero());
        let mut state = self.state.lock();
        state
            .entries
            .retain(|_, e| !e.record.status.is_terminal() || e.record.created_at > cutoff);
    }

    fn running_count(state: &ManagerState) -> usize {
        state
            .entries
            .values()
            .filter(|e| e.record.status == SubAgentStatus::Running)
            .count()
    }

    /// Load a context file, truncated to [`CONTEXT_FILE_LIMIT`] bytes
    async fn read_context_file(path: &str) -> String {
        match tokio::fs::read_to_string(path).await {
            Ok(mut content) => {
                if content.len() > CONTEXT_FILE_LIMIT {
                    let mut end = CONTEXT_FILE_LIMIT;
                    while !content.is_char_boundary(end) {
                        end -= 1;
                    }
                    content.truncate(end);
                    content.push_str("\n[truncated]");
                }
                format!("=== {} ===\n{}", path, content)
            }
            Err(e) => format!("=== {} ===\n[unreadable: {}]", path, e),
        }
    }
}

#[async_trait]
impl AgentSpawner for SubAgentManager {
    async fn spawn(
        &self,
        task: &str,
        context_files: &[String],
        agent_name: Option<&str>,
    ) -> crate::error::Result<String> {
        let child_depth = self.depth + 1;
        if child_depth > self.max_depth {
            return Err(Error::SubAgent(format!(
                "sub-agent depth limit ({}) reached",
                self.max_depth
            )));
        }

        // Reserve the slot and the id under one lock
        let (id, cancel) = {
            let mut state = self.state.lock();
            if Self::running_count(&state) >= self.max_concurrent {
                return Err(Error::SubAgent(format!(
                    "too many sub-agents running (limit {})",
                    self.max_concurrent
                )));
            }
            state.next_id += 1;
            let id = format!("sub-{}", state.next_id);
            let cancel = CancellationToken::new();
            state.entries.insert(
                id.clone(),
                Entry {
                    record: SubAgentRecord {
                        id: id.clone(),
                        task: task.to_string(),
                        status: SubAgentStatus::Running,
                        output: String::new(),
                        created_at: Utc::now(),
                        depth: child_depth,
                    },
                    cancel: cancel.clone(),
                },
            );
            (id, cancel)
        };

        let system_prompt = agent_name
            .and_then(|name| self.personas.system_prompt(name))
            .unwrap_or_else(|| DEFAULT_SUB_AGENT_PROMPT.to_string());

        let runtime = Arc::new(
            AgentRuntime::new(self.provider.clone(), self.registry.clone(), system_prompt)
                .with_depth(child_depth),
        );

        // Preload context before the task message
        if !context_files.is_empty() {
            let mut context = String::from("Context files for this task:\n\n");
            for path in context_files {
                context.push_str(&Self::read_context_file(path).await);
                context.push('\n');
            }
            runtime.log().append_user(context);
        }

        // Children never prompt: answer every confirmation until the run ends
        let approve_done = CancellationToken::new();
        {
            let confirm = runtime.confirmations();
            let stop = approve_done.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        sent = confirm.send(true) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }

        let state = self.state.clone();
        let task_text = task.to_string();
        let record_id = id.clone();
        tokio::spawn(async move {
            let (tx, mut rx) = mpsc::channel(256);
            let run = {
                let runtime = runtime.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { runtime.send(&task_text, tx, cancel).await })
            };

            let mut failure: Option<String> = None;
            while let Some(event) = rx.recv().await {
                match event {
                    AgentEvent::Delta { text } => {
                        let mut state = state.lock();
                        if let Some(entry) = state.entries.get_mut(&record_id) {
                            entry.record.output.push_str(&text);
                        }
                    }
                    AgentEvent::Error { message, done: true } => {
                        failure = Some(message);
                    }
                    _ => {}
                }
            }

            let outcome = run.await;
            approve_done.cancel();

            let status = if cancel.is_cancelled() {
                SubAgentStatus::Cancelled
            } else {
                match outcome {
                    Ok(Ok(())) => SubAgentStatus::Done,
                    _ => SubAgentStatus::Failed,
                }
            };

            let mut state = state.lock();
            if let Some(entry) = state.entries.get_mut(&record_id) {
                // cancel() may have already finalised the record
                if entry.record.status == SubAgentStatus::Running {
                    entry.record.status = status;
                    if let Some(message) = failure {
                        if entry.record.output.is_empty() {
                            entry.record.output = message;
                        }
                    }
                }
            }
        });

        Ok(id)
    }

    fn get(&self, id: &str) -> Option<SubAgentRecord> {
        self.state.lock().entries.get(id).map(|e| e.record.clone())
    }

    fn cancel(&self, id: &str) -> bool {
        let mut state = self.state.lock();
        match state.entries.get_mut(id) {
            Some(entry) if entry.record.status == SubAgentStatus::Running => {
                entry.record.status = SubAgentStatus::Cancelled;
                entry.cancel.cancel();
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::harness::ScriptedProvider;
    use sigil_ai::{ChunkStream, Message, Role, StreamChunk, ToolCall, ToolDef};
    use crate::tool::{Tool, ToolResult};
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn wait_terminal(manager: &SubAgentManager, id: &str) -> SubAgentRecord {
        for _ in 0..500 {
            if let Some(record) = manager.get(id) {
                if record.status.is_terminal() {
                    return record;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("sub-agent {} never finished", id);
    }

    /// Provider that stalls until its cancellation token fires
    struct HangingProvider;

    #[async_trait]
    impl Provider for HangingProvider {
        async fn chat(
            &self,
            _messages: &[Message],
            _tools: &[ToolDef],
            cancel: CancellationToken,
        ) -> sigil_ai::Result<ChunkStream> {
            cancel.cancelled().await;
            Err(sigil_ai::Error::Aborted)
        }
    }

    #[tokio::test]
    async fn test_spawn_runs_to_done_with_output() {
        let provider = Arc::new(ScriptedProvider::new(vec![ScriptedProvider::text_turn(
            "task complete",
        )]));
        let manager = SubAgentManager::new(provider, Arc::new(ToolRegistry::new()));

        let id = manager.spawn("do the thing", &[], None).await.unwrap();
        let record = wait_terminal(&manager, &id).await;

        assert_eq!(record.status, SubAgentStatus::Done);
        assert_eq!(record.output, "task complete");
        assert_eq!(record.depth, 1);
        assert_eq!(record.task, "do the thing");
    }

    #[tokio::test]
    async fn test_monotonic_ids() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            ScriptedProvider::text_turn("a"),
            ScriptedProvider::text_turn("b"),
        ]));
        let manager = SubAgentManager::new(provider, Arc::new(ToolRegistry::new()));

        let first = manager.spawn("a", &[], None).await.unwrap();
        let second = manager.spawn("b", &[], None).await.unwrap();
        assert_eq!(first, "sub-1");
        assert_eq!(second, "sub-2");
    }

    #[tokio::test]
    async fn test_depth_limit() {
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let manager = SubAgentManager::new(provider, Arc::new(ToolRegistry::new()))
            .with_depth(MAX_DEPTH);

        let err = manager.spawn("too deep", &[], None).await.unwrap_err();
        assert!(err.to_string().contains("depth"));
    }

    #[tokio::test]
    async fn test_concurrency_limit_and_cancel() {
        let manager =
            SubAgentManager::new(Arc::new(HangingProvider), Arc::new(ToolRegistry::new()));

        let mut ids = Vec::new();
        for i in 0..DEFAULT_MAX_CONCURRENT {
            ids.push(manager.spawn(&format!("task {}", i), &[], None).await.unwrap());
        }

        let err = manager.spawn("one too many", &[], None).await.unwrap_err();
        assert!(err.to_string().contains("too many sub-agents"));

        // Cancelling one frees a slot
        assert!(manager.cancel(&ids[0]));
        let record = wait_terminal(&manager, &ids[0]).await;
        assert_eq!(record.status, SubAgentStatus::Cancelled);
        let replacement = manager.spawn("replacement", &[], None).await.unwrap();

        for id in ids.iter().skip(1) {
            manager.cancel(id);
        }
        manager.cancel(&replacement);
    }

    #[tokio::test]
    async fn test_cancel_unknown_or_finished() {
        let provider = Arc::new(ScriptedProvider::new(vec![ScriptedProvider::text_turn("x")]));
        let manager = SubAgentManager::new(provider, Arc::new(ToolRegistry::new()));

        assert!(!manager.cancel("sub-99"));

        let id = manager.spawn("quick", &[], None).await.unwrap();
        wait_terminal(&manager, &id).await;
        assert!(!manager.cancel(&id));
    }

    #[tokio::test]
    async fn test_context_files_preloaded_and_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let small = dir.path().join("small.txt");
        let large = dir.path().join("large.txt");
        std::fs::write(&small, "needle content").unwrap();
        std::fs::write(&large, "x".repeat(CONTEXT_FILE_LIMIT * 2)).unwrap();

        let provider = Arc::new(ScriptedProvider::new(vec![ScriptedProvider::text_turn(
            "ok",
        )]));
        let manager = SubAgentManager::new(provider.clone(), Arc::new(ToolRegistry::new()));

        let files = vec![
            small.to_string_lossy().into_owned(),
            large.to_string_lossy().into_owned(),
        ];
        let id = manager.spawn("summarise", &files, None).await.unwrap();
        wait_terminal(&manager, &id).await;

        let request = provider.last_request.lock().clone();
        let context = request
            .iter()
            .find(|m| m.role == Role::User && m.content.contains("Context files"))
            .expect("context message");
        assert!(context.content.contains("needle content"));
        assert!(context.content.contains("[truncated]"));
        // Truncated well below the raw file size
        assert!(context.content.len() < CONTEXT_FILE_LIMIT * 2);
    }

    #[tokio::test]
    async fn test_persona_prompt_used() {
        struct OnePersona;
        impl PersonaStore for OnePersona {
            fn system_prompt(&self, agent_name: &str) -> Option<String> {
                (agent_name == "Critic").then(|| "You are a strict reviewer.".to_string())
            }
        }

        let provider = Arc::new(ScriptedProvider::new(vec![ScriptedProvider::text_turn(
            "verdict",
        )]));
        let manager = SubAgentManager::new(provider.clone(), Arc::new(ToolRegistry::new()))
            .with_personas(Arc::new(OnePersona));

        let id = manager.spawn("review", &[], Some("Critic")).await.unwrap();
        wait_terminal(&manager, &id).await;

        let request = provider.last_request.lock().clone();
        assert_eq!(request[0].role, Role::System);
        assert_eq!(request[0].content, "You are a strict reviewer.");
    }

    #[tokio::test]
    async fn test_auto_approval_answers_confirmations() {
        struct GuardedTool {
            calls: Arc<AtomicU32>,
        }

        #[async_trait]
        impl Tool for GuardedTool {
            fn name(&self) -> &str {
                "file_write"
            }
            fn description(&self) -> &str {
                "Writes a file"
            }
            fn parameters(&self) -> serde_json::Value {
                serde_json::json!({ "type": "object" })
            }
            fn needs_confirmation(&self) -> bool {
                true
            }
            async fn execute(
                &self,
                _arguments: &str,
                _cancel: CancellationToken,
            ) -> crate::error::Result<ToolResult> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Ok(ToolResult::ok("written"))
            }
        }

        let calls = Arc::new(AtomicU32::new(0));
        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(GuardedTool {
            calls: calls.clone(),
        }));

        let provider = Arc::new(ScriptedProvider::new(vec![
            vec![StreamChunk::finished(
                vec![ToolCall::new("call-1", "file_write", "{}")],
                None,
            )],
            ScriptedProvider::text_turn("done"),
        ]));
        let manager = SubAgentManager::new(provider, registry);

        let id = manager.spawn("write it", &[], None).await.unwrap();
        let record = wait_terminal(&manager, &id).await;

        assert_eq!(record.status, SubAgentStatus::Done);
        assert_eq!(calls.load(Ordering::SeqCst), 1, "tool ran without a host");
    }

    #[tokio::test]
    async fn test_failed_run_reports_failure() {
        let provider = Arc::new(ScriptedProvider::new(vec![vec![StreamChunk::failed(
            "backend exploded",
        )]]));
        let manager = SubAgentManager::new(provider, Arc::new(ToolRegistry::new()));

        let id = manager.spawn("doomed", &[], None).await.unwrap();
        let record = wait_terminal(&manager, &id).await;

        assert_eq!(record.status, SubAgentStatus::Failed);
        assert!(record.output.contains("backend exploded"));
    }

    #[tokio::test]
    async fn test_cleanup_drops_old_terminal_records() {
        let provider = Arc::new(ScriptedProvider::new(vec![ScriptedProvider::text_turn("x")]));
        let manager = SubAgentManager::new(provider, Arc::new(ToolRegistry::new()));

        let id = manager.spawn("short", &[], None).await.unwrap();
        wait_terminal(&manager, &id).await;

        // Young records survive
        manager.cleanup(Duration::from_secs(3600));
        assert!(manager.get(&id).is_some());

        // Zero max-age sweeps every terminal record
        manager.cleanup(Duration::ZERO);
        assert!(manager.get(&id).is_none());
    }
}
