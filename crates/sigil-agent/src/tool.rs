//! Tool trait and execution results

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sigil_ai::ToolDef;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::events::AgentEvent;

/// Result of a tool execution.
///
/// `error` is a soft, model-visible failure; a hard failure is signalled by
/// the executor returning `Err`. Both fields may be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolResult {
    pub output: String,
    pub error: String,
}

impl ToolResult {
    /// Create a successful result
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            error: String::new(),
        }
    }

    /// Create a soft error result
    pub fn soft_error(message: impl Into<String>) -> Self {
        Self {
            output: String::new(),
            error: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }

    /// Text surfaced to the model as the tool result
    pub fn model_text(&self) -> String {
        match (self.output.is_empty(), self.error.is_empty()) {
            (false, true) => self.output.clone(),
            (true, false) => self.error.clone(),
            (false, false) => format!("{}\n{}", self.output, self.error),
            (true, true) => String::new(),
        }
    }
}

/// Sender for streaming tool output during execution.
///
/// Chunks become [`AgentEvent::ToolOutput`] events on the host's sink;
/// sending never blocks the tool.
#[derive(Clone)]
pub struct OutputSink {
    tx: mpsc::Sender<AgentEvent>,
    tool_call_id: String,
    tool_name: String,
}

impl OutputSink {
    pub fn new(
        tx: mpsc::Sender<AgentEvent>,
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
    ) -> Self {
        Self {
            tx,
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
        }
    }

    /// Send an output chunk; dropped if the host is not draining.
    pub fn send(&self, chunk: impl Into<String>) {
        let _ = self.tx.try_send(AgentEvent::ToolOutput {
            tool_call_id: self.tool_call_id.clone(),
            tool_name: self.tool_name.clone(),
            chunk: chunk.into(),
        });
    }
}

/// Trait for executable tools.
///
/// Implementations live outside this crate; the runtime consumes this
/// interface only. Capabilities (streaming, interactivity) are opt-in
/// through the default methods.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (used in API calls)
    fn name(&self) -> &str;

    /// Tool description for the LLM
    fn description(&self) -> &str;

    /// JSON Schema for parameters (object with "properties", "required")
    fn parameters(&self) -> serde_json::Value;

    /// Whether this tool requires human confirmation before running
    fn needs_confirmation(&self) -> bool {
        false
    }

    /// Whether this tool implements [`Tool::execute_stream`]
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Execute the tool with raw JSON arguments
    async fn execute(
        &self,
        arguments: &str,
        cancel: CancellationToken,
    ) -> crate::error::Result<ToolResult>;

    /// Execute with streaming output.
    ///
    /// Default delegates to `execute()`, ignoring the sink.
    async fn execute_stream(
        &self,
        arguments: &str,
        cancel: CancellationToken,
        _output: OutputSink,
    ) -> crate::error::Result<ToolResult> {
        self.execute(arguments, cancel).await
    }

    /// Install the channel an interactive tool reads user input from
    fn set_input_channel(&self, _input: mpsc::Receiver<String>) {}

    /// Install the callback fired when the tool wants user input
    fn set_input_request(&self, _notify: Arc<dyn Fn() + Send + Sync>) {}
}

/// Type alias for a shared tool
pub type BoxedTool = Arc<dyn Tool>;

/// Convert a Tool to the wire-level definition
pub fn to_tool_def(tool: &dyn Tool) -> ToolDef {
    ToolDef::new(tool.name(), tool.description(), tool.parameters())
}
