//! Agent event types

use serde::{Deserialize, Serialize};

/// Quality-Gate verdict phase reported through [`AgentEvent::JudgeCall`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JudgePhase {
    /// The critic is reviewing the output
    Evaluating,
    /// The output was accepted
    Passed,
}

/// Events emitted during a `send` call, delivered through the host's sink
/// channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// User-visible assistant text fragment
    Delta { text: String },

    /// Reasoning text from inside a think block
    Thinking { text: String },

    /// A tool is about to execute
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        /// Pretty-printed JSON arguments
        arguments: String,
    },

    /// Streaming output from a running tool
    ToolOutput {
        tool_call_id: String,
        tool_name: String,
        chunk: String,
    },

    /// A tool finished
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        output: String,
        #[serde(default)]
        is_error: bool,
    },

    /// The host must confirm or deny a tool execution
    ConfirmRequest {
        tool_call_id: String,
        tool_name: String,
        arguments: String,
    },

    /// An interactive tool is waiting for user input
    InputRequest { tool_name: String },

    /// Quality-Gate activity
    JudgeCall {
        phase: JudgePhase,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        feedback: Option<String>,
    },

    /// Error occurred; terminal when `done` is set
    Error {
        message: String,
        #[serde(default)]
        done: bool,
    },

    /// The send completed normally
    Done,
}

impl AgentEvent {
    /// Check if this event terminates the send
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentEvent::Done | AgentEvent::Error { done: true, .. }
        )
    }
}
