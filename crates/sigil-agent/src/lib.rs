//! sigil-agent: Agent runtime with tool execution
//!
//! This crate provides the conversation log, tool registry, and the turn
//! loop that drives multi-turn conversations with LLMs, plus sub-agent
//! delegation and a quality-gate critic.

pub mod critic;
pub mod error;
pub mod events;
pub mod log;
pub mod nudge;
pub mod registry;
pub mod runtime;
pub mod subagent;
pub mod tool;

pub use critic::Critic;
pub use error::{Error, Result};
pub use events::{AgentEvent, JudgePhase};
pub use log::{ConversationLog, SUMMARY_SENTINEL};
pub use nudge::{CommonFailures, FailureCatalogue};
pub use registry::ToolRegistry;
pub use runtime::{AgentRuntime, Judge, RuntimeConfig, Verdict};
pub use subagent::{
    AgentSpawner, PersonaStore, SubAgentManager, SubAgentRecord, SubAgentStatus,
};
pub use tool::{BoxedTool, OutputSink, Tool, ToolResult};
