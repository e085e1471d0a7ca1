//! Conversation log: ordered role-tagged messages with compaction
//!
//! The log is the single source of truth for a conversation. Appends from
//! parallel tool batches are serialised by one internal lock; compaction
//! replaces the oldest prefix with a synthetic summary while never severing
//! a tool-call chain.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use sigil_ai::{Message, Role, ToolCall};

/// Sentinel prefix for synthetic compaction summaries
pub const SUMMARY_SENTINEL: &str = "[Conversation summary]";

/// Number of trailing messages always kept verbatim by compaction
const KEEP_RECENT: usize = 6;

/// Ordered sequence of role-tagged messages, cheap to clone and safe for
/// concurrent appenders.
#[derive(Clone, Default)]
pub struct ConversationLog {
    messages: Arc<Mutex<Vec<Message>>>,
}

impl ConversationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a log with a system prompt
    pub fn with_system(prompt: impl Into<String>) -> Self {
        let log = Self::new();
        log.append_system(prompt);
        log
    }

    pub fn append_system(&self, content: impl Into<String>) {
        self.messages.lock().push(Message::system(content));
    }

    pub fn append_user(&self, content: impl Into<String>) {
        self.messages.lock().push(Message::user(content));
    }

    pub fn append_assistant(&self, content: impl Into<String>, tool_calls: Vec<ToolCall>) {
        self.messages
            .lock()
            .push(Message::assistant(content, tool_calls));
    }

    pub fn append_tool_result(&self, tool_call_id: impl Into<String>, content: impl Into<String>) {
        self.messages
            .lock()
            .push(Message::tool(tool_call_id, content));
    }

    /// Copy of the current message sequence
    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }

    /// Estimate total tokens with the chars/4 heuristic
    pub fn estimate_tokens(&self) -> u32 {
        let messages = self.messages.lock();
        messages.iter().map(estimate_message_tokens).sum()
    }

    /// Compact the log if it exceeds `max_tokens`.
    ///
    /// Replaces the oldest prefix (after the initial system message) with a
    /// synthetic user summary plus an assistant acknowledgement. Keeps the
    /// last [`KEEP_RECENT`] messages verbatim and only cuts on a boundary
    /// where no tool call is left unresolved. Returns `true` if the log was
    /// compacted.
    pub fn compact(&self, max_tokens: u32) -> bool {
        let mut messages = self.messages.lock();

        let estimate: u32 = messages.iter().map(estimate_message_tokens).sum();
        if estimate < max_tokens {
            return false;
        }

        // Need the system message, something to summarize, and the kept tail
        if messages.len() <= KEEP_RECENT + 2 {
            return false;
        }

        let Some(cut) = find_cut_index(&messages) else {
            return false;
        };

        let summary = synthesize_summary(&messages[1..cut]);
        let kept: Vec<Message> = messages[cut..].to_vec();
        let system = messages[0].clone();

        let mut compacted = vec![
            system,
            Message::user(format!("{}\n{}", SUMMARY_SENTINEL, summary)),
            Message::assistant(
                "Acknowledged. Continuing from the summary above.",
                vec![],
            ),
        ];
        compacted.extend(kept);
        *messages = compacted;
        true
    }

    /// Serialize to JSON at `path`
    pub fn save(&self, path: impl AsRef<Path>) -> crate::error::Result<()> {
        let snapshot = self.snapshot();
        let json = serde_json::to_string_pretty(&snapshot)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load a previously saved conversation, replacing the current one
    pub fn load(&self, path: impl AsRef<Path>) -> crate::error::Result<()> {
        let json = std::fs::read_to_string(path)?;
        let loaded: Vec<Message> = serde_json::from_str(&json)?;
        *self.messages.lock() = loaded;
        Ok(())
    }

    /// Render the conversation as Markdown
    pub fn to_markdown(&self) -> String {
        let messages = self.snapshot();
        let mut out = String::new();

        for msg in &messages {
            match msg.role {
                Role::System => out.push_str("## System\n\n"),
                Role::User => out.push_str("## User\n\n"),
                Role::Assistant => out.push_str("## Assistant\n\n"),
                Role::Tool => {
                    let id = msg.tool_call_id.as_deref().unwrap_or("?");
                    out.push_str(&format!("## Tool result ({})\n\n", id));
                }
            }
            if !msg.content.is_empty() {
                out.push_str(&msg.content);
                out.push_str("\n\n");
            }
            for tc in &msg.tool_calls {
                out.push_str(&format!("```json\n[{}] {}({})\n```\n\n", tc.id, tc.name, tc.arguments));
            }
        }

        out
    }

    /// Export the conversation as Markdown to `path`
    pub fn export(&self, path: impl AsRef<Path>) -> crate::error::Result<()> {
        std::fs::write(path, self.to_markdown())?;
        Ok(())
    }
}

/// Estimate token count for a single message (chars/4 heuristic)
fn estimate_message_tokens(message: &Message) -> u32 {
    let mut chars = message.content.len();
    for tc in &message.tool_calls {
        chars += tc.name.len() + tc.arguments.len();
    }
    (chars / 4) as u32
}

/// Find the latest valid compaction boundary.
///
/// Candidates run from `len - KEEP_RECENT` down to 2; a boundary is valid
/// when it does not start on a tool message and every tool call issued
/// before it is answered before it.
fn find_cut_index(messages: &[Message]) -> Option<usize> {
    let max_cut = messages.len() - KEEP_RECENT;

    for cut in (2..=max_cut).rev() {
        if messages[cut].role == Role::Tool {
            continue;
        }
        if outstanding_tool_calls(&messages[..cut]).is_empty() {
            return Some(cut);
        }
    }
    None
}

/// Ids of tool calls that have no matching tool result in `messages`
fn outstanding_tool_calls(messages: &[Message]) -> HashSet<&str> {
    let mut outstanding: HashSet<&str> = HashSet::new();
    for msg in messages {
        match msg.role {
            Role::Assistant => {
                for tc in &msg.tool_calls {
                    outstanding.insert(tc.id.as_str());
                }
            }
            Role::Tool => {
                if let Some(ref id) = msg.tool_call_id {
                    outstanding.remove(id.as_str());
                }
            }
            _ => {}
        }
    }
    outstanding
}

/// Build a compaction summary from the replaced prefix.
///
/// A plain role-labelled digest: no LLM call, provider-agnostic.
fn synthesize_summary(messages: &[Message]) -> String {
    const MAX_SNIPPET: usize = 200;

    let mut out = String::new();
    for msg in messages {
        let label = match msg.role {
            Role::System => "[System]",
            Role::User => "[User]",
            Role::Assistant => "[Assistant]",
            Role::Tool => "[Tool result]",
        };

        if !msg.content.is_empty() {
            out.push_str(label);
            out.push_str(": ");
            out.push_str(&truncate(&msg.content, MAX_SNIPPET));
            out.push('\n');
        }
        if !msg.tool_calls.is_empty() {
            let calls: Vec<String> = msg
                .tool_calls
                .iter()
                .map(|tc| format!("{}({})", tc.name, truncate(&tc.arguments, 80)))
                .collect();
            out.push_str("[Assistant tool calls]: ");
            out.push_str(&calls.join("; "));
            out.push('\n');
        }
    }
    out
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
