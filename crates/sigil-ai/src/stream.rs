//! Streaming chunk types and think-tag demultiplexing

use crate::types::{ToolCall, Usage};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio_stream::Stream;

/// One unit of adapter output.
///
/// At most one of `delta`/`thinking` is populated per chunk; accumulated
/// tool calls are emitted with the terminal `done` chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamChunk {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub done: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl StreamChunk {
    /// A user-visible text fragment
    pub fn delta(text: impl Into<String>) -> Self {
        Self {
            delta: Some(text.into()),
            ..Default::default()
        }
    }

    /// A reasoning fragment from inside a think block
    pub fn thinking(text: impl Into<String>) -> Self {
        Self {
            thinking: Some(text.into()),
            ..Default::default()
        }
    }

    /// The terminal chunk carrying accumulated tool calls and usage
    pub fn finished(tool_calls: Vec<ToolCall>, usage: Option<Usage>) -> Self {
        Self {
            tool_calls,
            done: true,
            usage,
            ..Default::default()
        }
    }

    /// A terminal error chunk
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            done: true,
            error: Some(message.into()),
            ..Default::default()
        }
    }
}

/// A stream of adapter chunks
pub type ChunkStream = Pin<Box<dyn Stream<Item = StreamChunk> + Send>>;

/// A demultiplexed piece of assistant text
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextPiece {
    /// Text outside any think block
    Text(String),
    /// Text inside a `<think>...</think>` block
    Thinking(String),
}

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

/// State machine that splits a stream of content fragments into visible
/// text and `<think>` reasoning, tolerating tags split across fragments.
///
/// Characters that could begin a partial tag are buffered until the next
/// fragment resolves them.
#[derive(Debug, Default)]
pub struct ThinkDemux {
    buf: String,
    in_think: bool,
}

impl ThinkDemux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a content fragment, returning the pieces it completed.
    pub fn feed(&mut self, fragment: &str) -> Vec<TextPiece> {
        self.buf.push_str(fragment);
        let mut out = Vec::new();

        loop {
            let tag = if self.in_think { THINK_CLOSE } else { THINK_OPEN };
            match self.buf.find(tag) {
                Some(pos) => {
                    if pos > 0 {
                        let before: String = self.buf.drain(..pos).collect();
                        out.push(self.piece(before));
                    }
                    self.buf.drain(..tag.len());
                    self.in_think = !self.in_think;
                }
                None => {
                    // Hold back any suffix that could be the start of the tag
                    let keep = partial_tag_suffix(&self.buf, tag);
                    let flush = self.buf.len() - keep;
                    if flush > 0 {
                        let text: String = self.buf.drain(..flush).collect();
                        out.push(self.piece(text));
                    }
                    break;
                }
            }
        }

        out
    }

    /// Flush anything still buffered (end of stream).
    pub fn finish(&mut self) -> Option<TextPiece> {
        if self.buf.is_empty() {
            return None;
        }
        let text = std::mem::take(&mut self.buf);
        Some(self.piece(text))
    }

    fn piece(&self, text: String) -> TextPiece {
        if self.in_think {
            TextPiece::Thinking(text)
        } else {
            TextPiece::Text(text)
        }
    }
}

/// Length of the longest suffix of `buf` that is a proper prefix of `tag`.
fn partial_tag_suffix(buf: &str, tag: &str) -> usize {
    let max = buf.len().min(tag.len() - 1);
    for k in (1..=max).rev() {
        if buf.ends_with(&tag[..k]) {
            return k;
        }
    }
    0
}
