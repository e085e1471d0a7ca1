//! sigil-ai: Streaming chat-completions provider layer
//!
//! This crate provides the wire-level adapter for OpenAI-compatible
//! streaming backends, including think-tag demultiplexing, tool-call
//! assembly, and a retry decorator for transient failures.

pub mod error;
pub mod provider;
pub mod providers;
pub mod retry;
pub mod stream;
pub mod types;

pub use error::{Error, Result};
pub use provider::Provider;
pub use providers::openai_compat::{ChatClient, ChatConfig};
pub use retry::{RetryConfig, RetryProvider};
pub use stream::{ChunkStream, StreamChunk, TextPiece, ThinkDemux};
pub use types::*;
