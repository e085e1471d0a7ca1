//! Provider contract for streaming chat backends

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    error::Result,
    stream::ChunkStream,
    types::{Message, ToolDef},
};

/// A streaming chat-completions backend.
///
/// `chat` opens one streaming request and returns the chunk stream; the
/// retry wrapper and the agent runtime both program against this trait.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolDef],
        cancel: CancellationToken,
    ) -> Result<ChunkStream>;
}
