//! Chat-completions streaming client (OpenAI-compatible backends)

use std::sync::LazyLock;

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use regex::Regex;
use reqwest_eventsource::{Event, EventSource};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Result, rewrite_network_error},
    provider::Provider,
    stream::{ChunkStream, StreamChunk, TextPiece, ThinkDemux},
    types::{Message, ToolCall, ToolDef, Usage},
};

/// Body patterns signalling that the backend rejects tool definitions.
static TOOLS_UNSUPPORTED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)does not support (tools|functions)|tool use is not supported").unwrap()
});

/// Configuration for a chat-completions backend
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Model identifier sent in the request body
    pub model: String,
    /// Base URL up to and excluding `/chat/completions`
    pub base_url: String,
    /// Bearer token; local backends usually run without one
    pub api_key: Option<String>,
    /// Local-model backend (Ollama-style): sends `options.num_ctx`
    pub local: bool,
    /// Context size hint for local backends
    pub num_ctx: u32,
}

impl ChatConfig {
    /// Config for a hosted backend
    pub fn hosted(
        model: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            model: model.into(),
            base_url: base_url.into(),
            api_key: Some(api_key.into()),
            local: false,
            num_ctx: 32768,
        }
    }

    /// Config for a local backend (no key, `num_ctx` option sent)
    pub fn local(model: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            base_url: base_url.into(),
            api_key: None,
            local: true,
            num_ctx: 32768,
        }
    }
}

/// Streaming client for chat-completions backends
pub struct ChatClient {
    client: reqwest::Client,
    config: ChatConfig,
}

impl ChatClient {
    pub fn new(config: ChatConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn build_request(&self, messages: &[Message], tools: &[ToolDef]) -> WireRequest {
        let wire_messages = messages.iter().map(convert_message).collect();

        let wire_tools = if tools.is_empty() {
            None
        } else {
            Some(
                tools
                    .iter()
                    .map(|t| WireTool {
                        tool_type: "function".to_string(),
                        function: WireFunction {
                            name: t.name.clone(),
                            description: Some(t.description.clone()),
                            parameters: Some(t.parameters.clone()),
                        },
                    })
                    .collect(),
            )
        };

        let options = if self.config.local {
            Some(serde_json::json!({ "num_ctx": self.config.num_ctx }))
        } else {
            None
        };

        WireRequest {
            model: self.config.model.clone(),
            messages: wire_messages,
            stream: true,
            stream_options: WireStreamOptions {
                include_usage: true,
            },
            tools: wire_tools,
            options,
        }
    }

    /// Open the SSE stream, mapping HTTP failures to readable errors.
    async fn open(&self, request: &WireRequest) -> Result<EventSource> {
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );

        let mut builder = self
            .client
            .post(&url)
            .header("content-type", "application/json");
        if let Some(ref key) = self.config.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }
        let builder = builder.json(request);

        let mut event_source = EventSource::new(builder)
            .map_err(|e| Error::Sse(format!("Failed to create event source: {}", e)))?;

        match event_source.next().await {
            Some(Ok(Event::Open)) => Ok(event_source),
            Some(Err(reqwest_eventsource::Error::InvalidStatusCode(status, response))) => {
                let body = response.text().await.unwrap_or_default();
                Err(Error::api(status.as_u16(), extract_error_message(&body)))
            }
            Some(Err(reqwest_eventsource::Error::Transport(e))) => Err(rewrite_network_error(&e)),
            Some(Err(e)) => Err(Error::Sse(e.to_string())),
            Some(Ok(Event::Message(_))) | None => {
                Err(Error::Sse("stream closed before opening".to_string()))
            }
        }
    }
}

#[async_trait]
impl Provider for ChatClient {
    async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolDef],
        cancel: CancellationToken,
    ) -> Result<ChunkStream> {
        let request = self.build_request(messages, tools);

        let event_source = match self.open(&request).await {
            Ok(es) => es,
            // Graceful degradation: some backends reject tool definitions
            // outright. Re-issue the single request without tools.
            Err(Error::Api { message, .. })
                if !tools.is_empty() && TOOLS_UNSUPPORTED.is_match(&message) =>
            {
                tracing::warn!("backend rejected tool definitions, retrying without tools");
                let request = self.build_request(messages, &[]);
                self.open(&request).await?
            }
            Err(e) => return Err(e),
        };

        Ok(Box::pin(create_stream(event_source, cancel)))
    }
}

/// Extract `error.message` from an API error body, falling back to the raw body.
fn extract_error_message(body: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: ErrorDetail,
    }
    #[derive(Deserialize)]
    struct ErrorDetail {
        message: String,
    }

    match serde_json::from_str::<ErrorBody>(body) {
        Ok(parsed) => parsed.error.message,
        Err(_) => body.to_string(),
    }
}

fn convert_message(msg: &Message) -> WireMessage {
    let tool_calls = if msg.tool_calls.is_empty() {
        None
    } else {
        Some(
            msg.tool_calls
                .iter()
                .map(|tc| WireToolCall {
                    id: tc.id.clone(),
                    call_type: "function".to_string(),
                    function: WireFunctionCall {
                        name: tc.name.clone(),
                        arguments: tc.arguments.clone(),
                    },
                })
                .collect(),
        )
    };

    WireMessage {
        role: msg.role.as_str(),
        // Always serialize content, even when empty: some backends reject
        // assistant messages with a missing content field.
        content: msg.content.clone(),
        tool_calls,
        tool_call_id: msg.tool_call_id.clone(),
    }
}

fn create_stream(
    mut event_source: impl futures::Stream<Item = std::result::Result<Event, reqwest_eventsource::Error>>
        + Unpin,
    cancel: CancellationToken,
) -> impl futures::Stream<Item = StreamChunk> {
    stream! {
        let mut demux = ThinkDemux::new();
        // (id, name, arguments) accumulated by wire index
        let mut tool_calls: Vec<(String, String, String)> = Vec::new();
        let mut usage: Option<Usage> = None;
        let mut visible_text = String::new();
        let mut finish_seen = false;

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    yield StreamChunk::failed("Cancelled");
                    return;
                }
                ev = event_source.next() => ev,
            };

            let Some(event) = event else { break };

            match event {
                Ok(Event::Open) => {}
                Ok(Event::Message(msg)) => {
                    if msg.data == "[DONE]" {
                        break;
                    }

                    let chunk: WireChunk = match serde_json::from_str(&msg.data) {
                        Ok(c) => c,
                        Err(e) => {
                            yield StreamChunk::failed(format!("Failed to parse chunk: {}", e));
                            return;
                        }
                    };

                    if let Some(choice) = chunk.choices.first() {
                        // Terminal marker; an unclean close after this
                        // point is still a complete response.
                        if choice.finish_reason.is_some() {
                            finish_seen = true;
                        }

                        if let Some(ref content) = choice.delta.content {
                            for piece in demux.feed(content) {
                                match piece {
                                    TextPiece::Text(t) => {
                                        visible_text.push_str(&t);
                                        yield StreamChunk::delta(t);
                                    }
                                    TextPiece::Thinking(t) => yield StreamChunk::thinking(t),
                                }
                            }
                        }

                        if let Some(ref fragments) = choice.delta.tool_calls {
                            for fragment in fragments {
                                // A broken backend can send a negative
                                // index; as usize it would wrap huge.
                                let Ok(idx) = usize::try_from(fragment.index) else {
                                    tracing::warn!(
                                        "ignoring tool call fragment with index {}",
                                        fragment.index
                                    );
                                    continue;
                                };
                                while tool_calls.len() <= idx {
                                    tool_calls.push((String::new(), String::new(), String::new()));
                                }
                                // Id and name are fixed on first appearance
                                if let Some(ref id) = fragment.id {
                                    if tool_calls[idx].0.is_empty() {
                                        tool_calls[idx].0 = id.clone();
                                    }
                                }
                                if let Some(ref function) = fragment.function {
                                    if let Some(ref name) = function.name {
                                        if tool_calls[idx].1.is_empty() {
                                            tool_calls[idx].1 = name.clone();
                                        }
                                    }
                                    if let Some(ref args) = function.arguments {
                                        tool_calls[idx].2.push_str(args);
                                    }
                                }
                            }
                        }
                    }

                    if let Some(ref wire_usage) = chunk.usage {
                        usage = Some(Usage {
                            input: wire_usage.prompt_tokens,
                            output: wire_usage.completion_tokens,
                            estimated: false,
                        });
                    }
                }
                Err(reqwest_eventsource::Error::StreamEnded) => break,
                Err(e) if finish_seen => {
                    tracing::debug!("stream closed uncleanly after finish_reason: {}", e);
                    break;
                }
                Err(e) => {
                    yield StreamChunk::failed(format!("SSE error: {}", e));
                    return;
                }
            }
        }

        // Flush any text still buffered in the tag state machine
        if let Some(piece) = demux.finish() {
            match piece {
                TextPiece::Text(t) => {
                    visible_text.push_str(&t);
                    yield StreamChunk::delta(t);
                }
                TextPiece::Thinking(t) => yield StreamChunk::thinking(t),
            }
        }

        let calls: Vec<ToolCall> = tool_calls
            .into_iter()
            .filter(|(_, name, _)| !name.is_empty())
            .map(|(id, name, args)| ToolCall::new(id, name, args))
            .collect();

        let usage = usage.unwrap_or_else(|| Usage::estimate_output(&visible_text));
        yield StreamChunk::finished(calls, Some(usage));
    }
}

// Request types

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    stream: bool,
    stream_options: WireStreamOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct WireStreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    tool_type: String,
    function: WireFunction,
}

#[derive(Debug, Serialize)]
struct WireFunction {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: String,
    function: WireFunctionCall,
}

#[derive(Debug, Serialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

// Streaming response types

#[derive(Debug, Deserialize)]
struct WireChunk {
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    delta: WireDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireDelta {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCallDelta {
    index: i32,
    id: Option<String>,
    function: Option<WireFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct WireFunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}
