//! OpenAI-compatible chat completion client. Streams deltas over SSE and
//! reassembles incremental tool calls before handing them to the bridge.

use crate::config::ProviderConfig;
use crate::domain::{ChatMessage, MessageRole, ToolCall};
use async_trait::async_trait;
use futures::StreamExt;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::pin::Pin;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("no provider API key configured")]
    MissingApiKey,
    #[error("model request failed: {source}")]
    Request {
        #[source]
        source: reqwest::Error,
    },
    #[error("model API returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("model stream error: {message}")]
    Stream { message: String },
}

impl ModelError {
    pub fn user_message(&self) -> String {
        match self {
            ModelError::MissingApiKey => {
                "The language model provider is not configured on this server.".to_string()
            }
            ModelError::Request { .. } => {
                "Could not reach the language model provider. Please try again.".to_string()
            }
            ModelError::Api { status, .. } => format!(
                "The language model provider rejected the request (status {status})."
            ),
            ModelError::Stream { .. } => {
                "The model response stream was interrupted. Please try again.".to_string()
            }
        }
    }
}

/// Tool surface advertised to the model for one request.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: Option<String>,
    pub parameters: Value,
}

#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModelChunk {
    TextDelta(String),
    ReasoningDelta(String),
    ToolCall(ToolCall),
    Finished { message_id: String },
}

pub type ModelStream = Pin<Box<dyn Stream<Item = Result<ModelChunk, ModelError>> + Send>>;

#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn stream_chat(&self, request: ModelRequest) -> Result<ModelStream, ModelError>;
}

pub struct OpenAiProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiProvider {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.resolved_api_key(),
        }
    }
}

#[async_trait]
impl ModelProvider for OpenAiProvider {
    async fn stream_chat(&self, request: ModelRequest) -> Result<ModelStream, ModelError> {
        let api_key = self.api_key.clone().ok_or(ModelError::MissingApiKey)?;
        let url = format!("{}/chat/completions", self.base_url);
        let body = request_body(&request);

        debug!(model = %request.model, tools = request.tools.len(), "opening model stream");
        let response = self
            .http
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|source| ModelError::Request { source })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ModelError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(pump_stream(response, tx));
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

fn request_body(request: &ModelRequest) -> Value {
    let messages: Vec<Value> = request.messages.iter().map(wire_message).collect();
    let mut body = json!({
        "model": request.model,
        "messages": messages,
        "stream": true,
    });
    if !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    }
                })
            })
            .collect();
        body["tools"] = Value::Array(tools);
    }
    body
}

fn wire_message(message: &ChatMessage) -> Value {
    let role = match message.role {
        MessageRole::System => "system",
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
        MessageRole::Tool => "tool",
    };
    let mut wire = json!({"role": role, "content": message.content});
    if let Some(call_id) = &message.tool_call_id {
        wire["tool_call_id"] = json!(call_id);
    }
    if let Some(calls) = &message.tool_calls {
        let calls: Vec<Value> = calls
            .iter()
            .map(|call| {
                json!({
                    "id": call.id,
                    "type": "function",
                    "function": {"name": call.name, "arguments": call.arguments}
                })
            })
            .collect();
        wire["tool_calls"] = Value::Array(calls);
    }
    wire
}

async fn pump_stream(response: reqwest::Response, tx: mpsc::Sender<Result<ModelChunk, ModelError>>) {
    let mut assembler = StreamAssembler::default();
    let mut buffer = LineBuffer::default();
    let mut bytes = response.bytes_stream();

    while let Some(piece) = bytes.next().await {
        let piece = match piece {
            Ok(piece) => piece,
            Err(err) => {
                let _ = tx
                    .send(Err(ModelError::Stream {
                        message: err.to_string(),
                    }))
                    .await;
                return;
            }
        };

        for line in buffer.push(&piece) {
            for chunk in assembler.push_line(&line) {
                if tx.send(chunk).await.is_err() {
                    return;
                }
            }
            if assembler.done {
                return;
            }
        }
    }

    // Stream ended without the terminator; flush whatever assembled.
    for chunk in assembler.finish() {
        if tx.send(chunk).await.is_err() {
            return;
        }
    }
}

/// Splits raw network bytes into complete lines. Incomplete trailing bytes
/// stay buffered, so a multibyte character split across two chunks is only
/// decoded once the whole line has arrived.
#[derive(Default)]
struct LineBuffer {
    bytes: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.bytes.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.bytes.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.bytes.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            lines.push(line.trim_end_matches(['\n', '\r']).to_string());
        }
        lines
    }
}

#[derive(Debug, Default, Clone)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Incremental SSE decoder for the chat completion stream. Text deltas pass
/// straight through; tool call fragments accumulate by index until the
/// stream signals completion.
#[derive(Default)]
struct StreamAssembler {
    tool_calls: BTreeMap<u64, PendingToolCall>,
    message_id: Option<String>,
    done: bool,
}

impl StreamAssembler {
    fn push_line(&mut self, line: &str) -> Vec<Result<ModelChunk, ModelError>> {
        let Some(data) = line.strip_prefix("data:") else {
            return Vec::new();
        };
        let data = data.trim();
        if data.is_empty() {
            return Vec::new();
        }
        if data == "[DONE]" {
            return self.finish();
        }

        let value: Value = match serde_json::from_str(data) {
            Ok(value) => value,
            Err(err) => {
                warn!(%err, "skipping malformed stream chunk");
                return Vec::new();
            }
        };
        self.push_chunk(&value)
    }

    fn push_chunk(&mut self, value: &Value) -> Vec<Result<ModelChunk, ModelError>> {
        if self.message_id.is_none() {
            self.message_id = value
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string);
        }

        let Some(choice) = value
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
        else {
            return Vec::new();
        };

        let mut out = Vec::new();
        if let Some(delta) = choice.get("delta") {
            if let Some(text) = delta.get("content").and_then(Value::as_str) {
                if !text.is_empty() {
                    out.push(Ok(ModelChunk::TextDelta(text.to_string())));
                }
            }
            // Providers disagree on the field name for reasoning output.
            let reasoning = delta
                .get("reasoning_content")
                .or_else(|| delta.get("reasoning"))
                .and_then(Value::as_str);
            if let Some(text) = reasoning {
                if !text.is_empty() {
                    out.push(Ok(ModelChunk::ReasoningDelta(text.to_string())));
                }
            }
            if let Some(fragments) = delta.get("tool_calls").and_then(Value::as_array) {
                for fragment in fragments {
                    self.merge_tool_fragment(fragment);
                }
            }
        }

        if choice.get("finish_reason").and_then(Value::as_str).is_some() {
            out.extend(self.finish());
        }
        out
    }

    fn merge_tool_fragment(&mut self, fragment: &Value) {
        let index = fragment.get("index").and_then(Value::as_u64).unwrap_or(0);
        let entry = self.tool_calls.entry(index).or_default();
        if let Some(id) = fragment.get("id").and_then(Value::as_str) {
            entry.id = id.to_string();
        }
        if let Some(function) = fragment.get("function") {
            if let Some(name) = function.get("name").and_then(Value::as_str) {
                entry.name.push_str(name);
            }
            if let Some(arguments) = function.get("arguments").and_then(Value::as_str) {
                entry.arguments.push_str(arguments);
            }
        }
    }

    fn finish(&mut self) -> Vec<Result<ModelChunk, ModelError>> {
        if self.done {
            return Vec::new();
        }
        self.done = true;

        let mut out = Vec::new();
        for (_, pending) in std::mem::take(&mut self.tool_calls) {
            if pending.name.is_empty() {
                continue;
            }
            let id = if pending.id.is_empty() {
                format!("call-{}", Uuid::new_v4())
            } else {
                pending.id
            };
            out.push(Ok(ModelChunk::ToolCall(ToolCall {
                id,
                name: pending.name,
                arguments: pending.arguments,
            })));
        }

        let message_id = self
            .message_id
            .take()
            .unwrap_or_else(|| format!("msg-{}", Uuid::new_v4()));
        out.push(Ok(ModelChunk::Finished { message_id }));
        out
    }
}
