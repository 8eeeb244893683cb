//! OpenAI-compatible Chat Completions provider.
//!
//! Streams `/chat/completions` and forwards each SSE chunk as one [`Message`]
//! chunk. Tool-call fragments are passed through as index-tagged deltas;
//! merging them is the consumer's job. Also serves Volcengine Ark, which
//! speaks the same dialect under a different path.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::StreamExt;
use tracing::{debug, trace};

use deerflow_core::config::{ModelKind, ResolvedModel};
use deerflow_core::types::{Message, Role, ToolCall, ToolDefinition};

use crate::sse::{SseEvent, parse_sse_stream};
use crate::{CompletionRequest, Credentials, LlmProvider, MessageChunkStream};

const OPENAI_BASE_URL: &str = "https://api.openai.com";
const ARK_BASE_URL: &str = "https://ark.cn-beijing.volces.com";

/// API style. Ark differs only in endpoint layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiStyle {
    OpenAi,
    Ark,
}

pub struct OpenAiProvider {
    pub base_url: String,
    pub api_style: ApiStyle,
    provider_id: String,
    client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn openai(base_url: Option<&str>, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url
                .unwrap_or(OPENAI_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_style: ApiStyle::OpenAi,
            provider_id: "openai".into(),
            client,
        }
    }

    pub fn ark(base_url: Option<&str>, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url
                .unwrap_or(ARK_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_style: ApiStyle::Ark,
            provider_id: "ark".into(),
            client,
        }
    }

    pub fn from_resolved(resolved: &ResolvedModel, client: reqwest::Client) -> Self {
        let base_url = resolved.base_url.as_deref().filter(|u| !u.is_empty());
        match resolved.kind {
            ModelKind::OpenAi => Self::openai(base_url, client),
            ModelKind::Ark => Self::ark(base_url, client),
        }
    }

    /// Full URL of the chat-completions endpoint.
    pub fn endpoint(&self) -> String {
        match self.api_style {
            ApiStyle::Ark if self.base_url.ends_with("/api/v3") => {
                format!("{}/chat/completions", self.base_url)
            }
            ApiStyle::Ark => format!("{}/api/v3/chat/completions", self.base_url),
            ApiStyle::OpenAi if self.base_url.ends_with("/v1") => {
                format!("{}/chat/completions", self.base_url)
            }
            ApiStyle::OpenAi => format!("{}/v1/chat/completions", self.base_url),
        }
    }
}

// --- wire types ---

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<serde_json::Value>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Default, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// Tool definitions in the `{"type":"function","function":{...}}` wrapper.
pub fn format_tools(tools: &[ToolDefinition]) -> Vec<serde_json::Value> {
    tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters_schema,
                }
            })
        })
        .collect()
}

/// Conversation history in Chat Completions message shape.
pub fn format_messages(history: &[Message]) -> Vec<serde_json::Value> {
    history
        .iter()
        .map(|m| {
            let mut msg = json!({ "role": m.role.as_str(), "content": m.content });
            if !m.tool_calls.is_empty() {
                let calls: Vec<_> = m
                    .tool_calls
                    .iter()
                    .map(|tc| {
                        json!({
                            "id": tc.id,
                            "type": "function",
                            "function": {
                                "name": tc.name(),
                                "arguments": tc.arguments(),
                            }
                        })
                    })
                    .collect();
                msg["tool_calls"] = json!(calls);
            }
            if m.role == Role::Tool {
                if let Some(id) = &m.tool_call_id {
                    msg["tool_call_id"] = json!(id);
                }
                if let Some(name) = &m.name {
                    msg["name"] = json!(name);
                }
            }
            msg
        })
        .collect()
}

/// Convert one decoded chunk into a message chunk, or `None` when it carries nothing.
fn chunk_to_message(chunk: ChatCompletionChunk) -> Option<Message> {
    let choice = chunk.choices.into_iter().next()?;
    let content = choice.delta.content.unwrap_or_default();
    let tool_calls: Vec<ToolCall> = choice
        .delta
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|tc| {
            let function = tc.function.unwrap_or_default();
            ToolCall::delta(
                tc.index,
                tc.id.unwrap_or_default(),
                function.name.unwrap_or_default(),
                function.arguments.unwrap_or_default(),
            )
        })
        .collect();

    if content.is_empty() && tool_calls.is_empty() {
        if let Some(reason) = choice.finish_reason {
            trace!(%reason, "Chunk carried only a finish reason");
        }
        return None;
    }
    Some(Message::assistant_tool_calls(content, tool_calls))
}

type SseStream = Pin<Box<dyn Stream<Item = anyhow::Result<SseEvent>> + Send>>;

/// Map a raw SSE stream to message chunks, stopping at `[DONE]`.
fn message_chunks(sse: SseStream) -> MessageChunkStream {
    let stream = futures::stream::unfold(sse, |mut sse| async move {
        loop {
            match sse.next().await {
                Some(Ok(event)) => {
                    let data = event.data.trim();
                    if data == "[DONE]" {
                        return None;
                    }
                    if data.is_empty() {
                        continue;
                    }
                    let chunk: ChatCompletionChunk = match serde_json::from_str(data) {
                        Ok(c) => c,
                        Err(e) => {
                            trace!(%e, data, "Failed to parse completion chunk");
                            continue;
                        }
                    };
                    if let Some(message) = chunk_to_message(chunk) {
                        return Some((Ok(message), sse));
                    }
                }
                Some(Err(e)) => return Some((Err(e), sse)),
                None => return None,
            }
        }
    });
    Box::pin(stream)
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn id(&self) -> &str {
        &self.provider_id
    }

    async fn stream(
        &self,
        request: &CompletionRequest,
        credentials: &Credentials,
    ) -> anyhow::Result<MessageChunkStream> {
        let api_key = match credentials {
            Credentials::ApiKey { api_key } => api_key.clone(),
            Credentials::None => {
                anyhow::bail!("{} provider requires ApiKey credentials", self.provider_id)
            }
        };

        let body = ChatRequest {
            model: request.model.clone(),
            messages: format_messages(&request.messages),
            stream: true,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            tools: format_tools(&request.tools),
        };

        let url = self.endpoint();
        debug!(model = %body.model, %url, tools = body.tools.len(), "Streaming chat completion");

        let response = self
            .client
            .post(url)
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {api_key}"))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("{} API error {status}: {body}", self.provider_id);
        }

        Ok(message_chunks(Box::pin(parse_sse_stream(response))))
    }
}
