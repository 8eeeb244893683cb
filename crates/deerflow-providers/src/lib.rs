//! Tool-calling chat model abstraction.
//!
//! Each provider implements [`LlmProvider`]: given a message history and a
//! set of callable tools, produce a streamed message whose chunks may carry
//! index-tagged tool-call deltas, or a complete message.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use deerflow_core::config::ResolvedModel;
use deerflow_core::types::{Message, ToolDefinition, concat_messages};

pub mod openai;
pub mod sse;
pub mod testing;

/// Credentials for authenticating with an LLM provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Credentials {
    #[serde(rename = "api_key")]
    ApiKey { api_key: String },
    #[serde(rename = "none")]
    None,
}

/// A request to the LLM.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub model: String,
    /// Full history, including the leading system instruction.
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
}

/// Incremental assistant message: each item is one chunk.
pub type MessageChunkStream = Pin<Box<dyn Stream<Item = anyhow::Result<Message>> + Send>>;

/// The core LLM provider trait.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider identifier (e.g., "openai", "ark").
    fn id(&self) -> &str;

    /// Stream a chat completion chunk by chunk.
    async fn stream(
        &self,
        request: &CompletionRequest,
        credentials: &Credentials,
    ) -> anyhow::Result<MessageChunkStream>;

    /// Produce a complete message. The default drains [`LlmProvider::stream`].
    async fn complete(
        &self,
        request: &CompletionRequest,
        credentials: &Credentials,
    ) -> anyhow::Result<Message> {
        let mut stream = self.stream(request, credentials).await?;
        let mut chunks = Vec::new();
        while let Some(chunk) = stream.next().await {
            chunks.push(chunk?);
        }
        Ok(concat_messages(&chunks))
    }
}

/// A provider bound to credentials and a model name, ready to be handed to one agent.
#[derive(Clone)]
pub struct ModelHandle {
    provider: Arc<dyn LlmProvider>,
    credentials: Credentials,
    model: String,
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("provider", &self.provider.id())
            .field("model", &self.model)
            .finish()
    }
}

impl ModelHandle {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        credentials: Credentials,
        model: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            credentials,
            model: model.into(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn provider_id(&self) -> &str {
        self.provider.id()
    }

    fn request(&self, messages: Vec<Message>, tools: Vec<ToolDefinition>) -> CompletionRequest {
        CompletionRequest {
            model: self.model.clone(),
            messages,
            tools,
            max_tokens: None,
            temperature: None,
        }
    }

    pub async fn stream(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolDefinition>,
    ) -> anyhow::Result<MessageChunkStream> {
        let request = self.request(messages, tools);
        self.provider.stream(&request, &self.credentials).await
    }

    pub async fn complete(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolDefinition>,
    ) -> anyhow::Result<Message> {
        let request = self.request(messages, tools);
        self.provider.complete(&request, &self.credentials).await
    }
}

/// Hands out a model handle per agent construction.
pub trait ModelSource: Send + Sync {
    fn model(&self) -> ModelHandle;

    /// Whether the handles this source produces can authenticate.
    fn has_credentials(&self) -> bool {
        true
    }
}

impl ModelSource for ModelHandle {
    fn model(&self) -> ModelHandle {
        self.clone()
    }
}

/// Model source backed by the resolved config/environment settings.
pub struct ConfiguredModels {
    resolved: ResolvedModel,
    client: reqwest::Client,
}

impl ConfiguredModels {
    pub fn new(resolved: ResolvedModel) -> Self {
        Self {
            resolved,
            client: reqwest::Client::new(),
        }
    }
}

impl ModelSource for ConfiguredModels {
    fn model(&self) -> ModelHandle {
        let provider = openai::OpenAiProvider::from_resolved(&self.resolved, self.client.clone());
        let credentials = match &self.resolved.api_key {
            Some(api_key) => Credentials::ApiKey {
                api_key: api_key.clone(),
            },
            None => Credentials::None,
        };
        ModelHandle::new(Arc::new(provider), credentials, self.resolved.model.clone())
    }

    fn has_credentials(&self) -> bool {
        self.resolved.has_credentials()
    }
}
