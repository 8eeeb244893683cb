//! Scripted provider for driving agents in tests without real API calls.
//!
//! Each agent's turns are queued under a marker string. A request is routed
//! to the first queue whose marker occurs in the request's system message;
//! requests matching no marker consume the fallback queue.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use deerflow_core::types::{Message, Role, ToolCall};

use crate::{CompletionRequest, Credentials, LlmProvider, MessageChunkStream, ModelHandle};

/// One scripted model response.
#[derive(Debug, Clone)]
pub enum Turn {
    /// Plain assistant text.
    Text(String),
    /// Assistant message requesting tool calls. Streamed as indexed deltas.
    ToolCalls { content: String, calls: Vec<ToolCall> },
    /// Raw chunks, emitted verbatim.
    Chunks(Vec<Message>),
    /// The model call itself fails.
    Error(String),
}

impl Turn {
    pub fn text(content: impl Into<String>) -> Self {
        Turn::Text(content.into())
    }

    /// A single tool call with a generated id.
    pub fn tool_call(name: impl Into<String>, arguments: impl Into<String>) -> Self {
        let name = name.into();
        Turn::ToolCalls {
            content: String::new(),
            calls: vec![ToolCall::new(format!("call_{name}"), name, arguments)],
        }
    }

    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Turn::ToolCalls {
            content: String::new(),
            calls,
        }
    }

    pub fn chunks(chunks: Vec<Message>) -> Self {
        Turn::Chunks(chunks)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Turn::Error(message.into())
    }

    /// Split into the chunk sequence a streaming model would produce.
    fn into_chunks(self) -> anyhow::Result<Vec<Message>> {
        match self {
            Turn::Text(content) => Ok(vec![Message::assistant(content)]),
            Turn::ToolCalls { content, calls } => {
                let mut chunks = Vec::new();
                if !content.is_empty() {
                    chunks.push(Message::assistant(content));
                }
                for (index, call) in calls.into_iter().enumerate() {
                    let args = call.arguments();
                    let split = args
                        .char_indices()
                        .nth(args.chars().count() / 2)
                        .map_or(args.len(), |(i, _)| i);
                    let (head, tail) = args.split_at(split);
                    chunks.push(Message::assistant_tool_calls(
                        "",
                        vec![ToolCall::delta(index, call.id.clone(), call.name(), head)],
                    ));
                    if !tail.is_empty() {
                        let rest = ToolCall::delta(index, "", "", tail);
                        chunks.push(Message::assistant_tool_calls("", vec![rest]));
                    }
                }
                Ok(chunks)
            }
            Turn::Chunks(chunks) => Ok(chunks),
            Turn::Error(message) => Err(anyhow::anyhow!(message)),
        }
    }
}

#[derive(Default)]
struct Script {
    keyed: Vec<(String, VecDeque<Turn>)>,
    fallback: VecDeque<Turn>,
    requests: Vec<CompletionRequest>,
}

/// An [`LlmProvider`] that replays queued turns.
#[derive(Default, Clone)]
pub struct ScriptedProvider {
    script: Arc<Mutex<Script>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue turns for requests whose system message contains `marker`.
    pub fn on(self, marker: impl Into<String>, turns: impl IntoIterator<Item = Turn>) -> Self {
        {
            let mut script = self.script.lock().unwrap_or_else(|e| e.into_inner());
            let marker = marker.into();
            match script.keyed.iter_mut().find(|(m, _)| *m == marker) {
                Some((_, queue)) => queue.extend(turns),
                None => script.keyed.push((marker, turns.into_iter().collect())),
            }
        }
        self
    }

    /// Queue turns for requests that match no marker.
    pub fn fallback(self, turns: impl IntoIterator<Item = Turn>) -> Self {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .fallback
            .extend(turns);
        self
    }

    /// A handle over this provider with dummy credentials.
    pub fn handle(&self) -> ModelHandle {
        ModelHandle::new(
            Arc::new(self.clone()),
            Credentials::ApiKey {
                api_key: "test-key".into(),
            },
            "scripted",
        )
    }

    /// Every request received so far, in order.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .requests
            .clone()
    }

    /// Number of requests routed to `marker`.
    pub fn calls_for(&self, marker: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| system_text(r).contains(marker))
            .count()
    }

    fn next_turn(&self, request: &CompletionRequest) -> anyhow::Result<Turn> {
        let mut script = self.script.lock().unwrap_or_else(|e| e.into_inner());
        script.requests.push(request.clone());

        let system = system_text(request);
        let Script { keyed, fallback, .. } = &mut *script;
        let (marker, queue) = match keyed.iter_mut().find(|(m, _)| system.contains(m.as_str())) {
            Some((marker, queue)) => (marker.as_str(), queue),
            None => ("<fallback>", fallback),
        };
        queue
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("script exhausted for {marker}"))
    }
}

fn system_text(request: &CompletionRequest) -> &str {
    request
        .messages
        .iter()
        .find(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .unwrap_or_default()
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn id(&self) -> &str {
        "scripted"
    }

    async fn stream(
        &self,
        request: &CompletionRequest,
        _credentials: &Credentials,
    ) -> anyhow::Result<MessageChunkStream> {
        let chunks = self.next_turn(request)?.into_chunks()?;
        Ok(Box::pin(futures::stream::iter(chunks.into_iter().map(Ok))))
    }
}
