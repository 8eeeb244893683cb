//! Frames for `POST /api/chat/stream`.
//!
//! Every payload carries `{id, thread_id, agent, role}`. The id is minted
//! per agent on first use and reused for the rest of the response.

use std::collections::HashMap;

use chrono::Utc;
use serde_json::{Map, Value, json};

use deerflow_agent::InterruptContext;
use deerflow_agent::policy::COORDINATOR;
use deerflow_core::types::{Message, Role, ToolCall};

use super::{Frame, WireEncoder};

const UNCONFIGURED_NOTICE: &str = "The model is not configured, so no connection can be made. \
Export the environment variables in your shell, for example:\n\
export OPENAI_API_KEY=your-key OPENAI_MODEL=gpt-4o\n\
or use Ark:\n\
export MODEL_TYPE=ark ARK_API_KEY=your-key ARK_MODEL=ep-xxx \
ARK_BASE_URL=https://ark.cn-beijing.volces.com\n\
and restart the backend service.";

fn nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

/// A fresh thread id for requests that did not bring one.
pub fn new_thread_id() -> String {
    format!("thread_{}", nanos())
}

/// The single frame sent when no model credentials are configured.
pub fn unconfigured_frame(thread_id: &str) -> Frame {
    Frame::json(
        "message_chunk",
        &json!({
            "id": format!("run-{COORDINATOR}-{}", nanos()),
            "thread_id": thread_id,
            "agent": COORDINATOR,
            "role": "assistant",
            "content": UNCONFIGURED_NOTICE,
        }),
    )
}

fn parse_args(arguments: &str) -> Value {
    match serde_json::from_str::<Map<String, Value>>(arguments) {
        Ok(map) => Value::Object(map),
        Err(_) => Value::Object(Map::new()),
    }
}

pub struct ThreadChatEncoder {
    thread_id: String,
    ids: HashMap<String, String>,
}

impl ThreadChatEncoder {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            ids: HashMap::new(),
        }
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    fn frame(&mut self, event: &'static str, agent: &str, role: &str, fields: Value) -> Frame {
        let agent = if agent.is_empty() { COORDINATOR } else { agent };
        let id = self
            .ids
            .entry(agent.to_string())
            .or_insert_with(|| format!("run-{agent}-{}", nanos()))
            .clone();

        let mut payload = Map::new();
        payload.insert("id".into(), Value::String(id));
        payload.insert("thread_id".into(), Value::String(self.thread_id.clone()));
        payload.insert("agent".into(), Value::String(agent.to_string()));
        payload.insert("role".into(), Value::String(role.to_string()));
        if let Value::Object(fields) = fields {
            payload.extend(fields);
        }
        Frame::json(event, &Value::Object(payload))
    }

    /// Tool output is shown as the tool's, except the coordinator's own bookkeeping.
    fn role(agent: &str, role: Role) -> &'static str {
        if role == Role::Tool && agent != COORDINATOR && !agent.is_empty() {
            "tool"
        } else {
            "assistant"
        }
    }

    fn tool_calls(&mut self, agent: &str, calls: &[ToolCall]) -> Frame {
        let calls: Vec<Value> = calls
            .iter()
            .map(|call| {
                json!({
                    "type": "tool_call",
                    "id": call.id,
                    "name": call.name(),
                    "args": parse_args(call.arguments()),
                })
            })
            .collect();
        self.frame(
            "tool_calls",
            agent,
            "assistant",
            json!({
                "finish_reason": "tool_calls",
                "tool_calls": calls,
                "tool_call_chunks": [],
            }),
        )
    }

    fn content(&mut self, agent: &str, role: &str, content: &str) -> Frame {
        self.frame("message_chunk", agent, role, json!({ "content": content }))
    }

    fn stop(&mut self, agent: &str) -> Frame {
        self.frame("message_chunk", agent, "assistant", json!({ "finish_reason": "stop" }))
    }
}

impl WireEncoder for ThreadChatEncoder {
    fn message(&mut self, agent: &str, message: &Message) -> Vec<Frame> {
        let mut frames = Vec::new();
        if !message.content.is_empty() {
            frames.push(self.content(agent, Self::role(agent, message.role), &message.content));
        }
        if message.has_tool_calls() {
            frames.push(self.tool_calls(agent, &message.tool_calls));
        }
        frames
    }

    fn text(&mut self, agent: &str, role: Role, content: &str) -> Vec<Frame> {
        vec![self.content(agent, Self::role(agent, role), content)]
    }

    fn deltas(&mut self, agent: &str, deltas: &[ToolCall]) -> Vec<Frame> {
        let chunks: Vec<Value> = deltas
            .iter()
            .map(|delta| {
                json!({
                    "type": "tool_call_chunk",
                    "index": delta.index.unwrap_or(0),
                    "id": delta.id,
                    "name": delta.name(),
                    "args": delta.arguments(),
                })
            })
            .collect();
        vec![self.frame(
            "tool_call_chunks",
            agent,
            "assistant",
            json!({ "tool_call_chunks": chunks }),
        )]
    }

    fn resolved(&mut self, agent: &str, calls: &[ToolCall]) -> Vec<Frame> {
        vec![self.tool_calls(agent, calls)]
    }

    fn stream_error(&mut self, agent: &str, error: &str) -> Vec<Frame> {
        vec![self.content(agent, "assistant", error)]
    }

    fn transfer(&mut self, _agent: &str, _dest: &str) -> Vec<Frame> {
        Vec::new()
    }

    fn interrupt(&mut self, agent: &str, contexts: &[InterruptContext]) -> Vec<Frame> {
        vec![self.frame("interrupt", agent, "assistant", json!({ "options": contexts }))]
    }

    fn exit(&mut self, agent: &str) -> Vec<Frame> {
        vec![self.stop(agent)]
    }

    fn error(&mut self, agent: &str, error: &str) -> Vec<Frame> {
        vec![self.content(agent, "assistant", error)]
    }

    fn finish(&mut self) -> Vec<Frame> {
        vec![self.stop(COORDINATOR)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::tests::encode;
    use deerflow_agent::{AgentAction, AgentEvent, Interrupt, MessageStream, ResumeState};

    fn payload(frame: &Frame) -> Value {
        serde_json::from_str(&frame.data).unwrap()
    }

    #[tokio::test]
    async fn test_ids_are_minted_once_per_agent() {
        let events = vec![
            AgentEvent::message("planner", Message::assistant("a")),
            AgentEvent::message("researcher", Message::assistant("b")),
            AgentEvent::message("planner", Message::assistant("c")),
        ];
        let (frames, _) = encode(events, &mut ThreadChatEncoder::new("thread_1")).await;
        let first = payload(&frames[0]);
        let second = payload(&frames[1]);
        let third = payload(&frames[2]);
        assert!(first["id"].as_str().unwrap().starts_with("run-planner-"));
        assert_eq!(first["id"], third["id"]);
        assert_ne!(first["id"], second["id"]);
        assert_eq!(first["thread_id"], "thread_1");
        assert_eq!(second["agent"], "researcher");
    }

    #[tokio::test]
    async fn test_tool_roles() {
        let events = vec![
            AgentEvent::message("researcher", Message::tool_result("c1", "web_search", "hits")),
            AgentEvent::message(
                "coordinator",
                Message::tool_result("c2", "transfer_to_agent", "done"),
            ),
        ];
        let (frames, _) = encode(events, &mut ThreadChatEncoder::new("t")).await;
        assert_eq!(payload(&frames[0])["role"], "tool");
        assert_eq!(payload(&frames[1])["role"], "assistant");
    }

    #[tokio::test]
    async fn test_stream_chunks_then_resolved_calls() {
        let stream = MessageStream::from_chunks([
            Ok(Message::assistant_tool_calls(
                "",
                vec![ToolCall::delta(0, "c1", "web_search", r#"{"query":"#)],
            )),
            Ok(Message::assistant_tool_calls(
                "",
                vec![ToolCall::delta(0, "", "", r#""rust"}"#)],
            )),
        ]);
        let events = vec![AgentEvent::stream("researcher", stream)];
        let (frames, _) = encode(events, &mut ThreadChatEncoder::new("t")).await;
        let names: Vec<&str> = frames.iter().map(|f| f.event).collect();
        assert_eq!(
            names,
            vec!["tool_call_chunks", "tool_call_chunks", "tool_calls", "message_chunk"]
        );

        let chunk = payload(&frames[0]);
        assert_eq!(chunk["tool_call_chunks"][0]["type"], "tool_call_chunk");
        assert_eq!(chunk["tool_call_chunks"][0]["index"], 0);
        assert_eq!(chunk["tool_call_chunks"][0]["args"], r#"{"query":"#);

        let calls = payload(&frames[2]);
        assert_eq!(calls["finish_reason"], "tool_calls");
        assert_eq!(calls["tool_calls"][0]["args"]["query"], "rust");
        assert_eq!(calls["tool_call_chunks"], json!([]));

        let end = payload(&frames[3]);
        assert_eq!(end["agent"], "coordinator");
        assert_eq!(end["finish_reason"], "stop");
    }

    #[tokio::test]
    async fn test_unparsable_args_become_empty_object() {
        let events = vec![AgentEvent::message(
            "coder",
            Message::assistant_tool_calls("", vec![ToolCall::new("c1", "python_exec", "not json")]),
        )];
        let (frames, _) = encode(events, &mut ThreadChatEncoder::new("t")).await;
        assert_eq!(frames[0].event, "tool_calls");
        assert_eq!(payload(&frames[0])["tool_calls"][0]["args"], json!({}));
    }

    #[tokio::test]
    async fn test_actions_and_errors() {
        let interrupt = Interrupt {
            contexts: Vec::new(),
            resume: ResumeState::default(),
        };
        let events = vec![
            AgentEvent::action(
                "coordinator",
                AgentAction::TransferToAgent {
                    dest: "planner".into(),
                },
            ),
            AgentEvent::error("planner", "model call failed: timeout"),
            AgentEvent::action("coordinator", AgentAction::Interrupted(interrupt)),
            AgentEvent::action("coordinator", AgentAction::Exit),
        ];
        let (frames, _) = encode(events, &mut ThreadChatEncoder::new("t")).await;
        let names: Vec<&str> = frames.iter().map(|f| f.event).collect();
        assert_eq!(names, vec!["message_chunk", "interrupt", "message_chunk", "message_chunk"]);
        assert_eq!(payload(&frames[0])["content"], "model call failed: timeout");
        assert_eq!(payload(&frames[1])["options"], json!([]));
        assert_eq!(payload(&frames[2])["finish_reason"], "stop");
    }

    #[test]
    fn test_unconfigured_frame() {
        let frame = unconfigured_frame("thread_9");
        assert_eq!(frame.event, "message_chunk");
        let body = payload(&frame);
        assert_eq!(body["agent"], "coordinator");
        assert_eq!(body["thread_id"], "thread_9");
        assert!(body["content"].as_str().unwrap().contains("OPENAI_API_KEY"));
        assert!(new_thread_id().starts_with("thread_"));
    }
}
