//! Frames for `POST /v1/chat/completions`.
//!
//! Text goes out raw in `message` frames; tool calls and interrupt contexts
//! as JSON.

use serde_json::json;

use deerflow_agent::InterruptContext;
use deerflow_core::types::{Message, Role, ToolCall};

use super::{Frame, WireEncoder};

#[derive(Debug, Default)]
pub struct ChatCompletionsEncoder;

impl ChatCompletionsEncoder {
    pub fn new() -> Self {
        Self
    }

    fn start_end(calls: &[ToolCall]) -> Vec<Frame> {
        calls
            .iter()
            .flat_map(|call| {
                let payload = json!({
                    "id": call.id,
                    "type": call.call_type,
                    "name": call.name(),
                    "args": call.arguments(),
                });
                [
                    Frame::json("tool_call_start", &payload),
                    Frame::json("tool_call_end", &payload),
                ]
            })
            .collect()
    }
}

impl WireEncoder for ChatCompletionsEncoder {
    fn message(&mut self, _agent: &str, message: &Message) -> Vec<Frame> {
        let mut frames = Vec::new();
        if !message.content.is_empty() {
            frames.push(Frame::new("message", message.content.clone()));
        }
        frames.extend(Self::start_end(&message.tool_calls));
        frames
    }

    fn text(&mut self, _agent: &str, _role: Role, content: &str) -> Vec<Frame> {
        vec![Frame::new("message", content)]
    }

    fn deltas(&mut self, _agent: &str, deltas: &[ToolCall]) -> Vec<Frame> {
        deltas
            .iter()
            .filter_map(|delta| {
                let index = delta.index?;
                Some(Frame::json(
                    "tool_call_delta",
                    &json!({
                        "id": delta.id,
                        "type": delta.call_type,
                        "name": delta.name(),
                        "args": delta.arguments(),
                        "index": index,
                    }),
                ))
            })
            .collect()
    }

    fn resolved(&mut self, _agent: &str, calls: &[ToolCall]) -> Vec<Frame> {
        Self::start_end(calls)
    }

    fn stream_error(&mut self, agent: &str, error: &str) -> Vec<Frame> {
        self.error(agent, error)
    }

    fn transfer(&mut self, _agent: &str, dest: &str) -> Vec<Frame> {
        vec![Frame::new("transfer_to_agent", dest)]
    }

    fn interrupt(&mut self, _agent: &str, contexts: &[InterruptContext]) -> Vec<Frame> {
        vec![Frame::json("interrupt_options", &json!(contexts))]
    }

    fn exit(&mut self, _agent: &str) -> Vec<Frame> {
        vec![Frame::new("exit", "")]
    }

    fn error(&mut self, _agent: &str, error: &str) -> Vec<Frame> {
        vec![Frame::new("error", error)]
    }
}
