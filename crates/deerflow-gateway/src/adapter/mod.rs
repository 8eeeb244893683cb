//! Streaming protocol adapter.
//!
//! Drains a supervisor [`EventStream`] and turns every event into wire frames
//! through a [`WireEncoder`]. The delta aggregation below is shared by both
//! encodings; only the frame vocabulary and payload shapes differ.

pub mod chat_completions;
pub mod thread_chat;

use std::convert::Infallible;
use std::future::Future;

use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use deerflow_agent::{
    AgentAction, EventKind, EventStream, InterruptContext, MessageOutput, ResumeState,
};
use deerflow_core::types::{Message, Role, ToolCall, ToolCallAccumulator};

pub use chat_completions::ChatCompletionsEncoder;
pub use thread_chat::ThreadChatEncoder;

const FRAME_BUFFER: usize = 64;

/// One named server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub event: &'static str,
    pub data: String,
}

impl Frame {
    pub fn new(event: &'static str, data: impl Into<String>) -> Self {
        Self {
            event,
            data: data.into(),
        }
    }

    pub fn json(event: &'static str, payload: &serde_json::Value) -> Self {
        Self::new(event, payload.to_string())
    }

    pub fn into_sse(self) -> SseEvent {
        SseEvent::default().event(self.event).data(self.data)
    }
}

/// Frame vocabulary of one wire protocol.
pub trait WireEncoder: Send {
    /// A complete message.
    fn message(&mut self, agent: &str, message: &Message) -> Vec<Frame>;

    /// Text of one live chunk.
    fn text(&mut self, agent: &str, role: Role, content: &str) -> Vec<Frame>;

    /// Raw tool-call deltas of one live chunk, in arrival order.
    fn deltas(&mut self, agent: &str, deltas: &[ToolCall]) -> Vec<Frame>;

    /// Calls resolved from a finished chunk stream, in index order.
    fn resolved(&mut self, agent: &str, calls: &[ToolCall]) -> Vec<Frame>;

    /// A chunk stream that ended with an error.
    fn stream_error(&mut self, agent: &str, error: &str) -> Vec<Frame>;

    fn transfer(&mut self, agent: &str, dest: &str) -> Vec<Frame>;

    fn interrupt(&mut self, agent: &str, contexts: &[InterruptContext]) -> Vec<Frame>;

    fn exit(&mut self, agent: &str) -> Vec<Frame>;

    fn error(&mut self, agent: &str, error: &str) -> Vec<Frame>;

    /// Frames written once the event stream is exhausted.
    fn finish(&mut self) -> Vec<Frame> {
        Vec::new()
    }
}

async fn emit(tx: &mpsc::Sender<Frame>, frames: Vec<Frame>) -> bool {
    for frame in frames {
        if tx.send(frame).await.is_err() {
            return false;
        }
    }
    true
}

/// Encode every event of `events` into `tx` until the stream is exhausted.
///
/// Errors are forwarded as frames and do not stop the pump. Returns the
/// resume state of the last interrupt, if the run was suspended. Stops early
/// when the client has gone away.
pub async fn pump<E: WireEncoder>(
    mut events: EventStream,
    encoder: &mut E,
    tx: &mpsc::Sender<Frame>,
) -> Option<ResumeState> {
    let mut suspended = None;

    while let Some(event) = events.next_event().await {
        let agent = event.agent_name.as_str();
        let frames = match event.kind {
            EventKind::Output(MessageOutput::Message(message)) => encoder.message(agent, &message),
            EventKind::Output(MessageOutput::Stream(mut chunks)) => {
                let mut calls = ToolCallAccumulator::new();
                while let Some(item) = chunks.recv().await {
                    let frames = match item {
                        Ok(chunk) => {
                            let mut frames = Vec::new();
                            if !chunk.content.is_empty() {
                                frames.extend(encoder.text(agent, chunk.role, &chunk.content));
                            }
                            if !chunk.tool_calls.is_empty() {
                                frames.extend(encoder.deltas(agent, &chunk.tool_calls));
                                calls.extend(&chunk.tool_calls);
                            }
                            frames
                        }
                        Err(e) => {
                            let frames = encoder.stream_error(agent, &e.to_string());
                            if !emit(tx, frames).await {
                                return suspended;
                            }
                            break;
                        }
                    };
                    if !emit(tx, frames).await {
                        return suspended;
                    }
                }
                let resolved = calls.resolve();
                if resolved.is_empty() {
                    Vec::new()
                } else {
                    encoder.resolved(agent, &resolved)
                }
            }
            EventKind::Action(AgentAction::TransferToAgent { dest }) => {
                encoder.transfer(agent, &dest)
            }
            EventKind::Action(AgentAction::Interrupted(interrupt)) => {
                let frames = encoder.interrupt(agent, &interrupt.contexts);
                suspended = Some(interrupt.resume);
                frames
            }
            EventKind::Action(AgentAction::Exit) => encoder.exit(agent),
            EventKind::Error(e) => encoder.error(agent, &e),
        };
        if !emit(tx, frames).await {
            debug!("Client disconnected, stopping event pump");
            return suspended;
        }
    }

    emit(tx, encoder.finish()).await;
    suspended
}

/// Serve frames produced by `producer` as an SSE response.
///
/// `cancel` fires when the response is dropped, so a disconnecting client
/// stops the agent run.
pub fn sse_response<F, Fut>(cancel: CancellationToken, producer: F) -> Response
where
    F: FnOnce(mpsc::Sender<Frame>) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(FRAME_BUFFER);
    tokio::spawn(producer(tx));

    let guard = cancel.drop_guard();
    let stream = ReceiverStream::new(rx).map(move |frame| {
        let _guard = &guard;
        Ok::<_, Infallible>(frame.into_sse())
    });
    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use deerflow_agent::{AgentEvent, MessageStream};

    /// Run `events` through `encoder` and collect everything it wrote.
    pub(crate) async fn encode<E: WireEncoder>(
        events: Vec<AgentEvent>,
        encoder: &mut E,
    ) -> (Vec<Frame>, Option<ResumeState>) {
        let (sender, stream) = EventStream::channel("coordinator");
        for event in events {
            sender.forward(event);
        }
        drop(sender);

        let (tx, mut rx) = mpsc::channel(1024);
        let resume = pump(stream, encoder, &tx).await;
        drop(tx);
        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame);
        }
        (frames, resume)
    }

    /// Records which encoder hooks fired.
    #[derive(Default)]
    struct Recorder;

    impl WireEncoder for Recorder {
        fn message(&mut self, _agent: &str, message: &Message) -> Vec<Frame> {
            vec![Frame::new("message", message.content.clone())]
        }
        fn text(&mut self, _agent: &str, _role: Role, content: &str) -> Vec<Frame> {
            vec![Frame::new("text", content)]
        }
        fn deltas(&mut self, _agent: &str, deltas: &[ToolCall]) -> Vec<Frame> {
            deltas.iter().map(|d| Frame::new("delta", d.arguments())).collect()
        }
        fn resolved(&mut self, _agent: &str, calls: &[ToolCall]) -> Vec<Frame> {
            calls
                .iter()
                .map(|c| Frame::new("resolved", format!("{}|{}|{}", c.id, c.name(), c.arguments())))
                .collect()
        }
        fn stream_error(&mut self, _agent: &str, error: &str) -> Vec<Frame> {
            vec![Frame::new("stream_error", error)]
        }
        fn transfer(&mut self, _agent: &str, dest: &str) -> Vec<Frame> {
            vec![Frame::new("transfer", dest)]
        }
        fn interrupt(&mut self, _agent: &str, contexts: &[InterruptContext]) -> Vec<Frame> {
            vec![Frame::new("interrupt", contexts.len().to_string())]
        }
        fn exit(&mut self, _agent: &str) -> Vec<Frame> {
            vec![Frame::new("exit", "")]
        }
        fn error(&mut self, _agent: &str, error: &str) -> Vec<Frame> {
            vec![Frame::new("error", error)]
        }
        fn finish(&mut self) -> Vec<Frame> {
            vec![Frame::new("finish", "")]
        }
    }

    fn chunk(content: &str, calls: Vec<ToolCall>) -> anyhow::Result<Message> {
        Ok(Message::assistant_tool_calls(content, calls))
    }

    fn names(frames: &[Frame]) -> Vec<&str> {
        frames.iter().map(|f| f.event).collect()
    }

    #[tokio::test]
    async fn test_deltas_resolve_per_index() {
        let stream = MessageStream::from_chunks([
            chunk("", vec![ToolCall::delta(0, "c1", "run", r#"{"x":"#)]),
            chunk("", vec![ToolCall::delta(0, "", "", "1}")]),
        ]);
        let (frames, _) = encode(vec![AgentEvent::stream("coder", stream)], &mut Recorder).await;
        assert_eq!(names(&frames), vec!["delta", "delta", "resolved", "finish"]);
        assert_eq!(frames[2].data, r#"c1|run|{"x":1}"#);
    }

    #[tokio::test]
    async fn test_interleaved_indices_resolve_in_index_order() {
        let stream = MessageStream::from_chunks([
            chunk("", vec![ToolCall::delta(1, "b", "second", "{")]),
            chunk("", vec![ToolCall::delta(0, "a", "first", "[")]),
            chunk("", vec![ToolCall::delta(1, "", "", "}")]),
            chunk("", vec![ToolCall::delta(0, "", "", "]")]),
        ]);
        let (frames, _) = encode(vec![AgentEvent::stream("coder", stream)], &mut Recorder).await;
        let deltas: Vec<&str> = frames
            .iter()
            .filter(|f| f.event == "delta")
            .map(|f| f.data.as_str())
            .collect();
        assert_eq!(deltas, vec!["{", "[", "}", "]"]);
        let resolved: Vec<&str> = frames
            .iter()
            .filter(|f| f.event == "resolved")
            .map(|f| f.data.as_str())
            .collect();
        assert_eq!(resolved, vec!["a|first|[]", "b|second|{}"]);
    }

    #[tokio::test]
    async fn test_text_passes_through_before_resolved_calls() {
        let stream = MessageStream::from_chunks([
            chunk("Let me ", vec![]),
            chunk("search", vec![ToolCall::delta(0, "c1", "web_search", "{}")]),
            chunk(".", vec![]),
        ]);
        let events = vec![AgentEvent::stream("researcher", stream)];
        let (frames, _) = encode(events, &mut Recorder).await;
        assert_eq!(
            names(&frames),
            vec!["text", "text", "delta", "text", "resolved", "finish"]
        );
        let text: String = frames
            .iter()
            .filter(|f| f.event == "text")
            .map(|f| f.data.as_str())
            .collect();
        assert_eq!(text, "Let me search.");
    }

    #[tokio::test]
    async fn test_stream_error_still_resolves_collected_calls() {
        let stream = MessageStream::from_chunks([
            chunk("", vec![ToolCall::delta(0, "c1", "run", "{}")]),
            Err(anyhow::anyhow!("connection reset")),
            chunk("never", vec![]),
        ]);
        let (frames, _) = encode(vec![AgentEvent::stream("coder", stream)], &mut Recorder).await;
        assert_eq!(names(&frames), vec!["delta", "stream_error", "resolved", "finish"]);
        assert_eq!(frames[1].data, "connection reset");
    }

    #[tokio::test]
    async fn test_errors_do_not_stop_the_pump() {
        let events = vec![
            AgentEvent::error("planner", "model call failed: 500"),
            AgentEvent::message("coordinator", Message::assistant("still here")),
            AgentEvent::action(
                "coordinator",
                AgentAction::TransferToAgent {
                    dest: "reporter".into(),
                },
            ),
            AgentEvent::action("coordinator", AgentAction::Exit),
        ];
        let (frames, resume) = encode(events, &mut Recorder).await;
        assert_eq!(names(&frames), vec!["error", "message", "transfer", "exit", "finish"]);
        assert_eq!(frames[2].data, "reporter");
        assert!(resume.is_none());
    }

    #[tokio::test]
    async fn test_interrupt_returns_resume_state() {
        let interrupt = deerflow_agent::Interrupt {
            contexts: Vec::new(),
            resume: ResumeState {
                agent: "coordinator".into(),
                pending_call_id: "call_1".into(),
                ..Default::default()
            },
        };
        let events = vec![AgentEvent::action("coordinator", AgentAction::Interrupted(interrupt))];
        let (frames, resume) = encode(events, &mut Recorder).await;
        assert_eq!(names(&frames), vec!["interrupt", "finish"]);
        assert_eq!(resume.unwrap().pending_call_id, "call_1");
    }

    #[tokio::test]
    async fn test_pump_stops_when_client_leaves() {
        let (sender, stream) = EventStream::channel("coordinator");
        sender.forward(AgentEvent::message("coordinator", Message::assistant("a")));
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let resume = pump(stream, &mut Recorder, &tx).await;
        assert!(resume.is_none());
        drop(sender);
    }
}
