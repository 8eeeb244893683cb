//! Events emitted by a running agent.

use serde::{Deserialize, Serialize};

use deerflow_core::types::Message;

use crate::stream::MessageStream;

/// One event from an agent run. Exactly one of output / action / error.
#[derive(Debug)]
pub struct AgentEvent {
    /// Name of the agent that produced the event.
    pub agent_name: String,
    pub kind: EventKind,
}

#[derive(Debug)]
pub enum EventKind {
    Output(MessageOutput),
    Action(AgentAction),
    Error(String),
}

/// A complete message, or a live chunk stream the consumer must drain.
#[derive(Debug)]
pub enum MessageOutput {
    Message(Message),
    Stream(MessageStream),
}

#[derive(Debug)]
pub enum AgentAction {
    TransferToAgent { dest: String },
    Interrupted(Interrupt),
    Exit,
}

/// A suspension awaiting an external reply.
#[derive(Debug)]
pub struct Interrupt {
    /// Serializable contexts shown to the requester.
    pub contexts: Vec<InterruptContext>,
    /// In-process state needed to continue the run. Never serialized.
    pub resume: ResumeState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterruptContext {
    pub id: String,
    pub agent: String,
    pub kind: String,
    pub info: serde_json::Value,
    pub options: Vec<InterruptOption>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptOption {
    pub text: String,
    pub value: String,
}

/// A message attributed to the agent that produced it. An empty agent name
/// marks requester input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedMessage {
    pub agent: String,
    pub message: Message,
}

impl TaggedMessage {
    pub fn new(agent: impl Into<String>, message: Message) -> Self {
        Self {
            agent: agent.into(),
            message,
        }
    }

    pub fn from_requester(message: Message) -> Self {
        Self::new("", message)
    }
}

/// What a suspended supervised run needs to pick up where it stopped.
#[derive(Debug, Clone, Default)]
pub struct ResumeState {
    pub history: Vec<TaggedMessage>,
    /// Agent that raised the interrupt.
    pub agent: String,
    /// Tool call left unanswered by the interrupt.
    pub pending_call_id: String,
    pub pending_tool: String,
    pub transfers: u32,
}

impl AgentEvent {
    pub fn new(agent_name: impl Into<String>, kind: EventKind) -> Self {
        Self {
            agent_name: agent_name.into(),
            kind,
        }
    }

    pub fn message(agent_name: impl Into<String>, message: Message) -> Self {
        Self::new(agent_name, EventKind::Output(MessageOutput::Message(message)))
    }

    pub fn stream(agent_name: impl Into<String>, stream: MessageStream) -> Self {
        Self::new(agent_name, EventKind::Output(MessageOutput::Stream(stream)))
    }

    pub fn action(agent_name: impl Into<String>, action: AgentAction) -> Self {
        Self::new(agent_name, EventKind::Action(action))
    }

    pub fn error(agent_name: impl Into<String>, error: impl std::fmt::Display) -> Self {
        Self::new(agent_name, EventKind::Error(error.to_string()))
    }

    pub fn is_error(&self) -> bool {
        matches!(self.kind, EventKind::Error(_))
    }
}
