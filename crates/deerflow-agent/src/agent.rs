//! The capability contract shared by every agent.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use deerflow_core::types::Message;

use crate::stream::EventStream;

/// Input handed to one agent run.
#[derive(Debug, Clone, Default)]
pub struct AgentInput {
    /// Conversation history as this agent should see it.
    pub messages: Vec<Message>,
}

impl AgentInput {
    pub fn new(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn query(text: impl Into<String>) -> Self {
        Self::new(vec![Message::user(text)])
    }
}

/// A capability call an agent is about to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatedAction {
    Transfer(String),
    Exit,
}

/// Reviews capability calls before they take effect.
///
/// `produced` holds the messages the calling agent has emitted in the
/// current run so far. A refusal is returned to the model as the tool result.
pub trait ActionGate: Send + Sync {
    fn review(&self, agent: &str, action: &GatedAction, produced: &[Message]) -> Result<(), String>;
}

/// Request-scoped run settings.
#[derive(Clone, Default)]
pub struct RunContext {
    pub cancel: CancellationToken,
    pub gate: Option<Arc<dyn ActionGate>>,
}

impl RunContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel, gate: None }
    }

    pub fn with_gate(mut self, gate: Arc<dyn ActionGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Context for a nested run: cancelled with this one, no gate.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            gate: None,
        }
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("cancelled", &self.cancel.is_cancelled())
            .field("gated", &self.gate.is_some())
            .finish()
    }
}

/// Something that can be run against a history and reports through events.
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    /// One-line description shown to the coordinator.
    fn description(&self) -> &str;

    fn run(self: Arc<Self>, input: AgentInput, ctx: RunContext) -> EventStream;
}
