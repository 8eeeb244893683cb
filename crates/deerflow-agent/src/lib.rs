//! Agents, their event streams, and the supervisor that coordinates them.

pub mod agent;
pub mod chat_model;
pub mod event;
pub mod factory;
pub mod investigator;
pub mod policy;
pub mod runner;
pub mod stream;
pub mod supervisor;

pub use agent::{ActionGate, Agent, AgentInput, GatedAction, RunContext};
pub use chat_model::{ApprovalMode, ChatModelAgent, ChatModelAgentConfig};
pub use event::{
    AgentAction, AgentEvent, EventKind, Interrupt, InterruptContext, InterruptOption, MessageOutput,
    ResumeState, TaggedMessage,
};
pub use factory::{AgentFactory, RequestOptions};
pub use investigator::Investigator;
pub use runner::{Runner, feedback_message};
pub use stream::{EventSender, EventStream, MessageStream};
pub use supervisor::SupervisorAgent;
