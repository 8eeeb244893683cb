//! Entry point for running a query (or resuming one) against a supervisor.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::agent::{Agent, AgentInput, RunContext};
use crate::event::ResumeState;
use crate::stream::EventStream;
use crate::supervisor::SupervisorAgent;

/// Format a human answer to an approval interrupt.
///
/// `option` is the chosen option value (`accepted`, `edit_plan`); the
/// coordinator reads the bracketed upper-case tag. A comment that already
/// carries the tag is passed through.
pub fn feedback_message(option: &str, comment: &str) -> String {
    let tag = format!("[{}]", option.trim().to_uppercase());
    let comment = comment.trim();
    if comment.is_empty() {
        tag
    } else if comment
        .get(..tag.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(&tag))
    {
        comment.to_string()
    } else {
        format!("{tag} {comment}")
    }
}

pub struct Runner {
    supervisor: Arc<SupervisorAgent>,
}

impl Runner {
    pub fn new(supervisor: Arc<SupervisorAgent>) -> Self {
        Self { supervisor }
    }

    /// Start a fresh run with a single user query.
    pub fn query(&self, query: &str, cancel: CancellationToken) -> EventStream {
        info!(agent = %self.supervisor.name(), query_len = query.len(), "Starting run");
        self.supervisor
            .clone()
            .run(AgentInput::query(query), RunContext::new(cancel))
    }

    /// Start a fresh run over an existing conversation.
    pub fn run(&self, input: AgentInput, cancel: CancellationToken) -> EventStream {
        info!(agent = %self.supervisor.name(), messages = input.messages.len(), "Starting run");
        self.supervisor.clone().run(input, RunContext::new(cancel))
    }

    /// Continue an interrupted run.
    pub fn resume(
        &self,
        state: ResumeState,
        feedback: String,
        cancel: CancellationToken,
    ) -> EventStream {
        info!(agent = %state.agent, transfers = state.transfers, "Resuming interrupted run");
        self.supervisor.clone().resume(state, feedback, RunContext::new(cancel))
    }
}
