//! Supervisor: drives the coordinator and the agents it delegates to.
//!
//! Control starts at the coordinator. A transfer action hands control to the
//! named delegate; when a delegate finishes without an action of its own,
//! control returns to the coordinator. The run ends on exit, interrupt,
//! error, or a coordinator turn that takes no action.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use deerflow_core::error::{DeerError, Result};
use deerflow_core::types::{Message, Role};

use crate::agent::{Agent, AgentInput, RunContext};
use crate::chat_model::{ChatModelAgent, TRANSFER_TOOL};
use crate::event::{AgentAction, AgentEvent, EventKind, MessageOutput, ResumeState, TaggedMessage};
use crate::policy::PolicyGate;
use crate::stream::{EventSender, EventStream, MessageStream, relay};

pub const DEFAULT_MAX_TRANSFERS: u32 = 64;

/// Rewrite the shared history as `viewer` should see it.
///
/// Requester input and the viewer's own messages pass through. Messages of
/// other agents become user-role context lines; their transfer bookkeeping
/// is dropped.
pub fn history_view(history: &[TaggedMessage], viewer: &str) -> Vec<Message> {
    history
        .iter()
        .filter_map(|tagged| {
            if tagged.agent.is_empty() || tagged.agent == viewer {
                return Some(tagged.message.clone());
            }
            let agent = &tagged.agent;
            let message = &tagged.message;
            let mut lines = Vec::new();
            match message.role {
                Role::Tool => {
                    let tool = message.name.as_deref().unwrap_or("unknown");
                    if tool != TRANSFER_TOOL {
                        lines.push(format!(
                            "For context: [{agent}] `{tool}` tool returned result: {}.",
                            message.content
                        ));
                    }
                }
                _ => {
                    if !message.content.is_empty() {
                        lines.push(format!("For context: [{agent}] said: {}.", message.content));
                    }
                    for call in message.tool_calls.iter().filter(|c| c.name() != TRANSFER_TOOL) {
                        lines.push(format!(
                            "For context: [{agent}] called tool: `{}` with arguments: {}.",
                            call.name(),
                            call.arguments()
                        ));
                    }
                }
            }
            (!lines.is_empty()).then(|| Message::user(lines.join("\n")))
        })
        .collect()
}

/// How one agent turn ended.
enum TurnEnd {
    /// The agent took no action.
    Finished,
    Transfer(String),
    /// Exit, interrupt, error, or lost consumer: the supervised run is over.
    Stop,
}

pub struct SupervisorAgent {
    coordinator: Arc<ChatModelAgent>,
    delegates: BTreeMap<String, Arc<dyn Agent>>,
    max_transfers: u32,
}

impl SupervisorAgent {
    /// Assemble the supervisor. Delegate names must be unique and differ from
    /// the coordinator's.
    pub fn new(
        coordinator: Arc<ChatModelAgent>,
        delegates: Vec<Arc<dyn Agent>>,
        max_transfers: u32,
    ) -> Result<Self> {
        let mut map: BTreeMap<String, Arc<dyn Agent>> = BTreeMap::new();
        for agent in delegates {
            let name = agent.name().to_string();
            if name == coordinator.name() {
                return Err(DeerError::Agent(format!("delegate '{name}' shadows the coordinator")));
            }
            if map.insert(name.clone(), agent).is_some() {
                return Err(DeerError::Agent(format!("duplicate agent name '{name}'")));
            }
        }
        Ok(Self {
            coordinator,
            delegates: map,
            max_transfers,
        })
    }

    pub fn agent_names(&self) -> impl Iterator<Item = &str> {
        self.delegates.keys().map(String::as_str)
    }

    fn agent(&self, name: &str) -> Option<Arc<dyn Agent>> {
        if name == self.coordinator.name() {
            Some(self.coordinator.clone() as Arc<dyn Agent>)
        } else {
            self.delegates.get(name).cloned()
        }
    }

    /// Continue a run suspended by an interrupt, answering the pending call with `feedback`.
    pub fn resume(
        self: Arc<Self>,
        state: ResumeState,
        feedback: String,
        ctx: RunContext,
    ) -> EventStream {
        let name = self.coordinator.name().to_string();
        EventStream::spawn(name, ctx.cancel.clone(), move |tx| async move {
            let mut history = state.history;
            history.push(TaggedMessage::new(
                state.agent.clone(),
                Message::tool_result(state.pending_call_id, state.pending_tool, feedback),
            ));
            let current = if state.agent.is_empty() {
                self.coordinator.name().to_string()
            } else {
                state.agent
            };
            self.drive(history, current, state.transfers, ctx, tx).await;
        })
    }

    async fn drive(
        &self,
        mut history: Vec<TaggedMessage>,
        mut current: String,
        mut transfers: u32,
        ctx: RunContext,
        tx: EventSender,
    ) {
        let coordinator = self.coordinator.name().to_string();

        loop {
            if ctx.cancel.is_cancelled() {
                return;
            }
            let Some(agent) = self.agent(&current) else {
                tx.send(EventKind::Error(format!("unknown agent '{current}'")));
                return;
            };

            let mut run_ctx = ctx.child();
            if current == coordinator {
                run_ctx = run_ctx.with_gate(Arc::new(PolicyGate::new(history.clone())));
            }
            let input = AgentInput::new(history_view(&history, &current));
            let events = agent.run(input, run_ctx);

            let next = match self.pump(events, &mut history, transfers, &tx).await {
                TurnEnd::Stop => return,
                TurnEnd::Transfer(dest) => dest,
                TurnEnd::Finished if current == coordinator => return,
                TurnEnd::Finished => {
                    if !tx.forward(AgentEvent::action(
                        current.clone(),
                        AgentAction::TransferToAgent {
                            dest: coordinator.clone(),
                        },
                    )) {
                        return;
                    }
                    coordinator.clone()
                }
            };

            transfers += 1;
            if transfers > self.max_transfers {
                warn!(max = self.max_transfers, "Transfer limit reached");
                tx.send(EventKind::Error(format!(
                    "run exceeded the maximum of {} agent transfers",
                    self.max_transfers
                )));
                return;
            }
            info!(from = %current, to = %next, transfers, "Agent transfer");
            current = next;
        }
    }

    /// Forward one agent's events, recording its output into `history`.
    async fn pump(
        &self,
        mut events: EventStream,
        history: &mut Vec<TaggedMessage>,
        transfers: u32,
        tx: &EventSender,
    ) -> TurnEnd {
        let mut end = TurnEnd::Finished;

        while let Some(event) = events.next_event().await {
            let agent = event.agent_name.clone();
            let delivered = match event.kind {
                EventKind::Output(MessageOutput::Message(message)) => {
                    history.push(TaggedMessage::new(agent.clone(), message.clone()));
                    tx.forward(AgentEvent::message(agent, message))
                }
                EventKind::Output(MessageOutput::Stream(source)) => {
                    let (chunk_tx, copy) = MessageStream::channel();
                    let delivered = tx.forward(AgentEvent::stream(agent.clone(), copy));
                    match relay(source, &chunk_tx).await {
                        Ok(message) => history.push(TaggedMessage::new(agent, message)),
                        Err(e) => {
                            warn!(agent = %agent, %e, "Agent output stream failed");
                            end = TurnEnd::Stop;
                        }
                    }
                    delivered
                }
                EventKind::Action(AgentAction::TransferToAgent { dest }) => {
                    if self.agent(&dest).is_none() {
                        tx.send(EventKind::Error(format!("transfer to unknown agent '{dest}'")));
                        end = TurnEnd::Stop;
                        continue;
                    }
                    end = TurnEnd::Transfer(dest.clone());
                    tx.forward(AgentEvent::action(agent, AgentAction::TransferToAgent { dest }))
                }
                EventKind::Action(AgentAction::Interrupted(mut interrupt)) => {
                    interrupt.resume.history = history.clone();
                    interrupt.resume.transfers = transfers;
                    if interrupt.resume.agent.is_empty() {
                        interrupt.resume.agent = agent.clone();
                    }
                    info!(agent = %agent, "Run interrupted for approval");
                    end = TurnEnd::Stop;
                    tx.forward(AgentEvent::action(agent, AgentAction::Interrupted(interrupt)))
                }
                EventKind::Action(AgentAction::Exit) => {
                    end = TurnEnd::Stop;
                    tx.forward(AgentEvent::action(agent, AgentAction::Exit))
                }
                EventKind::Error(e) => {
                    end = TurnEnd::Stop;
                    tx.forward(AgentEvent::error(agent, e))
                }
            };
            if !delivered {
                return TurnEnd::Stop;
            }
        }
        end
    }
}

impl Agent for SupervisorAgent {
    fn name(&self) -> &str {
        self.coordinator.name()
    }

    fn description(&self) -> &str {
        self.coordinator.description()
    }

    fn run(self: Arc<Self>, input: AgentInput, ctx: RunContext) -> EventStream {
        let name = self.coordinator.name().to_string();
        EventStream::spawn(name.clone(), ctx.cancel.clone(), move |tx| async move {
            let history = input.messages.into_iter().map(TaggedMessage::from_requester).collect();
            self.drive(history, name, 0, ctx, tx).await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deerflow_core::types::ToolCall;

    #[test]
    fn test_history_view_rewrites_foreign_messages() {
        let history = vec![
            TaggedMessage::from_requester(Message::user("study rust")),
            TaggedMessage::new(
                "coordinator",
                Message::assistant_tool_calls(
                    "",
                    vec![ToolCall::new("t1", TRANSFER_TOOL, r#"{"agent_name":"researcher"}"#)],
                ),
            ),
            TaggedMessage::new(
                "coordinator",
                Message::tool_result(
                    "t1",
                    TRANSFER_TOOL,
                    "Successfully transferred to agent [researcher]",
                ),
            ),
            TaggedMessage::new(
                "researcher",
                Message::assistant_tool_calls(
                    "looking",
                    vec![ToolCall::new("s1", "web_search", r#"{"query":"rust"}"#)],
                ),
            ),
            TaggedMessage::new("researcher", Message::tool_result("s1", "web_search", "hits")),
        ];

        let for_coordinator = history_view(&history, "coordinator");
        assert_eq!(for_coordinator.len(), 5);
        assert_eq!(for_coordinator[1].tool_calls.len(), 1);
        assert_eq!(for_coordinator[2].role, Role::Tool);
        assert!(for_coordinator[3].content.contains("[researcher] said: looking."));
        assert!(for_coordinator[3].content.contains("called tool: `web_search`"));
        assert_eq!(for_coordinator[4].role, Role::User);
        assert_eq!(
            for_coordinator[4].content,
            "For context: [researcher] `web_search` tool returned result: hits."
        );

        let for_researcher = history_view(&history, "researcher");
        assert_eq!(for_researcher.len(), 3);
        assert_eq!(for_researcher[0].content, "study rust");
        assert_eq!(for_researcher[1].role, Role::Assistant);
        assert_eq!(for_researcher[2].role, Role::Tool);
    }
}
