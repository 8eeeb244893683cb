//! Model-backed agent: instruction + history -> model -> tool calls -> repeat.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use deerflow_core::types::{Message, Role, ToolCall, ToolDefinition};
use deerflow_providers::ModelHandle;
use deerflow_tools::ToolRef;

use crate::agent::{Agent, AgentInput, GatedAction, RunContext};
use crate::event::{
    AgentAction, EventKind, Interrupt, InterruptContext, InterruptOption, MessageOutput,
    ResumeState,
};
use crate::stream::{EventSender, EventStream, MessageStream, relay};

pub const TRANSFER_TOOL: &str = "transfer_to_agent";
pub const EXIT_TOOL: &str = "exit";
pub const APPROVAL_TOOL: &str = "request_approval";

pub const DEFAULT_MAX_ITERATIONS: usize = 20;

/// How a `request_approval` call is answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalMode {
    /// Suspend the run until the requester replies.
    Interrupt,
    /// Answer immediately with an acceptance.
    AutoAccept,
}

pub struct ChatModelAgentConfig {
    pub name: String,
    pub description: String,
    pub instruction: String,
    pub model: ModelHandle,
    pub tools: Vec<ToolRef>,
    /// `(name, description)` of agents reachable through `transfer_to_agent`.
    pub transfer_targets: Vec<(String, String)>,
    pub exit: bool,
    pub approval: Option<ApprovalMode>,
    pub max_iterations: usize,
    pub streaming: bool,
}

impl ChatModelAgentConfig {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        instruction: impl Into<String>,
        model: ModelHandle,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            instruction: instruction.into(),
            model,
            tools: Vec::new(),
            transfer_targets: Vec::new(),
            exit: false,
            approval: None,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            streaming: true,
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolRef>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }
}

#[derive(Deserialize)]
struct TransferArgs {
    agent_name: String,
}

#[derive(Deserialize, Default)]
struct ExitArgs {
    #[serde(default)]
    final_result: String,
}

#[derive(Deserialize, Default)]
struct ApprovalArgs {
    #[serde(default)]
    plan: String,
}

/// What a tool call asks the run to do after its result is recorded.
enum Outcome {
    Continue,
    Stop(AgentAction),
}

pub struct ChatModelAgent {
    config: ChatModelAgentConfig,
}

impl ChatModelAgent {
    pub fn new(config: ChatModelAgentConfig) -> Self {
        Self { config }
    }

    pub fn instruction(&self) -> &str {
        &self.config.instruction
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tool_definitions().into_iter().map(|d| d.name).collect()
    }

    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        let mut defs = deerflow_tools::definitions(&self.config.tools);

        if !self.config.transfer_targets.is_empty() {
            let names: Vec<&str> = self
                .config
                .transfer_targets
                .iter()
                .map(|(n, _)| n.as_str())
                .collect();
            let listing: String = self
                .config
                .transfer_targets
                .iter()
                .map(|(name, desc)| format!("\n- {name}: {desc}"))
                .collect();
            defs.push(ToolDefinition {
                name: TRANSFER_TOOL.into(),
                description: format!(
                    "Transfer the task to another agent. Available agents:{listing}"
                ),
                parameters_schema: json!({
                    "type": "object",
                    "properties": {
                        "agent_name": {
                            "type": "string",
                            "enum": names,
                            "description": "Name of the agent to hand the task to",
                        }
                    },
                    "required": ["agent_name"],
                }),
                provider: String::new(),
            });
        }

        if self.config.exit {
            defs.push(ToolDefinition {
                name: EXIT_TOOL.into(),
                description: "Finish the conversation and return the final result.".into(),
                parameters_schema: json!({
                    "type": "object",
                    "properties": { "final_result": { "type": "string" } },
                }),
                provider: String::new(),
            });
        }

        if self.config.approval.is_some() {
            defs.push(ToolDefinition {
                name: APPROVAL_TOOL.into(),
                description: "Present the plan to the user and wait for approval before \
                              executing it."
                    .into(),
                parameters_schema: json!({
                    "type": "object",
                    "properties": {
                        "plan": {
                            "type": "string",
                            "description": "The plan, as shown to the user",
                        },
                    },
                    "required": ["plan"],
                }),
                provider: String::new(),
            });
        }
        defs
    }

    /// Call the model once. `None` means the run must stop; the reason was already reported.
    async fn call_model(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        tx: &EventSender,
    ) -> Option<Message> {
        let model = &self.config.model;

        if !self.config.streaming {
            return match model.complete(messages.to_vec(), tools.to_vec()).await {
                Ok(mut message) => {
                    message.role = Role::Assistant;
                    tx.send(EventKind::Output(MessageOutput::Message(message.clone())))
                        .then_some(message)
                }
                Err(e) => {
                    error!(agent = %self.config.name, %e, "Model call failed");
                    tx.send(EventKind::Error(format!("model call failed: {e}")));
                    None
                }
            };
        }

        let source = match model.stream(messages.to_vec(), tools.to_vec()).await {
            Ok(source) => source,
            Err(e) => {
                error!(agent = %self.config.name, %e, "Model stream failed");
                tx.send(EventKind::Error(format!("model call failed: {e}")));
                return None;
            }
        };

        let (chunk_tx, chunks) = MessageStream::channel();
        if !tx.send(EventKind::Output(MessageOutput::Stream(chunks))) {
            return None;
        }

        match relay(source, &chunk_tx).await {
            Ok(mut message) => {
                message.role = Role::Assistant;
                Some(message)
            }
            Err(e) => {
                warn!(agent = %self.config.name, %e, "Model stream interrupted");
                None
            }
        }
    }

    async fn handle_call(
        &self,
        call: &ToolCall,
        ctx: &RunContext,
        produced: &[Message],
    ) -> (Option<String>, Outcome) {
        let name = &self.config.name;
        match call.name() {
            TRANSFER_TOOL if !self.config.transfer_targets.is_empty() => {
                let dest = match serde_json::from_str::<TransferArgs>(call.arguments()) {
                    Ok(args) => args.agent_name,
                    Err(e) => {
                        let reason = format!("Invalid arguments for {TRANSFER_TOOL}: {e}");
                        return (Some(reason), Outcome::Continue);
                    }
                };
                if !self.config.transfer_targets.iter().any(|(n, _)| *n == dest) {
                    return (Some(format!("Unknown agent '{dest}'.")), Outcome::Continue);
                }
                let action = GatedAction::Transfer(dest.clone());
                if let Err(reason) = self.review(ctx, action, produced) {
                    return (Some(reason), Outcome::Continue);
                }
                (
                    Some(format!("Successfully transferred to agent [{dest}]")),
                    Outcome::Stop(AgentAction::TransferToAgent { dest }),
                )
            }
            EXIT_TOOL if self.config.exit => {
                if let Err(reason) = self.review(ctx, GatedAction::Exit, produced) {
                    return (Some(reason), Outcome::Continue);
                }
                let args: ExitArgs = serde_json::from_str(call.arguments()).unwrap_or_default();
                (Some(args.final_result), Outcome::Stop(AgentAction::Exit))
            }
            APPROVAL_TOOL if self.config.approval.is_some() => {
                let args: ApprovalArgs = serde_json::from_str(call.arguments()).unwrap_or_default();
                if self.config.approval == Some(ApprovalMode::AutoAccept) {
                    info!(agent = %name, "Plan auto-accepted");
                    let answer = "[ACCEPTED] The plan was accepted automatically.";
                    return (Some(answer.into()), Outcome::Continue);
                }
                let interrupt = Interrupt {
                    contexts: vec![InterruptContext {
                        id: uuid::Uuid::new_v4().to_string(),
                        agent: name.clone(),
                        kind: "plan_approval".into(),
                        info: json!({ "plan": args.plan }),
                        options: vec![
                            InterruptOption {
                                text: "Edit plan".into(),
                                value: "edit_plan".into(),
                            },
                            InterruptOption {
                                text: "Start research".into(),
                                value: "accepted".into(),
                            },
                        ],
                    }],
                    resume: ResumeState {
                        agent: name.clone(),
                        pending_call_id: call.id.clone(),
                        pending_tool: APPROVAL_TOOL.into(),
                        ..Default::default()
                    },
                };
                (None, Outcome::Stop(AgentAction::Interrupted(interrupt)))
            }
            tool_name => {
                let Some(tool) = self.config.tools.iter().find(|t| t.name() == tool_name) else {
                    return (Some(format!("Unknown tool: {tool_name}")), Outcome::Continue);
                };
                info!(agent = %name, tool = %tool_name, "Executing tool");
                match tool.invoke(call.arguments()).await {
                    Ok(output) => (Some(output), Outcome::Continue),
                    Err(e) => {
                        warn!(agent = %name, tool = %tool_name, %e, "Tool execution error");
                        (Some(format!("Tool error: {e}")), Outcome::Continue)
                    }
                }
            }
        }
    }

    fn review(
        &self,
        ctx: &RunContext,
        action: GatedAction,
        produced: &[Message],
    ) -> Result<(), String> {
        let Some(gate) = &ctx.gate else {
            return Ok(());
        };
        gate.review(&self.config.name, &action, produced).inspect_err(|reason| {
            warn!(agent = %self.config.name, ?action, %reason, "Action refused by policy gate");
        })
    }

    async fn run_loop(self: Arc<Self>, input: AgentInput, ctx: RunContext, tx: EventSender) {
        let tools = self.tool_definitions();
        let mut messages = Vec::with_capacity(input.messages.len() + 1);
        messages.push(Message::system(self.config.instruction.clone()));
        messages.extend(input.messages);
        let mut produced: Vec<Message> = Vec::new();

        for iteration in 0..self.config.max_iterations {
            debug!(agent = %self.config.name, iteration, "Agent loop iteration");
            if ctx.cancel.is_cancelled() || tx.is_closed() {
                return;
            }

            let Some(response) = self.call_model(&messages, &tools, &tx).await else {
                return;
            };
            messages.push(response.clone());
            produced.push(response.clone());

            if !response.has_tool_calls() {
                return;
            }

            let mut stop: Option<AgentAction> = None;
            for call in &response.tool_calls {
                let result = if stop.is_some() {
                    Some(format!(
                        "Skipped: {} was not executed because the run is ending.",
                        call.name()
                    ))
                } else {
                    let (result, outcome) = self.handle_call(call, &ctx, &produced).await;
                    if let Outcome::Stop(action) = outcome {
                        stop = Some(action);
                    }
                    result
                };

                if let Some(content) = result {
                    let message = Message::tool_result(call.id.clone(), call.name(), content);
                    messages.push(message.clone());
                    produced.push(message.clone());
                    if !tx.send(EventKind::Output(MessageOutput::Message(message))) {
                        return;
                    }
                }
            }

            if let Some(action) = stop {
                tx.send(EventKind::Action(action));
                return;
            }
        }

        warn!(
            agent = %self.config.name,
            max = self.config.max_iterations,
            "Tool loop limit reached"
        );
        tx.send(EventKind::Error(format!(
            "{} exceeded {} model iterations",
            self.config.name, self.config.max_iterations
        )));
    }
}

impl Agent for ChatModelAgent {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn description(&self) -> &str {
        &self.config.description
    }

    fn run(self: Arc<Self>, input: AgentInput, ctx: RunContext) -> EventStream {
        let cancel = ctx.cancel.clone();
        let name = self.config.name.clone();
        EventStream::spawn(name, cancel, move |tx| self.run_loop(input, ctx, tx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::AgentEvent;
    use deerflow_core::types::concat_messages;
    use deerflow_providers::testing::{ScriptedProvider, Turn};
    use deerflow_tools::FnTool;
    use tokio_util::sync::CancellationToken;

    fn config(provider: &ScriptedProvider, name: &str) -> ChatModelAgentConfig {
        let instruction = format!("[{name}] instruction");
        ChatModelAgentConfig::new(name, "test agent", instruction, provider.handle())
    }

    async fn drain(events: EventStream) -> Vec<AgentEvent> {
        let mut out = Vec::new();
        let mut events = events;
        while let Some(event) = events.next_event().await {
            if let EventKind::Output(MessageOutput::Stream(mut s)) = event.kind {
                let mut chunks = Vec::new();
                while let Some(chunk) = s.recv().await {
                    match chunk {
                        Ok(c) => chunks.push(c),
                        Err(e) => {
                            out.push(AgentEvent::error(event.agent_name.clone(), e));
                            break;
                        }
                    }
                }
                out.push(AgentEvent::message(event.agent_name, concat_messages(&chunks)));
            } else {
                out.push(event);
            }
        }
        out
    }

    fn contents(events: &[AgentEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::Output(MessageOutput::Message(m)) => Some(m.content.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_plain_reply_streams_one_message() {
        let provider = ScriptedProvider::new().on("[planner]", [Turn::text("1. search 2. write")]);
        let agent = Arc::new(ChatModelAgent::new(config(&provider, "planner")));
        let mut stream = agent.run(AgentInput::query("plan it"), RunContext::default());

        let first = stream.next_event().await.unwrap();
        assert_eq!(first.agent_name, "planner");
        assert!(matches!(first.kind, EventKind::Output(MessageOutput::Stream(_))));
        drop(first);
        assert!(stream.next_event().await.is_none());

        let request = &provider.requests()[0];
        assert_eq!(request.messages[0].role, Role::System);
        assert_eq!(request.messages[1].content, "plan it");
    }

    #[tokio::test]
    async fn test_tool_loop_executes_and_feeds_back() {
        let provider = ScriptedProvider::new().on(
            "[researcher]",
            [
                Turn::tool_call("web_search", r#"{"query":"rust"}"#),
                Turn::text("found it"),
            ],
        );
        let tool = FnTool::new("web_search", "search", |args| Ok(format!("results for {args}")));
        let agent = Arc::new(ChatModelAgent::new(
            config(&provider, "researcher").with_tools(vec![Arc::new(tool)]),
        ));
        let events = drain(agent.run(AgentInput::query("q"), RunContext::default())).await;

        let texts = contents(&events);
        assert_eq!(texts[1], r#"results for {"query":"rust"}"#);
        assert_eq!(texts[2], "found it");

        let second = &provider.requests()[1];
        let tool_msg = second.messages.last().unwrap();
        assert_eq!(tool_msg.role, Role::Tool);
        assert_eq!(tool_msg.tool_call_id.as_deref(), Some("call_web_search"));
        assert_eq!(second.tools[0].name, "web_search");
    }

    #[tokio::test]
    async fn test_unknown_tool_and_tool_error_become_results() {
        let provider = ScriptedProvider::new().on(
            "[coder]",
            [
                Turn::tool_calls(vec![
                    ToolCall::new("a", "missing", "{}"),
                    ToolCall::new("b", "python_exec", "{}"),
                ]),
                Turn::text("done"),
            ],
        );
        let tool = FnTool::new("python_exec", "run", |_| Err(anyhow::anyhow!("SyntaxError")));
        let agent = Arc::new(ChatModelAgent::new(
            config(&provider, "coder")
                .with_tools(vec![Arc::new(tool)])
                .with_streaming(false),
        ));
        let events = drain(agent.run(AgentInput::query("q"), RunContext::default())).await;
        let texts = contents(&events);
        assert!(texts.contains(&"Unknown tool: missing".to_string()));
        assert!(texts.contains(&"Tool error: SyntaxError".to_string()));
        assert_eq!(texts.last().unwrap(), "done");
    }

    #[tokio::test]
    async fn test_transfer_emits_action_and_rejects_unknown_target() {
        let provider = ScriptedProvider::new().on(
            "[coordinator]",
            [
                Turn::tool_call(TRANSFER_TOOL, r#"{"agent_name":"nobody"}"#),
                Turn::tool_call(TRANSFER_TOOL, r#"{"agent_name":"planner"}"#),
            ],
        );
        let mut cfg = config(&provider, "coordinator");
        cfg.transfer_targets = vec![("planner".into(), "plans".into())];
        let agent = Arc::new(ChatModelAgent::new(cfg));
        let events = drain(agent.run(AgentInput::query("q"), RunContext::default())).await;

        let texts = contents(&events);
        assert!(texts.contains(&"Unknown agent 'nobody'.".to_string()));
        assert!(texts.contains(&"Successfully transferred to agent [planner]".to_string()));
        match &events.last().unwrap().kind {
            EventKind::Action(AgentAction::TransferToAgent { dest }) => assert_eq!(dest, "planner"),
            other => panic!("expected transfer, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_approval_interrupts_with_pending_call() {
        let provider = ScriptedProvider::new().on(
            "[coordinator]",
            [Turn::tool_call(APPROVAL_TOOL, r#"{"plan":"1. research"}"#)],
        );
        let mut cfg = config(&provider, "coordinator");
        cfg.approval = Some(ApprovalMode::Interrupt);
        let agent = Arc::new(ChatModelAgent::new(cfg));
        let events = drain(agent.run(AgentInput::query("q"), RunContext::default())).await;

        match &events.last().unwrap().kind {
            EventKind::Action(AgentAction::Interrupted(interrupt)) => {
                assert_eq!(interrupt.resume.pending_call_id, "call_request_approval");
                assert_eq!(interrupt.contexts[0].info["plan"], "1. research");
                assert_eq!(interrupt.contexts[0].options[1].value, "accepted");
            }
            other => panic!("expected interrupt, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_auto_accept_answers_immediately() {
        let provider = ScriptedProvider::new().on(
            "[coordinator]",
            [Turn::tool_call(APPROVAL_TOOL, r#"{"plan":"p"}"#), Turn::text("ok")],
        );
        let mut cfg = config(&provider, "coordinator");
        cfg.approval = Some(ApprovalMode::AutoAccept);
        let agent = Arc::new(ChatModelAgent::new(cfg));
        let events = drain(agent.run(AgentInput::query("q"), RunContext::default())).await;
        assert!(contents(&events).iter().any(|t| t.starts_with("[ACCEPTED]")));
        assert!(!events.iter().any(|e| matches!(e.kind, EventKind::Action(_))));
    }

    struct DenyAll;

    impl crate::agent::ActionGate for DenyAll {
        fn review(
            &self,
            _agent: &str,
            _action: &GatedAction,
            _produced: &[Message],
        ) -> Result<(), String> {
            Err("not yet".into())
        }
    }

    #[tokio::test]
    async fn test_gate_veto_is_returned_as_tool_result() {
        let provider = ScriptedProvider::new().on(
            "[coordinator]",
            [Turn::tool_call(EXIT_TOOL, r#"{"final_result":"bye"}"#), Turn::text("ok, continuing")],
        );
        let mut cfg = config(&provider, "coordinator");
        cfg.exit = true;
        let agent = Arc::new(ChatModelAgent::new(cfg));
        let ctx = RunContext::new(CancellationToken::new()).with_gate(Arc::new(DenyAll));
        let events = drain(agent.run(AgentInput::query("q"), ctx)).await;
        assert!(contents(&events).contains(&"not yet".to_string()));
        assert!(!events.iter().any(|e| matches!(e.kind, EventKind::Action(AgentAction::Exit))));
    }

    #[tokio::test]
    async fn test_model_failure_is_error_event() {
        let provider = ScriptedProvider::new().on("[planner]", [Turn::error("401 unauthorized")]);
        let agent = Arc::new(ChatModelAgent::new(config(&provider, "planner")));
        let events = drain(agent.run(AgentInput::query("q"), RunContext::default())).await;
        assert_eq!(events.len(), 1);
        match &events[0].kind {
            EventKind::Error(e) => assert!(e.contains("401 unauthorized")),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_iteration_limit() {
        let provider = ScriptedProvider::new().on(
            "[looper]",
            (0..3).map(|_| Turn::tool_call("missing", "{}")),
        );
        let mut cfg = config(&provider, "looper");
        cfg.max_iterations = 2;
        let agent = Arc::new(ChatModelAgent::new(cfg));
        let events = drain(agent.run(AgentInput::query("q"), RunContext::default())).await;
        assert!(events.last().unwrap().is_error());
        assert_eq!(provider.requests().len(), 2);
    }
}
