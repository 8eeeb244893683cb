//! Background investigator: one search call, no model.

use std::sync::Arc;

use serde_json::json;
use tracing::{error, info, warn};

use deerflow_core::types::Message;
use deerflow_tools::ToolRegistry;

use crate::agent::{Agent, AgentInput, RunContext};
use crate::event::{EventKind, MessageOutput};
use crate::stream::EventStream;

pub const INVESTIGATOR: &str = "investigator";

const SEARCH_SUFFIX: &str = "search";

pub struct Investigator {
    registry: Arc<ToolRegistry>,
}

impl Investigator {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    async fn investigate(&self, input: AgentInput) -> Message {
        let Some(last) = input.messages.last() else {
            return Message::assistant("");
        };
        let query = last.content.clone();

        let Some(tool) = self.registry.find_by_suffix(SEARCH_SUFFIX) else {
            warn!("No search tool found for background investigation");
            return Message::assistant("No search tool available for background investigation.");
        };

        info!(tool = %tool.name(), provider = %tool.provider(), "Running background investigation");
        let args = json!({ "query": query }).to_string();
        match tool.invoke(&args).await {
            Ok(result) => Message::assistant(format!("Background Investigation Result: {result}")),
            Err(e) => {
                error!(tool = %tool.name(), %e, "Background investigation failed");
                Message::assistant(format!("Background investigation failed: {e}"))
            }
        }
    }
}

impl Agent for Investigator {
    fn name(&self) -> &str {
        INVESTIGATOR
    }

    fn description(&self) -> &str {
        "Conducts initial background investigation using search tools. \
         Useful for gathering context before planning."
    }

    fn run(self: Arc<Self>, input: AgentInput, ctx: RunContext) -> EventStream {
        EventStream::spawn(INVESTIGATOR, ctx.cancel, move |tx| async move {
            let message = self.investigate(input).await;
            tx.send(EventKind::Output(MessageOutput::Message(message)));
        })
    }
}
