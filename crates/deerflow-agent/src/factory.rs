//! Per-request assembly of the agent set.
//!
//! Prompts and tools are shared process-wide and read-only; every request
//! gets fresh agents and fresh model handles.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use tracing::debug;

use deerflow_core::config::Setting;
use deerflow_core::error::Result;
use deerflow_core::prompts::{PromptStore, render_current_time};
use deerflow_providers::ModelSource;
use deerflow_tools::{ToolRef, ToolRegistry};

use crate::agent::Agent;
use crate::chat_model::{ApprovalMode, ChatModelAgent, ChatModelAgentConfig};
use crate::investigator::Investigator;
use crate::policy::{
    CODER, COORDINATOR, PLANNER, PODCAST_WRITER, PPT_COMPOSER, REPORTER, RESEARCHER,
    WorkflowSettings, referenced_agents, validate_roster, workflow_instruction,
};
use crate::supervisor::SupervisorAgent;

/// Per-request knobs.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub max_step_num: Option<u32>,
    pub max_plan_iterations: Option<u32>,
    pub auto_accepted_plan: bool,
    pub enable_background_investigation: bool,
    pub locale: Option<String>,
    pub streaming: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            max_step_num: None,
            max_plan_iterations: None,
            auto_accepted_plan: false,
            enable_background_investigation: true,
            locale: None,
            streaming: true,
        }
    }
}

/// Builds the supervisor and its delegates from shared, read-only parts.
pub struct AgentFactory {
    prompts: Arc<PromptStore>,
    registry: Arc<ToolRegistry>,
    models: Arc<dyn ModelSource>,
    setting: Setting,
}

impl AgentFactory {
    pub fn new(
        prompts: Arc<PromptStore>,
        registry: Arc<ToolRegistry>,
        models: Arc<dyn ModelSource>,
        setting: Setting,
    ) -> Self {
        Self {
            prompts,
            registry,
            models,
            setting,
        }
    }

    /// Whether the configured model can authenticate.
    pub fn has_credentials(&self) -> bool {
        self.models.has_credentials()
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    fn chat_agent(
        &self,
        name: &str,
        prompt_key: &str,
        description: &str,
        instruction: Option<String>,
        tools: &[ToolRef],
        options: &RequestOptions,
    ) -> Result<ChatModelAgentConfig> {
        let instruction = match instruction {
            Some(instruction) => instruction,
            None => self.prompts.get(prompt_key)?.to_string(),
        };
        Ok(
            ChatModelAgentConfig::new(name, description, instruction, self.models.model())
                .with_tools(tools.to_vec())
                .with_streaming(options.streaming),
        )
    }

    /// Assemble a fresh agent set for one request.
    pub fn build(&self, options: &RequestOptions) -> Result<Arc<SupervisorAgent>> {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let none: &[ToolRef] = &[];

        let planner = self.chat_agent(
            PLANNER,
            "planner",
            "Responsible for breaking down complex tasks into executable steps. \
             Call this agent when you need to create a plan.",
            None,
            none,
            options,
        )?;
        let researcher = self.chat_agent(
            RESEARCHER,
            "researcher",
            "Responsible for executing research tasks. \
             Call this agent when you need to gather information.",
            None,
            self.registry.research_tools(),
            options,
        )?;
        let coder_instruction = render_current_time(self.prompts.get("coder")?, &now);
        let coder = self.chat_agent(
            CODER,
            "coder",
            "Responsible for writing code. Call this agent when you need to generate code.",
            Some(coder_instruction),
            self.registry.execution_tools(),
            options,
        )?;
        let reporter = self.chat_agent(
            REPORTER,
            "reporter",
            "Responsible for generating the final report based on the findings.",
            None,
            none,
            options,
        )?;
        let podcast_writer = self.chat_agent(
            PODCAST_WRITER,
            "podcast_script_writer",
            "Responsible for converting content into a podcast script.",
            None,
            none,
            options,
        )?;
        let ppt_composer = self.chat_agent(
            PPT_COMPOSER,
            "ppt_composer",
            "Responsible for creating a markdown presentation from content.",
            None,
            none,
            options,
        )?;

        let configs = [planner, researcher, coder, reporter, podcast_writer, ppt_composer];
        let mut delegates: Vec<Arc<dyn Agent>> = configs
            .into_iter()
            .map(|config| Arc::new(ChatModelAgent::new(config)) as Arc<dyn Agent>)
            .collect();
        if options.enable_background_investigation {
            delegates.push(Arc::new(Investigator::new(self.registry.clone())));
        }

        let settings = WorkflowSettings {
            max_step_num: options.max_step_num.unwrap_or(self.setting.max_step_num),
            max_plan_iterations: options
                .max_plan_iterations
                .unwrap_or(self.setting.max_plan_iterations),
            background_investigation: options.enable_background_investigation,
            locale: options.locale.clone(),
        };
        validate_roster(&referenced_agents(&settings), delegates.iter().map(|a| a.name()))?;

        let base = render_current_time(self.prompts.get("coordinator")?, &now);
        let mut coordinator = self.chat_agent(
            COORDINATOR,
            "coordinator",
            "Coordinates the planning and execution process.",
            Some(base + &workflow_instruction(&settings)),
            none,
            options,
        )?;
        coordinator.transfer_targets = delegates
            .iter()
            .map(|a| (a.name().to_string(), a.description().to_string()))
            .collect();
        coordinator.exit = true;
        coordinator.approval = Some(if options.auto_accepted_plan {
            ApprovalMode::AutoAccept
        } else {
            ApprovalMode::Interrupt
        });

        debug!(
            delegates = delegates.len(),
            max_step_num = settings.max_step_num,
            "Assembled agent set"
        );
        let supervisor = SupervisorAgent::new(
            Arc::new(ChatModelAgent::new(coordinator)),
            delegates,
            self.setting.max_transfers,
        )?;
        Ok(Arc::new(supervisor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deerflow_core::error::DeerError;
    use deerflow_core::prompts::PROMPT_KEYS;
    use deerflow_providers::testing::ScriptedProvider;

    fn prompts() -> PromptStore {
        let mut store = PromptStore::new();
        for key in PROMPT_KEYS {
            store.insert(*key, format!("[{key}] time={{{{ CURRENT_TIME }}}}"));
        }
        store
    }

    fn factory(store: PromptStore) -> AgentFactory {
        AgentFactory::new(
            Arc::new(store),
            Arc::new(ToolRegistry::new()),
            Arc::new(ScriptedProvider::new().handle()),
            Setting::default(),
        )
    }

    #[test]
    fn test_builds_full_roster() {
        let supervisor = factory(prompts()).build(&RequestOptions::default()).unwrap();
        let names: Vec<&str> = supervisor.agent_names().collect();
        assert_eq!(
            names,
            vec![
                "coder",
                "investigator",
                "planner",
                "podcast_writer",
                "ppt_composer",
                "reporter",
                "researcher",
            ]
        );
        assert_eq!(supervisor.name(), "coordinator");
    }

    #[test]
    fn test_investigation_can_be_disabled() {
        let options = RequestOptions {
            enable_background_investigation: false,
            ..Default::default()
        };
        let supervisor = factory(prompts()).build(&options).unwrap();
        assert!(!supervisor.agent_names().any(|n| n == "investigator"));
    }

    #[test]
    fn test_missing_prompt_is_fatal() {
        let mut store = PromptStore::new();
        for key in PROMPT_KEYS.iter().filter(|k| **k != "reporter") {
            store.insert(*key, "x");
        }
        let err = factory(store).build(&RequestOptions::default()).err().unwrap();
        assert!(matches!(err, DeerError::Prompt(_)));
        assert!(err.to_string().contains("reporter prompt not found"));
    }
}
