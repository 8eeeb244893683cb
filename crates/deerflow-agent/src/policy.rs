//! Orchestration policy: the coordinator's workflow contract and the gate
//! that enforces its checkable parts.
//!
//! The workflow itself is natural language handed to the coordinator model.
//! Two rules are enforced mechanically:
//! - no transfer to `researcher` / `coder` before the planner has produced a
//!   plan and a `request_approval` answer carrying the approval signal
//!   follows its latest output;
//! - no `exit` after research or processing ran until a finisher has run.

use std::collections::HashSet;

use deerflow_core::error::{DeerError, Result};
use deerflow_core::types::{Message, Role};

use crate::agent::{ActionGate, GatedAction};
use crate::chat_model::APPROVAL_TOOL;
use crate::event::TaggedMessage;
use crate::investigator::INVESTIGATOR;

pub const COORDINATOR: &str = "coordinator";
pub const PLANNER: &str = "planner";
pub const RESEARCHER: &str = "researcher";
pub const CODER: &str = "coder";
pub const REPORTER: &str = "reporter";
pub const PODCAST_WRITER: &str = "podcast_writer";
pub const PPT_COMPOSER: &str = "ppt_composer";

/// Terminal-output agents.
pub const FINISHERS: &[&str] = &[REPORTER, PODCAST_WRITER, PPT_COMPOSER];

/// Agents whose work requires an approved plan.
pub const STEP_AGENTS: &[&str] = &[RESEARCHER, CODER];

/// Prefix marking an approval in a `request_approval` answer.
pub const APPROVAL_SIGNAL: &str = "[ACCEPTED]";

/// Knobs that shape the workflow text.
#[derive(Debug, Clone)]
pub struct WorkflowSettings {
    pub max_step_num: u32,
    pub max_plan_iterations: u32,
    pub background_investigation: bool,
    pub locale: Option<String>,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            max_step_num: 3,
            max_plan_iterations: 1,
            background_investigation: true,
            locale: None,
        }
    }
}

/// Agent names the workflow text refers to.
pub fn referenced_agents(settings: &WorkflowSettings) -> Vec<&'static str> {
    let mut names = Vec::new();
    if settings.background_investigation {
        names.push(INVESTIGATOR);
    }
    names.extend([PLANNER, RESEARCHER, CODER, REPORTER, PODCAST_WRITER, PPT_COMPOSER]);
    names
}

/// The workflow contract appended to the coordinator's base instruction.
pub fn workflow_instruction(settings: &WorkflowSettings) -> String {
    let mut text = String::from(
        "\n\n# Workflow Management\n\n\
         You also manage the research and content generation workflow.\n\
         Your available agents are:\n",
    );
    if settings.background_investigation {
        text.push_str("- investigator: conducts initial background investigation\n");
    }
    text.push_str(
        "- planner: breaks down tasks into a research plan\n\
         - researcher: gathers information for research steps\n\
         - coder: processes data or writes code for processing steps\n\
         - reporter: generates a final report\n\
         - podcast_writer: converts content into a podcast script\n\
         - ppt_composer: creates a presentation\n\n\
         If the user request requires research, follow this workflow:\n",
    );

    let mut step = 1;
    if settings.background_investigation {
        text.push_str(&format!(
            "{step}. (Optional) If you need initial context, ask the **investigator** to search.\n"
        ));
        step += 1;
    }
    text.push_str(&format!(
        "{step}. Ask the **planner** to create a plan (Max steps: {}).\n",
        settings.max_step_num
    ));
    step += 1;
    text.push_str(&format!(
        "{step}. **Human Feedback**: call `request_approval` with the plan \
         and wait for the answer.\n   \
         - If the answer starts with [EDIT_PLAN], ask the **planner** to revise the plan \
         (at most {} revision(s)).\n   \
         - Only proceed once the answer starts with [ACCEPTED].\n",
        settings.max_plan_iterations
    ));
    step += 1;
    text.push_str(&format!(
        "{step}. Iterate through the steps in the plan:\n   \
         - If it is a research step, assign it to the **researcher**.\n   \
         - If it is a processing step, assign it to the **coder**.\n   \
         - Pass the result of previous steps to the next step if needed.\n"
    ));
    step += 1;
    text.push_str(&format!(
        "{step}. Once all steps are complete (or you have enough info), \
         choose the output format:\n   \
         - Default: ask the **reporter** to generate a final report.\n   \
         - If the user asked for a podcast: ask the **podcast_writer**.\n   \
         - If the user asked for a PPT/presentation: ask the **ppt_composer**.\n"
    ));
    step += 1;
    text.push_str(&format!(
        "{step}. Call `exit` with the final result.\n\n\
         Always follow this flow for complex tasks. Do not skip planning.\n"
    ));

    if let Some(locale) = settings.locale.as_deref().filter(|l| !l.is_empty()) {
        text.push_str(&format!("\nAlways respond in the language of locale `{locale}`.\n"));
    }
    text
}

/// Fail unless every name the policy refers to is a registered agent.
pub fn validate_roster<'a>(
    referenced: &[&str],
    registered: impl IntoIterator<Item = &'a str>,
) -> Result<()> {
    let registered: HashSet<&str> = registered.into_iter().collect();
    let missing: Vec<&str> = referenced
        .iter()
        .copied()
        .filter(|name| !registered.contains(name))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(DeerError::Agent(format!(
            "coordinator policy references unregistered agents: {}",
            missing.join(", ")
        )))
    }
}

/// Only answers to `request_approval` count; model-authored text never does.
fn is_approval(message: &Message) -> bool {
    message.role == Role::Tool
        && message.name.as_deref() == Some(APPROVAL_TOOL)
        && message
            .content
            .trim_start()
            .get(..APPROVAL_SIGNAL.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(APPROVAL_SIGNAL))
}

/// Checks transfers and exits against the supervised history.
pub struct PolicyGate {
    history: Vec<TaggedMessage>,
}

impl PolicyGate {
    /// `history` is the supervised history at the start of the gated run.
    pub fn new(history: Vec<TaggedMessage>) -> Self {
        Self { history }
    }

    fn check(
        &self,
        agent: &str,
        action: &GatedAction,
        produced: &[Message],
    ) -> std::result::Result<(), String> {
        let timeline: Vec<(&str, &Message)> = self
            .history
            .iter()
            .map(|t| (t.agent.as_str(), &t.message))
            .chain(produced.iter().map(|m| (agent, m)))
            .collect();

        match action {
            GatedAction::Transfer(dest) if STEP_AGENTS.contains(&dest.as_str()) => {
                let Some(plan_at) = timeline
                    .iter()
                    .rposition(|(a, m)| *a == PLANNER && m.role == Role::Assistant)
                else {
                    return Err(format!(
                        "Cannot transfer to {dest}: the planner has not produced a plan yet. \
                         Ask the planner first."
                    ));
                };
                if !timeline[plan_at + 1..].iter().any(|(_, m)| is_approval(m)) {
                    return Err(format!(
                        "Cannot transfer to {dest}: the latest plan has not been approved. \
                         Call request_approval and wait for an [ACCEPTED] answer."
                    ));
                }
                Ok(())
            }
            GatedAction::Transfer(_) => Ok(()),
            GatedAction::Exit => {
                let worked = timeline.iter().any(|(a, _)| STEP_AGENTS.contains(a));
                let finished = timeline.iter().any(|(a, _)| FINISHERS.contains(a));
                if worked && !finished {
                    return Err(
                        "Cannot exit yet: research ran but no final output was produced. \
                         Ask the reporter (or podcast_writer / ppt_composer) first."
                            .into(),
                    );
                }
                Ok(())
            }
        }
    }
}

impl ActionGate for PolicyGate {
    fn review(
        &self,
        agent: &str,
        action: &GatedAction,
        produced: &[Message],
    ) -> std::result::Result<(), String> {
        self.check(agent, action, produced)
    }
}
