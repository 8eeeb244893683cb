//! Prompt templates, loaded once at startup and read-only afterwards.

use std::collections::HashMap;
use std::path::Path;

use tracing::debug;

use crate::error::{DeerError, Result};

/// Template keys every agent set needs.
pub const PROMPT_KEYS: &[&str] = &[
    "planner",
    "researcher",
    "coder",
    "reporter",
    "podcast_script_writer",
    "ppt_composer",
    "coordinator",
];

/// Placeholder replaced with the current RFC 3339 timestamp at agent construction.
pub const CURRENT_TIME_PLACEHOLDER: &str = "{{ CURRENT_TIME }}";

/// Prompt templates keyed by agent name.
#[derive(Debug, Clone, Default)]
pub struct PromptStore {
    templates: HashMap<String, String>,
}

impl PromptStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `<key>.md` for every key in [`PROMPT_KEYS`] from `dir`.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut store = Self::new();
        for key in PROMPT_KEYS {
            let path = dir.join(format!("{key}.md"));
            let content = std::fs::read_to_string(&path).map_err(|e| {
                let path = path.display();
                DeerError::Prompt(format!("failed to load prompt {key} from {path}: {e}"))
            })?;
            debug!(key, bytes = content.len(), "Loaded prompt template");
            store.insert(*key, content);
        }
        Ok(store)
    }

    pub fn insert(&mut self, key: impl Into<String>, template: impl Into<String>) {
        self.templates.insert(key.into(), template.into());
    }

    /// Look up a template. A missing key is a construction error for the agent that needs it.
    pub fn get(&self, key: &str) -> Result<&str> {
        self.templates
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| DeerError::Prompt(format!("{key} prompt not found")))
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

/// Replace every `{{ CURRENT_TIME }}` in `template` with `now`.
pub fn render_current_time(template: &str, now: &str) -> String {
    template.replace(CURRENT_TIME_PLACEHOLDER, now)
}
