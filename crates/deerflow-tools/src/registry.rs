//! Research / execution partitioning of discovered tools.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::{ToolProvider, ToolRef};

/// Handles whose name starts with this prefix feed the execution set.
pub const EXECUTION_PREFIX: &str = "python";

/// Tools discovered at startup. Read-only afterwards.
///
/// Iteration is in lexical handle order, so "first match" lookups are stable
/// across runs.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    research: Vec<ToolRef>,
    execution: Vec<ToolRef>,
    by_provider: BTreeMap<String, Vec<ToolRef>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// List every provider's tools and partition them.
    ///
    /// A provider whose listing fails is logged and skipped.
    pub async fn build(providers: &BTreeMap<String, Arc<dyn ToolProvider>>) -> Self {
        let mut registry = Self::new();

        for (handle, provider) in providers {
            let tools = match provider.list_tools().await {
                Ok(tools) => tools,
                Err(e) => {
                    warn!(
                        provider = %handle,
                        error = %e,
                        "Failed to list tools, skipping provider"
                    );
                    continue;
                }
            };
            info!(provider = %handle, count = tools.len(), "Registered tools");
            registry.insert(handle, tools);
        }

        if registry.execution.is_empty() {
            warn!("No execution tools found; the coder will run without tools");
        }
        registry
    }

    fn insert(&mut self, handle: &str, tools: Vec<ToolRef>) {
        self.research.extend(tools.iter().cloned());
        if handle.starts_with(EXECUTION_PREFIX) {
            self.execution.extend(tools.iter().cloned());
        }
        self.by_provider.insert(handle.to_string(), tools);
    }

    /// Every discovered tool.
    pub fn research_tools(&self) -> &[ToolRef] {
        &self.research
    }

    /// Tools from `python*` handles only.
    pub fn execution_tools(&self) -> &[ToolRef] {
        &self.execution
    }

    pub fn providers(&self) -> impl Iterator<Item = (&str, &[ToolRef])> {
        self.by_provider.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// First tool, in handle order then listing order, whose name ends with `suffix`.
    pub fn find_by_suffix(&self, suffix: &str) -> Option<ToolRef> {
        self.by_provider
            .values()
            .flatten()
            .find(|t| t.name().ends_with(suffix))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FnTool, StaticToolProvider};

    fn tool(name: &str) -> FnTool {
        let owned = name.to_string();
        FnTool::new(name, "test tool", move |_| Ok(owned.clone()))
    }

    fn providers() -> BTreeMap<String, Arc<dyn ToolProvider>> {
        let mut map: BTreeMap<String, Arc<dyn ToolProvider>> = BTreeMap::new();
        map.insert(
            "tavily".into(),
            Arc::new(StaticToolProvider::new("tavily", vec![tool("web_search"), tool("crawl")])),
        );
        map.insert(
            "python-repl".into(),
            Arc::new(StaticToolProvider::new("python-repl", vec![tool("python_exec")])),
        );
        map.insert("broken".into(), Arc::new(StaticToolProvider::failing("broken", "boom")));
        map
    }

    fn names(tools: &[ToolRef]) -> Vec<String> {
        let mut names: Vec<String> = tools.iter().map(|t| t.name().to_string()).collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_partitioning() {
        let registry = ToolRegistry::build(&providers()).await;
        assert_eq!(names(registry.research_tools()), vec!["crawl", "python_exec", "web_search"]);
        assert_eq!(names(registry.execution_tools()), vec!["python_exec"]);
        assert_eq!(registry.providers().count(), 2);
    }

    #[tokio::test]
    async fn test_partitioning_is_idempotent() {
        let map = providers();
        let first = ToolRegistry::build(&map).await;
        let second = ToolRegistry::build(&map).await;
        assert_eq!(names(first.research_tools()), names(second.research_tools()));
        assert_eq!(names(first.execution_tools()), names(second.execution_tools()));
    }

    #[tokio::test]
    async fn test_no_python_handle_means_empty_execution_set() {
        let mut map = providers();
        map.remove("python-repl");
        let registry = ToolRegistry::build(&map).await;
        assert!(registry.execution_tools().is_empty());
        assert_eq!(registry.research_tools().len(), 2);
    }

    #[tokio::test]
    async fn test_find_by_suffix_uses_handle_order() {
        let mut map: BTreeMap<String, Arc<dyn ToolProvider>> = BTreeMap::new();
        let zeta = StaticToolProvider::new("zeta", vec![tool("web_search")]);
        let alpha = StaticToolProvider::new("alpha", vec![tool("doc_search")]);
        map.insert("zeta".into(), Arc::new(zeta));
        map.insert("alpha".into(), Arc::new(alpha));
        let registry = ToolRegistry::build(&map).await;

        let found = registry.find_by_suffix("search").unwrap();
        assert_eq!(found.name(), "doc_search");
        assert!(registry.find_by_suffix("nothing").is_none());
    }
}
