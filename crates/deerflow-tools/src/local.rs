//! In-process tools and a provider that serves a fixed list of them.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{Tool, ToolProvider, ToolRef};

type Handler = dyn Fn(&str) -> anyhow::Result<String> + Send + Sync;

/// A tool backed by a closure.
pub struct FnTool {
    name: String,
    description: String,
    schema: serde_json::Value,
    provider: String,
    handler: Arc<Handler>,
}

impl FnTool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        handler: impl Fn(&str) -> anyhow::Result<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema: serde_json::json!({
                "type": "object",
                "properties": { "query": { "type": "string" } },
            }),
            provider: String::new(),
            handler: Arc::new(handler),
        }
    }

    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.schema = schema;
        self
    }

    fn for_provider(&self, provider: &str) -> Self {
        Self {
            name: self.name.clone(),
            description: self.description.clone(),
            schema: self.schema.clone(),
            provider: provider.to_string(),
            handler: self.handler.clone(),
        }
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> serde_json::Value {
        self.schema.clone()
    }

    fn provider(&self) -> &str {
        &self.provider
    }

    async fn invoke(&self, arguments: &str) -> anyhow::Result<String> {
        (self.handler)(arguments)
    }
}

/// Provider serving a fixed tool list, or failing every listing.
pub struct StaticToolProvider {
    name: String,
    tools: Vec<FnTool>,
    listing_error: Option<String>,
}

impl StaticToolProvider {
    pub fn new(name: impl Into<String>, tools: Vec<FnTool>) -> Self {
        Self {
            name: name.into(),
            tools,
            listing_error: None,
        }
    }

    /// A provider whose listing call always errors.
    pub fn failing(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tools: Vec::new(),
            listing_error: Some(error.into()),
        }
    }
}

#[async_trait]
impl ToolProvider for StaticToolProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn list_tools(&self) -> anyhow::Result<Vec<ToolRef>> {
        if let Some(error) = &self.listing_error {
            anyhow::bail!("{}: {error}", self.name);
        }
        Ok(self
            .tools
            .iter()
            .map(|t| Arc::new(t.for_provider(&self.name)) as ToolRef)
            .collect())
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
