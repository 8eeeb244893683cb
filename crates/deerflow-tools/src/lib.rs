//! Tool providers and the tool registry.
//!
//! A [`ToolProvider`] is a named handle that lists invokable [`Tool`]s. The
//! [`registry::ToolRegistry`] partitions everything discovered at startup
//! into a research set and a python-only execution set.

use async_trait::async_trait;
use std::sync::Arc;

use deerflow_core::types::ToolDefinition;

pub mod local;
pub mod registry;
pub mod stdio;

pub use local::{FnTool, StaticToolProvider};
pub use registry::ToolRegistry;
pub use stdio::StdioToolProvider;

/// A callable tool exposed to the model.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name as exposed to the LLM (e.g., "web_search").
    fn name(&self) -> &str;

    /// Human-readable description for the LLM.
    fn description(&self) -> &str;

    /// JSON Schema describing the arguments object.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Handle name of the provider that owns this tool. Empty for built-ins.
    fn provider(&self) -> &str {
        ""
    }

    /// Invoke with the raw argument string the model produced.
    async fn invoke(&self, arguments: &str) -> anyhow::Result<String>;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters_schema: self.parameters_schema(),
            provider: self.provider().to_string(),
        }
    }
}

/// A shared handle to a tool.
pub type ToolRef = Arc<dyn Tool>;

/// A connection to something that offers tools.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    /// Handle name the provider was registered under.
    fn name(&self) -> &str;

    /// Bring the provider up. Called once before any listing.
    async fn initialize(&self) -> anyhow::Result<()>;

    /// Tools currently offered by this provider.
    async fn list_tools(&self) -> anyhow::Result<Vec<ToolRef>>;

    /// Release the provider. Safe to call more than once.
    async fn close(&self) -> anyhow::Result<()>;
}

/// Definitions for a set of tools, in order.
pub fn definitions(tools: &[ToolRef]) -> Vec<ToolDefinition> {
    tools.iter().map(|t| t.definition()).collect()
}
