//! YAML configuration loading and model credential resolution.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DeerError, Result};

/// Default location of the config file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "conf/deer-go.yaml";

/// Top-level deerflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub mcp: McpConfig,

    #[serde(default)]
    pub model: ModelConfig,

    #[serde(default)]
    pub setting: Setting,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpConfig {
    /// Tool-provider processes keyed by handle name.
    #[serde(default)]
    pub servers: BTreeMap<String, McpServerConfig>,
}

/// A stdio tool-provider process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Setting {
    #[serde(default = "default_max_plan_iterations")]
    pub max_plan_iterations: u32,

    #[serde(default = "default_max_step_num")]
    pub max_step_num: u32,

    /// Upper bound on agent hand-offs within one supervised run.
    #[serde(default = "default_max_transfers")]
    pub max_transfers: u32,
}

impl Default for Setting {
    fn default() -> Self {
        Self {
            max_plan_iterations: default_max_plan_iterations(),
            max_step_num: default_max_step_num(),
            max_transfers: default_max_transfers(),
        }
    }
}

fn default_max_plan_iterations() -> u32 {
    1
}

fn default_max_step_num() -> u32 {
    3
}

fn default_max_transfers() -> u32 {
    64
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_bind() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    8000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate directives (e.g. "deerflow_agent=debug").
    #[serde(default)]
    pub filters: Vec<String>,
}

fn default_log_format() -> String {
    "plain".into()
}

/// Which wire dialect the resolved model speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    OpenAi,
    Ark,
}

/// Model settings after merging config with the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModel {
    pub kind: ModelKind,
    pub model: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
}

impl ResolvedModel {
    pub fn has_credentials(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|v| !v.is_empty()).cloned()
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").expect("static regex");
    re.replace_all(input, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .into_owned()
}

impl Config {
    /// Load config from a YAML file, substituting `${ENV_VAR}` references.
    ///
    /// A missing or malformed file is an error: the process cannot start without it.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            DeerError::Config(format!("failed to read config file {}: {e}", path.display()))
        })?;
        Self::from_yaml(&raw).map_err(|e| {
            DeerError::Config(format!("failed to parse config file {}: {e}", path.display()))
        })
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let substituted = substitute_env_vars(raw);
        Ok(serde_yaml::from_str(&substituted)?)
    }

    pub fn default_path() -> PathBuf {
        PathBuf::from(DEFAULT_CONFIG_PATH)
    }

    /// Bind address and port. `PORT` in the environment overrides the configured port.
    pub fn listen_addr(&self) -> (String, u16) {
        let bind = self
            .server
            .as_ref()
            .map(|s| s.bind.clone())
            .unwrap_or_else(default_bind);
        let port = env_non_empty("PORT")
            .and_then(|p| p.parse().ok())
            .or_else(|| self.server.as_ref().map(|s| s.port))
            .unwrap_or_else(default_port);
        (bind, port)
    }

    /// Merge `model.*` with the environment.
    ///
    /// `MODEL_TYPE=ark` selects Ark and reads only `ARK_*` variables. Otherwise
    /// config values win and `OPENAI_*` variables fill the gaps.
    pub fn resolve_model(&self) -> ResolvedModel {
        if env_non_empty("MODEL_TYPE").as_deref() == Some("ark") {
            return ResolvedModel {
                kind: ModelKind::Ark,
                model: env_non_empty("ARK_MODEL").unwrap_or_default(),
                api_key: env_non_empty("ARK_API_KEY"),
                base_url: env_non_empty("ARK_BASE_URL"),
            };
        }

        ResolvedModel {
            kind: ModelKind::OpenAi,
            model: non_empty(&self.model.default_model)
                .or_else(|| env_non_empty("OPENAI_MODEL"))
                .unwrap_or_else(|| "gpt-4o".to_string()),
            api_key: non_empty(&self.model.api_key).or_else(|| env_non_empty("OPENAI_API_KEY")),
            base_url: non_empty(&self.model.base_url).or_else(|| env_non_empty("OPENAI_BASE_URL")),
        }
    }

    /// Model names advertised to clients: `OPENAI_MODEL` and `ARK_MODEL` when set.
    pub fn basic_model_names() -> Vec<String> {
        ["OPENAI_MODEL", "ARK_MODEL"]
            .iter()
            .filter_map(|name| env_non_empty(name))
            .collect()
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        for (name, server) in &self.mcp.servers {
            if server.command.trim().is_empty() {
                errors.push(format!("MCP server '{name}' has an empty command"));
            }
        }

        if self.setting.max_step_num == 0 {
            errors.push("setting.max_step_num must be at least 1".to_string());
        }

        if !self.resolve_model().has_credentials() {
            warnings.push("No model API key configured".to_string());
        }

        if !self.mcp.servers.keys().any(|name| name.starts_with("python")) {
            warnings.push(
                "No python* tool provider configured; the coder will have no tools".to_string(),
            );
        }

        (warnings, errors)
    }
}
