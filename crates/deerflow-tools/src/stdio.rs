//! Tool provider backed by a child process speaking MCP over stdio.
//!
//! Messages are newline-delimited JSON-RPC 2.0. Requests are serialized
//! through one lock: a request is written, then lines are read until the
//! response with the matching id arrives. Server notifications in between
//! are skipped.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use deerflow_core::config::McpServerConfig;

use crate::{Tool, ToolProvider, ToolRef};

const PROTOCOL_VERSION: &str = "2024-11-05";
const INIT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Clone, Deserialize)]
struct McpToolInfo {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    input_schema: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ListToolsResult {
    #[serde(default)]
    tools: Vec<McpToolInfo>,
}

#[derive(Debug, Deserialize)]
struct CallToolResult {
    #[serde(default)]
    content: Vec<ContentItem>,
    #[serde(rename = "isError", default)]
    is_error: bool,
}

#[derive(Debug, Deserialize)]
struct ContentItem {
    #[serde(rename = "type")]
    content_type: String,
    #[serde(default)]
    text: Option<String>,
}

impl CallToolResult {
    fn text(&self) -> String {
        self.content
            .iter()
            .filter(|item| item.content_type == "text")
            .filter_map(|item| item.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

struct Pipes {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

struct Connection {
    name: String,
    config: McpServerConfig,
    pipes: Mutex<Option<Pipes>>,
    next_id: AtomicU64,
}

impl Connection {
    async fn spawn(&self) -> anyhow::Result<()> {
        let mut guard = self.pipes.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let mut child = Command::new(&self.config.command)
            .args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                anyhow::anyhow!("{}: failed to spawn '{}': {e}", self.name, self.config.command)
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("{}: child stdin unavailable", self.name))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("{}: child stdout unavailable", self.name))?;

        *guard = Some(Pipes {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        });
        Ok(())
    }

    async fn write(pipes: &mut Pipes, message: &JsonRpcRequest<'_>) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');
        pipes.stdin.write_all(line.as_bytes()).await?;
        pipes.stdin.flush().await?;
        Ok(())
    }

    async fn request(&self, method: &str, params: Option<Value>) -> anyhow::Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut guard = self.pipes.lock().await;
        let pipes = guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("{}: provider is not running", self.name))?;

        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: Some(id),
            method,
            params,
        };
        Self::write(pipes, &request).await?;

        loop {
            let line = pipes
                .stdout
                .next_line()
                .await?
                .ok_or_else(|| anyhow::anyhow!("{}: provider closed its output", self.name))?;
            if line.trim().is_empty() {
                continue;
            }
            let response: JsonRpcResponse = match serde_json::from_str(&line) {
                Ok(r) => r,
                Err(e) => {
                    debug!(provider = %self.name, error = %e, "Skipping non-JSON-RPC line");
                    continue;
                }
            };
            if response.id != Some(id) {
                continue;
            }
            if let Some(error) = response.error {
                anyhow::bail!("{}: [{}] {}", self.name, error.code, error.message);
            }
            return response
                .result
                .ok_or_else(|| anyhow::anyhow!("{}: response without result", self.name));
        }
    }

    async fn notify(&self, method: &str) -> anyhow::Result<()> {
        let mut guard = self.pipes.lock().await;
        let pipes = guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("{}: provider is not running", self.name))?;
        let message = JsonRpcRequest {
            jsonrpc: "2.0",
            id: None,
            method,
            params: None,
        };
        Self::write(pipes, &message).await
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(mut pipes) = self.pipes.lock().await.take() {
            drop(pipes.stdin);
            if let Err(e) = pipes.child.kill().await {
                warn!(provider = %self.name, error = %e, "Failed to kill provider process");
            }
        }
        Ok(())
    }
}

/// A provider process launched from `mcp.servers.<handle>` config.
pub struct StdioToolProvider {
    conn: Arc<Connection>,
}

impl StdioToolProvider {
    pub fn new(name: impl Into<String>, config: McpServerConfig) -> Self {
        Self {
            conn: Arc::new(Connection {
                name: name.into(),
                config,
                pipes: Mutex::new(None),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    async fn handshake(&self) -> anyhow::Result<()> {
        self.conn.spawn().await?;
        let result = self
            .conn
            .request(
                "initialize",
                Some(json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": "deerflow",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                })),
            )
            .await?;
        let server = result
            .pointer("/serverInfo/name")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        info!(provider = %self.conn.name, server, "Tool provider initialized");
        self.conn.notify("notifications/initialized").await
    }
}

#[async_trait]
impl ToolProvider for StdioToolProvider {
    fn name(&self) -> &str {
        &self.conn.name
    }

    async fn initialize(&self) -> anyhow::Result<()> {
        match tokio::time::timeout(INIT_TIMEOUT, self.handshake()).await {
            Ok(result) => result,
            Err(_) => {
                self.conn.shutdown().await?;
                anyhow::bail!(
                    "{}: initialize timed out after {}s",
                    self.conn.name,
                    INIT_TIMEOUT.as_secs()
                )
            }
        }
    }

    async fn list_tools(&self) -> anyhow::Result<Vec<ToolRef>> {
        let result = self.conn.request("tools/list", None).await?;
        let listed: ListToolsResult = serde_json::from_value(result)?;
        Ok(listed
            .tools
            .into_iter()
            .map(|info| {
                Arc::new(McpTool {
                    conn: self.conn.clone(),
                    info,
                }) as ToolRef
            })
            .collect())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.conn.shutdown().await
    }
}

/// A tool living in a provider process.
struct McpTool {
    conn: Arc<Connection>,
    info: McpToolInfo,
}

#[async_trait]
impl Tool for McpTool {
    fn name(&self) -> &str {
        &self.info.name
    }

    fn description(&self) -> &str {
        self.info.description.as_deref().unwrap_or_default()
    }

    fn parameters_schema(&self) -> Value {
        self.info
            .input_schema
            .clone()
            .unwrap_or_else(|| json!({ "type": "object", "properties": {} }))
    }

    fn provider(&self) -> &str {
        &self.conn.name
    }

    async fn invoke(&self, arguments: &str) -> anyhow::Result<String> {
        let arguments: Value = if arguments.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(arguments)
                .map_err(|e| anyhow::anyhow!("invalid arguments for {}: {e}", self.info.name))?
        };
        debug!(provider = %self.conn.name, tool = %self.info.name, "Calling tool");

        let result = self
            .conn
            .request("tools/call", Some(json!({ "name": self.info.name, "arguments": arguments })))
            .await?;
        let result: CallToolResult = serde_json::from_value(result)?;
        if result.is_error {
            anyhow::bail!("{} failed: {}", self.info.name, result.text());
        }
        Ok(result.text())
    }
}
