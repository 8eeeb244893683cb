//! Conversation messages, tool calls, and streamed tool-call delta handling.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Author of a message in a conversation history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    #[default]
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// Function name and raw argument text of a tool call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    #[serde(default)]
    pub name: String,
    /// Opaque argument string, usually JSON. Never parsed here.
    #[serde(default)]
    pub arguments: String,
}

/// A tool call requested by the model.
///
/// When `index` is set the value is a partial delta: one streamed fragment of
/// the logical call at that index. Deltas sharing an index are concatenated
/// with [`concat_tool_calls`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub call_type: String,
    #[serde(default)]
    pub function: FunctionCall,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
}

impl ToolCall {
    /// A complete (non-streamed) function call.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            call_type: "function".into(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
            index: None,
        }
    }

    /// A streamed fragment of the call at `index`. Empty strings mean "not carried by this delta".
    pub fn delta(
        index: usize,
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            call_type: if id.is_empty() { String::new() } else { "function".into() },
            id,
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
            index: Some(index),
        }
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }

    pub fn arguments(&self) -> &str {
        &self.function.arguments
    }
}

/// A callable tool as advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments object.
    pub parameters_schema: serde_json::Value,
    /// Handle name of the provider that executes the call.
    #[serde(default)]
    pub provider: String,
}

/// One message of a conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Set on tool-role messages: the id of the call this message answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Set on tool-role messages: the name of the tool that produced it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn assistant_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls,
            ..Self::default()
        }
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
            name: Some(tool_name.into()),
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

fn first_non_empty<'a>(values: impl Iterator<Item = &'a str>) -> String {
    values
        .into_iter()
        .find(|v| !v.is_empty())
        .unwrap_or_default()
        .to_string()
}

/// Merge the deltas of one logical tool call.
///
/// Arguments are concatenated in arrival order. `id`, `type`, and the
/// function name come from the first delta carrying a non-empty value.
/// Returns `None` for an empty slice.
pub fn concat_tool_calls(deltas: &[ToolCall]) -> Option<ToolCall> {
    let first = deltas.first()?;
    let arguments: String = deltas.iter().map(|d| d.function.arguments.as_str()).collect();

    Some(ToolCall {
        id: first_non_empty(deltas.iter().map(|d| d.id.as_str())),
        call_type: first_non_empty(deltas.iter().map(|d| d.call_type.as_str())),
        function: FunctionCall {
            name: first_non_empty(deltas.iter().map(|d| d.function.name.as_str())),
            arguments,
        },
        index: first.index,
    })
}

/// Groups streamed tool-call deltas by index and resolves them into complete calls.
///
/// Resolution order is ascending index, not arrival order. Calls without an
/// index are already complete; they are kept in arrival order after the
/// indexed ones.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    by_index: BTreeMap<usize, Vec<ToolCall>>,
    complete: Vec<ToolCall>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, call: &ToolCall) {
        match call.index {
            Some(index) => self.by_index.entry(index).or_default().push(call.clone()),
            None => self.complete.push(call.clone()),
        }
    }

    pub fn extend<'a>(&mut self, calls: impl IntoIterator<Item = &'a ToolCall>) {
        for call in calls {
            self.push(call);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.by_index.is_empty() && self.complete.is_empty()
    }

    /// Deltas received so far for `index`, in arrival order.
    pub fn deltas(&self, index: usize) -> &[ToolCall] {
        self.by_index.get(&index).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn resolve(&self) -> Vec<ToolCall> {
        self.by_index
            .values()
            .filter_map(|deltas| concat_tool_calls(deltas))
            .chain(self.complete.iter().cloned())
            .collect()
    }
}

/// Merge the chunks of one streamed message into a complete message.
///
/// Content is concatenated in order, tool-call deltas are resolved through a
/// [`ToolCallAccumulator`], and role / `tool_call_id` / `name` come from the
/// first chunk that carries them.
pub fn concat_messages(chunks: &[Message]) -> Message {
    let mut acc = ToolCallAccumulator::new();
    let mut content = String::new();
    for chunk in chunks {
        content.push_str(&chunk.content);
        acc.extend(&chunk.tool_calls);
    }

    Message {
        role: chunks.first().map(|c| c.role).unwrap_or_default(),
        content,
        tool_calls: acc.resolve(),
        tool_call_id: chunks.iter().find_map(|c| c.tool_call_id.clone()),
        name: chunks.iter().find_map(|c| c.name.clone()),
    }
}
