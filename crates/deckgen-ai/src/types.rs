use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One conversation turn, provider-agnostic.
///
/// The assistant variant is an opaque passthrough: it carries the exact
/// content object the provider returned so it can be replayed verbatim on
/// the next round-trip. Providers embed internal state there (thought
/// signatures, citations) that must survive the round-trip untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role")]
pub enum Message {
    #[serde(rename = "system")]
    System { content: String },
    #[serde(rename = "user")]
    User { content: String },
    #[serde(rename = "assistant")]
    Assistant { provider: String, content: Value },
    #[serde(rename = "toolResult")]
    ToolResult { name: String, response: Value },
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Message::System {
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Message::User {
            content: content.into(),
        }
    }

    pub fn assistant(provider: impl Into<String>, content: Value) -> Self {
        Message::Assistant {
            provider: provider.into(),
            content,
        }
    }

    pub fn tool_result(name: impl Into<String>, response: Value) -> Self {
        Message::ToolResult {
            name: name.into(),
            response,
        }
    }
}

/// The first system message wins; later ones are ignored rather than merged.
pub fn system_prompt(messages: &[Message]) -> String {
    messages
        .iter()
        .find_map(|message| match message {
            Message::System { content } => Some(content.clone()),
            _ => None,
        })
        .unwrap_or_default()
}

/// A function-invocation request emitted by the provider. `id` is absent for
/// providers that correlate results by order instead of explicit ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub arguments: Value,
}

/// Token counters for a single provider round-trip. Reported per depth,
/// never summed across the tool-calling recursion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Usage {
    #[serde(rename = "inputTokens")]
    pub input_tokens: u64,
    #[serde(rename = "outputTokens")]
    pub output_tokens: u64,
    #[serde(rename = "totalTokens")]
    pub total_tokens: u64,
}

/// A normalized piece of a provider response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ResponsePart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "toolCall")]
    ToolCall { call: ToolCall },
}

/// Provider-format tool declaration, ready for the wire. Parameter schemas
/// are already flattened and title-stripped by the time one of these exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// One round-trip request in abstract form.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GenerateRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub max_tokens: Option<u32>,
    pub tools: Option<Vec<FunctionDeclaration>>,
    /// Native structured-output constraint; mutually exclusive with `tools`.
    pub response_schema: Option<Value>,
    /// Forces the provider into tool-calling mode (used when a synthetic
    /// response-schema tool is injected alongside real tools).
    pub force_tool_calls: bool,
}

/// Normalized non-streaming response. `content` is the opaque replay blob;
/// an empty response is `parts: []` with `content: None`, not an error.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawResponse {
    pub content: Option<Value>,
    pub parts: Vec<ResponsePart>,
    pub usage: Option<Usage>,
}

impl RawResponse {
    /// Last non-empty text segment wins when a response carries several.
    pub fn text_content(&self) -> Option<String> {
        self.parts
            .iter()
            .filter_map(|part| match part {
                ResponsePart::Text { text } if !text.is_empty() => Some(text.clone()),
                _ => None,
            })
            .last()
    }

    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.parts
            .iter()
            .filter_map(|part| match part {
                ResponsePart::ToolCall { call } => Some(call.clone()),
                _ => None,
            })
            .collect()
    }
}

/// One incremental event of a streaming round-trip. A chunk carrying usage
/// but no parts is valid and only updates the running counters.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    pub parts: Vec<ResponsePart>,
    pub content: Option<Value>,
    pub usage: Option<Usage>,
}
