use std::env;

use serde_json::{json, Map, Value};
use tracing::{info, warn};

use super::common::{join_url, shared_http_client, truncate_for_details};
use crate::error::{LlmError, LlmErrorCode};
use crate::event_stream::RawEventStream;
use crate::provider::{ProviderAdapter, ProviderFuture};
use crate::types::{
    system_prompt, GenerateRequest, Message, RawEvent, RawResponse, ResponsePart, ToolCall, Usage,
};

const GEMINI_API_KEY_ENVS: &[&str] = &["GEMINI_API_KEY", "GOOGLE_API_KEY"];
const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GeminiAdapter {
    api_key: String,
    base_url: String,
}

impl GeminiAdapter {
    /// Fails fast when no API key is configured; a missing credential is a
    /// configuration error at construction, not a per-call error.
    pub fn new() -> Result<Self, LlmError> {
        let api_key = resolve_api_key()?;
        Ok(Self {
            api_key,
            base_url: DEFAULT_GEMINI_BASE_URL.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn endpoint(&self, model: &str, method: &str) -> String {
        join_url(&self.base_url, &model_path(model, method))
    }
}

impl ProviderAdapter for GeminiAdapter {
    fn name(&self) -> &str {
        "google"
    }

    fn complete(&self, request: GenerateRequest) -> ProviderFuture<RawResponse> {
        let endpoint = self.endpoint(&request.model, "generateContent");
        let payload = build_payload(&request);
        let client = CallContext {
            endpoint,
            payload,
            api_key: self.api_key.clone(),
        };
        Box::pin(async move {
            let body = client.post().await?;
            let parsed: Value = serde_json::from_str(&body).map_err(|error| {
                LlmError::new(
                    LlmErrorCode::ProviderProtocol,
                    format!("Invalid Gemini response JSON: {error}"),
                )
                .with_details(json!({ "bodyPrefix": truncate_for_details(&body, 800) }))
            })?;

            let chunk = parse_chunk(&parsed);
            if let Some(usage) = &chunk.usage {
                log_usage(usage);
            }
            Ok(RawResponse {
                content: chunk.content,
                parts: chunk.parts,
                usage: chunk.usage,
            })
        })
    }

    fn stream(&self, request: GenerateRequest) -> Result<RawEventStream, LlmError> {
        let endpoint = self.endpoint(&request.model, "streamGenerateContent") + "?alt=sse";
        let payload = build_payload(&request);
        let client = CallContext {
            endpoint,
            payload,
            api_key: self.api_key.clone(),
        };

        let stream: RawEventStream = RawEventStream::new();
        let writer = stream.clone();
        spawn_provider_task(async move {
            let outcome = run_stream(&client, &writer).await;
            if let Err(error) = &outcome {
                warn!(code = ?error.code, error = error.message.as_str(), "gemini stream failed");
            }
            writer.end(Some(outcome));
        });
        Ok(stream)
    }
}

struct CallContext {
    endpoint: String,
    payload: Value,
    api_key: String,
}

impl CallContext {
    async fn send(&self) -> Result<reqwest::Response, LlmError> {
        let response = shared_http_client()
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .header("x-goog-api-key", &self.api_key)
            .json(&self.payload)
            .send()
            .await
            .map_err(|error| {
                LlmError::new(
                    LlmErrorCode::ProviderTransport,
                    format!("Gemini transport failed: {error}"),
                )
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unable to read error body".to_string());
            return Err(LlmError::new(
                LlmErrorCode::ProviderHttp,
                format!("Gemini HTTP {status}: {}", truncate_for_details(&body, 800)),
            ));
        }

        Ok(response)
    }

    async fn post(&self) -> Result<String, LlmError> {
        self.send().await?.text().await.map_err(|error| {
            LlmError::new(
                LlmErrorCode::ProviderTransport,
                format!("Gemini response read failed: {error}"),
            )
        })
    }
}

/// Events are pushed to the writer as soon as their terminating blank line
/// arrives, not after the whole body has been read.
async fn run_stream(client: &CallContext, writer: &RawEventStream) -> Result<RawResponse, LlmError> {
    let mut response = client.send().await?;
    let mut scanner = SseScanner::default();
    let mut aggregator = StreamAggregator::default();

    let mut done = false;
    while !done {
        let chunk = response.chunk().await.map_err(|error| {
            LlmError::new(
                LlmErrorCode::ProviderTransport,
                format!("Gemini stream read failed: {error}"),
            )
        })?;
        let Some(chunk) = chunk else { break };
        for data in scanner.push(&chunk) {
            if data == "[DONE]" {
                done = true;
                break;
            }
            aggregator.handle(&data, writer)?;
        }
    }
    if !done {
        // Servers may omit the final blank line before closing.
        if let Some(data) = scanner.finish() {
            if data != "[DONE]" {
                aggregator.handle(&data, writer)?;
            }
        }
    }

    aggregator.into_response()
}

/// Splits a raw SSE byte stream into `data:` payloads, tolerating events and
/// multi-byte characters that straddle chunk boundaries.
#[derive(Default)]
struct SseScanner {
    buffer: Vec<u8>,
}

impl SseScanner {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some((at, len)) = find_event_boundary(&self.buffer) {
            let event: Vec<u8> = self.buffer.drain(..at + len).collect();
            if let Some(data) = extract_data(&String::from_utf8_lossy(&event[..at])) {
                events.push(data);
            }
        }
        events
    }

    fn finish(self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        extract_data(&String::from_utf8_lossy(&self.buffer))
    }
}

fn find_event_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    for at in 0..buffer.len() {
        let rest = &buffer[at..];
        if rest.starts_with(b"\r\n\r\n") {
            return Some((at, 4));
        }
        if rest.starts_with(b"\n\n") {
            return Some((at, 2));
        }
    }
    None
}

fn extract_data(event: &str) -> Option<String> {
    let data = event
        .lines()
        .filter_map(|line| line.strip_prefix("data:").map(str::trim_start))
        .collect::<Vec<_>>()
        .join("\n");
    if data.is_empty() {
        None
    } else {
        Some(data)
    }
}

#[derive(Default)]
struct StreamAggregator {
    parts: Vec<ResponsePart>,
    content_parts: Vec<Value>,
    usage: Option<Usage>,
    handled_any: bool,
}

impl StreamAggregator {
    fn handle(&mut self, data: &str, writer: &RawEventStream) -> Result<(), LlmError> {
        let payload: Value = serde_json::from_str(data).map_err(|error| {
            LlmError::new(
                LlmErrorCode::ProviderProtocol,
                format!("Invalid Gemini SSE chunk JSON: {error}"),
            )
            .with_details(json!({ "chunk": truncate_for_details(data, 800) }))
        })?;

        let chunk = parse_chunk(&payload);
        self.handled_any |= chunk.handled;

        self.parts.extend(chunk.parts.clone());
        if let Some(content) = &chunk.content {
            if let Some(parts) = content.get("parts").and_then(Value::as_array) {
                self.content_parts.extend(parts.iter().cloned());
            }
        }
        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }

        writer.push(RawEvent {
            parts: chunk.parts,
            content: chunk.content,
            usage: chunk.usage,
        });
        Ok(())
    }

    fn into_response(self) -> Result<RawResponse, LlmError> {
        if !self.handled_any {
            return Err(LlmError::new(
                LlmErrorCode::ProviderProtocol,
                "Gemini stream contained no candidates or usage fields",
            ));
        }

        if let Some(usage) = &self.usage {
            log_usage(usage);
        }
        let content = if self.content_parts.is_empty() {
            None
        } else {
            Some(json!({ "role": "model", "parts": self.content_parts }))
        };
        Ok(RawResponse {
            content,
            parts: self.parts,
            usage: self.usage,
        })
    }
}

struct ParsedChunk {
    parts: Vec<ResponsePart>,
    content: Option<Value>,
    usage: Option<Usage>,
    handled: bool,
}

fn parse_chunk(payload: &Value) -> ParsedChunk {
    let mut chunk = ParsedChunk {
        parts: Vec::new(),
        content: None,
        usage: None,
        handled: false,
    };

    if let Some(usage) = payload
        .get("usageMetadata")
        .or_else(|| payload.get("usage_metadata"))
    {
        chunk.usage = Some(parse_usage(usage));
        chunk.handled = true;
    }

    let candidate = payload
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first());

    let Some(candidate) = candidate else {
        return chunk;
    };
    chunk.handled = true;

    let Some(content) = candidate.get("content") else {
        return chunk;
    };
    chunk.content = Some(content.clone());

    let Some(parts) = content.get("parts").and_then(Value::as_array) else {
        return chunk;
    };

    for part in parts {
        // Thought parts stay in the replay blob but are not surfaced as
        // answer text.
        let is_thought = part
            .get("thought")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if let Some(text) = part.get("text").and_then(Value::as_str) {
            if !is_thought && !text.is_empty() {
                chunk.parts.push(ResponsePart::Text {
                    text: text.to_string(),
                });
            }
        }

        if let Some(function_call) = part
            .get("functionCall")
            .or_else(|| part.get("function_call"))
            .and_then(Value::as_object)
        {
            let name = function_call
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let id = function_call
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string);
            let arguments = function_call
                .get("args")
                .or_else(|| function_call.get("arguments"))
                .cloned()
                .unwrap_or_else(|| Value::Object(Map::new()));
            chunk.parts.push(ResponsePart::ToolCall {
                call: ToolCall {
                    id,
                    name,
                    arguments,
                },
            });
        }
    }

    chunk
}

fn parse_usage(value: &Value) -> Usage {
    let input_tokens = value
        .get("promptTokenCount")
        .or_else(|| value.get("prompt_token_count"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let output_tokens = value
        .get("candidatesTokenCount")
        .or_else(|| value.get("candidates_token_count"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let total_tokens = value
        .get("totalTokenCount")
        .or_else(|| value.get("total_token_count"))
        .and_then(Value::as_u64)
        .unwrap_or(input_tokens + output_tokens);

    Usage {
        input_tokens,
        output_tokens,
        total_tokens,
    }
}

fn log_usage(usage: &Usage) {
    info!(
        input = usage.input_tokens,
        output = usage.output_tokens,
        total = usage.total_tokens,
        "gemini usage"
    );
}

fn build_payload(request: &GenerateRequest) -> Value {
    let mut payload = json!({
        "contents": convert_messages(&request.messages),
    });

    let instruction = system_prompt(&request.messages);
    if !instruction.is_empty() {
        payload["systemInstruction"] = json!({
            "parts": [{ "text": instruction }],
        });
    }

    let mut generation_config = Map::new();
    if let Some(max_tokens) = request.max_tokens {
        generation_config.insert("maxOutputTokens".to_string(), json!(max_tokens));
    }

    if let Some(tools) = &request.tools {
        payload["tools"] = json!([{
            "functionDeclarations": tools,
        }]);
        if request.force_tool_calls {
            payload["toolConfig"] = json!({
                "functionCallingConfig": { "mode": "ANY" },
            });
        }
    } else if let Some(schema) = &request.response_schema {
        // Native structured output is mutually exclusive with tool use.
        generation_config.insert("responseMimeType".to_string(), json!("application/json"));
        generation_config.insert("responseJsonSchema".to_string(), schema.clone());
    } else {
        generation_config.insert("responseMimeType".to_string(), json!("text/plain"));
    }

    if !generation_config.is_empty() {
        payload["generationConfig"] = Value::Object(generation_config);
    }

    payload
}

fn convert_messages(messages: &[Message]) -> Vec<Value> {
    let mut contents: Vec<Value> = Vec::new();

    for message in messages {
        match message {
            // System messages ride on systemInstruction, not contents.
            Message::System { .. } => {}
            Message::User { content } => {
                contents.push(json!({
                    "role": "user",
                    "parts": [{ "text": content }],
                }));
            }
            Message::Assistant { content, .. } => {
                // Verbatim replay of the opaque provider content.
                contents.push(content.clone());
            }
            Message::ToolResult { name, response } => {
                let tool_part = json!({
                    "functionResponse": {
                        "name": name,
                        "response": response,
                    }
                });
                if !merge_into_tool_turn(&mut contents, &tool_part) {
                    contents.push(json!({
                        "role": "user",
                        "parts": [tool_part],
                    }));
                }
            }
        }
    }

    contents
}

/// Parallel function responses belong in one user turn; append to the
/// previous turn when it is already a function-response turn.
fn merge_into_tool_turn(contents: &mut [Value], tool_part: &Value) -> bool {
    let Some(last) = contents.last_mut() else {
        return false;
    };
    let is_user = last.get("role").and_then(Value::as_str) == Some("user");
    let has_function_response = last
        .get("parts")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .any(|part| part.get("functionResponse").is_some())
        })
        .unwrap_or(false);

    if is_user && has_function_response {
        if let Some(parts) = last.get_mut("parts").and_then(Value::as_array_mut) {
            parts.push(tool_part.clone());
            return true;
        }
    }
    false
}

fn model_path(model: &str, method: &str) -> String {
    let trimmed = model.trim().trim_start_matches('/');
    if trimmed.starts_with("models/") || trimmed.contains("/models/") {
        format!("{trimmed}:{method}")
    } else {
        format!("models/{trimmed}:{method}")
    }
}

fn resolve_api_key() -> Result<String, LlmError> {
    for env_key in GEMINI_API_KEY_ENVS {
        if let Ok(value) = env::var(env_key) {
            if !value.trim().is_empty() {
                return Ok(value);
            }
        }
    }

    Err(LlmError::new(
        LlmErrorCode::Configuration,
        format!(
            "Missing Gemini API key. Set {}.",
            GEMINI_API_KEY_ENVS.join(" or ")
        ),
    ))
}

fn spawn_provider_task<F>(task: F)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(task);
        return;
    }

    std::thread::spawn(move || {
        if let Ok(runtime) = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            runtime.block_on(task);
        }
    });
}
