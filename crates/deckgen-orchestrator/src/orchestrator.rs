use std::future::Future;
use std::sync::Arc;

use deckgen_ai::{
    flatten_json_schema, remove_titles_from_schema, validate_structured_output, EventStream,
    FunctionDeclaration, GenerateRequest, LlmError, LlmErrorCode, Message, ProviderAdapterRef,
    RawResponse, ToolCall, Usage,
};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::context::{LogUsageRecorder, RequestContext, UsageRecorder};
use crate::tools::{ToolDefinition, ToolRegistry};

/// Pseudo-tool name: a provider "call" on this tool carries the final
/// structured answer in its arguments and terminates the loop.
pub const RESPONSE_SCHEMA_TOOL: &str = "ResponseSchema";

pub const DEFAULT_MAX_DEPTH: usize = 8;

/// Incremental text fragments; the final result is the full concatenated
/// answer, or the error that ended the run.
pub type TextStream = EventStream<String, Result<String, LlmError>>;

/// Drives the recursive tool-calling conversation loop against one provider
/// adapter. Stateless across calls; each entry point owns its own growing
/// message list for the duration of the call.
pub struct Orchestrator {
    adapter: ProviderAdapterRef,
    max_depth: usize,
    usage_recorder: Arc<dyn UsageRecorder>,
}

impl Orchestrator {
    pub fn new(adapter: ProviderAdapterRef) -> Self {
        Self {
            adapter,
            max_depth: DEFAULT_MAX_DEPTH,
            usage_recorder: Arc::new(LogUsageRecorder),
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_usage_recorder(mut self, recorder: Arc<dyn UsageRecorder>) -> Self {
        self.usage_recorder = recorder;
        self
    }

    /// Plain text generation with optional tool use. Loops until a round
    /// produces no tool calls, then returns that round's text.
    pub async fn generate(
        &self,
        model: &str,
        messages: Vec<Message>,
        max_tokens: Option<u32>,
        tools: Option<Vec<ToolDefinition>>,
        ctx: RequestContext,
    ) -> Result<String, LlmError> {
        let registry = ToolRegistry::new(tools.unwrap_or_default())?;
        let declarations = declarations_for(&registry);
        let mut messages = messages;
        let mut depth = 0;
        loop {
            let request = GenerateRequest {
                model: model.to_string(),
                messages: messages.clone(),
                max_tokens,
                tools: declarations.clone(),
                ..Default::default()
            };
            let response = self.round_trip(request, &ctx).await?;
            self.report_usage(model, response.usage.as_ref(), &ctx);

            let calls = response.tool_calls();
            if calls.is_empty() {
                return response.text_content().ok_or_else(empty_response);
            }
            self.follow_up(&registry, &mut messages, response.content, &calls, depth, &ctx)
                .await?;
            depth += 1;
        }
    }

    /// Structured generation: the caller's schema constrains the final
    /// output, natively when no tools are in play, via the synthetic
    /// `ResponseSchema` pseudo-tool when they are.
    pub async fn generate_structured(
        &self,
        model: &str,
        messages: Vec<Message>,
        max_tokens: Option<u32>,
        tools: Option<Vec<ToolDefinition>>,
        response_format: Value,
        strict: bool,
        ctx: RequestContext,
    ) -> Result<Value, LlmError> {
        let registry = ToolRegistry::new(tools.unwrap_or_default())?;
        let schema = prepare_response_schema(&registry, &response_format)?;
        let declarations = structured_declarations(&registry, &schema);
        let mut messages = messages;
        let mut depth = 0;
        loop {
            let request = structured_request(model, &messages, max_tokens, &declarations, &schema);
            let response = self.round_trip(request, &ctx).await?;
            self.report_usage(model, response.usage.as_ref(), &ctx);

            let calls = response.tool_calls();
            if let Some(result) = take_schema_call(&calls) {
                if strict {
                    validate_structured_output(&schema, &result)?;
                }
                return Ok(result);
            }
            if calls.is_empty() {
                let text = response.text_content().ok_or_else(empty_response)?;
                let parsed = parse_lenient_json(&text)?;
                if strict {
                    validate_structured_output(&schema, &parsed)?;
                }
                return Ok(parsed);
            }
            self.follow_up(&registry, &mut messages, response.content, &calls, depth, &ctx)
                .await?;
            depth += 1;
        }
    }

    /// Streaming text generation. Fragments from every recursion depth flow
    /// through the returned stream; their concatenation is the full answer,
    /// also delivered as the stream's final result.
    pub fn stream(
        &self,
        model: &str,
        messages: Vec<Message>,
        max_tokens: Option<u32>,
        tools: Option<Vec<ToolDefinition>>,
        ctx: RequestContext,
    ) -> Result<TextStream, LlmError> {
        let registry = ToolRegistry::new(tools.unwrap_or_default())?;
        let run = StreamRun {
            adapter: Arc::clone(&self.adapter),
            usage_recorder: Arc::clone(&self.usage_recorder),
            max_depth: self.max_depth,
            model: model.to_string(),
            messages,
            max_tokens,
            declarations: declarations_for(&registry),
            registry,
            response_format: None,
            ctx,
            output: TextStream::new(),
        };
        Ok(run.launch())
    }

    /// Streaming structured generation. While the synthetic pseudo-tool is in
    /// play, exploratory text is suppressed and the schema call's arguments
    /// are forwarded as the sole fragment.
    pub fn stream_structured(
        &self,
        model: &str,
        messages: Vec<Message>,
        max_tokens: Option<u32>,
        tools: Option<Vec<ToolDefinition>>,
        response_format: Value,
        strict: bool,
        ctx: RequestContext,
    ) -> Result<TextStream, LlmError> {
        let registry = ToolRegistry::new(tools.unwrap_or_default())?;
        let schema = prepare_response_schema(&registry, &response_format)?;
        let run = StreamRun {
            adapter: Arc::clone(&self.adapter),
            usage_recorder: Arc::clone(&self.usage_recorder),
            max_depth: self.max_depth,
            model: model.to_string(),
            messages,
            max_tokens,
            declarations: structured_declarations(&registry, &schema),
            registry,
            response_format: Some((schema, strict)),
            ctx,
            output: TextStream::new(),
        };
        Ok(run.launch())
    }

    async fn round_trip(
        &self,
        request: GenerateRequest,
        ctx: &RequestContext,
    ) -> Result<RawResponse, LlmError> {
        ensure_not_aborted(ctx)?;
        let future = self.adapter.complete(request);
        await_abortable(future, ctx).await?
    }

    fn report_usage(&self, model: &str, usage: Option<&Usage>, ctx: &RequestContext) {
        if let Some(usage) = usage {
            self.usage_recorder
                .record(ctx.scope.as_ref(), self.adapter.name(), model, usage);
        }
    }

    /// Executes one round's tool calls and appends the assistant turn plus
    /// the tool results to the conversation.
    async fn follow_up(
        &self,
        registry: &ToolRegistry,
        messages: &mut Vec<Message>,
        content: Option<Value>,
        calls: &[ToolCall],
        depth: usize,
        ctx: &RequestContext,
    ) -> Result<(), LlmError> {
        ensure_depth(depth, self.max_depth)?;
        ensure_not_aborted(ctx)?;
        debug!(depth, calls = calls.len(), "executing tool calls");
        let results = registry.handle_tool_calls(calls).await;
        messages.push(Message::assistant(
            self.adapter.name(),
            content.unwrap_or_else(empty_model_turn),
        ));
        messages.extend(results);
        Ok(())
    }
}

/// One in-flight streaming conversation, driven on a background task.
struct StreamRun {
    adapter: ProviderAdapterRef,
    usage_recorder: Arc<dyn UsageRecorder>,
    max_depth: usize,
    model: String,
    messages: Vec<Message>,
    max_tokens: Option<u32>,
    registry: ToolRegistry,
    declarations: Option<Vec<FunctionDeclaration>>,
    /// `Some((flattened schema, strict))` in structured mode.
    response_format: Option<(Value, bool)>,
    ctx: RequestContext,
    output: TextStream,
}

/// Per-round accumulation: the stream's events are drained to completion
/// before any tool call is acted on.
struct RoundOutcome {
    contents: Vec<Value>,
    calls: Vec<ToolCall>,
    text: String,
}

impl StreamRun {
    fn launch(self) -> TextStream {
        let output = self.output.clone();
        spawn_detached(async move {
            let stream = self.output.clone();
            let outcome = self.run().await;
            if let Err(err) = &outcome {
                warn!(error = %err, "stream run failed");
            }
            stream.end(Some(outcome));
        });
        output
    }

    async fn run(mut self) -> Result<String, LlmError> {
        // A synthetic schema tool means provider text is exploratory, not
        // part of the answer; suppress it from the output.
        let forward_text =
            self.response_format.is_none() || self.declarations.is_none();
        let mut collected = String::new();
        let mut depth = 0;
        loop {
            let request = match &self.response_format {
                Some((schema, _)) => structured_request(
                    &self.model,
                    &self.messages,
                    self.max_tokens,
                    &self.declarations,
                    schema,
                ),
                None => GenerateRequest {
                    model: self.model.clone(),
                    messages: self.messages.clone(),
                    max_tokens: self.max_tokens,
                    tools: self.declarations.clone(),
                    ..Default::default()
                },
            };
            let round = self.consume_round(request, forward_text, &mut collected).await?;

            if let Some((schema, strict)) = &self.response_format {
                if let Some(result) = take_schema_call(&round.calls) {
                    if *strict {
                        validate_structured_output(schema, &result)?;
                    }
                    let serialized = serde_json::to_string(&result).map_err(|err| {
                        LlmError::new(
                            LlmErrorCode::UnparsableStructuredOutput,
                            format!("failed to serialize structured result: {err}"),
                        )
                    })?;
                    self.output.push(serialized.clone());
                    return Ok(serialized);
                }
            }

            if round.calls.is_empty() {
                if let Some((schema, strict)) = &self.response_format {
                    // Terminal text in structured mode must parse and, when
                    // strict, conform, exactly as in the blocking variant.
                    if round.text.is_empty() {
                        return Err(empty_response());
                    }
                    let parsed = parse_lenient_json(&round.text)?;
                    if *strict {
                        validate_structured_output(schema, &parsed)?;
                    }
                    if !forward_text {
                        self.output.push(round.text.clone());
                    }
                    return Ok(round.text);
                }
                if collected.is_empty() && round.text.is_empty() {
                    return Err(empty_response());
                }
                return Ok(collected);
            }

            ensure_depth(depth, self.max_depth)?;
            ensure_not_aborted(&self.ctx)?;
            let results = self.registry.handle_tool_calls(&round.calls).await;
            if round.contents.is_empty() {
                self.messages
                    .push(Message::assistant(self.adapter.name(), empty_model_turn()));
            } else {
                for content in round.contents {
                    self.messages
                        .push(Message::assistant(self.adapter.name(), content));
                }
            }
            self.messages.extend(results);
            depth += 1;
        }
    }

    /// Drains one provider round-trip, forwarding text fragments live and
    /// accumulating replay content and tool calls.
    async fn consume_round(
        &self,
        request: GenerateRequest,
        forward_text: bool,
        collected: &mut String,
    ) -> Result<RoundOutcome, LlmError> {
        ensure_not_aborted(&self.ctx)?;
        let events = self.adapter.stream(request)?;
        let mut outcome = RoundOutcome {
            contents: Vec::new(),
            calls: Vec::new(),
            text: String::new(),
        };
        let mut usage = None;
        loop {
            let event = match await_abortable(events.next(), &self.ctx).await? {
                Some(event) => event,
                None => break,
            };
            if let Some(content) = event.content {
                outcome.contents.push(content);
            }
            if let Some(event_usage) = event.usage {
                usage = Some(event_usage);
            }
            for part in event.parts {
                match part {
                    deckgen_ai::ResponsePart::Text { text } => {
                        if forward_text {
                            self.output.push(text.clone());
                        }
                        collected.push_str(&text);
                        outcome.text.push_str(&text);
                    }
                    deckgen_ai::ResponsePart::ToolCall { call } => outcome.calls.push(call),
                }
            }
        }
        match events.result().await {
            Some(Ok(_)) => {}
            Some(Err(err)) => return Err(err),
            None => {
                return Err(LlmError::new(
                    LlmErrorCode::ProviderProtocol,
                    "stream ended without a completion result",
                ))
            }
        }
        if let Some(usage) = usage {
            self.usage_recorder
                .record(self.ctx.scope.as_ref(), self.adapter.name(), &self.model, &usage);
        }
        Ok(outcome)
    }
}

fn declarations_for(registry: &ToolRegistry) -> Option<Vec<FunctionDeclaration>> {
    if registry.is_empty() {
        None
    } else {
        Some(registry.declarations())
    }
}

/// Flattens and title-strips the caller's schema, rejecting a real tool that
/// would collide with the pseudo-tool name.
fn prepare_response_schema(
    registry: &ToolRegistry,
    response_format: &Value,
) -> Result<Value, LlmError> {
    if registry
        .declarations()
        .iter()
        .any(|declaration| declaration.name == RESPONSE_SCHEMA_TOOL)
    {
        return Err(LlmError::new(
            LlmErrorCode::Configuration,
            format!("tool name '{RESPONSE_SCHEMA_TOOL}' is reserved in structured mode"),
        ));
    }
    Ok(remove_titles_from_schema(&flatten_json_schema(
        response_format,
    )?))
}

/// With real tools the schema rides along as a pseudo-tool; without them the
/// native output constraint is used instead and no tool list is sent.
fn structured_declarations(
    registry: &ToolRegistry,
    schema: &Value,
) -> Option<Vec<FunctionDeclaration>> {
    let mut declarations = declarations_for(registry)?;
    declarations.push(FunctionDeclaration {
        name: RESPONSE_SCHEMA_TOOL.to_string(),
        description: "Provide the final response to the user".to_string(),
        parameters: schema.clone(),
    });
    Some(declarations)
}

fn structured_request(
    model: &str,
    messages: &[Message],
    max_tokens: Option<u32>,
    declarations: &Option<Vec<FunctionDeclaration>>,
    schema: &Value,
) -> GenerateRequest {
    match declarations {
        Some(declarations) => GenerateRequest {
            model: model.to_string(),
            messages: messages.to_vec(),
            max_tokens,
            tools: Some(declarations.clone()),
            force_tool_calls: true,
            ..Default::default()
        },
        None => GenerateRequest {
            model: model.to_string(),
            messages: messages.to_vec(),
            max_tokens,
            response_schema: Some(schema.clone()),
            ..Default::default()
        },
    }
}

/// The schema call's arguments ARE the answer; it is never executed and
/// pre-empts any real calls in the same round.
fn take_schema_call(calls: &[ToolCall]) -> Option<Value> {
    calls
        .iter()
        .find(|call| call.name == RESPONSE_SCHEMA_TOOL)
        .map(|call| call.arguments.clone())
}

/// Providers sometimes emit near-JSON (trailing commas, comments); parse
/// tolerantly before giving up.
fn parse_lenient_json(text: &str) -> Result<Value, LlmError> {
    let trimmed = strip_code_fence(text.trim());
    json5::from_str::<Value>(trimmed).map_err(|err| {
        LlmError::new(
            LlmErrorCode::UnparsableStructuredOutput,
            format!("structured output is not valid JSON: {err}"),
        )
        .with_details(json!({ "rawText": text }))
    })
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.trim_start_matches(['\r', '\n'])
        .strip_suffix("```")
        .map(str::trim_end)
        .unwrap_or(text)
}

fn ensure_depth(depth: usize, max_depth: usize) -> Result<(), LlmError> {
    if depth + 1 >= max_depth {
        return Err(LlmError::new(
            LlmErrorCode::MaxDepthExceeded,
            format!("tool-calling recursion exceeded the depth limit of {max_depth}"),
        ));
    }
    Ok(())
}

fn ensure_not_aborted(ctx: &RequestContext) -> Result<(), LlmError> {
    match &ctx.signal {
        Some(signal) if signal.is_aborted() => Err(aborted()),
        _ => Ok(()),
    }
}

/// Races a future against the caller's abort signal.
async fn await_abortable<T>(
    future: impl Future<Output = T>,
    ctx: &RequestContext,
) -> Result<T, LlmError> {
    match &ctx.signal {
        Some(signal) => {
            if signal.is_aborted() {
                return Err(aborted());
            }
            tokio::select! {
                value = future => Ok(value),
                _ = signal.cancelled() => Err(aborted()),
            }
        }
        None => Ok(future.await),
    }
}

fn aborted() -> LlmError {
    LlmError::new(LlmErrorCode::Aborted, "request aborted by caller")
}

fn empty_response() -> LlmError {
    LlmError::new(
        LlmErrorCode::EmptyResponse,
        "provider returned no text content",
    )
}

/// Replay placeholder for the rare provider response that carries calls but
/// no content blob.
fn empty_model_turn() -> Value {
    json!({ "role": "model", "parts": [] })
}

/// Runs the stream driver on the current runtime, or a throwaway one when
/// called from outside a runtime.
fn spawn_detached(future: impl Future<Output = ()> + Send + 'static) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(future);
        }
        Err(_) => {
            std::thread::spawn(move || {
                match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime.block_on(future),
                    Err(err) => warn!(error = %err, "failed to build stream runtime"),
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lenient_parse_accepts_trailing_commas() {
        assert_eq!(
            parse_lenient_json("{\"a\": 1,}").unwrap(),
            json!({"a": 1})
        );
    }

    #[test]
    fn lenient_parse_strips_markdown_fences() {
        assert_eq!(
            parse_lenient_json("```json\n{\"a\": 1}\n```").unwrap(),
            json!({"a": 1})
        );
    }

    #[test]
    fn lenient_parse_failure_carries_raw_text() {
        let err = parse_lenient_json("not json at all {").unwrap_err();
        assert_eq!(err.code, LlmErrorCode::UnparsableStructuredOutput);
        let details = err.details.unwrap();
        assert_eq!(details["rawText"], json!("not json at all {"));
    }

    #[test]
    fn schema_call_preempts_real_calls() {
        let calls = vec![
            ToolCall {
                id: None,
                name: "lookup".into(),
                arguments: json!({}),
            },
            ToolCall {
                id: None,
                name: RESPONSE_SCHEMA_TOOL.into(),
                arguments: json!({"x": 1}),
            },
        ];
        assert_eq!(take_schema_call(&calls), Some(json!({"x": 1})));
    }
}
