use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use deckgen_ai::{
    GenerateRequest, LlmError, LlmErrorCode, ProviderAdapter, ProviderFuture, RawEvent,
    RawEventStream, RawResponse, ResponsePart, ToolCall, Usage,
};
use serde_json::{json, Value};

/// Test double that replays a fixed script of responses and records every
/// request it receives. `stream` replays the same script as one event per
/// part, so streaming paths see multiple fragments per round.
pub struct ScriptedAdapter {
    responses: Mutex<VecDeque<RawResponse>>,
    requests: Mutex<Vec<GenerateRequest>>,
}

impl ScriptedAdapter {
    pub fn new(responses: Vec<RawResponse>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<GenerateRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn next_response(&self, request: GenerateRequest) -> Result<RawResponse, LlmError> {
        self.requests.lock().unwrap().push(request);
        self.responses.lock().unwrap().pop_front().ok_or_else(|| {
            LlmError::new(LlmErrorCode::ProviderProtocol, "script exhausted")
        })
    }
}

impl ProviderAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        "scripted"
    }

    fn complete(&self, request: GenerateRequest) -> ProviderFuture<RawResponse> {
        let next = self.next_response(request);
        Box::pin(async move { next })
    }

    fn stream(&self, request: GenerateRequest) -> Result<RawEventStream, LlmError> {
        let next = self.next_response(request)?;
        let events = RawEventStream::new();
        for part in &next.parts {
            events.push(RawEvent {
                parts: vec![part.clone()],
                content: None,
                usage: None,
            });
        }
        events.push(RawEvent {
            parts: vec![],
            content: next.content.clone(),
            usage: next.usage,
        });
        events.end(Some(Ok(next)));
        Ok(events)
    }
}

pub fn text_response(text: &str) -> RawResponse {
    RawResponse {
        content: Some(json!({
            "role": "model",
            "parts": [{ "text": text }]
        })),
        parts: vec![ResponsePart::Text {
            text: text.to_string(),
        }],
        usage: Some(Usage {
            input_tokens: 10,
            output_tokens: 5,
            total_tokens: 15,
        }),
    }
}

pub fn tool_call_response(calls: &[(&str, Value)]) -> RawResponse {
    let parts = calls
        .iter()
        .map(|(name, arguments)| ResponsePart::ToolCall {
            call: ToolCall {
                id: None,
                name: name.to_string(),
                arguments: arguments.clone(),
            },
        })
        .collect();
    RawResponse {
        content: Some(json!({
            "role": "model",
            "parts": calls
                .iter()
                .map(|(name, arguments)| json!({
                    "functionCall": { "name": name, "args": arguments }
                }))
                .collect::<Vec<_>>()
        })),
        parts,
        usage: Some(Usage {
            input_tokens: 20,
            output_tokens: 8,
            total_tokens: 28,
        }),
    }
}
