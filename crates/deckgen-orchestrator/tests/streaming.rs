mod common;

use deckgen_ai::{LlmErrorCode, Message, ResponsePart};
use deckgen_orchestrator::{
    tool_fn, AbortController, Orchestrator, RequestContext, ToolDefinition, ToolExecuteFn,
    RESPONSE_SCHEMA_TOOL,
};
use serde_json::{json, Value};

use common::{text_response, tool_call_response, ScriptedAdapter};

fn echo_executor() -> ToolExecuteFn {
    tool_fn(|arguments: Value| async move { Ok(arguments) })
}

async fn drain(stream: &deckgen_orchestrator::TextStream) -> Vec<String> {
    let mut fragments = Vec::new();
    while let Some(fragment) = stream.next().await {
        fragments.push(fragment);
    }
    fragments
}

#[tokio::test]
async fn fragments_concatenate_to_the_full_answer_across_depths() {
    let adapter = ScriptedAdapter::new(vec![
        tool_call_response(&[("echo", json!({"q": 1}))]),
        text_response("final answer"),
    ]);
    let orchestrator = Orchestrator::new(adapter.clone());
    let tools = vec![ToolDefinition::new(
        "echo",
        "",
        json!({"type": "object", "properties": {"q": {"type": "integer"}}}),
        echo_executor(),
    )];

    let stream = orchestrator
        .stream(
            "model-a",
            vec![Message::user("hi")],
            None,
            Some(tools),
            RequestContext::default(),
        )
        .unwrap();

    let fragments = drain(&stream).await;
    let full = stream.result().await.unwrap().unwrap();
    assert_eq!(fragments.concat(), full);
    assert_eq!(full, "final answer");
    assert_eq!(adapter.requests().len(), 2);
}

#[tokio::test]
async fn exploratory_text_in_tool_rounds_is_forwarded_live() {
    // A round can carry both text and a tool call; plain streaming forwards
    // the text as it arrives instead of discarding it.
    let mut first = tool_call_response(&[("echo", json!({}))]);
    first.parts.insert(
        0,
        ResponsePart::Text {
            text: "checking... ".into(),
        },
    );
    let adapter = ScriptedAdapter::new(vec![first, text_response("done")]);
    let orchestrator = Orchestrator::new(adapter);
    let tools = vec![ToolDefinition::new(
        "echo",
        "",
        json!({"type": "object"}),
        echo_executor(),
    )];

    let stream = orchestrator
        .stream(
            "model-a",
            vec![Message::user("hi")],
            None,
            Some(tools),
            RequestContext::default(),
        )
        .unwrap();

    let fragments = drain(&stream).await;
    assert_eq!(fragments, vec!["checking... ".to_string(), "done".to_string()]);
    assert_eq!(stream.result().await.unwrap().unwrap(), "checking... done");
}

#[tokio::test]
async fn structured_stream_suppresses_text_and_emits_one_fragment() {
    let mut scripted = tool_call_response(&[(RESPONSE_SCHEMA_TOOL, json!({"x": 1}))]);
    scripted.parts.insert(
        0,
        ResponsePart::Text {
            text: "thinking out loud".into(),
        },
    );
    let adapter = ScriptedAdapter::new(vec![scripted]);
    let orchestrator = Orchestrator::new(adapter.clone());
    let tools = vec![ToolDefinition::new(
        "echo",
        "",
        json!({"type": "object"}),
        echo_executor(),
    )];

    let stream = orchestrator
        .stream_structured(
            "model-a",
            vec![Message::user("hi")],
            None,
            Some(tools),
            json!({"type": "object", "properties": {"x": {"type": "integer"}}}),
            true,
            RequestContext::default(),
        )
        .unwrap();

    let fragments = drain(&stream).await;
    assert_eq!(fragments, vec!["{\"x\":1}".to_string()]);
    assert_eq!(stream.result().await.unwrap().unwrap(), "{\"x\":1}");
    assert_eq!(adapter.requests().len(), 1);
}

#[tokio::test]
async fn structured_stream_without_tools_forwards_native_output() {
    let adapter = ScriptedAdapter::new(vec![text_response("{\"a\": 1}")]);
    let orchestrator = Orchestrator::new(adapter.clone());

    let stream = orchestrator
        .stream_structured(
            "model-a",
            vec![Message::user("hi")],
            None,
            None,
            json!({"type": "object", "properties": {"a": {"type": "integer"}}}),
            false,
            RequestContext::default(),
        )
        .unwrap();

    let fragments = drain(&stream).await;
    assert_eq!(fragments.concat(), "{\"a\": 1}");
    assert!(adapter.requests()[0].response_schema.is_some());
}

#[tokio::test]
async fn structured_stream_executes_real_calls_before_schema_round() {
    let adapter = ScriptedAdapter::new(vec![
        tool_call_response(&[("echo", json!({"q": 7}))]),
        tool_call_response(&[(RESPONSE_SCHEMA_TOOL, json!({"x": 2}))]),
    ]);
    let orchestrator = Orchestrator::new(adapter.clone());
    let tools = vec![ToolDefinition::new(
        "echo",
        "",
        json!({"type": "object", "properties": {"q": {"type": "integer"}}}),
        echo_executor(),
    )];

    let stream = orchestrator
        .stream_structured(
            "model-a",
            vec![Message::user("hi")],
            None,
            Some(tools),
            json!({"type": "object", "properties": {"x": {"type": "integer"}}}),
            false,
            RequestContext::default(),
        )
        .unwrap();

    let fragments = drain(&stream).await;
    assert_eq!(fragments, vec!["{\"x\":2}".to_string()]);

    let requests = adapter.requests();
    assert_eq!(requests.len(), 2);
    // The second round replays the echo result appended after the assistant
    // turn.
    assert!(requests[1].messages.iter().any(|message| matches!(
        message,
        Message::ToolResult { name, response } if name == "echo" && response == &json!({"q": 7})
    )));
}

#[tokio::test]
async fn structured_stream_strict_rejects_nonconforming_text() {
    let adapter = ScriptedAdapter::new(vec![text_response("{\"x\": \"nope\"}")]);
    let orchestrator = Orchestrator::new(adapter);

    let stream = orchestrator
        .stream_structured(
            "model-a",
            vec![Message::user("hi")],
            None,
            None,
            json!({
                "type": "object",
                "properties": {"x": {"type": "integer"}},
                "required": ["x"]
            }),
            true,
            RequestContext::default(),
        )
        .unwrap();

    drain(&stream).await;
    let err = stream.result().await.unwrap().unwrap_err();
    assert_eq!(err.code, LlmErrorCode::StructuredOutputInvalid);
}

#[tokio::test]
async fn structured_stream_text_fallback_is_parsed_and_validated() {
    // With real tools in play the model may answer in bare text instead of
    // calling the schema tool; that text still goes through the lenient
    // parse and strict validation before it is emitted.
    let adapter = ScriptedAdapter::new(vec![
        tool_call_response(&[("echo", json!({"q": 1}))]),
        text_response("{\"x\": 3,}"),
    ]);
    let orchestrator = Orchestrator::new(adapter);
    let tools = vec![ToolDefinition::new(
        "echo",
        "",
        json!({"type": "object", "properties": {"q": {"type": "integer"}}}),
        echo_executor(),
    )];

    let stream = orchestrator
        .stream_structured(
            "model-a",
            vec![Message::user("hi")],
            None,
            Some(tools),
            json!({
                "type": "object",
                "properties": {"x": {"type": "integer"}},
                "required": ["x"]
            }),
            true,
            RequestContext::default(),
        )
        .unwrap();

    let fragments = drain(&stream).await;
    assert_eq!(fragments, vec!["{\"x\": 3,}".to_string()]);
    assert_eq!(stream.result().await.unwrap().unwrap(), "{\"x\": 3,}");
}

#[tokio::test]
async fn structured_stream_unparsable_text_is_an_error() {
    let adapter = ScriptedAdapter::new(vec![text_response("definitely not json {")]);
    let orchestrator = Orchestrator::new(adapter);

    let stream = orchestrator
        .stream_structured(
            "model-a",
            vec![Message::user("hi")],
            None,
            None,
            json!({"type": "object"}),
            false,
            RequestContext::default(),
        )
        .unwrap();

    drain(&stream).await;
    let err = stream.result().await.unwrap().unwrap_err();
    assert_eq!(err.code, LlmErrorCode::UnparsableStructuredOutput);
}

#[tokio::test]
async fn aborted_stream_surfaces_the_abort_as_its_result() {
    let adapter = ScriptedAdapter::new(vec![text_response("never")]);
    let orchestrator = Orchestrator::new(adapter.clone());
    let controller = AbortController::new();
    controller.abort();

    let stream = orchestrator
        .stream(
            "model-a",
            vec![Message::user("hi")],
            None,
            None,
            RequestContext::default().with_signal(controller.signal()),
        )
        .unwrap();

    assert!(drain(&stream).await.is_empty());
    let err = stream.result().await.unwrap().unwrap_err();
    assert_eq!(err.code, LlmErrorCode::Aborted);
    assert!(adapter.requests().is_empty());
}

#[tokio::test]
async fn stream_replays_assistant_content_verbatim() {
    let adapter = ScriptedAdapter::new(vec![
        tool_call_response(&[("echo", json!({"q": 1}))]),
        text_response("done"),
    ]);
    let orchestrator = Orchestrator::new(adapter.clone());
    let tools = vec![ToolDefinition::new(
        "echo",
        "",
        json!({"type": "object", "properties": {"q": {"type": "integer"}}}),
        echo_executor(),
    )];

    let stream = orchestrator
        .stream(
            "model-a",
            vec![Message::user("hi")],
            None,
            Some(tools),
            RequestContext::default(),
        )
        .unwrap();
    drain(&stream).await;
    stream.result().await.unwrap().unwrap();

    let requests = adapter.requests();
    let assistant = requests[1]
        .messages
        .iter()
        .find_map(|message| match message {
            Message::Assistant { content, .. } => Some(content.clone()),
            _ => None,
        })
        .unwrap();
    // The opaque provider blob survives the round-trip untouched.
    assert_eq!(
        assistant,
        json!({
            "role": "model",
            "parts": [{ "functionCall": { "name": "echo", "args": {"q": 1} } }]
        })
    );
}
