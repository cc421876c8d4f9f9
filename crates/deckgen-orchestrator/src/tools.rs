use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use deckgen_ai::{
    flatten_json_schema, remove_titles_from_schema, validate_tool_arguments, FunctionDeclaration,
    LlmError, LlmErrorCode, Message, ToolCall,
};
use serde_json::{json, Value};
use tracing::warn;

pub type ToolFuture = Pin<Box<dyn Future<Output = Result<Value, LlmError>> + Send>>;

/// Application-supplied tool body. Receives already-validated arguments and
/// returns an arbitrary JSON result.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, arguments: Value) -> Result<Value, LlmError>;
}

#[async_trait]
impl<F> ToolExecutor for F
where
    F: Fn(Value) -> ToolFuture + Send + Sync,
{
    async fn execute(&self, arguments: Value) -> Result<Value, LlmError> {
        (self)(arguments).await
    }
}

pub type ToolExecuteFn = Arc<dyn ToolExecutor>;

/// Wraps an async closure as a tool executor.
pub fn tool_fn<F, Fut>(body: F) -> ToolExecuteFn
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, LlmError>> + Send + 'static,
{
    Arc::new(move |arguments: Value| -> ToolFuture { Box::pin(body(arguments)) })
}

/// A callable tool: declaration metadata plus its executor.
#[derive(Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub execute: ToolExecuteFn,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        execute: ToolExecuteFn,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            execute,
        }
    }
}

struct RegisteredTool {
    declaration: FunctionDeclaration,
    execute: ToolExecuteFn,
}

/// Immutable per-request set of tools, keyed by name. Parameter schemas are
/// flattened and title-stripped once at registration so every provider
/// round-trip reuses the same declarations.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<RegisteredTool>>,
    declarations: Vec<FunctionDeclaration>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("declarations", &self.declarations)
            .finish_non_exhaustive()
    }
}

impl ToolRegistry {
    pub fn new(definitions: Vec<ToolDefinition>) -> Result<Self, LlmError> {
        let mut tools = HashMap::with_capacity(definitions.len());
        let mut declarations = Vec::with_capacity(definitions.len());
        for definition in definitions {
            let parameters =
                remove_titles_from_schema(&flatten_json_schema(&definition.parameters)?);
            let declaration = FunctionDeclaration {
                name: definition.name.clone(),
                description: definition.description,
                parameters,
            };
            declarations.push(declaration.clone());
            let registered = Arc::new(RegisteredTool {
                declaration,
                execute: definition.execute,
            });
            if tools.insert(definition.name.clone(), registered).is_some() {
                return Err(LlmError::new(
                    LlmErrorCode::Configuration,
                    format!("duplicate tool name: {}", definition.name),
                ));
            }
        }
        Ok(Self {
            tools,
            declarations,
        })
    }

    pub fn declarations(&self) -> Vec<FunctionDeclaration> {
        self.declarations.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Executes every requested call concurrently and returns one tool-result
    /// message per call, in the order the model requested them. Failures
    /// degrade to error-shaped results so the conversation keeps going.
    pub async fn handle_tool_calls(&self, calls: &[ToolCall]) -> Vec<Message> {
        let mut handles = Vec::with_capacity(calls.len());
        for call in calls {
            let name = call.name.clone();
            match self.tools.get(&call.name) {
                Some(tool) => {
                    let tool = Arc::clone(tool);
                    let call = call.clone();
                    handles.push((name, Some(tokio::spawn(async move {
                        validate_tool_arguments(&tool.declaration, &call)?;
                        tool.execute.execute(call.arguments).await
                    }))));
                }
                None => handles.push((name, None)),
            }
        }

        let mut results = Vec::with_capacity(handles.len());
        for (name, handle) in handles {
            let outcome = match handle {
                Some(handle) => match handle.await {
                    Ok(result) => result,
                    Err(join_err) => Err(LlmError::new(
                        LlmErrorCode::ToolExecutionFailed,
                        format!("tool {name} panicked: {join_err}"),
                    )),
                },
                None => Err(LlmError::new(
                    LlmErrorCode::ToolNotFound,
                    format!("unknown tool: {name}"),
                )),
            };
            let response = match outcome {
                Ok(value) => value,
                Err(err) => {
                    warn!(tool = %name, code = ?err.code, error = %err.message, "tool call failed");
                    json!({ "error": err.message, "code": err.code })
                }
            };
            results.push(Message::tool_result(name, response));
        }
        results
    }
}
