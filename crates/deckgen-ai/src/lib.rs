//! Provider-agnostic message model and client adapters for the deckgen
//! LLM orchestration engine.

mod error;
mod event_stream;
mod provider;
mod providers;
mod schema;
mod types;
mod validation;

pub use error::{LlmError, LlmErrorCode};
pub use event_stream::{EventStream, RawEventStream};
pub use provider::{provider_for, LlmProvider, ProviderAdapter, ProviderAdapterRef, ProviderFuture};
pub use providers::GeminiAdapter;
pub use schema::{flatten_json_schema, remove_titles_from_schema};
pub use types::{
    system_prompt, FunctionDeclaration, GenerateRequest, Message, RawEvent, RawResponse,
    ResponsePart, ToolCall, Usage,
};
pub use validation::{validate_structured_output, validate_tool_arguments};
