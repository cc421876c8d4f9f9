//! Recursive tool-calling orchestration over the `deckgen-ai` provider seam.
//!
//! Four entry points cover the blocking/streaming x text/structured matrix:
//! [`Orchestrator::generate`], [`Orchestrator::generate_structured`],
//! [`Orchestrator::stream`], and [`Orchestrator::stream_structured`].

mod abort;
mod context;
mod orchestrator;
mod tools;

pub use abort::{AbortController, AbortSignal};
pub use context::{LogUsageRecorder, QuotaGateway, RequestContext, RequestScope, UsageRecorder};
pub use orchestrator::{
    Orchestrator, TextStream, DEFAULT_MAX_DEPTH, RESPONSE_SCHEMA_TOOL,
};
pub use tools::{tool_fn, ToolDefinition, ToolExecuteFn, ToolExecutor, ToolFuture, ToolRegistry};
