use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::{LlmError, LlmErrorCode};
use crate::event_stream::RawEventStream;
use crate::types::{GenerateRequest, RawResponse};

pub type ProviderFuture<T> = Pin<Box<dyn Future<Output = Result<T, LlmError>> + Send>>;

/// One backend of the generative-AI provider seam. Implementations hold
/// their credentials/session and are selected once at construction; they are
/// stateless across calls and safe to share between independent
/// conversations.
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Single non-streaming round-trip.
    fn complete(&self, request: GenerateRequest) -> ProviderFuture<RawResponse>;

    /// One round-trip delivered incrementally. The aggregate of all events
    /// reconstructs what `complete` would have returned for the same
    /// content.
    fn stream(&self, request: GenerateRequest) -> Result<RawEventStream, LlmError>;
}

pub type ProviderAdapterRef = Arc<dyn ProviderAdapter>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    Google,
}

impl LlmProvider {
    pub fn from_name(name: &str) -> Result<Self, LlmError> {
        match name {
            "google" => Ok(LlmProvider::Google),
            other => Err(LlmError::new(
                LlmErrorCode::Configuration,
                format!("Unknown LLM provider '{other}' (supported: google)"),
            )),
        }
    }
}

/// Constructs the adapter for the configured provider. Missing credentials
/// fail here, not on the first call.
pub fn provider_for(provider: LlmProvider) -> Result<ProviderAdapterRef, LlmError> {
    match provider {
        LlmProvider::Google => Ok(Arc::new(crate::providers::GeminiAdapter::new()?)),
    }
}
