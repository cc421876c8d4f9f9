use async_trait::async_trait;
use deckgen_ai::{LlmError, Usage};
use tracing::info;

use crate::abort::AbortSignal;

/// Identity of the authenticated caller, passed explicitly through the call
/// chain instead of living in ambient per-request state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestScope {
    pub user_id: String,
    pub plan: String,
}

/// Per-request extras every entry point accepts. One conversation is owned
/// by exactly one request; contexts are never shared across requests.
#[derive(Clone, Default)]
pub struct RequestContext {
    pub scope: Option<RequestScope>,
    pub signal: Option<AbortSignal>,
}

impl RequestContext {
    pub fn with_scope(scope: RequestScope) -> Self {
        Self {
            scope: Some(scope),
            signal: None,
        }
    }

    pub fn with_signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }
}

/// Receives one usage report per provider round-trip. Reports are
/// independent per recursion depth, never summed. Delivery is
/// at-least-once; exact-once is not guaranteed.
pub trait UsageRecorder: Send + Sync {
    fn record(&self, scope: Option<&RequestScope>, provider: &str, model: &str, usage: &Usage);
}

/// Default recorder: structured log line per round-trip.
pub struct LogUsageRecorder;

impl UsageRecorder for LogUsageRecorder {
    fn record(&self, scope: Option<&RequestScope>, provider: &str, model: &str, usage: &Usage) {
        info!(
            user_id = scope.map(|scope| scope.user_id.as_str()).unwrap_or("-"),
            provider,
            model,
            input = usage.input_tokens,
            output = usage.output_tokens,
            total = usage.total_tokens,
            "llm usage"
        );
    }
}

/// Contract of the external quota service. The engine only consumes this
/// boundary; persistence and increment bookkeeping live elsewhere.
#[async_trait]
pub trait QuotaGateway: Send + Sync {
    async fn available_tokens(&self, user_id: &str, plan: &str) -> Result<u64, LlmError>;

    async fn record_usage(
        &self,
        user_id: &str,
        provider: &str,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Result<(), LlmError>;
}
