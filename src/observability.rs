//! Observability module for correlation and per-operation structured logging

use crate::metrics::metrics;
use crate::pipeline::errors::OperationError;
use serde::{Deserialize, Serialize};
use solana_sdk::signature::Signature;
use uuid::Uuid;

/// Correlation ID for tracking one operation across components
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Create a new correlation ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Structured logger for pipeline phase events
#[derive(Debug, Clone)]
pub struct OperationLogger {
    correlation_id: CorrelationId,
    operation: &'static str,
}

impl OperationLogger {
    pub fn new(operation: &'static str) -> Self {
        Self::with_id(operation, CorrelationId::new())
    }

    pub fn with_id(operation: &'static str, correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id,
            operation,
        }
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Span carrying the correlation id for everything inside the operation
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!(
            "operation",
            correlation_id = %self.correlation_id,
            operation = self.operation
        )
    }

    pub fn log_draft_built(&self, size_bytes: usize, instructions: usize, lookup_tables: usize, latency_ms: u64) {
        tracing::info!(
            correlation_id = %self.correlation_id,
            operation = self.operation,
            size_bytes,
            instructions,
            lookup_tables,
            latency_ms,
            "Draft built"
        );
    }

    pub fn log_cosigned(&self, signature: &Signature) {
        tracing::info!(
            correlation_id = %self.correlation_id,
            operation = self.operation,
            signature = %signature,
            "Transaction co-signed"
        );
    }

    pub fn log_broadcast(&self, signature: &Signature) {
        tracing::info!(
            correlation_id = %self.correlation_id,
            operation = self.operation,
            signature = %signature,
            "Broadcast accepted"
        );
    }

    pub fn log_finished(&self, signature: &Signature, confirmed: bool, latency_ms: u64) {
        tracing::info!(
            correlation_id = %self.correlation_id,
            operation = self.operation,
            signature = %signature,
            confirmed,
            latency_ms,
            "Operation finished"
        );
    }

    /// Log and count a failure under its kind and stage
    pub fn log_failed(&self, error: &OperationError) {
        metrics().record_error(error.category(), error.stage.as_str());
        tracing::warn!(
            correlation_id = %self.correlation_id,
            operation = self.operation,
            kind = %error.kind,
            stage = %error.stage,
            retryable = error.retryable,
            message = %error.message,
            upstream = error.upstream_logs.as_deref().unwrap_or(""),
            "Operation failed"
        );
    }
}
