//! Upstream instruction providers
//!
//! A provider answers an operation-specific request (a swap quote, a vault
//! deposit) with JSON instruction descriptions. Sources only fetch; shape
//! differences are resolved later by the normalizer.

use crate::pipeline::errors::{ErrorKind, OperationError, Stage};
use crate::pipeline::normalize::to_provider_json;
use crate::pipeline::retry::{retry_with_backoff, PacingClock, RetryConfig, Retryable};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use solana_sdk::{instruction::Instruction, pubkey::Pubkey};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Aggregator response fields, in execution order
const SINGLE_OR_LIST_FIELDS: &[&str] = &[
    "computeBudgetInstructions",
    "setupInstructions",
    "tokenLedgerInstruction",
    "swapInstruction",
    "otherInstructions",
    "cleanupInstruction",
];

const INSTRUCTIONS_FIELD: &str = "instructions";

const LOOKUP_TABLE_FIELDS: &[&str] = &[
    "addressLookupTableAddresses",
    "addressLookupTables",
    "lookupTables",
];

/// Raw instructions returned by one provider
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderBatch {
    pub provider: String,
    pub instructions: Vec<Value>,
    pub lookup_tables: Vec<String>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timed out")]
    Timeout,

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("Request cancelled")]
    Cancelled,
}

impl Retryable for ProviderError {
    fn is_transient(&self) -> bool {
        match self {
            Self::RateLimited | Self::Transport(_) | Self::Timeout => true,
            Self::Http { status, .. } => *status >= 500,
            Self::InvalidResponse(_) | Self::Cancelled => false,
        }
    }

    fn cancelled() -> Self {
        Self::Cancelled
    }
}

impl ProviderError {
    /// Translate into the pipeline taxonomy
    pub fn into_operation_error(self, provider: &str) -> OperationError {
        OperationError::new(
            ErrorKind::MalformedInstruction,
            Stage::Fetch,
            format!("provider={provider}: instructions could not be fetched"),
        )
        .with_retryable(self.is_transient())
        .with_logs(self.to_string())
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_decode() {
            Self::InvalidResponse(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// Anything that can produce instructions for an operation
#[async_trait]
pub trait InstructionSource: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self, cancel: &CancellationToken) -> Result<ProviderBatch, ProviderError>;
}

/// Flatten a provider response into ordered instructions and lookup tables
pub fn flatten_response(body: &Value) -> Result<(Vec<Value>, Vec<String>), ProviderError> {
    let obj = body
        .as_object()
        .ok_or_else(|| ProviderError::InvalidResponse("response is not a JSON object".into()))?;

    let mut instructions = Vec::new();
    if let Some(list) = obj.get(INSTRUCTIONS_FIELD) {
        push_instructions(&mut instructions, INSTRUCTIONS_FIELD, list)?;
    } else {
        let mut found = false;
        for field in SINGLE_OR_LIST_FIELDS {
            if let Some(value) = obj.get(*field) {
                found = true;
                push_instructions(&mut instructions, field, value)?;
            }
        }
        if !found {
            return Err(ProviderError::InvalidResponse(
                "response carries no instruction fields".into(),
            ));
        }
    }

    let lookup_tables = LOOKUP_TABLE_FIELDS
        .iter()
        .find_map(|field| obj.get(*field))
        .and_then(Value::as_array)
        .map(|tables| {
            tables
                .iter()
                .filter_map(|t| t.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    Ok((instructions, lookup_tables))
}

fn push_instructions(out: &mut Vec<Value>, field: &str, value: &Value) -> Result<(), ProviderError> {
    match value {
        Value::Null => Ok(()),
        Value::Array(items) => {
            out.extend(items.iter().filter(|v| !v.is_null()).cloned());
            Ok(())
        }
        Value::Object(_) => {
            out.push(value.clone());
            Ok(())
        }
        other => Err(ProviderError::InvalidResponse(format!(
            "`{field}` is neither an instruction nor a list: {other}"
        ))),
    }
}

/// Provider reached over HTTP with a JSON request body
pub struct HttpInstructionSource {
    name: String,
    http: Client,
    url: String,
    request: Value,
    api_key: Option<String>,
    pacing: Arc<PacingClock>,
    retry: RetryConfig,
}

impl HttpInstructionSource {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        request: Value,
        timeout: Duration,
        pacing: Arc<PacingClock>,
        retry: RetryConfig,
    ) -> Result<Self, ProviderError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        Ok(Self {
            name: name.into(),
            http,
            url: url.into(),
            request,
            api_key: None,
            pacing,
            retry,
        })
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Pacing key: one clock slot per upstream host
    fn pacing_key(&self) -> String {
        reqwest::Url::parse(&self.url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
            .unwrap_or_else(|| self.name.clone())
    }

    async fn fetch_once(&self, cancel: &CancellationToken) -> Result<ProviderBatch, ProviderError> {
        if !self.pacing.pace(&self.pacing_key(), cancel).await {
            return Err(ProviderError::Cancelled);
        }

        let mut req = self.http.post(&self.url).json(&self.request);
        if let Some(key) = &self.api_key {
            req = req.header("X-API-KEY", key);
        }

        let resp = req.send().await.map_err(ProviderError::from_reqwest)?;
        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::RateLimited);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Http {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }

        let body: Value = resp.json().await.map_err(|e| {
            ProviderError::InvalidResponse(format!("JSON parse error: {e}"))
        })?;
        let (instructions, lookup_tables) = flatten_response(&body)?;
        Ok(ProviderBatch {
            provider: self.name.clone(),
            instructions,
            lookup_tables,
        })
    }
}

#[async_trait]
impl InstructionSource for HttpInstructionSource {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip_all, fields(provider = %self.name))]
    async fn fetch(&self, cancel: &CancellationToken) -> Result<ProviderBatch, ProviderError> {
        let batch = retry_with_backoff(&self.name, &self.retry, cancel, || self.fetch_once(cancel))
            .await
            .inspect_err(|e| warn!(error = %e, "Provider fetch failed"))?;
        debug!(
            instructions = batch.instructions.len(),
            lookup_tables = batch.lookup_tables.len(),
            "Fetched provider instructions"
        );
        Ok(batch)
    }
}

/// Instructions built locally, presented as a provider
pub struct StaticInstructionSource {
    name: String,
    batch: ProviderBatch,
}

impl StaticInstructionSource {
    pub fn new(name: impl Into<String>, instructions: &[Instruction]) -> Self {
        let name = name.into();
        Self {
            batch: ProviderBatch {
                provider: name.clone(),
                instructions: instructions.iter().map(to_provider_json).collect(),
                lookup_tables: Vec::new(),
            },
            name,
        }
    }

    /// Raw provider-shaped JSON, passed through untouched
    pub fn from_json(name: impl Into<String>, instructions: Vec<Value>) -> Self {
        let name = name.into();
        Self {
            batch: ProviderBatch {
                provider: name.clone(),
                instructions,
                lookup_tables: Vec::new(),
            },
            name,
        }
    }

    pub fn with_lookup_tables(mut self, tables: &[Pubkey]) -> Self {
        self.batch.lookup_tables = tables.iter().map(|t| t.to_string()).collect();
        self
    }
}

#[async_trait]
impl InstructionSource for StaticInstructionSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, cancel: &CancellationToken) -> Result<ProviderBatch, ProviderError> {
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        Ok(self.batch.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ix(tag: &str) -> Value {
        json!({ "programId": tag, "accounts": [], "data": "" })
    }

    #[test]
    fn test_flatten_aggregator_order() {
        let body = json!({
            "cleanupInstruction": ix("cleanup"),
            "swapInstruction": ix("swap"),
            "setupInstructions": [ix("setup-1"), ix("setup-2")],
            "computeBudgetInstructions": [ix("cb")],
            "otherInstructions": [],
            "tokenLedgerInstruction": null,
            "addressLookupTableAddresses": ["T1", "T2"],
        });
        let (instructions, tables) = flatten_response(&body).unwrap();
        let order: Vec<&str> = instructions
            .iter()
            .map(|v| v["programId"].as_str().unwrap())
            .collect();
        assert_eq!(order, vec!["cb", "setup-1", "setup-2", "swap", "cleanup"]);
        assert_eq!(tables, vec!["T1".to_string(), "T2".to_string()]);
    }

    #[test]
    fn test_flatten_plain_list() {
        let body = json!({ "instructions": [ix("a"), ix("b")] });
        let (instructions, tables) = flatten_response(&body).unwrap();
        assert_eq!(instructions.len(), 2);
        assert!(tables.is_empty());
    }

    #[test]
    fn test_flatten_rejects_unknown_shapes() {
        assert!(flatten_response(&json!([1, 2])).is_err());
        assert!(flatten_response(&json!({ "quote": 1 })).is_err());
        assert!(flatten_response(&json!({ "swapInstruction": 5 })).is_err());
    }

    #[test]
    fn test_provider_error_translation() {
        let err = ProviderError::Http { status: 503, body: "down".into() }.into_operation_error("quotes");
        assert_eq!(err.kind, ErrorKind::MalformedInstruction);
        assert_eq!(err.stage, Stage::Fetch);
        assert!(err.retryable);

        let err = ProviderError::InvalidResponse("bad".into()).into_operation_error("quotes");
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn test_static_source_emits_canonical_json() {
        let instruction = Instruction::new_with_bytes(Pubkey::new_unique(), &[1, 2], vec![]);
        let table = Pubkey::new_unique();
        let source = StaticInstructionSource::new("local", &[instruction.clone()])
            .with_lookup_tables(&[table]);

        let batch = source.fetch(&CancellationToken::new()).await.unwrap();
        assert_eq!(batch.provider, "local");
        assert_eq!(batch.instructions, vec![to_provider_json(&instruction)]);
        assert_eq!(batch.lookup_tables, vec![table.to_string()]);
    }
}
