//! Error taxonomy for the sponsored transaction pipeline
//!
//! Every failure produced anywhere inside the pipeline is translated into
//! exactly one [`ErrorKind`] before it reaches a calling flow. Raw upstream
//! diagnostics never cross the boundary untranslated; only a bounded excerpt
//! is carried along in [`OperationError::upstream_logs`] for support.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Maximum number of characters of upstream diagnostic text kept on an error
pub const MAX_DIAGNOSTIC_CHARS: usize = 512;

/// Maximum number of simulation log lines kept on an error
pub const MAX_LOG_LINES: usize = 20;

/// The closed set of failure kinds a calling flow can observe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// A provider instruction could not be normalized
    MalformedInstruction,
    /// Submitted transaction bytes could not be decoded or sanitized
    MalformedTransaction,
    /// Composed transaction exceeds the per-transaction byte ceiling
    PayloadTooLarge,
    /// Fee payer is not the sponsor, or the sponsor is referenced where it must not be
    InvalidFeePayer,
    /// Recency token missing, null, or expired
    InvalidRecencyToken,
    /// No valid user signature present
    MissingUserSignature,
    /// Custodial signer unavailable or rejected the request
    SponsorSignFailed,
    /// Custodial signer answered with something we cannot accept
    SigningServiceContractViolation,
    /// Price moved beyond tolerance
    SlippageExceeded,
    /// User lacks funds for amount plus fees
    InsufficientBalance,
    /// Simulation failed for an unrecognized reason
    SimulationFailed,
    /// Broadcast or on-chain execution failed for an unrecognized reason
    BroadcastFailed,
    /// Another operation is already in flight for this session
    OperationInProgress,
}

impl ErrorKind {
    /// Default retryability of this kind.
    ///
    /// `SimulationFailed` and `BroadcastFailed` default to not retryable; the
    /// classifier flips them per instance when the diagnostic is transient.
    pub fn default_retryable(self) -> bool {
        match self {
            Self::InvalidRecencyToken => true,
            Self::SponsorSignFailed => true,
            Self::SlippageExceeded => true,

            Self::MalformedInstruction => false,
            Self::MalformedTransaction => false,
            Self::PayloadTooLarge => false,
            Self::InvalidFeePayer => false,
            Self::MissingUserSignature => false,
            Self::SigningServiceContractViolation => false,
            Self::InsufficientBalance => false,
            Self::SimulationFailed => false,
            Self::BroadcastFailed => false,
            Self::OperationInProgress => false,
        }
    }

    /// Stable wire name, also used as the metrics label
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MalformedInstruction => "MALFORMED_INSTRUCTION",
            Self::MalformedTransaction => "MALFORMED_TRANSACTION",
            Self::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            Self::InvalidFeePayer => "INVALID_FEE_PAYER",
            Self::InvalidRecencyToken => "INVALID_RECENCY_TOKEN",
            Self::MissingUserSignature => "MISSING_USER_SIGNATURE",
            Self::SponsorSignFailed => "SPONSOR_SIGN_FAILED",
            Self::SigningServiceContractViolation => "SIGNING_SERVICE_CONTRACT_VIOLATION",
            Self::SlippageExceeded => "SLIPPAGE_EXCEEDED",
            Self::InsufficientBalance => "INSUFFICIENT_BALANCE",
            Self::SimulationFailed => "SIMULATION_FAILED",
            Self::BroadcastFailed => "BROADCAST_FAILED",
            Self::OperationInProgress => "OPERATION_IN_PROGRESS",
        }
    }

    /// Short human message for UI binding
    pub fn user_message(self) -> &'static str {
        match self {
            Self::MalformedInstruction => "The quote service returned an invalid route. Please try a different amount.",
            Self::MalformedTransaction => "The transaction could not be read.",
            Self::PayloadTooLarge => "This operation is too large for a single transaction. Try a smaller or simpler route.",
            Self::InvalidFeePayer => "The transaction was not prepared by this service.",
            Self::InvalidRecencyToken => "The transaction expired before it was sent. Please try again.",
            Self::MissingUserSignature => "The transaction was not signed by your wallet.",
            Self::SponsorSignFailed => "Network fees could not be sponsored right now. Please try again.",
            Self::SigningServiceContractViolation => "Network fees could not be sponsored.",
            Self::SlippageExceeded => "The price moved while your transaction was processing. Get a new quote and retry.",
            Self::InsufficientBalance => "Insufficient balance for this amount.",
            Self::SimulationFailed => "The transaction would fail if sent.",
            Self::BroadcastFailed => "The transaction could not be sent.",
            Self::OperationInProgress => "Another operation is already in progress.",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline phase that produced an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetch,
    Normalize,
    Compose,
    Draft,
    Ceremony,
    Signing,
    Simulate,
    Broadcast,
    Confirm,
    Client,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Normalize => "normalize",
            Self::Compose => "compose",
            Self::Draft => "draft",
            Self::Ceremony => "ceremony",
            Self::Signing => "signing",
            Self::Simulate => "simulate",
            Self::Broadcast => "broadcast",
            Self::Confirm => "confirm",
            Self::Client => "client",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure value handed to the calling flow
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind} at {stage}: {message}")]
pub struct OperationError {
    pub kind: ErrorKind,
    pub message: String,
    pub stage: Stage,
    pub retryable: bool,
    /// Truncated diagnostic excerpt (simulation logs, RPC error text)
    pub upstream_logs: Option<String>,
}

impl OperationError {
    /// Create an error with the kind's default retryability
    pub fn new(kind: ErrorKind, stage: Stage, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stage,
            retryable: kind.default_retryable(),
            upstream_logs: None,
        }
    }

    /// Attach a diagnostic excerpt, truncated to [`MAX_DIAGNOSTIC_CHARS`]
    pub fn with_logs(mut self, logs: impl AsRef<str>) -> Self {
        let logs = logs.as_ref();
        if !logs.is_empty() {
            self.upstream_logs = Some(truncate_diagnostic(logs));
        }
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Label used for metrics
    pub fn category(&self) -> &'static str {
        self.kind.as_str()
    }

    pub fn user_message(&self) -> &'static str {
        self.kind.user_message()
    }
}

// Convenience constructors for common error scenarios
impl OperationError {
    pub fn malformed_instruction(
        provider: &str,
        index: usize,
        reason: impl fmt::Display,
        preview: &str,
    ) -> Self {
        Self::new(
            ErrorKind::MalformedInstruction,
            Stage::Normalize,
            format!("provider={provider} index={index}: {reason}"),
        )
        .with_logs(preview)
    }

    pub fn malformed_transaction(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::MalformedTransaction, Stage::Ceremony, reason)
    }

    pub fn payload_too_large(measured: usize, ceiling: usize) -> Self {
        Self::new(
            ErrorKind::PayloadTooLarge,
            Stage::Compose,
            format!("serialized transaction is {measured} bytes, ceiling is {ceiling}"),
        )
    }

    pub fn invalid_fee_payer(stage: Stage, reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidFeePayer, stage, reason)
    }

    pub fn invalid_recency_token(stage: Stage, reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRecencyToken, stage, reason)
    }

    pub fn missing_user_signature(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::MissingUserSignature, Stage::Ceremony, reason)
    }

    pub fn sponsor_sign_failed(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::SponsorSignFailed, Stage::Signing, reason)
    }

    pub fn signer_contract_violation(reason: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::SigningServiceContractViolation,
            Stage::Signing,
            reason,
        )
    }

    pub fn operation_in_progress() -> Self {
        Self::new(
            ErrorKind::OperationInProgress,
            Stage::Client,
            "an operation is already in flight for this session",
        )
    }
}

/// Truncate a diagnostic to a bounded excerpt on a char boundary
pub fn truncate_diagnostic(text: &str) -> String {
    if text.chars().count() <= MAX_DIAGNOSTIC_CHARS {
        return text.to_string();
    }
    let mut out: String = text.chars().take(MAX_DIAGNOSTIC_CHARS).collect();
    out.push_str("…");
    out
}

/// Keep the tail of a simulation log, where program failures are reported
pub fn excerpt_logs(logs: &[String]) -> String {
    let start = logs.len().saturating_sub(MAX_LOG_LINES);
    truncate_diagnostic(&logs[start..].join("\n"))
}
