//! Chain network adapter
//!
//! [`ChainClient`] is the only way the pipeline talks to the network. The
//! production implementation wraps the nonblocking Solana `RpcClient`; tests
//! use the mock in `test_utils`.

use crate::pipeline::recency::RecencyToken;
use crate::pipeline::retry::Retryable;
use async_trait::async_trait;
use solana_address_lookup_table_interface::state::AddressLookupTable;
use solana_client::client_error::{ClientError, ClientErrorKind};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_rpc_client_api::config::{RpcSendTransactionConfig, RpcSimulateTransactionConfig};
use solana_rpc_client_api::request::RpcError;
use solana_sdk::{
    address_lookup_table::AddressLookupTableAccount,
    commitment_config::{CommitmentConfig, CommitmentLevel},
    hash::Hash,
    pubkey::Pubkey,
    signature::Signature,
    transaction::VersionedTransaction,
};
use solana_transaction_status::TransactionStatus;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

/// JSON-RPC codes for node-side conditions that clear on their own:
/// block not available, node unhealthy, slot skipped, min context slot not reached
const TRANSIENT_RPC_CODES: &[i64] = &[-32004, -32005, -32007, -32016];

/// Outcome of a simulation that reached the node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimulationOutcome {
    /// Transaction error rendered as text, `None` on success
    pub err: Option<String>,
    pub logs: Vec<String>,
    pub units_consumed: Option<u64>,
}

impl SimulationOutcome {
    pub fn succeeded(&self) -> bool {
        self.err.is_none()
    }
}

/// Status of a submitted signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureState {
    /// Unknown to the node, or not yet at the requested commitment
    Pending,
    Confirmed,
    /// Landed with an execution error
    Failed(String),
}

/// Errors from the chain network endpoint
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("RPC response error: {message} (code: {code:?})")]
    Rpc { message: String, code: Option<i64> },

    #[error("Account not found: {0}")]
    AccountNotFound(Pubkey),

    #[error("Invalid account data for {account}: {reason}")]
    InvalidAccountData { account: Pubkey, reason: String },

    #[error("Request cancelled")]
    Cancelled,
}

impl ChainError {
    /// Classify a client error by kind and message text
    pub fn from_client_error(err: &ClientError) -> Self {
        let text = err.to_string();
        let lower = text.to_lowercase();

        if lower.contains("rate limit") || lower.contains("too many requests") || lower.contains("429")
        {
            return Self::RateLimited(text);
        }
        if lower.contains("timeout") || lower.contains("timed out") {
            return Self::Timeout(text);
        }

        match err.kind() {
            ClientErrorKind::Io(_) | ClientErrorKind::Reqwest(_) => Self::Transport(text),
            ClientErrorKind::RpcError(RpcError::RpcResponseError { code, message, .. }) => {
                Self::Rpc {
                    message: message.clone(),
                    code: Some(*code),
                }
            }
            _ => Self::Rpc {
                message: text,
                code: None,
            },
        }
    }

    /// Full diagnostic text, fed to the failure classifier
    pub fn diagnostic(&self) -> String {
        self.to_string()
    }
}

impl Retryable for ChainError {
    fn is_transient(&self) -> bool {
        match self {
            Self::RateLimited(_) | Self::Transport(_) | Self::Timeout(_) => true,
            Self::Rpc { code: Some(code), .. } => {
                TRANSIENT_RPC_CODES.contains(code) || (500..600).contains(code)
            }
            Self::Rpc { code: None, .. } => false,
            Self::AccountNotFound(_) | Self::InvalidAccountData { .. } | Self::Cancelled => false,
        }
    }

    fn cancelled() -> Self {
        Self::Cancelled
    }
}

/// Chain operations the pipeline needs
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn latest_recency_token(&self) -> Result<RecencyToken, ChainError>;

    async fn block_height(&self) -> Result<u64, ChainError>;

    async fn is_blockhash_valid(&self, blockhash: &Hash) -> Result<bool, ChainError>;

    /// Fetch and decode an address lookup table
    async fn lookup_table(&self, key: &Pubkey) -> Result<AddressLookupTableAccount, ChainError>;

    /// Simulate without signature verification
    async fn simulate(&self, tx: &VersionedTransaction) -> Result<SimulationOutcome, ChainError>;

    /// Submit already-simulated bytes; node-side retries disabled
    async fn send(&self, tx: &VersionedTransaction) -> Result<Signature, ChainError>;

    async fn signature_state(&self, signature: &Signature) -> Result<SignatureState, ChainError>;
}

/// [`ChainClient`] over the nonblocking Solana RPC client
pub struct RpcChainClient {
    rpc: Arc<RpcClient>,
    commitment: CommitmentConfig,
}

impl RpcChainClient {
    pub fn new(url: impl Into<String>, commitment: CommitmentConfig, timeout: Duration) -> Self {
        Self {
            rpc: Arc::new(RpcClient::new_with_timeout_and_commitment(
                url.into(),
                timeout,
                commitment,
            )),
            commitment,
        }
    }

    pub fn url(&self) -> String {
        self.rpc.url()
    }
}

#[async_trait]
impl ChainClient for RpcChainClient {
    #[instrument(skip_all)]
    async fn latest_recency_token(&self) -> Result<RecencyToken, ChainError> {
        let (blockhash, last_valid_block_height) = self
            .rpc
            .get_latest_blockhash_with_commitment(self.commitment)
            .await
            .map_err(|e| ChainError::from_client_error(&e))?;
        debug!(%blockhash, last_valid_block_height, "Fetched recency token");
        Ok(RecencyToken::new(blockhash, last_valid_block_height))
    }

    async fn block_height(&self) -> Result<u64, ChainError> {
        self.rpc
            .get_block_height_with_commitment(self.commitment)
            .await
            .map_err(|e| ChainError::from_client_error(&e))
    }

    async fn is_blockhash_valid(&self, blockhash: &Hash) -> Result<bool, ChainError> {
        self.rpc
            .is_blockhash_valid(blockhash, self.commitment)
            .await
            .map_err(|e| ChainError::from_client_error(&e))
    }

    #[instrument(skip_all, fields(table = %key))]
    async fn lookup_table(&self, key: &Pubkey) -> Result<AddressLookupTableAccount, ChainError> {
        let account = self
            .rpc
            .get_account_with_commitment(key, self.commitment)
            .await
            .map_err(|e| ChainError::from_client_error(&e))?
            .value
            .ok_or(ChainError::AccountNotFound(*key))?;

        let table = AddressLookupTable::deserialize(&account.data).map_err(|e| {
            ChainError::InvalidAccountData {
                account: *key,
                reason: e.to_string(),
            }
        })?;

        Ok(AddressLookupTableAccount {
            key: *key,
            addresses: table.addresses.to_vec(),
        })
    }

    #[instrument(skip_all)]
    async fn simulate(&self, tx: &VersionedTransaction) -> Result<SimulationOutcome, ChainError> {
        let config = RpcSimulateTransactionConfig {
            sig_verify: false,
            replace_recent_blockhash: false,
            commitment: Some(self.commitment),
            ..RpcSimulateTransactionConfig::default()
        };
        let response = self
            .rpc
            .simulate_transaction_with_config(tx, config)
            .await
            .map_err(|e| ChainError::from_client_error(&e))?;

        let value = response.value;
        Ok(SimulationOutcome {
            err: value.err.map(|err| format!("{err:?}")),
            logs: value.logs.unwrap_or_default(),
            units_consumed: value.units_consumed,
        })
    }

    #[instrument(skip_all)]
    async fn send(&self, tx: &VersionedTransaction) -> Result<Signature, ChainError> {
        let config = RpcSendTransactionConfig {
            skip_preflight: true,
            preflight_commitment: Some(CommitmentLevel::Processed),
            max_retries: Some(0),
            ..RpcSendTransactionConfig::default()
        };
        self.rpc
            .send_transaction_with_config(tx, config)
            .await
            .map_err(|e| ChainError::from_client_error(&e))
    }

    async fn signature_state(&self, signature: &Signature) -> Result<SignatureState, ChainError> {
        let statuses = self
            .rpc
            .get_signature_statuses(&[*signature])
            .await
            .map_err(|e| ChainError::from_client_error(&e))?
            .value;

        Ok(signature_state_from(
            statuses.into_iter().next().flatten(),
            self.commitment,
        ))
    }
}

/// Reduce a node status report to the pipeline's view of a signature
fn signature_state_from(
    status: Option<TransactionStatus>,
    commitment: CommitmentConfig,
) -> SignatureState {
    match status {
        None => SignatureState::Pending,
        Some(status) => match status.err {
            Some(err) => SignatureState::Failed(format!("{err:?}")),
            None if status.satisfies_commitment(commitment) => SignatureState::Confirmed,
            None => SignatureState::Pending,
        },
    }
}
