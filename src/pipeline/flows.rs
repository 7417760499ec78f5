//! Calling flows: deposit, transfer and swap
//!
//! A flow decides which instruction sources feed the pipeline and owns the
//! rebuild policy for retryable failures. The client machine below it never
//! retries on its own.

use crate::pipeline::client::{OperationMachine, Outcome, UserSigner};
use crate::pipeline::errors::{ErrorKind, OperationError, Stage};
use crate::pipeline::provider::{HttpInstructionSource, InstructionSource, StaticInstructionSource};
use crate::pipeline::retry::{PacingClock, RetryConfig};
use crate::pipeline::service::SponsorPipeline;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use solana_sdk::{instruction::Instruction, pubkey::Pubkey};
use spl_associated_token_account::{
    get_associated_token_address_with_program_id,
    instruction::create_associated_token_account_idempotent,
};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Deposit,
    Transfer,
    Swap,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deposit => "deposit",
            Self::Transfer => "transfer",
            Self::Swap => "swap",
        }
    }
}

/// An operation and its ordered instruction sources
#[derive(Clone)]
pub struct OperationRequest {
    kind: OperationKind,
    sources: Vec<Arc<dyn InstructionSource>>,
}

impl OperationRequest {
    /// Swap through a single quote provider
    pub fn swap(quote: Arc<dyn InstructionSource>) -> Self {
        Self {
            kind: OperationKind::Swap,
            sources: vec![quote],
        }
    }

    /// Optional swap into the vault asset, then the vault's deposit instructions
    pub fn deposit(quote: Option<Arc<dyn InstructionSource>>, vault: Arc<dyn InstructionSource>) -> Self {
        Self {
            kind: OperationKind::Deposit,
            sources: quote.into_iter().chain(std::iter::once(vault)).collect(),
        }
    }

    /// Token transfer built locally
    pub fn transfer(params: &TransferParams) -> Result<Self, OperationError> {
        let instructions = transfer_instructions(params)?;
        let source: Arc<dyn InstructionSource> =
            Arc::new(StaticInstructionSource::new(OperationKind::Transfer.as_str(), &instructions));
        Ok(Self {
            kind: OperationKind::Transfer,
            sources: vec![source],
        })
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn sources(&self) -> &[Arc<dyn InstructionSource>] {
        &self.sources
    }
}

impl std::fmt::Debug for OperationRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationRequest")
            .field("kind", &self.kind)
            .field(
                "sources",
                &self.sources.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferParams {
    pub owner: Pubkey,
    pub recipient: Pubkey,
    pub mint: Pubkey,
    pub amount: u64,
    pub decimals: u8,
    pub token_program: Pubkey,
}

/// Recipient ATA create (payer = owner until sponsored) followed by `transfer_checked`
pub fn transfer_instructions(params: &TransferParams) -> Result<Vec<Instruction>, OperationError> {
    if params.amount == 0 {
        return Err(invalid_request("transfer amount must be positive"));
    }
    if params.token_program != spl_token::id() && params.token_program != spl_token_2022::id() {
        return Err(invalid_request(format!(
            "unsupported token program {}",
            params.token_program
        )));
    }

    let source = get_associated_token_address_with_program_id(
        &params.owner,
        &params.mint,
        &params.token_program,
    );
    let destination = get_associated_token_address_with_program_id(
        &params.recipient,
        &params.mint,
        &params.token_program,
    );

    let create = create_associated_token_account_idempotent(
        &params.owner,
        &params.recipient,
        &params.mint,
        &params.token_program,
    );
    let transfer = if params.token_program == spl_token::id() {
        spl_token::instruction::transfer_checked(
            &params.token_program,
            &source,
            &params.mint,
            &destination,
            &params.owner,
            &[],
            params.amount,
            params.decimals,
        )
        .map_err(|e| invalid_request(format!("transfer instruction: {e}")))?
    } else {
        spl_token_2022::instruction::transfer_checked(
            &params.token_program,
            &source,
            &params.mint,
            &destination,
            &params.owner,
            &[],
            params.amount,
            params.decimals,
        )
        .map_err(|e| invalid_request(format!("transfer instruction: {e}")))?
    };

    Ok(vec![create, transfer])
}

fn invalid_request(message: impl Into<String>) -> OperationError {
    OperationError::new(ErrorKind::MalformedInstruction, Stage::Compose, message)
}

/// Rebuild with a fresh draft on retryable failures, backing off between attempts
pub async fn run_with_rebuilds(
    machine: &OperationMachine,
    pipeline: &SponsorPipeline,
    request: &OperationRequest,
    user: &dyn UserSigner,
    policy: &RetryConfig,
    cancel: &CancellationToken,
) -> Result<Outcome, OperationError> {
    let mut delays = policy.delays();
    let mut rebuilds = 0u32;
    loop {
        let err = match machine.run(pipeline, request.sources(), user, cancel).await {
            Err(err) if err.retryable => err,
            other => return other,
        };
        let Some(delay) = delays.next() else {
            return Err(err);
        };

        rebuilds += 1;
        warn!(
            operation = request.kind().as_str(),
            kind = %err.kind,
            rebuilds,
            delay_ms = delay.as_millis() as u64,
            "Retryable failure, rebuilding draft"
        );
        tokio::select! {
            _ = cancel.cancelled() => return Err(err),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// A named provider endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEndpoint {
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

/// Builds instruction sources from request descriptions
pub struct SourceFactory {
    endpoints: HashMap<String, ProviderEndpoint>,
    pacing: Arc<PacingClock>,
    timeout: Duration,
    retry: RetryConfig,
}

impl SourceFactory {
    pub fn new(
        endpoints: HashMap<String, ProviderEndpoint>,
        pacing: Arc<PacingClock>,
        timeout: Duration,
        retry: RetryConfig,
    ) -> Self {
        Self {
            endpoints,
            pacing,
            timeout,
            retry,
        }
    }

    fn source(&self, call: &ProviderCall) -> Result<Arc<dyn InstructionSource>, OperationError> {
        if let Some(instructions) = &call.instructions {
            let tables = call
                .lookup_tables
                .iter()
                .map(|t| parse_key("lookup table", t))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Arc::new(
                StaticInstructionSource::from_json(&call.provider, instructions.clone())
                    .with_lookup_tables(&tables),
            ));
        }

        let endpoint = match (&call.url, self.endpoints.get(&call.provider)) {
            (Some(url), configured) => ProviderEndpoint {
                url: url.clone(),
                api_key: configured.and_then(|e| e.api_key.clone()),
            },
            (None, Some(configured)) => configured.clone(),
            (None, None) => {
                return Err(invalid_request(format!(
                    "provider {:?} has no url and no configured endpoint",
                    call.provider
                )))
            }
        };

        let mut source = HttpInstructionSource::new(
            &call.provider,
            endpoint.url,
            call.request.clone(),
            self.timeout,
            self.pacing.clone(),
            self.retry.clone(),
        )
        .map_err(|e| e.into_operation_error(&call.provider))?;
        if let Some(key) = endpoint.api_key {
            source = source.with_api_key(key);
        }
        Ok(Arc::new(source))
    }
}

/// One provider call inside a request description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderCall {
    pub provider: String,
    #[serde(default)]
    pub url: Option<String>,
    /// Body POSTed to the provider
    #[serde(default)]
    pub request: Value,
    /// Pre-fetched instructions; no HTTP call is made when present
    #[serde(default)]
    pub instructions: Option<Vec<Value>>,
    #[serde(default)]
    pub lookup_tables: Vec<String>,
}

/// Operation request as read from JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestSpec {
    Transfer {
        owner: String,
        recipient: String,
        mint: String,
        amount: u64,
        decimals: u8,
        #[serde(default)]
        token_program: Option<String>,
    },
    Swap {
        quote: ProviderCall,
    },
    Deposit {
        #[serde(default)]
        quote: Option<ProviderCall>,
        vault: ProviderCall,
    },
}

impl RequestSpec {
    pub fn into_request(self, factory: &SourceFactory) -> Result<OperationRequest, OperationError> {
        let request = match self {
            Self::Transfer {
                owner,
                recipient,
                mint,
                amount,
                decimals,
                token_program,
            } => OperationRequest::transfer(&TransferParams {
                owner: parse_key("owner", &owner)?,
                recipient: parse_key("recipient", &recipient)?,
                mint: parse_key("mint", &mint)?,
                amount,
                decimals,
                token_program: match token_program {
                    Some(program) => parse_key("token program", &program)?,
                    None => spl_token::id(),
                },
            })?,
            Self::Swap { quote } => OperationRequest::swap(factory.source(&quote)?),
            Self::Deposit { quote, vault } => OperationRequest::deposit(
                quote.map(|q| factory.source(&q)).transpose()?,
                factory.source(&vault)?,
            ),
        };
        info!(request = ?request, "Operation request prepared");
        Ok(request)
    }
}

fn parse_key(field: &str, value: &str) -> Result<Pubkey, OperationError> {
    Pubkey::from_str(value).map_err(|e| invalid_request(format!("{field} {value:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ata::AtaInitRecord;
    use serde_json::json;

    fn params() -> TransferParams {
        TransferParams {
            owner: Pubkey::new_unique(),
            recipient: Pubkey::new_unique(),
            mint: Pubkey::new_unique(),
            amount: 1_000,
            decimals: 6,
            token_program: spl_token::id(),
        }
    }

    fn factory() -> SourceFactory {
        SourceFactory::new(
            HashMap::new(),
            Arc::new(PacingClock::disabled()),
            Duration::from_secs(1),
            RetryConfig::no_retry(),
        )
    }

    #[test]
    fn test_transfer_instructions() {
        let params = params();
        let ixs = transfer_instructions(&params).unwrap();
        assert_eq!(ixs.len(), 2);

        let init = AtaInitRecord::from_instruction(&ixs[0]).expect("recognized ATA create");
        assert_eq!(init.owner, params.recipient);
        assert_eq!(init.original_payer, params.owner);

        assert_eq!(ixs[1].program_id, spl_token::id());
        assert!(ixs[1]
            .accounts
            .iter()
            .any(|meta| meta.pubkey == params.owner && meta.is_signer));
    }

    #[test]
    fn test_token_2022_transfer_instructions() {
        let mut params = params();
        params.token_program = spl_token_2022::id();
        let ixs = transfer_instructions(&params).unwrap();

        let init = AtaInitRecord::from_instruction(&ixs[0]).expect("recognized ATA create");
        assert_eq!(init.token_program, spl_token_2022::id());
        assert_eq!(
            init.target,
            get_associated_token_address_with_program_id(
                &params.recipient,
                &params.mint,
                &spl_token_2022::id()
            )
        );

        assert_eq!(ixs[1].program_id, spl_token_2022::id());
        assert_eq!(ixs[1].accounts[1].pubkey, params.mint);
        assert_eq!(ixs[1].data[0], 12);
        assert_eq!(ixs[1].data[1..9], params.amount.to_le_bytes());
        assert_eq!(ixs[1].data[9], params.decimals);
    }

    #[test]
    fn test_unknown_token_program_rejected() {
        let mut params = params();
        params.token_program = Pubkey::new_unique();
        let err = transfer_instructions(&params).unwrap_err();
        assert_eq!(err.kind, ErrorKind::MalformedInstruction);
        assert!(err.message.contains("unsupported token program"));
    }

    #[test]
    fn test_zero_amount_rejected() {
        let mut params = params();
        params.amount = 0;
        let err = transfer_instructions(&params).unwrap_err();
        assert_eq!(err.kind, ErrorKind::MalformedInstruction);
    }

    #[test]
    fn test_deposit_orders_quote_before_vault() {
        let quote: Arc<dyn InstructionSource> = Arc::new(StaticInstructionSource::new("quote", &[]));
        let vault: Arc<dyn InstructionSource> = Arc::new(StaticInstructionSource::new("vault", &[]));
        let request = OperationRequest::deposit(Some(quote), vault);
        let names: Vec<&str> = request.sources().iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["quote", "vault"]);
        assert_eq!(request.kind(), OperationKind::Deposit);
    }

    #[test]
    fn test_request_spec_parsing() {
        let p = params();
        let spec: RequestSpec = serde_json::from_value(json!({
            "kind": "transfer",
            "owner": p.owner.to_string(),
            "recipient": p.recipient.to_string(),
            "mint": p.mint.to_string(),
            "amount": 1000,
            "decimals": 6,
        }))
        .unwrap();
        let request = spec.into_request(&factory()).unwrap();
        assert_eq!(request.kind(), OperationKind::Transfer);
        assert_eq!(request.sources().len(), 1);
    }

    #[test]
    fn test_request_spec_inline_instructions() {
        let spec: RequestSpec = serde_json::from_value(json!({
            "kind": "swap",
            "quote": { "provider": "router", "instructions": [] },
        }))
        .unwrap();
        let request = spec.into_request(&factory()).unwrap();
        assert_eq!(request.sources()[0].name(), "router");
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let spec: RequestSpec = serde_json::from_value(json!({
            "kind": "swap",
            "quote": { "provider": "nowhere" },
        }))
        .unwrap();
        let err = spec.into_request(&factory()).unwrap_err();
        assert!(err.message.contains("nowhere"));
    }

    #[test]
    fn test_bad_pubkey_rejected() {
        let spec: RequestSpec = serde_json::from_value(json!({
            "kind": "transfer",
            "owner": "not-a-key",
            "recipient": Pubkey::new_unique().to_string(),
            "mint": Pubkey::new_unique().to_string(),
            "amount": 1,
            "decimals": 0,
        }))
        .unwrap();
        assert!(spec.into_request(&factory()).is_err());
    }
}
