//! Two-party signature ceremony
//!
//! `Unsigned -> UserSigned -> SponsorCosigned`. The user signs on their own
//! device; this module only validates what comes back, then asks the
//! custodial signer for the sponsor's signature. The message is never
//! modified after the user signs. A different instruction set means a new
//! draft and a new user signature.

use crate::compat;
use crate::metrics::{metrics, Timer};
use crate::pipeline::chain::{ChainClient, ChainError};
use crate::pipeline::draft::SignatureSet;
use crate::pipeline::errors::{OperationError, Stage};
use crate::pipeline::exposure::{self, DEFAULT_MAX_SPONSORED_INITS};
use crate::pipeline::issued::IssuedDrafts;
use crate::pipeline::recency::{RecencyRegistry, RecencyToken};
use async_trait::async_trait;
use base64::Engine;
use serde_json::Value;
use solana_sdk::{pubkey::Pubkey, signature::Signature, transaction::VersionedTransaction};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Field names under which a wrapped signer response carries the transaction
const WRAPPER_FIELDS: &[&str] = &[
    "signedTransaction",
    "signed_transaction",
    "serializedTransaction",
    "transaction",
    "tx",
    "data",
];

/// Fee payer slot; the sponsor always signs first
const SPONSOR_SLOT: usize = 0;

/// Errors reported by a custodial signer
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignerError {
    #[error("Signing service unavailable: {0}")]
    Unavailable(String),

    #[error("Signing request rejected: {0}")]
    Rejected(String),

    #[error("Signing service returned an unexpected response: {0}")]
    InvalidResponse(String),

    #[error("Signing request cancelled")]
    Cancelled,
}

/// Accepted shapes of a custodial signer's answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignerResponse {
    RawBytes(Vec<u8>),
    /// base64 or base58 text
    Encoded(String),
    /// Object carrying one of the other two shapes under a known field
    Wrapped {
        field: &'static str,
        inner: Box<SignerResponse>,
    },
}

impl SignerResponse {
    /// Interpret a JSON response body
    pub fn from_json(value: &Value) -> Result<Self, OperationError> {
        Self::parse(value, true)
    }

    fn parse(value: &Value, allow_wrapper: bool) -> Result<Self, OperationError> {
        match value {
            Value::String(text) => Ok(Self::Encoded(text.clone())),
            Value::Array(items) => items
                .iter()
                .map(|item| item.as_u64().and_then(|n| u8::try_from(n).ok()))
                .collect::<Option<Vec<u8>>>()
                .map(Self::RawBytes)
                .ok_or_else(|| contract_violation("byte array contains non-byte values")),
            Value::Object(map) if allow_wrapper => {
                let (field, inner) = WRAPPER_FIELDS
                    .iter()
                    .find_map(|field| map.get(*field).map(|inner| (*field, inner)))
                    .ok_or_else(|| {
                        contract_violation(format!(
                            "object response has none of the fields {WRAPPER_FIELDS:?}"
                        ))
                    })?;
                Ok(Self::Wrapped {
                    field,
                    inner: Box::new(Self::parse(inner, false)?),
                })
            }
            other => Err(contract_violation(format!(
                "unsupported response shape: {}",
                shape_name(other)
            ))),
        }
    }

    /// Candidate wire encodings, most likely first
    fn candidates(self) -> Vec<Vec<u8>> {
        match self {
            Self::RawBytes(bytes) => vec![bytes],
            Self::Encoded(text) => {
                let text = text.trim();
                base64::engine::general_purpose::STANDARD
                    .decode(text)
                    .into_iter()
                    .chain(bs58::decode(text).into_vec())
                    .collect()
            }
            Self::Wrapped { inner, .. } => inner.candidates(),
        }
    }

    /// Canonical signed transaction decoded from whichever encoding fits
    pub fn into_transaction(self) -> Result<VersionedTransaction, OperationError> {
        let candidates = self.candidates();
        if candidates.is_empty() {
            return Err(contract_violation("encoded response is neither base64 nor base58"));
        }
        let mut last_reason = String::new();
        for bytes in candidates {
            match decode_transaction(&bytes) {
                Ok(tx) => return Ok(tx),
                Err(reason) => last_reason = reason,
            }
        }
        Err(contract_violation(format!("signed bytes do not decode: {last_reason}")))
    }
}

fn shape_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "nested object",
    }
}

fn contract_violation(reason: impl Into<String>) -> OperationError {
    OperationError::signer_contract_violation(reason)
}

/// External authority holding the sponsor's key material
#[async_trait]
pub trait CustodialSigner: Send + Sync {
    /// Sign the given transaction bytes with the key named by `key_id`
    async fn sign_transaction(
        &self,
        key_id: &str,
        transaction: &[u8],
    ) -> Result<SignerResponse, SignerError>;
}

/// Validated transaction carrying at least one verified user signature
#[derive(Debug, Clone)]
pub struct UserSignedTransaction {
    tx: VersionedTransaction,
    recency: Option<RecencyToken>,
}

impl UserSignedTransaction {
    pub fn transaction(&self) -> &VersionedTransaction {
        &self.tx
    }

    /// Token with known expiry, when the node or registry could tell us
    pub fn recency(&self) -> Option<&RecencyToken> {
        self.recency.as_ref()
    }
}

/// Fully signed transaction ready for broadcast
#[derive(Debug, Clone)]
pub struct SponsorCosignedTransaction {
    tx: VersionedTransaction,
    recency: Option<RecencyToken>,
}

impl SponsorCosignedTransaction {
    pub fn transaction(&self) -> &VersionedTransaction {
        &self.tx
    }

    pub fn recency(&self) -> Option<&RecencyToken> {
        self.recency.as_ref()
    }

    pub fn signature(&self) -> Signature {
        self.tx.signatures[SPONSOR_SLOT]
    }

    pub fn into_transaction(self) -> VersionedTransaction {
        self.tx
    }
}

pub struct CeremonyCoordinator {
    sponsor: Pubkey,
    key_id: String,
    signer: Arc<dyn CustodialSigner>,
    chain: Arc<dyn ChainClient>,
    recency: Arc<RecencyRegistry>,
    /// When set, only messages recorded here are co-signed
    issued: Option<Arc<IssuedDrafts>>,
    max_sponsored_inits: usize,
}

impl CeremonyCoordinator {
    pub fn new(
        sponsor: Pubkey,
        key_id: impl Into<String>,
        signer: Arc<dyn CustodialSigner>,
        chain: Arc<dyn ChainClient>,
        recency: Arc<RecencyRegistry>,
    ) -> Self {
        Self {
            sponsor,
            key_id: key_id.into(),
            signer,
            chain,
            recency,
            issued: None,
            max_sponsored_inits: DEFAULT_MAX_SPONSORED_INITS,
        }
    }

    /// Refuse to co-sign any message that is not in `issued`
    pub fn with_issued_drafts(mut self, issued: Arc<IssuedDrafts>) -> Self {
        self.issued = Some(issued);
        self
    }

    pub fn with_max_sponsored_inits(mut self, max: usize) -> Self {
        self.max_sponsored_inits = max;
        self
    }

    /// `Unsigned -> UserSigned`: validate a user-submitted transaction
    #[instrument(skip_all)]
    pub async fn validate(
        &self,
        bytes: &[u8],
        cancel: &CancellationToken,
    ) -> Result<UserSignedTransaction, OperationError> {
        let result = self.validate_inner(bytes, cancel).await;
        if let Err(err) = &result {
            metrics().drafts_rejected.inc();
            warn!(kind = %err.kind, message = %err.message, "Rejected user-signed transaction");
        }
        result
    }

    async fn validate_inner(
        &self,
        bytes: &[u8],
        cancel: &CancellationToken,
    ) -> Result<UserSignedTransaction, OperationError> {
        let tx = decode_transaction(bytes).map_err(OperationError::malformed_transaction)?;

        match compat::get_fee_payer(&tx.message) {
            Some(payer) if *payer == self.sponsor => {}
            Some(payer) => {
                return Err(OperationError::invalid_fee_payer(
                    Stage::Ceremony,
                    format!("fee payer {payer} is not the sponsor"),
                ))
            }
            None => return Err(OperationError::malformed_transaction("message has no account keys")),
        }
        exposure::check_message(&tx.message, &self.sponsor, self.max_sponsored_inits)?;

        let recency = self.check_recency(&tx, cancel).await?;
        if let Some(issued) = &self.issued {
            if !issued.contains(&tx.message) {
                return Err(OperationError::invalid_fee_payer(
                    Stage::Ceremony,
                    "message does not match any draft built by this sponsor",
                ));
            }
        }
        self.check_user_signatures(&tx)?;

        debug!(signers = tx.signatures.len(), "User-signed transaction validated");
        Ok(UserSignedTransaction { tx, recency })
    }

    async fn check_recency(
        &self,
        tx: &VersionedTransaction,
        cancel: &CancellationToken,
    ) -> Result<Option<RecencyToken>, OperationError> {
        let blockhash = *compat::get_recent_blockhash(&tx.message);
        if blockhash == Default::default() {
            return Err(OperationError::invalid_recency_token(
                Stage::Ceremony,
                "recency token is missing or the default hash",
            ));
        }

        if let Some(token) = self.recency.lookup(&blockhash) {
            match until_cancelled(cancel, self.chain.block_height()).await? {
                Ok(height) if token.is_expired_at(height) => {
                    return Err(OperationError::invalid_recency_token(
                        Stage::Ceremony,
                        format!(
                            "recency token expired at block height {}, current height {height}",
                            token.last_valid_block_height
                        ),
                    ))
                }
                Ok(_) => {}
                Err(err) => warn!(error = %err, "Could not read block height, skipping expiry check"),
            }
            return Ok(Some(token));
        }

        match until_cancelled(cancel, self.chain.is_blockhash_valid(&blockhash)).await? {
            Ok(true) => Ok(None),
            Ok(false) => Err(OperationError::invalid_recency_token(
                Stage::Ceremony,
                format!("recency token {blockhash} is no longer valid"),
            )),
            Err(err) => {
                warn!(error = %err, %blockhash, "Could not check unknown recency token, proceeding");
                Ok(None)
            }
        }
    }

    fn check_user_signatures(&self, tx: &VersionedTransaction) -> Result<(), OperationError> {
        let set = SignatureSet::from_transaction(tx);
        let message_bytes = tx.message.serialize();

        let user_slots: Vec<usize> = set
            .populated_slots()
            .filter(|slot| *slot != SPONSOR_SLOT)
            .collect();
        if user_slots.is_empty() {
            return Err(OperationError::missing_user_signature(
                "no non-placeholder user signature present",
            ));
        }

        for slot in user_slots {
            let signer = set.signers()[slot];
            if !set.signatures()[slot].verify(signer.as_ref(), &message_bytes) {
                return Err(OperationError::missing_user_signature(format!(
                    "signature for {signer} does not verify against the message"
                )));
            }
        }
        Ok(())
    }

    /// `UserSigned -> SponsorCosigned`: obtain and check the sponsor's signature.
    ///
    /// Signing failures are not retried here.
    #[instrument(skip_all)]
    pub async fn cosign(
        &self,
        user_signed: UserSignedTransaction,
        cancel: &CancellationToken,
    ) -> Result<SponsorCosignedTransaction, OperationError> {
        let UserSignedTransaction { tx, recency } = user_signed;
        let request = bincode::serialize(&tx)
            .map_err(|e| OperationError::malformed_transaction(format!("re-encoding failed: {e}")))?;

        metrics().cosign_requests.inc();
        let timer = Timer::new();
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SignerError::Cancelled),
            response = self.signer.sign_transaction(&self.key_id, &request) => response,
        };
        timer.observe_duration(&metrics().cosign_latency);

        let response = response.map_err(|err| match err {
            SignerError::InvalidResponse(reason) => contract_violation(reason),
            other => OperationError::sponsor_sign_failed(other.to_string()),
        })?;

        let signed = response.into_transaction()?;

        let original_message = tx.message.serialize();
        if signed.message.serialize() != original_message {
            return Err(contract_violation("signed transaction carries a different message"));
        }

        let sponsor_signature = signed.signatures[SPONSOR_SLOT];
        if !sponsor_signature.verify(self.sponsor.as_ref(), &original_message) {
            return Err(contract_violation("sponsor signature does not verify"));
        }

        for (slot, original) in tx.signatures.iter().enumerate().skip(1) {
            if *original != Signature::default() && signed.signatures[slot] != *original {
                return Err(contract_violation(format!(
                    "signature in slot {slot} was altered by the signing service"
                )));
            }
        }

        if !SignatureSet::from_transaction(&signed).is_fully_signed() {
            return Err(OperationError::missing_user_signature(
                "a required signer slot is still empty after co-signing",
            ));
        }

        info!(signature = %sponsor_signature, "Sponsor co-signed transaction");
        Ok(SponsorCosignedTransaction {
            tx: signed,
            recency,
        })
    }
}

/// Race a recency lookup against the cancel token
async fn until_cancelled<T>(
    cancel: &CancellationToken,
    call: impl std::future::Future<Output = Result<T, ChainError>>,
) -> Result<Result<T, ChainError>, OperationError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(OperationError::invalid_recency_token(
            Stage::Ceremony,
            "recency check cancelled",
        )),
        result = call => Ok(result),
    }
}

/// Decode wire bytes into a sanitized transaction with one slot per required signer
pub fn decode_transaction(bytes: &[u8]) -> Result<VersionedTransaction, String> {
    let tx: VersionedTransaction =
        bincode::deserialize(bytes).map_err(|e| format!("transaction bytes do not decode: {e}"))?;
    tx.sanitize()
        .map_err(|e| format!("transaction failed sanitization: {e}"))?;
    let required = compat::get_message_header(&tx.message).num_required_signatures as usize;
    if tx.signatures.len() != required {
        return Err(format!(
            "expected {required} signatures, found {}",
            tx.signatures.len()
        ));
    }
    Ok(tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::errors::ErrorKind;
    use serde_json::json;

    fn signed_tx_bytes() -> (VersionedTransaction, Vec<u8>) {
        use solana_sdk::{
            hash::Hash,
            instruction::{AccountMeta, Instruction},
            message::{v0, VersionedMessage},
            signature::Keypair,
            signer::Signer,
        };
        let payer = Keypair::new();
        let ix = Instruction::new_with_bytes(
            Pubkey::new_unique(),
            &[1, 2, 3],
            vec![AccountMeta::new(Pubkey::new_unique(), false)],
        );
        let message = VersionedMessage::V0(
            v0::Message::try_compile(&payer.pubkey(), &[ix], &[], Hash::new_unique()).unwrap(),
        );
        let tx = VersionedTransaction::try_new(message, &[&payer]).unwrap();
        let bytes = bincode::serialize(&tx).unwrap();
        (tx, bytes)
    }

    #[test]
    fn test_response_shapes_decode_to_same_transaction() {
        let (tx, bytes) = signed_tx_bytes();
        let b64 = base64::engine::general_purpose::STANDARD.encode(&bytes);
        let b58 = bs58::encode(&bytes).into_string();

        let shapes = [
            json!(bytes.clone()),
            json!(b64.clone()),
            json!(b58),
            json!({ "signedTransaction": b64 }),
            json!({ "data": bytes }),
        ];
        for shape in shapes {
            let response = SignerResponse::from_json(&shape).unwrap();
            assert_eq!(response.into_transaction().unwrap(), tx);
        }
    }

    #[test]
    fn test_wrapped_field_recorded() {
        let response = SignerResponse::from_json(&json!({ "transaction": "abc" })).unwrap();
        assert_eq!(
            response,
            SignerResponse::Wrapped {
                field: "transaction",
                inner: Box::new(SignerResponse::Encoded("abc".into())),
            }
        );
    }

    #[test]
    fn test_unaccepted_shapes_are_contract_violations() {
        for value in [
            json!(null),
            json!(42),
            json!({ "signature": "abc" }),
            json!({ "transaction": { "data": [1] } }),
            json!([1, 2, 300]),
        ] {
            let err = SignerResponse::from_json(&value).unwrap_err();
            assert_eq!(err.kind, ErrorKind::SigningServiceContractViolation, "{value}");
        }

        let err = SignerResponse::Encoded("@@not encoded@@".into())
            .into_transaction()
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::SigningServiceContractViolation);

        let err = SignerResponse::RawBytes(vec![1, 2, 3])
            .into_transaction()
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::SigningServiceContractViolation);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_transaction(&[1, 2, 3]).is_err());
        assert!(decode_transaction(&[]).is_err());
    }
}
