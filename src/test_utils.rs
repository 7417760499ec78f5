//! Test Utilities Module
//!
//! Mock chain, mock custodial signer and user wallets for deterministic
//! pipeline tests. Every mock counts its calls so tests can assert that a
//! path touched no network.
//!
//! These utilities are only compiled when running tests or when the
//! `test_utils` feature is enabled.

#![cfg(any(test, feature = "test_utils"))]

use crate::pipeline::ceremony::{CustodialSigner, SignerError, SignerResponse};
use crate::pipeline::chain::{ChainClient, ChainError, SignatureState, SimulationOutcome};
use crate::pipeline::client::{UserSignError, UserSigner};
use crate::pipeline::draft::TransactionDraft;
use crate::pipeline::provider::{InstructionSource, ProviderBatch, ProviderError};
use crate::pipeline::recency::RecencyToken;
use crate::signer::KeypairSigner;
use crate::wallet::SponsorWallet;
use async_trait::async_trait;
use base64::Engine;
use dashmap::DashMap;
use parking_lot::Mutex;
use solana_sdk::{
    address_lookup_table::AddressLookupTableAccount,
    hash::Hash,
    pubkey::Pubkey,
    signature::{Keypair, Signature, Signer},
    transaction::VersionedTransaction,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Per-method call counters
#[derive(Debug, Default)]
pub struct CallCounters {
    pub recency: AtomicUsize,
    pub block_height: AtomicUsize,
    pub blockhash_valid: AtomicUsize,
    pub lookup_table: AtomicUsize,
    pub simulate: AtomicUsize,
    pub send: AtomicUsize,
    pub signature_state: AtomicUsize,
}

impl CallCounters {
    pub fn total(&self) -> usize {
        [
            &self.recency,
            &self.block_height,
            &self.blockhash_valid,
            &self.lookup_table,
            &self.simulate,
            &self.send,
            &self.signature_state,
        ]
        .iter()
        .map(|c| c.load(Ordering::SeqCst))
        .sum()
    }
}

fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::SeqCst);
}

/// Scriptable in-memory chain
pub struct MockChainClient {
    pub calls: CallCounters,
    recency: Mutex<RecencyToken>,
    recency_error: Mutex<Option<ChainError>>,
    block_height: AtomicU64,
    blockhash_valid: AtomicBool,
    tables: DashMap<Pubkey, AddressLookupTableAccount>,
    simulation: Mutex<SimulationOutcome>,
    send_errors: Mutex<VecDeque<ChainError>>,
    signature_state: Mutex<SignatureState>,
    landed: DashMap<Signature, VersionedTransaction>,
    simulate_gate: Mutex<Option<Arc<Notify>>>,
    status_delay: Mutex<Option<Duration>>,
}

impl Default for MockChainClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChainClient {
    /// Healthy chain: fresh recency token, clean simulation, instant confirmation
    pub fn new() -> Self {
        Self {
            calls: CallCounters::default(),
            recency: Mutex::new(RecencyToken::new(Hash::new_unique(), 1_150)),
            recency_error: Mutex::new(None),
            block_height: AtomicU64::new(1_000),
            blockhash_valid: AtomicBool::new(true),
            tables: DashMap::new(),
            simulation: Mutex::new(SimulationOutcome::default()),
            send_errors: Mutex::new(VecDeque::new()),
            signature_state: Mutex::new(SignatureState::Confirmed),
            landed: DashMap::new(),
            simulate_gate: Mutex::new(None),
            status_delay: Mutex::new(None),
        }
    }

    pub fn current_recency(&self) -> RecencyToken {
        *self.recency.lock()
    }

    pub fn fail_recency(&self, err: Option<ChainError>) {
        *self.recency_error.lock() = err;
    }

    pub fn set_block_height(&self, height: u64) {
        self.block_height.store(height, Ordering::SeqCst);
    }

    pub fn set_blockhash_valid(&self, valid: bool) {
        self.blockhash_valid.store(valid, Ordering::SeqCst);
    }

    pub fn add_lookup_table(&self, table: AddressLookupTableAccount) {
        self.tables.insert(table.key, table);
    }

    pub fn set_simulation(&self, outcome: SimulationOutcome) {
        *self.simulation.lock() = outcome;
    }

    /// Queue errors returned by the next `send` calls, in order
    pub fn push_send_error(&self, err: ChainError) {
        self.send_errors.lock().push_back(err);
    }

    pub fn set_signature_state(&self, state: SignatureState) {
        *self.signature_state.lock() = state;
    }

    /// Block `simulate` until the gate is notified
    pub fn hold_simulate(&self, gate: Arc<Notify>) {
        *self.simulate_gate.lock() = Some(gate);
    }

    /// Make `block_height`, `is_blockhash_valid` and `signature_state` answer after `delay`
    pub fn delay_status_calls(&self, delay: Duration) {
        *self.status_delay.lock() = Some(delay);
    }

    async fn status_latency(&self) {
        let delay = *self.status_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    /// Distinct transactions that reached the ledger
    pub fn landed_count(&self) -> usize {
        self.landed.len()
    }

    pub fn landed(&self, signature: &Signature) -> Option<VersionedTransaction> {
        self.landed.get(signature).map(|tx| tx.clone())
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn latest_recency_token(&self) -> Result<RecencyToken, ChainError> {
        bump(&self.calls.recency);
        if let Some(err) = self.recency_error.lock().clone() {
            return Err(err);
        }
        Ok(*self.recency.lock())
    }

    async fn block_height(&self) -> Result<u64, ChainError> {
        bump(&self.calls.block_height);
        self.status_latency().await;
        Ok(self.block_height.load(Ordering::SeqCst))
    }

    async fn is_blockhash_valid(&self, _blockhash: &Hash) -> Result<bool, ChainError> {
        bump(&self.calls.blockhash_valid);
        self.status_latency().await;
        Ok(self.blockhash_valid.load(Ordering::SeqCst))
    }

    async fn lookup_table(&self, key: &Pubkey) -> Result<AddressLookupTableAccount, ChainError> {
        bump(&self.calls.lookup_table);
        self.tables
            .get(key)
            .map(|table| table.clone())
            .ok_or(ChainError::AccountNotFound(*key))
    }

    async fn simulate(&self, _tx: &VersionedTransaction) -> Result<SimulationOutcome, ChainError> {
        bump(&self.calls.simulate);
        let gate = self.simulate_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(self.simulation.lock().clone())
    }

    async fn send(&self, tx: &VersionedTransaction) -> Result<Signature, ChainError> {
        bump(&self.calls.send);
        if let Some(err) = self.send_errors.lock().pop_front() {
            return Err(err);
        }
        let signature = tx.signatures[0];
        if self.landed.contains_key(&signature) {
            return Err(ChainError::Rpc {
                message: "Transaction simulation failed: This transaction has already been processed"
                    .into(),
                code: Some(-32002),
            });
        }
        self.landed.insert(signature, tx.clone());
        Ok(signature)
    }

    async fn signature_state(&self, _signature: &Signature) -> Result<SignatureState, ChainError> {
        bump(&self.calls.signature_state);
        self.status_latency().await;
        Ok(self.signature_state.lock().clone())
    }
}

/// How [`MockCustodialSigner`] answers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockSignerMode {
    RawBytes,
    Base64,
    Base58,
    /// base64 under a wrapper field
    Wrapped,
    Fail(SignerError),
    /// A string that decodes to nothing
    Garbage,
    /// Sign correctly but overwrite the user's signature
    Tamper,
}

/// Custodial signer backed by a local keypair with scripted response shapes
pub struct MockCustodialSigner {
    inner: KeypairSigner,
    mode: Mutex<MockSignerMode>,
    pub calls: AtomicUsize,
}

impl MockCustodialSigner {
    pub fn new(key_id: &str, wallet: SponsorWallet) -> Self {
        Self {
            inner: KeypairSigner::new(key_id, wallet),
            mode: Mutex::new(MockSignerMode::RawBytes),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_mode(&self, mode: MockSignerMode) {
        *self.mode.lock() = mode;
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CustodialSigner for MockCustodialSigner {
    async fn sign_transaction(
        &self,
        key_id: &str,
        transaction: &[u8],
    ) -> Result<SignerResponse, SignerError> {
        bump(&self.calls);
        let mode = self.mode.lock().clone();

        let SignerResponse::RawBytes(signed) = self.inner.sign_transaction(key_id, transaction).await?
        else {
            return Err(SignerError::InvalidResponse("unexpected local response".into()));
        };
        let base64 = base64::engine::general_purpose::STANDARD.encode(&signed);

        Ok(match mode {
            MockSignerMode::Fail(err) => return Err(err),
            MockSignerMode::RawBytes => SignerResponse::RawBytes(signed),
            MockSignerMode::Base64 => SignerResponse::Encoded(base64),
            MockSignerMode::Base58 => SignerResponse::Encoded(bs58::encode(&signed).into_string()),
            MockSignerMode::Wrapped => SignerResponse::Wrapped {
                field: "signedTransaction",
                inner: Box::new(SignerResponse::Encoded(base64)),
            },
            MockSignerMode::Garbage => SignerResponse::Encoded("%%% not a transaction %%%".into()),
            MockSignerMode::Tamper => {
                let mut tx: VersionedTransaction = bincode::deserialize(&signed)
                    .map_err(|e| SignerError::InvalidResponse(e.to_string()))?;
                if let Some(slot) = tx.signatures.get_mut(1) {
                    *slot = Keypair::new().sign_message(b"tampered");
                }
                SignerResponse::RawBytes(
                    bincode::serialize(&tx).map_err(|e| SignerError::InvalidResponse(e.to_string()))?,
                )
            }
        })
    }
}

/// User wallet signing drafts with local keypairs
pub struct KeypairUserSigner {
    keypairs: Vec<Keypair>,
    decline: AtomicBool,
    gate: Mutex<Option<Arc<Notify>>>,
    pub calls: AtomicUsize,
}

impl KeypairUserSigner {
    pub fn new(keypair: Keypair) -> Self {
        Self {
            keypairs: vec![keypair],
            decline: AtomicBool::new(false),
            gate: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn pubkey(&self) -> Pubkey {
        self.keypairs[0].pubkey()
    }

    pub fn set_decline(&self, decline: bool) {
        self.decline.store(decline, Ordering::SeqCst);
    }

    /// Wait for the gate before signing, like a user pondering a prompt
    pub fn hold(&self, gate: Arc<Notify>) {
        *self.gate.lock() = Some(gate);
    }

    /// Sign every slot this wallet owns
    pub fn sign_transaction(&self, mut tx: VersionedTransaction) -> VersionedTransaction {
        let message = tx.message.serialize();
        let signers = tx.message.static_account_keys().to_vec();
        for (slot, key) in signers.iter().enumerate().take(tx.signatures.len()) {
            if let Some(keypair) = self.keypairs.iter().find(|k| k.pubkey() == *key) {
                tx.signatures[slot] = keypair.sign_message(&message);
            }
        }
        tx
    }
}

#[async_trait]
impl UserSigner for KeypairUserSigner {
    async fn sign(&self, draft: &TransactionDraft) -> Result<Vec<u8>, UserSignError> {
        bump(&self.calls);
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.decline.load(Ordering::SeqCst) {
            return Err(UserSignError::Declined);
        }
        let signed = self.sign_transaction(draft.unsigned_transaction());
        bincode::serialize(&signed).map_err(|e| UserSignError::Failed(e.to_string()))
    }
}

/// Fixed provider batch with a fetch counter
pub struct CountingSource {
    batch: ProviderBatch,
    pub fetches: AtomicUsize,
}

impl CountingSource {
    pub fn new(batch: ProviderBatch) -> Self {
        Self {
            batch,
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InstructionSource for CountingSource {
    fn name(&self) -> &str {
        &self.batch.provider
    }

    async fn fetch(&self, cancel: &CancellationToken) -> Result<ProviderBatch, ProviderError> {
        bump(&self.fetches);
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        Ok(self.batch.clone())
    }
}

/// A lookup table holding `addresses`
pub fn lookup_table(addresses: Vec<Pubkey>) -> AddressLookupTableAccount {
    AddressLookupTableAccount {
        key: Pubkey::new_unique(),
        addresses,
    }
}
