//! Shared fixtures for pipeline integration tests

#![allow(dead_code)]

use fee_sponsor::pipeline::broadcast::BroadcastConfig;
use fee_sponsor::pipeline::flows::{OperationRequest, TransferParams};
use fee_sponsor::pipeline::provider::{InstructionSource, StaticInstructionSource};
use fee_sponsor::pipeline::retry::RetryConfig;
use fee_sponsor::pipeline::service::{PipelineConfig, SharedCaches, SponsorPipeline};
use fee_sponsor::pipeline::TransactionDraft;
use fee_sponsor::test_utils::{KeypairUserSigner, MockChainClient, MockCustodialSigner};
use fee_sponsor::wallet::SponsorWallet;
use solana_sdk::{
    instruction::{AccountMeta, Instruction},
    pubkey::Pubkey,
    signature::Keypair,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const KEY_ID: &str = "sponsor-key";

pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        base_backoff_ms: 1,
        max_backoff_ms: 5,
    }
}

pub fn fast_broadcast() -> BroadcastConfig {
    BroadcastConfig {
        send_attempts: 3,
        confirm_timeout: Duration::from_millis(200),
        confirm_poll_interval: Duration::from_millis(10),
        retry: fast_retry(),
    }
}

pub struct Harness {
    pub sponsor: SponsorWallet,
    pub user: Arc<KeypairUserSigner>,
    pub chain: Arc<MockChainClient>,
    pub signer: Arc<MockCustodialSigner>,
    pub pipeline: SponsorPipeline,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(adjust: impl FnOnce(&mut PipelineConfig)) -> Self {
        let sponsor = SponsorWallet::from_keypair(Keypair::new());
        let user = Arc::new(KeypairUserSigner::new(Keypair::new()));
        let chain = Arc::new(MockChainClient::new());
        let signer = Arc::new(MockCustodialSigner::new(KEY_ID, sponsor.clone()));

        let mut config = PipelineConfig::new(sponsor.pubkey(), KEY_ID);
        config.broadcast = fast_broadcast();
        config.retry = fast_retry();
        adjust(&mut config);

        let pipeline =
            SponsorPipeline::new(config, chain.clone(), signer.clone(), SharedCaches::default());
        Self {
            sponsor,
            user,
            chain,
            signer,
            pipeline,
        }
    }

    pub fn transfer_params(&self, amount: u64) -> TransferParams {
        TransferParams {
            owner: self.user.pubkey(),
            recipient: Pubkey::new_unique(),
            mint: Pubkey::new_unique(),
            amount,
            decimals: 6,
            token_program: spl_token::id(),
        }
    }

    pub fn transfer_request(&self, amount: u64) -> OperationRequest {
        OperationRequest::transfer(&self.transfer_params(amount)).expect("valid transfer")
    }

    pub async fn build_transfer(&self, amount: u64) -> TransactionDraft {
        let request = self.transfer_request(amount);
        self.pipeline
            .build_draft(request.sources(), &CancellationToken::new())
            .await
            .expect("draft builds")
    }

    /// Wire bytes of the draft signed by the user
    pub fn user_sign(&self, draft: &TransactionDraft) -> Vec<u8> {
        let signed = self.user.sign_transaction(draft.unsigned_transaction());
        bincode::serialize(&signed).expect("serializable")
    }
}

/// One instruction signed by `user`, carrying `data_len` payload bytes
pub fn payload_instruction(user: &Pubkey, program: &Pubkey, data_len: usize) -> Instruction {
    Instruction::new_with_bytes(
        *program,
        &vec![7u8; data_len],
        vec![AccountMeta::new(*user, true)],
    )
}

pub fn static_source(name: &str, instructions: &[Instruction]) -> Arc<dyn InstructionSource> {
    Arc::new(StaticInstructionSource::new(name, instructions))
}
