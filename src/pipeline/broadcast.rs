//! Simulation and broadcast engine
//!
//! Sequence for a fully signed transaction:
//! simulate (no signature verification) -> classify -> send -> confirm.
//!
//! Sending the same signed bytes twice is harmless: the network deduplicates
//! by signature, and an "already processed" answer is treated as success.
//! Confirmation is best effort. When the polling window closes without
//! finality the engine still returns the signature, with `confirmed = false`.

use crate::metrics::{metrics, Timer};
use crate::pipeline::chain::{ChainClient, ChainError, SignatureState, SimulationOutcome};
use crate::pipeline::classify::classify_failure;
use crate::pipeline::errors::{ErrorKind, OperationError, Stage};
use crate::pipeline::output::OperationResult;
use crate::pipeline::recency::RecencyToken;
use crate::pipeline::retry::{retry_with_backoff, RetryConfig, Retryable};
use solana_sdk::{signature::Signature, transaction::VersionedTransaction};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastConfig {
    /// Attempts for the send call itself
    pub send_attempts: u32,
    pub confirm_timeout: Duration,
    pub confirm_poll_interval: Duration,
    /// Backoff for simulate, send and status calls
    pub retry: RetryConfig,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            send_attempts: 3,
            confirm_timeout: Duration::from_secs(30),
            confirm_poll_interval: Duration::from_millis(500),
            retry: RetryConfig::default(),
        }
    }
}

/// Receives the moment a broadcast is accepted, before confirmation polling
pub trait PhaseObserver: Send + Sync {
    fn broadcast_accepted(&self, _signature: &Signature) {}
}

impl PhaseObserver for () {}

pub struct BroadcastEngine {
    chain: Arc<dyn ChainClient>,
    config: BroadcastConfig,
}

impl BroadcastEngine {
    pub fn new(chain: Arc<dyn ChainClient>, config: BroadcastConfig) -> Self {
        Self { chain, config }
    }

    pub fn config(&self) -> &BroadcastConfig {
        &self.config
    }

    /// Simulate and classify; `Ok` only for a clean simulation
    #[instrument(skip_all)]
    pub async fn simulate(
        &self,
        tx: &VersionedTransaction,
        cancel: &CancellationToken,
    ) -> Result<SimulationOutcome, OperationError> {
        let outcome = retry_with_backoff("simulate", &self.config.retry, cancel, || {
            self.chain.simulate(tx)
        })
        .await
        .map_err(|e| chain_failure(Stage::Simulate, e))?;

        if let Some(err) = &outcome.err {
            warn!(error = %err, log_lines = outcome.logs.len(), "Simulation failed");
            return Err(classify_failure(Stage::Simulate, err, &outcome.logs));
        }
        debug!(units_consumed = ?outcome.units_consumed, "Simulation succeeded");
        Ok(outcome)
    }

    /// Submit signed bytes with a bounded retry count
    #[instrument(skip_all)]
    pub async fn broadcast(
        &self,
        tx: &VersionedTransaction,
        recency: Option<&RecencyToken>,
        cancel: &CancellationToken,
    ) -> Result<Signature, OperationError> {
        let expected = tx.signatures.first().copied().ok_or_else(|| {
            OperationError::new(ErrorKind::BroadcastFailed, Stage::Broadcast, "transaction has no signatures")
        })?;

        if let Some(token) = recency {
            self.ensure_not_expired(token, cancel).await?;
        }

        let send_retry = RetryConfig {
            max_attempts: self.config.send_attempts.max(1),
            ..self.config.retry.clone()
        };
        match retry_with_backoff("send", &send_retry, cancel, || self.chain.send(tx)).await {
            Ok(signature) => {
                if signature != expected {
                    warn!(%signature, %expected, "Node returned an unexpected signature");
                }
                metrics().broadcasts.inc();
                info!(%expected, "Broadcast accepted");
                Ok(expected)
            }
            Err(err) if is_already_processed(&err) => {
                info!(%expected, "Transaction already processed, treating resend as success");
                metrics().broadcasts.inc();
                Ok(expected)
            }
            Err(err) => Err(chain_failure(Stage::Broadcast, err)),
        }
    }

    /// Poll for finality until the window closes; `Ok(false)` on timeout or cancel.
    ///
    /// Each status call races the window and the cancel token, so a slow node
    /// cannot hold the caller past either.
    #[instrument(skip_all, fields(%signature))]
    pub async fn confirm(
        &self,
        signature: &Signature,
        cancel: &CancellationToken,
    ) -> Result<bool, OperationError> {
        let timer = Timer::new();
        let deadline = Instant::now() + self.config.confirm_timeout;

        loop {
            let poll = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(self.polling_cancelled()),
                poll = self.chain.signature_state(signature) => poll,
                _ = tokio::time::sleep_until(deadline) => break,
            };
            match poll {
                Ok(SignatureState::Confirmed) => {
                    timer.observe_duration(&metrics().confirm_latency);
                    metrics().confirmations.inc();
                    return Ok(true);
                }
                Ok(SignatureState::Failed(err)) => {
                    warn!(error = %err, "Transaction landed with an error");
                    return Err(classify_failure(Stage::Confirm, &err, &[]));
                }
                Ok(SignatureState::Pending) => {}
                Err(err) => debug!(error = %err, "Status poll failed, continuing"),
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let wait = self.config.confirm_poll_interval.min(deadline - now);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(self.polling_cancelled()),
                _ = tokio::time::sleep(wait) => {}
            }
        }

        warn!(
            timeout_ms = self.config.confirm_timeout.as_millis() as u64,
            "Confirmation window closed, returning unconfirmed signature"
        );
        metrics().unconfirmed_results.inc();
        Ok(false)
    }

    /// Simulate, broadcast and confirm a fully signed transaction
    pub async fn execute(
        &self,
        tx: &VersionedTransaction,
        recency: Option<&RecencyToken>,
        cancel: &CancellationToken,
        observer: &dyn PhaseObserver,
    ) -> Result<OperationResult, OperationError> {
        let timer = Timer::new();
        self.simulate(tx, cancel).await?;
        let signature = self.broadcast(tx, recency, cancel).await?;
        observer.broadcast_accepted(&signature);
        let confirmed = self.confirm(&signature, cancel).await?;
        Ok(OperationResult::new(signature, confirmed, timer.elapsed_ms()))
    }

    fn polling_cancelled(&self) -> bool {
        info!("Confirmation polling cancelled");
        metrics().unconfirmed_results.inc();
        false
    }

    async fn ensure_not_expired(
        &self,
        token: &RecencyToken,
        cancel: &CancellationToken,
    ) -> Result<(), OperationError> {
        let height = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(chain_failure(Stage::Broadcast, ChainError::Cancelled)),
            height = self.chain.block_height() => height,
        };
        match height {
            Ok(height) if token.is_expired_at(height) => Err(OperationError::invalid_recency_token(
                Stage::Broadcast,
                format!(
                    "recency token expired at block height {}, current height {height}",
                    token.last_valid_block_height
                ),
            )),
            Ok(_) => Ok(()),
            Err(err) => {
                warn!(error = %err, "Could not read block height, skipping expiry check");
                Ok(())
            }
        }
    }
}

fn is_already_processed(err: &ChainError) -> bool {
    let text = err.diagnostic().to_lowercase();
    text.contains("alreadyprocessed") || text.contains("already processed") || text.contains("already been processed")
}

/// Translate a chain error into the stage's taxonomy kind
fn chain_failure(stage: Stage, err: ChainError) -> OperationError {
    let transient = err.is_transient();
    let classified = classify_failure(stage, &err.diagnostic(), &[]);
    if transient && !classified.retryable {
        classified.with_retryable(true)
    } else {
        classified
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockChainClient;
    use solana_sdk::{
        hash::Hash,
        instruction::Instruction,
        message::{v0, VersionedMessage},
        pubkey::Pubkey,
        signature::Keypair,
        signer::Signer,
    };
    use std::sync::atomic::Ordering;

    const SLOW_NODE: Duration = Duration::from_secs(30);

    fn engine(chain: Arc<MockChainClient>, confirm_timeout: Duration) -> BroadcastEngine {
        BroadcastEngine::new(
            chain,
            BroadcastConfig {
                confirm_timeout,
                confirm_poll_interval: Duration::from_millis(100),
                ..BroadcastConfig::default()
            },
        )
    }

    fn signed_tx() -> VersionedTransaction {
        let payer = Keypair::new();
        let ix = Instruction::new_with_bytes(Pubkey::new_unique(), &[1], vec![]);
        let message = VersionedMessage::V0(
            v0::Message::try_compile(&payer.pubkey(), &[ix], &[], Hash::new_unique()).unwrap(),
        );
        VersionedTransaction::try_new(message, &[&payer]).unwrap()
    }

    fn cancel_after(delay: Duration) -> CancellationToken {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            trigger.cancel();
        });
        cancel
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_status_call_bounded_by_confirm_window() {
        let chain = Arc::new(MockChainClient::new());
        chain.delay_status_calls(SLOW_NODE);
        let engine = engine(chain.clone(), Duration::from_secs(2));

        let start = Instant::now();
        let confirmed = engine
            .confirm(&Signature::from([7u8; 64]), &CancellationToken::new())
            .await
            .unwrap();

        assert!(!confirmed);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2) && elapsed < Duration::from_secs(3), "{elapsed:?}");
        assert_eq!(chain.calls.signature_state.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_status_call() {
        let chain = Arc::new(MockChainClient::new());
        chain.delay_status_calls(SLOW_NODE);
        let engine = engine(chain, Duration::from_secs(60));
        let cancel = cancel_after(Duration::from_millis(100));

        let start = Instant::now();
        let confirmed = engine.confirm(&Signature::from([7u8; 64]), &cancel).await.unwrap();

        assert!(!confirmed);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_expiry_check() {
        let chain = Arc::new(MockChainClient::new());
        chain.delay_status_calls(SLOW_NODE);
        let engine = engine(chain.clone(), Duration::from_secs(2));
        let cancel = cancel_after(Duration::from_millis(100));

        let start = Instant::now();
        let token = RecencyToken::new(Hash::new_unique(), 5_000);
        let err = engine.broadcast(&signed_tx(), Some(&token), &cancel).await.unwrap_err();

        assert_eq!(err.stage, Stage::Broadcast);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(chain.calls.send.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_confirmed_signature() {
        let chain = Arc::new(MockChainClient::new());
        let engine = engine(chain, Duration::from_secs(2));
        assert!(engine
            .confirm(&Signature::from([7u8; 64]), &CancellationToken::new())
            .await
            .unwrap());
    }

    #[test]
    fn test_already_processed_detection() {
        assert!(is_already_processed(&ChainError::Rpc {
            message: "Transaction simulation failed: This transaction has already been processed".into(),
            code: Some(-32002),
        }));
        assert!(is_already_processed(&ChainError::Rpc {
            message: "AlreadyProcessed".into(),
            code: None,
        }));
        assert!(!is_already_processed(&ChainError::Timeout("slow".into())));
    }

    #[test]
    fn test_chain_failure_transient_is_retryable() {
        let err = chain_failure(Stage::Broadcast, ChainError::Transport("connection refused".into()));
        assert_eq!(err.kind, ErrorKind::BroadcastFailed);
        assert!(err.retryable);

        let err = chain_failure(
            Stage::Broadcast,
            ChainError::Rpc {
                message: "Blockhash not found".into(),
                code: Some(-32002),
            },
        );
        assert_eq!(err.kind, ErrorKind::InvalidRecencyToken);
    }
}
