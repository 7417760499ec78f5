//! The pipeline's two entry points
//!
//! - [`SponsorPipeline::build_draft`]: fetch every instruction source, normalize,
//!   compose and draft an unsigned transaction for the user to sign.
//! - [`SponsorPipeline::cosign_and_send`]: validate the user-signed bytes,
//!   obtain the sponsor's signature, then simulate, broadcast and confirm.
//!
//! Everything else in the pipeline is internal to these two calls.

use crate::metrics::{metrics, InFlightGuard, Timer};
use crate::observability::OperationLogger;
use crate::pipeline::broadcast::{BroadcastConfig, BroadcastEngine, PhaseObserver};
use crate::pipeline::ceremony::{CeremonyCoordinator, CustodialSigner};
use crate::pipeline::chain::{ChainClient, ChainError};
use crate::pipeline::composer::{Composer, ComposerConfig};
use crate::pipeline::draft::TransactionDraft;
use crate::pipeline::errors::{OperationError, Stage};
use crate::pipeline::issued::IssuedDrafts;
use crate::pipeline::lookup_tables::LookupTableCache;
use crate::pipeline::normalize::normalize_batch;
use crate::pipeline::output::OperationResult;
use crate::pipeline::provider::InstructionSource;
use crate::pipeline::recency::{RecencyRegistry, RecencyToken};
use crate::pipeline::retry::{retry_with_backoff, RetryConfig};
use solana_sdk::{pubkey::Pubkey, signature::Signature};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, Instrument};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub sponsor: Pubkey,
    /// Key identifier passed to the custodial signer
    pub key_id: String,
    pub composer: ComposerConfig,
    pub broadcast: BroadcastConfig,
    pub retry: RetryConfig,
    /// Co-sign only messages this pipeline drafted
    pub require_issued_draft: bool,
}

impl PipelineConfig {
    pub fn new(sponsor: Pubkey, key_id: impl Into<String>) -> Self {
        Self {
            sponsor,
            key_id: key_id.into(),
            composer: ComposerConfig::default(),
            broadcast: BroadcastConfig::default(),
            retry: RetryConfig::default(),
            require_issued_draft: true,
        }
    }
}

/// Process-wide shared state, created once at startup and injected
#[derive(Default)]
pub struct SharedCaches {
    pub lookup_tables: Arc<LookupTableCache>,
    pub recency: Arc<RecencyRegistry>,
    pub issued: Arc<IssuedDrafts>,
}

pub struct SponsorPipeline {
    composer: Composer,
    chain: Arc<dyn ChainClient>,
    lookup_tables: Arc<LookupTableCache>,
    recency: Arc<RecencyRegistry>,
    issued: Arc<IssuedDrafts>,
    ceremony: CeremonyCoordinator,
    engine: BroadcastEngine,
    retry: RetryConfig,
}

impl SponsorPipeline {
    pub fn new(
        config: PipelineConfig,
        chain: Arc<dyn ChainClient>,
        signer: Arc<dyn CustodialSigner>,
        caches: SharedCaches,
    ) -> Self {
        let mut ceremony = CeremonyCoordinator::new(
            config.sponsor,
            config.key_id,
            signer,
            chain.clone(),
            caches.recency.clone(),
        )
        .with_max_sponsored_inits(config.composer.max_sponsored_inits);
        if config.require_issued_draft {
            ceremony = ceremony.with_issued_drafts(caches.issued.clone());
        }
        Self {
            composer: Composer::new(config.sponsor, config.composer),
            engine: BroadcastEngine::new(chain.clone(), config.broadcast),
            chain,
            lookup_tables: caches.lookup_tables,
            recency: caches.recency,
            issued: caches.issued,
            ceremony,
            retry: config.retry,
        }
    }

    pub fn sponsor(&self) -> &Pubkey {
        self.composer.sponsor()
    }

    /// Build an unsigned, sponsor-paid draft from the operation's instruction sources
    pub async fn build_draft(
        &self,
        sources: &[Arc<dyn InstructionSource>],
        cancel: &CancellationToken,
    ) -> Result<TransactionDraft, OperationError> {
        let logger = OperationLogger::new("build");
        let _in_flight = InFlightGuard::new(&metrics().operations_in_flight);
        let timer = Timer::new();

        let result = self
            .build_inner(sources, cancel)
            .instrument(logger.span())
            .await;
        match &result {
            Ok(draft) => {
                timer.observe_duration(&metrics().build_latency);
                metrics().drafts_built.inc();
                metrics().tx_size_bytes.observe(draft.serialized_size() as f64);
                logger.log_draft_built(
                    draft.serialized_size(),
                    draft.instructions().len(),
                    draft.compression_tables().len(),
                    timer.elapsed_ms(),
                );
            }
            Err(err) => logger.log_failed(err),
        }
        result
    }

    async fn build_inner(
        &self,
        sources: &[Arc<dyn InstructionSource>],
        cancel: &CancellationToken,
    ) -> Result<TransactionDraft, OperationError> {
        let mut instructions = Vec::new();
        let mut table_refs = Vec::new();
        for source in sources {
            let batch = source
                .fetch(cancel)
                .await
                .map_err(|e| e.into_operation_error(source.name()))?;
            let normalized = normalize_batch(&batch.provider, &batch.instructions)?;
            debug!(
                provider = %batch.provider,
                instructions = normalized.len(),
                lookup_tables = batch.lookup_tables.len(),
                "Normalized provider batch"
            );
            instructions.extend(normalized);
            table_refs.extend(batch.lookup_tables);
        }

        let composed = self.composer.compose(instructions)?;
        let table_keys = self.composer.table_keys(&table_refs)?;
        let tables = self
            .lookup_tables
            .resolve(self.chain.as_ref(), &table_keys, &self.retry, cancel)
            .await?;
        let recency = self.fetch_recency(cancel).await?;

        let draft = self.composer.draft(composed, recency, &tables)?;
        self.recency.remember(&recency);
        self.issued.record(draft.message());
        Ok(draft)
    }

    async fn fetch_recency(&self, cancel: &CancellationToken) -> Result<RecencyToken, OperationError> {
        retry_with_backoff("latest_recency_token", &self.retry, cancel, || {
            self.chain.latest_recency_token()
        })
        .await
        .map_err(|e: ChainError| {
            OperationError::invalid_recency_token(Stage::Draft, "recency token could not be fetched")
                .with_logs(e.diagnostic())
        })
    }

    /// Validate, co-sign, simulate, broadcast and confirm user-signed bytes
    pub async fn cosign_and_send(
        &self,
        user_signed: &[u8],
        cancel: &CancellationToken,
        observer: &dyn PhaseObserver,
    ) -> Result<OperationResult, OperationError> {
        let logger = OperationLogger::new("cosign_and_send");
        let _in_flight = InFlightGuard::new(&metrics().operations_in_flight);
        let timer = Timer::new();

        let result = self
            .send_inner(user_signed, cancel, observer, &logger)
            .instrument(logger.span())
            .await
            .map(|mut result| {
                result.timing_ms = timer.elapsed_ms();
                result
            });
        match &result {
            Ok(done) => logger.log_finished(&done.signature, done.confirmed, done.timing_ms),
            Err(err) => logger.log_failed(err),
        }
        result
    }

    async fn send_inner(
        &self,
        user_signed: &[u8],
        cancel: &CancellationToken,
        observer: &dyn PhaseObserver,
        logger: &OperationLogger,
    ) -> Result<OperationResult, OperationError> {
        let validated = self.ceremony.validate(user_signed, cancel).await?;
        let cosigned = self.ceremony.cosign(validated, cancel).await?;
        logger.log_cosigned(&cosigned.signature());

        let observer = LoggingObserver { inner: observer, logger };
        self.engine
            .execute(cosigned.transaction(), cosigned.recency(), cancel, &observer)
            .await
    }
}

struct LoggingObserver<'a> {
    inner: &'a dyn PhaseObserver,
    logger: &'a OperationLogger,
}

impl PhaseObserver for LoggingObserver<'_> {
    fn broadcast_accepted(&self, signature: &Signature) {
        self.logger.log_broadcast(signature);
        self.inner.broadcast_accepted(signature);
    }
}
