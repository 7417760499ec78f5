//! Sponsored transaction pipeline
//!
//! Builds transactions whose network fees are paid by an operator-controlled
//! sponsor account, collects the user's signature client-side, co-signs with
//! the sponsor through a custodial signer, then simulates, broadcasts and
//! confirms.
//!
//! ## Architecture
//!
//! - **provider**: upstream instruction sources (HTTP providers, local instructions)
//! - **normalize**: provider JSON to typed instructions
//! - **ata**: account-initialization dedup and sponsor rewrite
//! - **composer** / **exposure**: ordered composition and the sponsor exposure guard
//! - **draft**: size-checked unsigned v0 transactions
//! - **ceremony** / **issued**: user-signature validation, drafted-message check, sponsor co-signing
//! - **broadcast** / **classify**: simulate, send, confirm, failure taxonomy
//! - **service**: the two entry points, `build_draft` and `cosign_and_send`
//! - **client** / **flows**: per-session state machine and calling flows
//!
//! Shared state (lookup-table cache, recency registry, issued drafts, pacing clock) is
//! created once and injected; see [`service::SharedCaches`].
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use fee_sponsor::pipeline::{OperationMachine, OperationRequest, SponsorPipeline, UserSigner};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(
//! #     pipeline: &SponsorPipeline,
//! #     request: &OperationRequest,
//! #     wallet: &dyn UserSigner,
//! # ) -> Result<(), fee_sponsor::pipeline::OperationError> {
//! let machine = OperationMachine::new();
//! let cancel = CancellationToken::new();
//! let outcome = machine.run(pipeline, request.sources(), wallet, &cancel).await?;
//! println!("{outcome:?}");
//! # Ok(())
//! # }
//! ```

pub mod errors;
pub use errors::{ErrorKind, OperationError, Stage};

pub mod ata;
pub mod broadcast;
pub mod ceremony;
pub mod chain;
pub mod classify;
pub mod client;
pub mod composer;
pub mod draft;
pub mod exposure;
pub mod flows;
pub mod issued;
pub mod lookup_tables;
pub mod normalize;
pub mod output;
pub mod provider;
pub mod recency;
pub mod retry;
pub mod service;

pub use broadcast::{BroadcastConfig, BroadcastEngine, PhaseObserver};
pub use ceremony::{CeremonyCoordinator, CustodialSigner, SignerError, SignerResponse};
pub use chain::{ChainClient, ChainError, RpcChainClient, SignatureState, SimulationOutcome};
pub use client::{
    ClientOperationState, OperationMachine, Outcome, SessionRegistry, UserSignError, UserSigner,
};
pub use composer::{Composer, ComposerConfig};
pub use draft::TransactionDraft;
pub use flows::{run_with_rebuilds, OperationKind, OperationRequest, RequestSpec, TransferParams};
pub use output::OperationResult;
pub use provider::{HttpInstructionSource, InstructionSource, StaticInstructionSource};
pub use recency::RecencyToken;
pub use retry::{PacingClock, RetryConfig};
pub use service::{PipelineConfig, SharedCaches, SponsorPipeline};
