//! Client orchestration state machine
//!
//! One machine per logical session drives a money-movement flow through
//! `Idle → Building → Signing → Sending → Confirming → {Done | Error}`.
//! State changes are published on a `watch` channel for UI binding.
//!
//! The machine is single-flight: a second run while one is in progress fails
//! with `OPERATION_IN_PROGRESS` before any network call. Cancelling during
//! building, signing or sending returns the machine to `Idle`. The machine
//! never retries; rebuild policy belongs to the calling flow.

use crate::pipeline::broadcast::PhaseObserver;
use crate::pipeline::draft::TransactionDraft;
use crate::pipeline::errors::{ErrorKind, OperationError, Stage};
use crate::pipeline::output::OperationResult;
use crate::pipeline::provider::InstructionSource;
use crate::pipeline::service::SponsorPipeline;
use async_trait::async_trait;
use dashmap::DashMap;
use solana_sdk::signature::Signature;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum ClientOperationState {
    Idle,
    Building,
    Signing,
    Sending,
    Confirming,
    Done(OperationResult),
    Error(OperationError),
}

impl ClientOperationState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Building => "building",
            Self::Signing => "signing",
            Self::Sending => "sending",
            Self::Confirming => "confirming",
            Self::Done(_) => "done",
            Self::Error(_) => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done(_) | Self::Error(_))
    }

    /// An operation is in flight
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            Self::Building | Self::Signing | Self::Sending | Self::Confirming
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MachineEvent {
    Start,
    DraftReady,
    UserSigned,
    BroadcastAccepted,
    Finished(OperationResult),
    Failed(OperationError),
    Aborted,
}

impl MachineEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::DraftReady => "draft_ready",
            Self::UserSigned => "user_signed",
            Self::BroadcastAccepted => "broadcast_accepted",
            Self::Finished(_) => "finished",
            Self::Failed(_) => "failed",
            Self::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid transition: {event} while {from}")]
pub struct TransitionError {
    pub from: &'static str,
    pub event: &'static str,
}

/// The machine's single transition function
pub fn transition(
    state: &ClientOperationState,
    event: MachineEvent,
) -> Result<ClientOperationState, TransitionError> {
    use ClientOperationState as S;

    let next = match (state, event) {
        (S::Idle | S::Done(_) | S::Error(_), MachineEvent::Start) => S::Building,
        (S::Building, MachineEvent::DraftReady) => S::Signing,
        (S::Signing, MachineEvent::UserSigned) => S::Sending,
        (S::Sending, MachineEvent::BroadcastAccepted) => S::Confirming,
        (S::Sending | S::Confirming, MachineEvent::Finished(result)) => S::Done(result),
        (s, MachineEvent::Failed(err)) if !s.is_terminal() => S::Error(err),
        (s, MachineEvent::Aborted) if s.is_busy() => S::Idle,
        (s, event) => {
            return Err(TransitionError {
                from: s.name(),
                event: event.name(),
            })
        }
    };
    Ok(next)
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UserSignError {
    #[error("user declined to sign")]
    Declined,

    #[error("wallet signing failed: {0}")]
    Failed(String),
}

/// The user's wallet, signing the draft client-side
#[async_trait]
pub trait UserSigner: Send + Sync {
    async fn sign(&self, draft: &TransactionDraft) -> Result<Vec<u8>, UserSignError>;
}

/// How a run ended when it did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed(OperationResult),
    /// Cancelled or declined; the machine is back in `Idle`
    Aborted,
}

enum RunError {
    Aborted,
    Failed(OperationError),
}

impl From<OperationError> for RunError {
    fn from(err: OperationError) -> Self {
        Self::Failed(err)
    }
}

pub struct OperationMachine {
    state: watch::Sender<ClientOperationState>,
}

impl Default for OperationMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationMachine {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ClientOperationState::Idle);
        Self { state }
    }

    pub fn state(&self) -> ClientOperationState {
        self.state.borrow().clone()
    }

    /// Receive every state change
    pub fn subscribe(&self) -> watch::Receiver<ClientOperationState> {
        self.state.subscribe()
    }

    /// Claim the machine for a new operation
    pub fn try_begin(&self) -> Result<(), OperationError> {
        let mut outcome = Ok(());
        self.state.send_if_modified(|state| match transition(state, MachineEvent::Start) {
            Ok(next) => {
                *state = next;
                true
            }
            Err(_) => {
                outcome = Err(OperationError::operation_in_progress());
                false
            }
        });
        outcome
    }

    fn apply(&self, event: MachineEvent) {
        self.state.send_if_modified(|state| match transition(state, event) {
            Ok(next) => {
                debug!(from = state.name(), to = next.name(), "Client state change");
                *state = next;
                true
            }
            Err(e) => {
                warn!(error = %e, "Ignoring client event");
                false
            }
        });
    }

    /// Run one operation end to end: build, user signing, co-sign and send
    pub async fn run(
        &self,
        pipeline: &SponsorPipeline,
        sources: &[Arc<dyn InstructionSource>],
        user: &dyn UserSigner,
        cancel: &CancellationToken,
    ) -> Result<Outcome, OperationError> {
        self.try_begin()?;

        match self.drive(pipeline, sources, user, cancel).await {
            Ok(result) => {
                self.apply(MachineEvent::Finished(result.clone()));
                Ok(Outcome::Completed(result))
            }
            Err(RunError::Aborted) => {
                info!("Operation aborted");
                self.apply(MachineEvent::Aborted);
                Ok(Outcome::Aborted)
            }
            Err(RunError::Failed(_)) if cancel.is_cancelled() && self.interruptible() => {
                info!("Operation cancelled");
                self.apply(MachineEvent::Aborted);
                Ok(Outcome::Aborted)
            }
            Err(RunError::Failed(err)) => {
                self.apply(MachineEvent::Failed(err.clone()));
                Err(err)
            }
        }
    }

    /// Cancellation before the network accepted the transaction
    fn interruptible(&self) -> bool {
        matches!(
            *self.state.borrow(),
            ClientOperationState::Building | ClientOperationState::Signing | ClientOperationState::Sending
        )
    }

    async fn drive(
        &self,
        pipeline: &SponsorPipeline,
        sources: &[Arc<dyn InstructionSource>],
        user: &dyn UserSigner,
        cancel: &CancellationToken,
    ) -> Result<OperationResult, RunError> {
        let draft = pipeline.build_draft(sources, cancel).await?;
        self.apply(MachineEvent::DraftReady);

        let signed = tokio::select! {
            _ = cancel.cancelled() => return Err(RunError::Aborted),
            signed = user.sign(&draft) => signed,
        };
        let signed = match signed {
            Ok(bytes) => bytes,
            Err(UserSignError::Declined) => return Err(RunError::Aborted),
            Err(UserSignError::Failed(reason)) => {
                return Err(RunError::Failed(OperationError::new(
                    ErrorKind::MissingUserSignature,
                    Stage::Client,
                    format!("wallet signing failed: {reason}"),
                )))
            }
        };
        self.apply(MachineEvent::UserSigned);

        let observer = MachineObserver { machine: self };
        Ok(pipeline.cosign_and_send(&signed, cancel, &observer).await?)
    }
}

struct MachineObserver<'a> {
    machine: &'a OperationMachine,
}

impl PhaseObserver for MachineObserver<'_> {
    fn broadcast_accepted(&self, _signature: &Signature) {
        self.machine.apply(MachineEvent::BroadcastAccepted);
    }
}

/// One machine per logical session
#[derive(Default)]
pub struct SessionRegistry {
    machines: DashMap<String, Arc<OperationMachine>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn machine(&self, session: &str) -> Arc<OperationMachine> {
        self.machines
            .entry(session.to_string())
            .or_insert_with(|| Arc::new(OperationMachine::new()))
            .clone()
    }

    /// Drop an idle or finished session; busy sessions are kept
    pub fn release(&self, session: &str) -> bool {
        self.machines
            .remove_if(session, |_, machine| !machine.state().is_busy())
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }
}
