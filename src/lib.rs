//! Fee Sponsor - sponsored transaction pipeline for Solana
//!
//! Builds transactions whose fees are paid by an operator-controlled sponsor
//! account, validates the user's signature, co-signs through a custodial
//! signer, then simulates, broadcasts and confirms. See [`pipeline`].

pub mod compat;
pub mod config;
pub mod endpoints;
pub mod metrics;
pub mod observability;
pub mod pipeline;
pub mod signer;
pub mod wallet;

pub mod test_utils;

// Re-export commonly used types
pub use solana_sdk::{message::VersionedMessage, pubkey::Pubkey, signature::Signature};
