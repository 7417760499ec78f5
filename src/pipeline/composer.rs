//! Instruction composer
//!
//! Turns the normalized instructions of every provider in an operation into
//! one ordered list (sponsored account creates first, everything else in
//! provider order) and compiles it into a [`TransactionDraft`]. There is no
//! instruction-dropping fallback when the result is too large: the draft
//! fails with `PAYLOAD_TOO_LARGE` instead.

use crate::metrics::metrics;
use crate::pipeline::ata::sponsor_ata_inits;
use crate::pipeline::draft::{TransactionDraft, MAX_TX_BYTES};
use crate::pipeline::errors::{ErrorKind, OperationError, Stage};
use crate::pipeline::exposure::{self, DEFAULT_MAX_SPONSORED_INITS};
use crate::pipeline::recency::RecencyToken;
use solana_sdk::{
    address_lookup_table::AddressLookupTableAccount, compute_budget, instruction::Instruction,
    pubkey::Pubkey,
};
use std::collections::HashSet;
use std::str::FromStr;
use tracing::{debug, warn};

/// Default cap on lookup tables referenced by one draft
pub const DEFAULT_MAX_LOOKUP_TABLES: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposerConfig {
    pub max_tx_bytes: usize,
    pub max_lookup_tables: usize,
    /// Sponsor-paid account creates allowed in one transaction
    pub max_sponsored_inits: usize,
}

impl Default for ComposerConfig {
    fn default() -> Self {
        Self {
            max_tx_bytes: MAX_TX_BYTES,
            max_lookup_tables: DEFAULT_MAX_LOOKUP_TABLES,
            max_sponsored_inits: DEFAULT_MAX_SPONSORED_INITS,
        }
    }
}

/// Ordered instruction list ready to be drafted
#[derive(Debug, Clone, Default)]
pub struct ComposedInstructions {
    pub instructions: Vec<Instruction>,
    pub sponsored_inits: usize,
    pub dropped_duplicate_inits: usize,
    pub dropped_compute_budget: usize,
}

pub struct Composer {
    sponsor: Pubkey,
    config: ComposerConfig,
}

impl Composer {
    pub fn new(sponsor: Pubkey, config: ComposerConfig) -> Self {
        Self { sponsor, config }
    }

    pub fn sponsor(&self) -> &Pubkey {
        &self.sponsor
    }

    pub fn config(&self) -> &ComposerConfig {
        &self.config
    }

    /// Order, deduplicate and guard the combined provider instructions
    pub fn compose(&self, instructions: Vec<Instruction>) -> Result<ComposedInstructions, OperationError> {
        let split = sponsor_ata_inits(instructions, &self.sponsor);
        let sponsored_inits = split.sponsored_inits.len();
        let dropped_duplicate_inits = split.dropped_duplicates;

        let (others, dropped_compute_budget) = collapse_compute_budget(split.others);
        let mut ordered = split.sponsored_inits;
        ordered.extend(others);

        exposure::check_instructions(
            &ordered,
            &self.sponsor,
            self.config.max_sponsored_inits,
            Stage::Compose,
        )?;

        metrics().sponsored_inits.inc_by(sponsored_inits as u64);
        metrics()
            .duplicate_inits_dropped
            .inc_by(dropped_duplicate_inits as u64);

        debug!(
            total = ordered.len(),
            sponsored_inits,
            dropped_duplicate_inits,
            dropped_compute_budget,
            "Composed instruction list"
        );

        Ok(ComposedInstructions {
            instructions: ordered,
            sponsored_inits,
            dropped_duplicate_inits,
            dropped_compute_budget,
        })
    }

    /// Parse, deduplicate and cap provider lookup table references.
    ///
    /// Providers over-supply tables; references beyond the cap are dropped.
    pub fn table_keys(&self, references: &[String]) -> Result<Vec<Pubkey>, OperationError> {
        let mut seen = HashSet::new();
        let mut keys = Vec::new();
        for reference in references {
            let key = Pubkey::from_str(reference.trim()).map_err(|e| {
                OperationError::new(
                    ErrorKind::MalformedInstruction,
                    Stage::Compose,
                    format!("invalid lookup table address {reference:?}: {e}"),
                )
            })?;
            if seen.insert(key) {
                keys.push(key);
            }
        }

        if keys.len() > self.config.max_lookup_tables {
            warn!(
                supplied = keys.len(),
                cap = self.config.max_lookup_tables,
                "Truncating lookup table references"
            );
            keys.truncate(self.config.max_lookup_tables);
        }
        Ok(keys)
    }

    /// Compile the composed list into a sponsor-paid draft
    pub fn draft(
        &self,
        composed: ComposedInstructions,
        recency: RecencyToken,
        tables: &[AddressLookupTableAccount],
    ) -> Result<TransactionDraft, OperationError> {
        TransactionDraft::new(
            &self.sponsor,
            &self.sponsor,
            recency,
            composed.instructions,
            tables,
            self.config.max_tx_bytes,
        )
    }
}

/// Keep the first compute-budget instruction of each type, preserving order
fn collapse_compute_budget(instructions: Vec<Instruction>) -> (Vec<Instruction>, usize) {
    let mut seen = HashSet::new();
    let mut dropped = 0;
    let kept = instructions
        .into_iter()
        .filter(|ix| {
            if ix.program_id != compute_budget::id() {
                return true;
            }
            let keep = seen.insert(ix.data.first().copied());
            if !keep {
                dropped += 1;
            }
            keep
        })
        .collect();
    (kept, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_sdk::{
        compute_budget::ComputeBudgetInstruction, hash::Hash, instruction::AccountMeta,
    };
    use spl_associated_token_account::{
        get_associated_token_address, instruction::create_associated_token_account,
    };

    fn composer(sponsor: Pubkey) -> Composer {
        Composer::new(sponsor, ComposerConfig::default())
    }

    fn transfer_ix(from: &Pubkey, to: &Pubkey, authority: &Pubkey, amount: u64) -> Instruction {
        spl_token::instruction::transfer(&spl_token::id(), from, to, authority, &[], amount).unwrap()
    }

    #[test]
    fn test_three_creates_and_transfer() {
        let sponsor = Pubkey::new_unique();
        let owner = Pubkey::new_unique();
        let mint = Pubkey::new_unique();
        let (a, b) = (Pubkey::new_unique(), Pubkey::new_unique());

        let mut batch: Vec<Instruction> = (0..3)
            .map(|_| {
                create_associated_token_account(&Pubkey::new_unique(), &owner, &mint, &spl_token::id())
            })
            .collect();
        let transfer = transfer_ix(&a, &b, &owner, 100);
        batch.push(transfer.clone());

        let composed = composer(sponsor).compose(batch).unwrap();
        assert_eq!(composed.instructions.len(), 2);
        assert_eq!(composed.sponsored_inits, 1);
        assert_eq!(composed.dropped_duplicate_inits, 2);

        let create = &composed.instructions[0];
        assert_eq!(create.program_id, spl_associated_token_account::id());
        assert_eq!(create.accounts[0].pubkey, sponsor);
        assert_eq!(create.accounts[1].pubkey, get_associated_token_address(&owner, &mint));
        assert_eq!(composed.instructions[1], transfer);
    }

    #[test]
    fn test_compute_budget_first_of_each_kind_wins() {
        let batch = vec![
            ComputeBudgetInstruction::set_compute_unit_limit(200_000),
            ComputeBudgetInstruction::set_compute_unit_price(10),
            ComputeBudgetInstruction::set_compute_unit_limit(400_000),
            ComputeBudgetInstruction::set_compute_unit_price(99),
        ];
        let composed = composer(Pubkey::new_unique()).compose(batch.clone()).unwrap();
        assert_eq!(composed.instructions, batch[..2].to_vec());
        assert_eq!(composed.dropped_compute_budget, 2);
    }

    #[test]
    fn test_sponsor_authority_rejected_at_compose() {
        let sponsor = Pubkey::new_unique();
        let batch = vec![transfer_ix(&Pubkey::new_unique(), &Pubkey::new_unique(), &sponsor, 5)];
        let err = composer(sponsor).compose(batch).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidFeePayer);
        assert_eq!(err.stage, Stage::Compose);
    }

    #[test]
    fn test_table_keys_deduplicated_and_capped() {
        let keys: Vec<Pubkey> = (0..6).map(|_| Pubkey::new_unique()).collect();
        let mut references: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        references.insert(1, keys[0].to_string());

        let resolved = composer(Pubkey::new_unique()).table_keys(&references).unwrap();
        assert_eq!(resolved, keys[..DEFAULT_MAX_LOOKUP_TABLES].to_vec());
    }

    #[test]
    fn test_invalid_table_key() {
        let err = composer(Pubkey::new_unique())
            .table_keys(&["not-a-key".to_string()])
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::MalformedInstruction);
    }

    #[test]
    fn test_draft_uses_sponsor_as_fee_payer() {
        let sponsor = Pubkey::new_unique();
        let user = Pubkey::new_unique();
        let composer = composer(sponsor);
        let composed = composer
            .compose(vec![Instruction::new_with_bytes(
                Pubkey::new_unique(),
                &[1, 2, 3],
                vec![AccountMeta::new(user, true)],
            )])
            .unwrap();
        let draft = composer
            .draft(composed, RecencyToken::new(Hash::new_unique(), 10), &[])
            .unwrap();
        assert_eq!(draft.fee_payer(), &sponsor);
        assert_eq!(draft.required_signers(), &[sponsor, user]);
    }
}
