//! Sponsor exposure guard
//!
//! The sponsor signs every pipeline transaction as fee payer, and every
//! instruction that lists the fee payer inherits its signer and writable
//! privileges. The only instruction allowed to name the sponsor is a sponsored
//! associated-token-account create, and only in its payer slot. Anything else
//! could make the sponsor authorize a transfer it never intended.
//!
//! Every sponsored create costs the sponsor rent, so creates are also capped
//! per transaction and each target may be created once.

use crate::compat;
use crate::pipeline::ata::{AtaInitRecord, MIN_ATA_ACCOUNTS, TARGET_SLOT};
use crate::pipeline::errors::{OperationError, Stage};
use solana_sdk::{instruction::Instruction, message::VersionedMessage, pubkey::Pubkey};
use std::collections::HashSet;
use std::hash::Hash;

/// Default cap on sponsor-paid account creates in one transaction
pub const DEFAULT_MAX_SPONSORED_INITS: usize = 4;

/// Counts sponsored creates and rejects repeated targets or too many creates
struct RentBudget<K> {
    targets: HashSet<K>,
    max: usize,
}

impl<K: Eq + Hash> RentBudget<K> {
    fn new(max: usize) -> Self {
        Self {
            targets: HashSet::new(),
            max,
        }
    }

    fn charge(&mut self, stage: Stage, index: usize, target: K) -> Result<(), OperationError> {
        if !self.targets.insert(target) {
            return Err(OperationError::invalid_fee_payer(
                stage,
                format!("instruction {index} creates an account the sponsor already pays for"),
            ));
        }
        if self.targets.len() > self.max {
            return Err(OperationError::invalid_fee_payer(
                stage,
                format!(
                    "instruction {index} exceeds the cap of {} sponsored account creates",
                    self.max
                ),
            ));
        }
        Ok(())
    }
}

/// Check composed instructions before drafting
pub fn check_instructions(
    instructions: &[Instruction],
    sponsor: &Pubkey,
    max_sponsored_inits: usize,
    stage: Stage,
) -> Result<(), OperationError> {
    let mut budget = RentBudget::new(max_sponsored_inits);
    for (index, ix) in instructions.iter().enumerate() {
        let positions: Vec<usize> = ix
            .accounts
            .iter()
            .enumerate()
            .filter(|(_, meta)| meta.pubkey == *sponsor)
            .map(|(position, _)| position)
            .collect();
        if positions.is_empty() && ix.program_id != *sponsor {
            continue;
        }

        let init = AtaInitRecord::from_instruction(ix)
            .filter(|_| ix.program_id != *sponsor && positions == [0]);
        let Some(init) = init else {
            return Err(exposure_error(stage, index, &ix.program_id, &positions));
        };
        budget.charge(stage, index, init.target)?;
    }
    Ok(())
}

/// Check a compiled message whose fee payer has already been verified as the sponsor.
///
/// Create targets are compared by account index; a compiled message lists each
/// address once, so distinct indices are distinct accounts.
pub fn check_message(
    message: &VersionedMessage,
    sponsor: &Pubkey,
    max_sponsored_inits: usize,
) -> Result<(), OperationError> {
    let keys = compat::get_static_account_keys(message);
    let Some(sponsor_index) = keys.iter().position(|k| k == sponsor) else {
        return Ok(());
    };
    let mut budget = RentBudget::new(max_sponsored_inits);

    for (index, ix) in compat::get_compiled_instructions(message).iter().enumerate() {
        let program_id = keys
            .get(ix.program_id_index as usize)
            .copied()
            .unwrap_or_default();
        let positions: Vec<usize> = ix
            .accounts
            .iter()
            .enumerate()
            .filter(|(_, account_index)| **account_index as usize == sponsor_index)
            .map(|(position, _)| position)
            .collect();
        let is_program = ix.program_id_index as usize == sponsor_index;
        if positions.is_empty() && !is_program {
            continue;
        }

        let allowed = !is_program
            && positions == [0]
            && program_id == spl_associated_token_account::id()
            && ix.accounts.len() >= MIN_ATA_ACCOUNTS
            && matches!(ix.data.first(), None | Some(0) | Some(1));
        if !allowed {
            return Err(exposure_error(Stage::Ceremony, index, &program_id, &positions));
        }
        budget.charge(Stage::Ceremony, index, ix.accounts[TARGET_SLOT])?;
    }
    Ok(())
}

fn exposure_error(
    stage: Stage,
    index: usize,
    program_id: &Pubkey,
    positions: &[usize],
) -> OperationError {
    OperationError::invalid_fee_payer(
        stage,
        format!(
            "instruction {index} (program {program_id}) references the sponsor at account positions {positions:?}"
        ),
    )
}
