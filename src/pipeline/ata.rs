//! Associated-token-account initialization deduplication and sponsorship
//!
//! Providers routinely include "create ATA" instructions for every account
//! their route touches, so a swap followed by a vault deposit often creates
//! the same account twice. This module pulls every such instruction out of
//! the composed list, keeps exactly one per target account (first occurrence
//! wins), and rebuilds it as an idempotent create paid for by the sponsor.
//! Everything else passes through untouched, in its original relative order.

use solana_sdk::{
    instruction::{AccountMeta, Instruction},
    pubkey::Pubkey,
    system_program,
};
use std::collections::HashSet;
use tracing::debug;

/// Positional slots of an associated-token-account create instruction
const PAYER_SLOT: usize = 0;
pub const TARGET_SLOT: usize = 1;
const OWNER_SLOT: usize = 2;
const MINT_SLOT: usize = 3;
const TOKEN_PROGRAM_SLOT: usize = 5;

/// Fewer accounts than this and the instruction is passed through as-is
pub const MIN_ATA_ACCOUNTS: usize = 4;

/// `AssociatedTokenAccountInstruction::Create`
const CREATE: u8 = 0;
/// `AssociatedTokenAccountInstruction::CreateIdempotent`
const CREATE_IDEMPOTENT: u8 = 1;

/// An account-initialization instruction recognized in a provider batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtaInitRecord {
    /// Payer named by the provider (replaced by the sponsor)
    pub original_payer: Pubkey,
    pub target: Pubkey,
    pub owner: Pubkey,
    pub mint: Pubkey,
    pub token_program: Pubkey,
}

impl AtaInitRecord {
    /// Recognize an ATA create instruction, or `None` for anything else.
    ///
    /// Nested-account recovery and unknown discriminators are not creates and
    /// are left alone, as are creates with too few accounts.
    pub fn from_instruction(ix: &Instruction) -> Option<Self> {
        if ix.program_id != spl_associated_token_account::id() {
            return None;
        }
        match ix.data.first() {
            None | Some(&CREATE) | Some(&CREATE_IDEMPOTENT) => {}
            Some(_) => return None,
        }
        if ix.accounts.len() < MIN_ATA_ACCOUNTS {
            return None;
        }

        Some(Self {
            original_payer: ix.accounts[PAYER_SLOT].pubkey,
            target: ix.accounts[TARGET_SLOT].pubkey,
            owner: ix.accounts[OWNER_SLOT].pubkey,
            mint: ix.accounts[MINT_SLOT].pubkey,
            token_program: ix
                .accounts
                .get(TOKEN_PROGRAM_SLOT)
                .map(|meta| meta.pubkey)
                .unwrap_or_else(spl_token::id),
        })
    }

    /// Rebuild as an idempotent create with the sponsor as payer
    pub fn sponsored_instruction(&self, sponsor: &Pubkey) -> Instruction {
        Instruction {
            program_id: spl_associated_token_account::id(),
            accounts: vec![
                AccountMeta::new(*sponsor, true),
                AccountMeta::new(self.target, false),
                AccountMeta::new_readonly(self.owner, false),
                AccountMeta::new_readonly(self.mint, false),
                AccountMeta::new_readonly(system_program::id(), false),
                AccountMeta::new_readonly(self.token_program, false),
            ],
            data: vec![CREATE_IDEMPOTENT],
        }
    }
}

/// Result of splitting a composed instruction list
#[derive(Debug, Clone, Default)]
pub struct SponsoredSplit {
    /// One sponsor-paid idempotent create per distinct target account
    pub sponsored_inits: Vec<Instruction>,
    /// All remaining instructions in their original order
    pub others: Vec<Instruction>,
    /// Number of duplicate creates that were dropped
    pub dropped_duplicates: usize,
}

impl SponsoredSplit {
    /// Sponsored creates first, then everything else
    pub fn into_ordered(self) -> Vec<Instruction> {
        let mut out = self.sponsored_inits;
        out.extend(self.others);
        out
    }
}

/// Extract, deduplicate and sponsor-rewrite account-initialization instructions
pub fn sponsor_ata_inits(instructions: Vec<Instruction>, sponsor: &Pubkey) -> SponsoredSplit {
    let mut split = SponsoredSplit::default();
    let mut seen: HashSet<Pubkey> = HashSet::new();

    for ix in instructions {
        match AtaInitRecord::from_instruction(&ix) {
            Some(record) => {
                if seen.insert(record.target) {
                    debug!(
                        target_account = %record.target,
                        original_payer = %record.original_payer,
                        "Sponsoring account initialization"
                    );
                    split.sponsored_inits.push(record.sponsored_instruction(sponsor));
                } else {
                    split.dropped_duplicates += 1;
                }
            }
            None => split.others.push(ix),
        }
    }

    if split.dropped_duplicates > 0 {
        debug!(
            dropped = split.dropped_duplicates,
            kept = split.sponsored_inits.len(),
            "Dropped duplicate account initializations"
        );
    }

    split
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use spl_associated_token_account::{
        get_associated_token_address, instruction::create_associated_token_account,
        instruction::create_associated_token_account_idempotent,
    };

    fn transfer_ix() -> Instruction {
        Instruction::new_with_bytes(
            spl_token::id(),
            &[3, 100, 0, 0, 0, 0, 0, 0, 0],
            vec![
                AccountMeta::new(Pubkey::new_unique(), false),
                AccountMeta::new(Pubkey::new_unique(), false),
                AccountMeta::new_readonly(Pubkey::new_unique(), true),
            ],
        )
    }

    #[test]
    fn test_duplicates_collapse_with_sponsor_payer() {
        let sponsor = Pubkey::new_unique();
        let owner = Pubkey::new_unique();
        let mint = Pubkey::new_unique();

        let mut batch: Vec<Instruction> = (0..3)
            .map(|_| {
                create_associated_token_account(&Pubkey::new_unique(), &owner, &mint, &spl_token::id())
            })
            .collect();
        let transfer = transfer_ix();
        batch.push(transfer.clone());

        let split = sponsor_ata_inits(batch, &sponsor);
        assert_eq!(split.sponsored_inits.len(), 1);
        assert_eq!(split.dropped_duplicates, 2);
        assert_eq!(split.others, vec![transfer.clone()]);

        let ordered = split.into_ordered();
        assert_eq!(ordered.len(), 2);
        assert_eq!(ordered[0].accounts[0].pubkey, sponsor);
        assert_eq!(ordered[0].accounts[1].pubkey, get_associated_token_address(&owner, &mint));
        assert_eq!(ordered[1], transfer);
    }

    #[test]
    fn test_sponsored_matches_idempotent_helper() {
        let sponsor = Pubkey::new_unique();
        let owner = Pubkey::new_unique();
        let mint = Pubkey::new_unique();
        let original = create_associated_token_account(&owner, &owner, &mint, &spl_token::id());

        let record = AtaInitRecord::from_instruction(&original).unwrap();
        assert_eq!(record.original_payer, owner);
        assert_eq!(
            record.sponsored_instruction(&sponsor),
            create_associated_token_account_idempotent(&sponsor, &owner, &mint, &spl_token::id())
        );
    }

    #[test]
    fn test_short_instruction_passes_through() {
        let short = Instruction::new_with_bytes(
            spl_associated_token_account::id(),
            &[1],
            vec![
                AccountMeta::new(Pubkey::new_unique(), true),
                AccountMeta::new(Pubkey::new_unique(), false),
            ],
        );
        let split = sponsor_ata_inits(vec![short.clone()], &Pubkey::new_unique());
        assert!(split.sponsored_inits.is_empty());
        assert_eq!(split.others, vec![short]);
    }

    #[test]
    fn test_token_program_defaults_when_absent() {
        let ix = Instruction::new_with_bytes(
            spl_associated_token_account::id(),
            &[],
            (0..4).map(|_| AccountMeta::new(Pubkey::new_unique(), false)).collect(),
        );
        let record = AtaInitRecord::from_instruction(&ix).unwrap();
        assert_eq!(record.token_program, spl_token::id());
    }

    #[test]
    fn test_recover_nested_is_not_an_init() {
        let ix = Instruction::new_with_bytes(
            spl_associated_token_account::id(),
            &[2],
            (0..7).map(|_| AccountMeta::new(Pubkey::new_unique(), false)).collect(),
        );
        assert!(AtaInitRecord::from_instruction(&ix).is_none());
    }

    #[test]
    fn test_order_of_others_preserved() {
        let sponsor = Pubkey::new_unique();
        let a = transfer_ix();
        let b = transfer_ix();
        let create = create_associated_token_account(
            &Pubkey::new_unique(),
            &Pubkey::new_unique(),
            &Pubkey::new_unique(),
            &spl_token::id(),
        );
        let split = sponsor_ata_inits(vec![a.clone(), create, b.clone()], &sponsor);
        assert_eq!(split.others, vec![a, b]);
    }

    proptest! {
        #[test]
        fn prop_one_sponsored_create_per_target(
            copies in proptest::collection::vec(1usize..5, 1..6),
        ) {
            let sponsor = Pubkey::new_unique();
            let mut batch = Vec::new();
            let mut targets = Vec::new();
            for count in &copies {
                let owner = Pubkey::new_unique();
                let mint = Pubkey::new_unique();
                targets.push(get_associated_token_address(&owner, &mint));
                for _ in 0..*count {
                    batch.push(create_associated_token_account(
                        &Pubkey::new_unique(), &owner, &mint, &spl_token::id(),
                    ));
                }
            }

            let split = sponsor_ata_inits(batch, &sponsor);
            prop_assert_eq!(split.sponsored_inits.len(), copies.len());
            prop_assert_eq!(split.dropped_duplicates, copies.iter().sum::<usize>() - copies.len());
            for (ix, target) in split.sponsored_inits.iter().zip(&targets) {
                prop_assert_eq!(ix.accounts[0].pubkey, sponsor);
                prop_assert_eq!(ix.accounts[1].pubkey, *target);
            }
        }
    }
}
