//! Transaction drafts and signature sets
//!
//! A [`TransactionDraft`] is the unsigned v0 transaction handed to the user:
//! sponsor as fee payer, a recency token, the composed instructions, and the
//! lookup tables that compress its account list. It is serialized exactly once
//! at construction to enforce the size ceiling, and never changes afterwards.

use crate::compat;
use crate::pipeline::errors::{ErrorKind, OperationError, Stage};
use crate::pipeline::recency::RecencyToken;
use base64::Engine;
use solana_sdk::{
    address_lookup_table::AddressLookupTableAccount,
    instruction::Instruction,
    message::{v0, CompileError, VersionedMessage},
    packet::PACKET_DATA_SIZE,
    pubkey::Pubkey,
    signature::Signature,
    transaction::VersionedTransaction,
};

/// Network per-transaction byte ceiling
pub const MAX_TX_BYTES: usize = PACKET_DATA_SIZE;

#[derive(Debug, Clone)]
pub struct TransactionDraft {
    fee_payer: Pubkey,
    recency: RecencyToken,
    instructions: Vec<Instruction>,
    compression_tables: Vec<Pubkey>,
    message: VersionedMessage,
    /// Unsigned wire encoding, measured against the size ceiling
    wire: Vec<u8>,
}

impl TransactionDraft {
    /// Compile and size-check a draft.
    ///
    /// The fee payer is checked against the sponsor before anything is
    /// compiled or serialized.
    pub fn new(
        sponsor: &Pubkey,
        fee_payer: &Pubkey,
        recency: RecencyToken,
        instructions: Vec<Instruction>,
        tables: &[AddressLookupTableAccount],
        max_tx_bytes: usize,
    ) -> Result<Self, OperationError> {
        if fee_payer != sponsor {
            return Err(OperationError::invalid_fee_payer(
                Stage::Draft,
                format!("fee payer {fee_payer} is not the sponsor {sponsor}"),
            ));
        }
        if recency.is_null() {
            return Err(OperationError::invalid_recency_token(
                Stage::Draft,
                "recency token is the default hash",
            ));
        }

        let compiled = v0::Message::try_compile(fee_payer, &instructions, tables, recency.blockhash)
            .map_err(compile_error)?;
        let compression_tables = compiled
            .address_table_lookups
            .iter()
            .map(|lookup| lookup.account_key)
            .collect();
        let message = VersionedMessage::V0(compiled);

        let unsigned = unsigned_transaction(&message);
        let wire = bincode::serialize(&unsigned).map_err(|e| {
            OperationError::new(
                ErrorKind::MalformedInstruction,
                Stage::Draft,
                format!("draft could not be serialized: {e}"),
            )
        })?;

        if wire.len() > max_tx_bytes {
            return Err(OperationError::payload_too_large(wire.len(), max_tx_bytes));
        }

        Ok(Self {
            fee_payer: *fee_payer,
            recency,
            instructions,
            compression_tables,
            message,
            wire,
        })
    }

    pub fn fee_payer(&self) -> &Pubkey {
        &self.fee_payer
    }

    pub fn recency(&self) -> &RecencyToken {
        &self.recency
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Lookup tables actually referenced by the compiled message
    pub fn compression_tables(&self) -> &[Pubkey] {
        &self.compression_tables
    }

    pub fn message(&self) -> &VersionedMessage {
        &self.message
    }

    pub fn serialized_size(&self) -> usize {
        self.wire.len()
    }

    pub fn required_signers(&self) -> &[Pubkey] {
        compat::get_required_signers(&self.message)
    }

    /// Transaction with every signature slot set to the placeholder
    pub fn unsigned_transaction(&self) -> VersionedTransaction {
        unsigned_transaction(&self.message)
    }

    /// Wire bytes of the unsigned transaction
    pub fn as_bytes(&self) -> &[u8] {
        &self.wire
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.wire)
    }
}

fn unsigned_transaction(message: &VersionedMessage) -> VersionedTransaction {
    let num_signers = compat::get_message_header(message).num_required_signatures as usize;
    VersionedTransaction {
        signatures: vec![Signature::default(); num_signers],
        message: message.clone(),
    }
}

fn compile_error(err: CompileError) -> OperationError {
    match err {
        CompileError::AccountIndexOverflow | CompileError::AddressTableLookupIndexOverflow => {
            OperationError::new(
                ErrorKind::PayloadTooLarge,
                Stage::Compose,
                format!("transaction references too many accounts: {err}"),
            )
        }
        CompileError::UnknownInstructionKey(key) => OperationError::new(
            ErrorKind::MalformedInstruction,
            Stage::Compose,
            format!("instruction references unknown key {key}"),
        ),
    }
}

/// Signatures aligned to a message's required-signer list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureSet {
    signers: Vec<Pubkey>,
    signatures: Vec<Signature>,
}

impl SignatureSet {
    /// Empty set for a message: every slot holds the placeholder
    pub fn empty(message: &VersionedMessage) -> Self {
        let signers = compat::get_required_signers(message).to_vec();
        let signatures = vec![Signature::default(); signers.len()];
        Self {
            signers,
            signatures,
        }
    }

    /// Signature set carried by a transaction.
    ///
    /// Missing trailing slots are treated as placeholders and surplus
    /// signatures are ignored.
    pub fn from_transaction(tx: &VersionedTransaction) -> Self {
        let mut set = Self::empty(&tx.message);
        for (slot, signature) in tx.signatures.iter().take(set.signatures.len()).enumerate() {
            set.signatures[slot] = *signature;
        }
        set
    }

    pub fn signers(&self) -> &[Pubkey] {
        &self.signers
    }

    pub fn signatures(&self) -> &[Signature] {
        &self.signatures
    }

    pub fn slot_of(&self, signer: &Pubkey) -> Option<usize> {
        self.signers.iter().position(|k| k == signer)
    }

    pub fn is_populated(&self, slot: usize) -> bool {
        self.signatures
            .get(slot)
            .is_some_and(|sig| *sig != Signature::default())
    }

    /// Slots holding a non-placeholder signature
    pub fn populated_slots(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.signatures.len()).filter(|slot| self.is_populated(*slot))
    }

    /// Every required signer slot is non-placeholder
    pub fn is_fully_signed(&self) -> bool {
        !self.signatures.is_empty() && (0..self.signatures.len()).all(|slot| self.is_populated(slot))
    }

    pub fn set(&mut self, slot: usize, signature: Signature) -> bool {
        match self.signatures.get_mut(slot) {
            Some(existing) => {
                *existing = signature;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_sdk::{hash::Hash, instruction::AccountMeta, signature::Keypair, signer::Signer};

    fn user_ix(user: &Pubkey, data_len: usize) -> Instruction {
        Instruction::new_with_bytes(
            Pubkey::new_unique(),
            &vec![7u8; data_len],
            vec![
                AccountMeta::new(*user, true),
                AccountMeta::new(Pubkey::new_unique(), false),
            ],
        )
    }

    fn token() -> RecencyToken {
        RecencyToken::new(Hash::new_unique(), 1_000)
    }

    #[test]
    fn test_fee_payer_must_be_sponsor() {
        let sponsor = Pubkey::new_unique();
        let other = Pubkey::new_unique();
        let err = TransactionDraft::new(&sponsor, &other, token(), vec![], &[], MAX_TX_BYTES)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidFeePayer);
        assert_eq!(err.stage, Stage::Draft);
    }

    #[test]
    fn test_null_recency_rejected() {
        let sponsor = Pubkey::new_unique();
        let err = TransactionDraft::new(
            &sponsor,
            &sponsor,
            RecencyToken::new(Hash::default(), 10),
            vec![],
            &[],
            MAX_TX_BYTES,
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidRecencyToken);
        assert!(err.retryable);
    }

    #[test]
    fn test_draft_layout() {
        let sponsor = Pubkey::new_unique();
        let user = Pubkey::new_unique();
        let draft = TransactionDraft::new(
            &sponsor,
            &sponsor,
            token(),
            vec![user_ix(&user, 8)],
            &[],
            MAX_TX_BYTES,
        )
        .unwrap();

        assert_eq!(draft.fee_payer(), &sponsor);
        assert_eq!(draft.required_signers(), &[sponsor, user]);
        assert_eq!(draft.as_bytes().len(), draft.serialized_size());
        let decoded: VersionedTransaction = bincode::deserialize(draft.as_bytes()).unwrap();
        assert_eq!(decoded, draft.unsigned_transaction());

        let tx = draft.unsigned_transaction();
        assert_eq!(tx.signatures, vec![Signature::default(); 2]);
        assert!(!SignatureSet::from_transaction(&tx).is_fully_signed());
    }

    #[test]
    fn test_size_is_measured_and_enforced() {
        let sponsor = Pubkey::new_unique();
        let user = Pubkey::new_unique();
        let ixs = vec![user_ix(&user, 300)];
        let size = TransactionDraft::new(&sponsor, &sponsor, token(), ixs.clone(), &[], usize::MAX)
            .unwrap()
            .serialized_size();

        assert!(TransactionDraft::new(&sponsor, &sponsor, token(), ixs.clone(), &[], size).is_ok());
        let err = TransactionDraft::new(&sponsor, &sponsor, token(), ixs, &[], size - 1).unwrap_err();
        assert_eq!(err.kind, ErrorKind::PayloadTooLarge);
        assert!(err.message.contains(&size.to_string()));
    }

    #[test]
    fn test_lookup_tables_compress_accounts() {
        let sponsor = Pubkey::new_unique();
        let user = Pubkey::new_unique();
        let readonly: Vec<Pubkey> = (0..20).map(|_| Pubkey::new_unique()).collect();
        let ix = Instruction::new_with_bytes(
            Pubkey::new_unique(),
            &[1],
            std::iter::once(AccountMeta::new(user, true))
                .chain(readonly.iter().map(|k| AccountMeta::new_readonly(*k, false)))
                .collect(),
        );
        let table = AddressLookupTableAccount {
            key: Pubkey::new_unique(),
            addresses: readonly.clone(),
        };
        let unused = AddressLookupTableAccount {
            key: Pubkey::new_unique(),
            addresses: vec![Pubkey::new_unique()],
        };

        let plain = TransactionDraft::new(&sponsor, &sponsor, token(), vec![ix.clone()], &[], MAX_TX_BYTES)
            .unwrap();
        let compressed = TransactionDraft::new(
            &sponsor,
            &sponsor,
            token(),
            vec![ix],
            &[table.clone(), unused],
            MAX_TX_BYTES,
        )
        .unwrap();

        assert_eq!(compressed.compression_tables(), &[table.key]);
        assert!(compressed.serialized_size() < plain.serialized_size());
    }

    #[test]
    fn test_signature_set_slots() {
        let sponsor = Keypair::new();
        let user = Keypair::new();
        let draft = TransactionDraft::new(
            &sponsor.pubkey(),
            &sponsor.pubkey(),
            token(),
            vec![user_ix(&user.pubkey(), 4)],
            &[],
            MAX_TX_BYTES,
        )
        .unwrap();

        let mut set = SignatureSet::empty(draft.message());
        assert_eq!(set.slot_of(&user.pubkey()), Some(1));
        assert_eq!(set.populated_slots().count(), 0);

        let message_bytes = draft.message().serialize();
        assert!(set.set(1, user.sign_message(&message_bytes)));
        assert!(!set.is_fully_signed());
        assert!(set.set(0, sponsor.sign_message(&message_bytes)));
        assert!(set.is_fully_signed());
        assert!(!set.set(2, Signature::default()));
    }
}
