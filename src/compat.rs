//! Compatibility layer for Solana message types
//!
//! Drafts are always compiled as V0 messages, but transactions submitted back
//! by clients are decoded as `VersionedMessage` and may be either version.
//! These helpers give one API for the header, the static keys, the fee payer
//! and the recency token regardless of the message version.

use solana_sdk::{
    hash::Hash,
    instruction::CompiledInstruction,
    message::{MessageHeader, VersionedMessage},
    pubkey::Pubkey,
};

/// Get the message header from a `VersionedMessage`.
#[inline]
#[must_use]
pub fn get_message_header(message: &VersionedMessage) -> &MessageHeader {
    match message {
        VersionedMessage::Legacy(legacy_msg) => &legacy_msg.header,
        VersionedMessage::V0(v0_msg) => &v0_msg.header,
    }
}

/// Get the static account keys from a `VersionedMessage`.
///
/// For V0 messages this excludes addresses loaded from lookup tables.
#[inline]
#[must_use]
pub fn get_static_account_keys(message: &VersionedMessage) -> &[Pubkey] {
    match message {
        VersionedMessage::Legacy(legacy_msg) => &legacy_msg.account_keys,
        VersionedMessage::V0(v0_msg) => &v0_msg.account_keys,
    }
}

/// Get the required signers: always the first `num_required_signatures` static keys.
#[inline]
#[must_use]
pub fn get_required_signers(message: &VersionedMessage) -> &[Pubkey] {
    let header = get_message_header(message);
    let account_keys = get_static_account_keys(message);
    let num_signers = header.num_required_signatures as usize;

    &account_keys[..num_signers.min(account_keys.len())]
}

/// The fee payer is the first static key of every message
#[inline]
#[must_use]
pub fn get_fee_payer(message: &VersionedMessage) -> Option<&Pubkey> {
    get_static_account_keys(message).first()
}

#[inline]
#[must_use]
pub fn get_recent_blockhash(message: &VersionedMessage) -> &Hash {
    match message {
        VersionedMessage::Legacy(legacy_msg) => &legacy_msg.recent_blockhash,
        VersionedMessage::V0(v0_msg) => &v0_msg.recent_blockhash,
    }
}

#[inline]
#[must_use]
pub fn get_compiled_instructions(message: &VersionedMessage) -> &[CompiledInstruction] {
    match message {
        VersionedMessage::Legacy(legacy_msg) => &legacy_msg.instructions,
        VersionedMessage::V0(v0_msg) => &v0_msg.instructions,
    }
}
