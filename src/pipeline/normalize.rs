//! Provider instruction normalization
//!
//! Quote and vault providers describe instructions in slightly different JSON
//! shapes. This module resolves every logical field through an ordered alias
//! table and produces a plain [`Instruction`], or an [`OperationError`] of
//! kind `MALFORMED_INSTRUCTION` naming the provider and the offending index.
//!
//! Recognized shapes:
//! - the instruction itself, or nested under `instruction` / `ix` / `inner`
//! - program id under `programId` / `program_id` / `programAddress` / `program`
//! - accounts under `accounts` / `keys` / `accountMetas` / `account_metas`,
//!   each either a bare base58 string or a record with pubkey, signer and
//!   writable flags (or a numeric `role`)
//! - payload under `data` / `payload` / `instructionData` / `instruction_data`,
//!   as base64 text, a byte array, or a `[text, encoding]` pair

use crate::pipeline::errors::OperationError;
use base64::Engine;
use serde_json::{Map, Value};
use solana_sdk::{
    instruction::{AccountMeta, Instruction},
    pubkey::Pubkey,
};
use std::str::FromStr;
use thiserror::Error;
use tracing::warn;

const WRAPPER_FIELDS: &[&str] = &["instruction", "ix", "inner"];
const PROGRAM_ID_FIELDS: &[&str] = &["programId", "program_id", "programAddress", "program"];
const ACCOUNTS_FIELDS: &[&str] = &["accounts", "keys", "accountMetas", "account_metas"];
const PAYLOAD_FIELDS: &[&str] = &["data", "payload", "instructionData", "instruction_data"];

const PUBKEY_FIELDS: &[&str] = &["pubkey", "address", "publicKey", "key"];
const SIGNER_FIELDS: &[&str] = &["isSigner", "is_signer", "signer"];
const WRITABLE_FIELDS: &[&str] = &["isWritable", "is_writable", "writable"];
const ROLE_FIELDS: &[&str] = &["role"];

/// Maximum characters of the offending input kept for diagnostics
pub const PREVIEW_CHARS: usize = 256;

/// Reason a single provider instruction could not be normalized
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("instruction is not a JSON object")]
    NotAnObject,

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("invalid pubkey in `{field}`: {value}")]
    InvalidPubkey { field: &'static str, value: String },

    #[error("invalid account at position {position}: {reason}")]
    InvalidAccount { position: usize, reason: String },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

/// Resolve the first present alias of a logical field
fn lookup<'a>(obj: &'a Map<String, Value>, aliases: &[&str]) -> Option<&'a Value> {
    aliases
        .iter()
        .find_map(|alias| obj.get(*alias))
        .filter(|v| !v.is_null())
}

/// Descend through wrapper fields until the object carrying a program id
fn unwrap_instruction(mut obj: &Map<String, Value>) -> &Map<String, Value> {
    // Bounded: providers nest at most a couple of levels
    for _ in 0..4 {
        if lookup(obj, PROGRAM_ID_FIELDS).is_some() {
            return obj;
        }
        match lookup(obj, WRAPPER_FIELDS).and_then(Value::as_object) {
            Some(inner) => obj = inner,
            None => return obj,
        }
    }
    obj
}

fn parse_pubkey(value: &Value, field: &'static str) -> Result<Pubkey, NormalizeError> {
    let text = value.as_str().ok_or_else(|| NormalizeError::InvalidPubkey {
        field,
        value: value.to_string(),
    })?;
    Pubkey::from_str(text).map_err(|_| NormalizeError::InvalidPubkey {
        field,
        value: text.to_string(),
    })
}

fn parse_flag(obj: &Map<String, Value>, aliases: &[&str]) -> bool {
    lookup(obj, aliases).and_then(Value::as_bool).unwrap_or(false)
}

fn parse_account(position: usize, entry: &Value) -> Result<AccountMeta, NormalizeError> {
    match entry {
        Value::String(_) => {
            let pubkey = parse_pubkey(entry, "accounts")?;
            Ok(AccountMeta {
                pubkey,
                is_signer: false,
                is_writable: false,
            })
        }
        Value::Object(obj) => {
            let raw = lookup(obj, PUBKEY_FIELDS).ok_or_else(|| NormalizeError::InvalidAccount {
                position,
                reason: "missing pubkey".to_string(),
            })?;
            let pubkey = parse_pubkey(raw, "accounts.pubkey")?;

            // Kit-style role: 0 readonly, 1 writable, 2 readonly signer, 3 writable signer
            if let Some(role) = lookup(obj, ROLE_FIELDS).and_then(Value::as_u64) {
                if role > 3 {
                    return Err(NormalizeError::InvalidAccount {
                        position,
                        reason: format!("unknown role {role}"),
                    });
                }
                return Ok(AccountMeta {
                    pubkey,
                    is_signer: role >= 2,
                    is_writable: role & 1 == 1,
                });
            }

            Ok(AccountMeta {
                pubkey,
                is_signer: parse_flag(obj, SIGNER_FIELDS),
                is_writable: parse_flag(obj, WRITABLE_FIELDS),
            })
        }
        other => Err(NormalizeError::InvalidAccount {
            position,
            reason: format!("unsupported entry {other}"),
        }),
    }
}

fn decode_text(text: &str, encoding: &str) -> Result<Vec<u8>, NormalizeError> {
    match encoding {
        "base64" => base64::engine::general_purpose::STANDARD
            .decode(text)
            .map_err(|e| NormalizeError::InvalidPayload(format!("base64: {e}"))),
        "base58" => bs58::decode(text)
            .into_vec()
            .map_err(|e| NormalizeError::InvalidPayload(format!("base58: {e}"))),
        other => Err(NormalizeError::InvalidPayload(format!(
            "unknown encoding `{other}`"
        ))),
    }
}

fn parse_payload(value: Option<&Value>) -> Result<Vec<u8>, NormalizeError> {
    match value {
        None => Ok(Vec::new()),
        Some(Value::String(text)) => decode_text(text, "base64"),
        Some(Value::Array(items)) => {
            // `[text, encoding]` as returned by RPC account encodings
            if let [Value::String(text), Value::String(encoding)] = items.as_slice() {
                return decode_text(text, encoding);
            }
            items
                .iter()
                .map(|b| {
                    b.as_u64()
                        .filter(|n| *n <= u8::MAX as u64)
                        .map(|n| n as u8)
                        .ok_or_else(|| NormalizeError::InvalidPayload(format!("bad byte {b}")))
                })
                .collect()
        }
        Some(other) => Err(NormalizeError::InvalidPayload(format!(
            "unsupported payload {other}"
        ))),
    }
}

/// Normalize a single provider instruction description
pub fn normalize_instruction(value: &Value) -> Result<Instruction, NormalizeError> {
    let obj = value.as_object().ok_or(NormalizeError::NotAnObject)?;
    let obj = unwrap_instruction(obj);

    let program_id = lookup(obj, PROGRAM_ID_FIELDS)
        .ok_or(NormalizeError::MissingField("programId"))
        .and_then(|v| parse_pubkey(v, "programId"))?;

    let accounts = match lookup(obj, ACCOUNTS_FIELDS) {
        None => Vec::new(),
        Some(Value::Array(entries)) => entries
            .iter()
            .enumerate()
            .map(|(position, entry)| parse_account(position, entry))
            .collect::<Result<Vec<_>, _>>()?,
        Some(other) => {
            return Err(NormalizeError::InvalidAccount {
                position: 0,
                reason: format!("accounts is not a list: {other}"),
            })
        }
    };

    let data = parse_payload(lookup(obj, PAYLOAD_FIELDS))?;

    Ok(Instruction {
        program_id,
        accounts,
        data,
    })
}

/// Bounded preview of the offending input
pub fn preview(value: &Value) -> String {
    let text = value.to_string();
    if text.chars().count() <= PREVIEW_CHARS {
        text
    } else {
        let mut out: String = text.chars().take(PREVIEW_CHARS).collect();
        out.push_str("…");
        out
    }
}

/// Normalize every instruction of a provider batch independently.
///
/// A malformed entry never prevents the others from being normalized; each
/// position carries its own result.
pub fn normalize_each(provider: &str, values: &[Value]) -> Vec<Result<Instruction, OperationError>> {
    values
        .iter()
        .enumerate()
        .map(|(index, value)| {
            normalize_instruction(value).map_err(|reason| {
                warn!(
                    provider = provider,
                    index = index,
                    error = %reason,
                    "Malformed provider instruction"
                );
                OperationError::malformed_instruction(provider, index, reason, &preview(value))
            })
        })
        .collect()
}

/// Normalize a provider batch, failing with the first malformed instruction
pub fn normalize_batch(provider: &str, values: &[Value]) -> Result<Vec<Instruction>, OperationError> {
    normalize_each(provider, values).into_iter().collect()
}

/// Canonical provider shape for an instruction (inverse of normalization)
pub fn to_provider_json(ix: &Instruction) -> Value {
    serde_json::json!({
        "programId": ix.program_id.to_string(),
        "accounts": ix.accounts.iter().map(|meta| serde_json::json!({
            "pubkey": meta.pubkey.to_string(),
            "isSigner": meta.is_signer,
            "isWritable": meta.is_writable,
        })).collect::<Vec<_>>(),
        "data": base64::engine::general_purpose::STANDARD.encode(&ix.data),
    })
}
