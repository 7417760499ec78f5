//! Terminal success value of a sponsored operation
//!
//! `confirmed == false` is not a failure: the transaction was accepted by the
//! network and the signature can be polled later. Callers must keep it as a
//! distinct "pending" state.

use serde::{Deserialize, Serialize};
use solana_sdk::signature::Signature;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    /// Transaction identifier (base58 in JSON)
    #[serde(with = "signature_base58")]
    pub signature: Signature,
    pub confirmed: bool,
    /// Wall time from ceremony start to the terminal result
    pub timing_ms: u64,
}

impl OperationResult {
    pub fn new(signature: Signature, confirmed: bool, timing_ms: u64) -> Self {
        Self {
            signature,
            confirmed,
            timing_ms,
        }
    }

    /// Landed on chain but confirmation was not observed in the polling window
    pub fn is_pending(&self) -> bool {
        !self.confirmed
    }
}

mod signature_base58 {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use solana_sdk::signature::Signature;
    use std::str::FromStr;

    pub fn serialize<S: Serializer>(sig: &Signature, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&sig.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Signature, D::Error> {
        let text = String::deserialize(d)?;
        Signature::from_str(&text).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_shape() {
        let sig = Signature::from([3u8; 64]);
        let result = OperationResult::new(sig, false, 1234);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["signature"], sig.to_string());
        assert_eq!(json["confirmed"], false);
        assert_eq!(json["timing_ms"], 1234);
        assert!(result.is_pending());

        let back: OperationResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, result);
    }
}
