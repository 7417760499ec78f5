//! Registry of messages this pipeline drafted
//!
//! The ceremony only co-signs a message whose digest was recorded here when
//! the draft was built. A client can still sign any message with the sponsor
//! as fee payer; without this check the sponsor would pay for instructions it
//! never composed.

use crate::pipeline::recency::DEFAULT_RECENCY_TTL;
use dashmap::DashMap;
use solana_sdk::{hash::Hash, message::VersionedMessage};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Digest under which a drafted message is recorded
pub fn message_digest(message: &VersionedMessage) -> Hash {
    solana_sdk::hash::hash(&message.serialize())
}

/// Process-wide TTL store of drafted message digests
#[derive(Debug)]
pub struct IssuedDrafts {
    entries: DashMap<Hash, Instant>,
    ttl: Duration,
}

impl Default for IssuedDrafts {
    fn default() -> Self {
        Self::new(DEFAULT_RECENCY_TTL)
    }
}

impl IssuedDrafts {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn record(&self, message: &VersionedMessage) {
        self.entries.insert(message_digest(message), Instant::now());
        if self.entries.len() > 4096 {
            self.prune();
        }
    }

    /// Whether the message was drafted here and has not aged out.
    ///
    /// Entries are not consumed; resubmitting the same signed bytes must keep working.
    pub fn contains(&self, message: &VersionedMessage) -> bool {
        let digest = message_digest(message);
        let Some(inserted) = self.entries.get(&digest).map(|entry| *entry) else {
            return false;
        };
        if inserted.elapsed() > self.ttl {
            self.entries.remove(&digest);
            return false;
        }
        true
    }

    pub fn prune(&self) {
        let before = self.entries.len();
        self.entries.retain(|_, inserted| inserted.elapsed() <= self.ttl);
        debug!(
            removed = before - self.entries.len(),
            remaining = self.entries.len(),
            "Pruned issued drafts"
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_sdk::{instruction::Instruction, message::v0, pubkey::Pubkey};

    fn message(data: u8) -> VersionedMessage {
        let ix = Instruction::new_with_bytes(Pubkey::new_unique(), &[data], vec![]);
        VersionedMessage::V0(
            v0::Message::try_compile(&Pubkey::new_unique(), &[ix], &[], Hash::new_unique()).unwrap(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_recorded_message_expires() {
        let issued = IssuedDrafts::new(Duration::from_secs(10));
        let drafted = message(1);
        issued.record(&drafted);
        assert!(issued.contains(&drafted));
        assert!(issued.contains(&drafted));
        assert!(!issued.contains(&message(2)));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!issued.contains(&drafted));
        assert!(issued.is_empty());
    }

    #[test]
    fn test_digest_covers_instruction_data() {
        let drafted = message(1);
        let VersionedMessage::V0(mut altered) = drafted.clone() else {
            unreachable!()
        };
        altered.instructions[0].data = vec![9];
        assert_ne!(message_digest(&drafted), message_digest(&VersionedMessage::V0(altered)));
    }
}
