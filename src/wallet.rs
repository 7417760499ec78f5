//! Sponsor key material for local signing
//!
//! Production deployments keep the sponsor key in a custodial signing
//! service. For development and self-hosted setups the key can be loaded from
//! a keypair file and used through [`crate::signer::KeypairSigner`].

use anyhow::{Context, Result};
use solana_sdk::{
    pubkey::Pubkey,
    signature::{Keypair, Signer},
};
use std::path::Path;
use std::sync::Arc;
use zeroize::Zeroizing;

/// Sponsor keypair holder
#[derive(Clone)]
pub struct SponsorWallet {
    keypair: Arc<Keypair>,
}

impl SponsorWallet {
    /// Load from a keypair file: raw 64 bytes or the JSON byte-array format
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = Zeroizing::new(
            std::fs::read(path)
                .with_context(|| format!("Failed to read keypair file: {}", path.display()))?,
        );

        let secret: Zeroizing<Vec<u8>> = if contents.len() == 64 {
            Zeroizing::new(contents.to_vec())
        } else {
            Zeroizing::new(
                serde_json::from_slice(&contents).context("Failed to parse keypair JSON")?,
            )
        };

        if secret.len() != 64 {
            anyhow::bail!("Invalid keypair length: expected 64 bytes, got {}", secret.len());
        }
        if secret.iter().all(|&b| b == 0) {
            anyhow::bail!("Invalid keypair: all-zero key rejected");
        }

        let keypair = Keypair::try_from(secret.as_slice()).context("Invalid keypair bytes")?;
        Ok(Self::from_keypair(keypair))
    }

    pub fn from_keypair(keypair: Keypair) -> Self {
        Self {
            keypair: Arc::new(keypair),
        }
    }

    pub fn pubkey(&self) -> Pubkey {
        self.keypair.pubkey()
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }
}

impl std::fmt::Debug for SponsorWallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SponsorWallet")
            .field("pubkey", &self.pubkey())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_json_keypair() {
        let keypair = Keypair::new();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let json = serde_json::to_string(&keypair.to_bytes().to_vec()).unwrap();
        file.write_all(json.as_bytes()).unwrap();

        let wallet = SponsorWallet::from_file(file.path()).unwrap();
        assert_eq!(wallet.pubkey(), keypair.pubkey());
    }

    #[test]
    fn test_load_raw_keypair() {
        let keypair = Keypair::new();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&keypair.to_bytes()).unwrap();

        let wallet = SponsorWallet::from_file(file.path()).unwrap();
        assert_eq!(wallet.pubkey(), keypair.pubkey());
    }

    #[test]
    fn test_zero_key_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0u8; 64]).unwrap();
        let err = SponsorWallet::from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("all-zero"));
    }

    #[test]
    fn test_wrong_length_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"[1,2,3]").unwrap();
        assert!(SponsorWallet::from_file(file.path()).is_err());
    }

    #[test]
    fn test_debug_hides_secret() {
        let wallet = SponsorWallet::from_keypair(Keypair::new());
        let text = format!("{wallet:?}");
        assert!(text.contains(&wallet.pubkey().to_string()));
    }
}
