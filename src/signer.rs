//! Custodial signer adapters
//!
//! - [`HttpCustodialSigner`]: remote signing service reached over HTTP
//! - [`KeypairSigner`]: local sponsor keypair, for development and tests

use crate::pipeline::ceremony::{CustodialSigner, SignerError, SignerResponse};
use crate::wallet::SponsorWallet;
use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, StatusCode};
use solana_sdk::{signer::Signer, transaction::VersionedTransaction};
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Signs with a locally held sponsor keypair
pub struct KeypairSigner {
    key_id: String,
    wallet: SponsorWallet,
}

impl KeypairSigner {
    pub fn new(key_id: impl Into<String>, wallet: SponsorWallet) -> Self {
        Self {
            key_id: key_id.into(),
            wallet,
        }
    }
}

#[async_trait]
impl CustodialSigner for KeypairSigner {
    async fn sign_transaction(
        &self,
        key_id: &str,
        transaction: &[u8],
    ) -> Result<SignerResponse, SignerError> {
        if key_id != self.key_id {
            return Err(SignerError::Rejected(format!("unknown key id {key_id:?}")));
        }

        let mut tx: VersionedTransaction = bincode::deserialize(transaction)
            .map_err(|e| SignerError::Rejected(format!("undecodable transaction: {e}")))?;
        let sponsor = self.wallet.pubkey();
        let slot = tx
            .message
            .static_account_keys()
            .iter()
            .take(tx.signatures.len())
            .position(|k| *k == sponsor)
            .ok_or_else(|| SignerError::Rejected("sponsor is not a required signer".into()))?;

        tx.signatures[slot] = self.wallet.keypair().sign_message(&tx.message.serialize());
        let signed = bincode::serialize(&tx)
            .map_err(|e| SignerError::Rejected(format!("re-encoding failed: {e}")))?;
        Ok(SignerResponse::RawBytes(signed))
    }
}

/// Remote custodial signing service
///
/// Request: `POST {url}` with `{"keyId", "transaction" (base64), "encoding"}`.
/// The response body may be any shape [`SignerResponse`] accepts.
pub struct HttpCustodialSigner {
    http: Client,
    url: String,
    api_key: Option<String>,
}

impl HttpCustodialSigner {
    pub fn new(url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Result<Self, SignerError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SignerError::Unavailable(e.to_string()))?;
        Ok(Self {
            http,
            url: url.into(),
            api_key,
        })
    }
}

#[async_trait]
impl CustodialSigner for HttpCustodialSigner {
    #[instrument(skip_all, fields(key_id = key_id))]
    async fn sign_transaction(
        &self,
        key_id: &str,
        transaction: &[u8],
    ) -> Result<SignerResponse, SignerError> {
        let payload = serde_json::json!({
            "keyId": key_id,
            "transaction": base64::engine::general_purpose::STANDARD.encode(transaction),
            "encoding": "base64",
        });

        let mut req = self.http.post(&self.url).json(&payload);
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }

        let resp = req.send().await.map_err(|e| {
            warn!(error = %e, "Signing service request error");
            SignerError::Unavailable(e.to_string())
        })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let excerpt: String = body.chars().take(200).collect();
            warn!(%status, "Signing service error");
            return Err(if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                SignerError::Unavailable(format!("{status}: {excerpt}"))
            } else {
                SignerError::Rejected(format!("{status}: {excerpt}"))
            });
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| SignerError::InvalidResponse(format!("JSON parse error: {e}")))?;
        debug!("Signing service responded");
        SignerResponse::from_json(&body).map_err(|e| SignerError::InvalidResponse(e.message))
    }
}
