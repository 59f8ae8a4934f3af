use base64::Engine;
use base64::engine::general_purpose;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum DecryptError {
    #[error("vault POST failed: {0}")]
    Post(#[from] reqwest::Error),
    #[error("vault HTTP {status}: {body}")]
    HttpStatus {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("vault JSON decode failed: {0}")]
    JsonDecode(#[source] reqwest::Error),
    #[error("decryption response carried no plaintext")]
    MissingPlaintext,
    #[error("plaintext base64 decode failed: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("plaintext is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("invalid transit URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

#[derive(Debug, Serialize)]
struct DecryptReq<'a> {
    ciphertext: &'a str,
}

#[derive(Debug, Deserialize)]
struct DecryptResp {
    data: Option<DecryptData>,
}

#[derive(Debug, Deserialize)]
struct DecryptData {
    plaintext: Option<String>,
}

/// Client for Vault's transit secret engine. Only the decrypt endpoint is
/// used at runtime; unsealing and engine setup happen out of band.
pub struct VaultClient {
    addr: Url,
    token: String,
    transit_key: String,
    http: reqwest::Client,
}

impl VaultClient {
    #[must_use]
    pub fn new(addr: Url, token: String, transit_key: String) -> Self {
        Self {
            addr,
            token,
            transit_key,
            http: reqwest::Client::new(),
        }
    }

    pub async fn decrypt(&self, ciphertext: &str) -> Result<String, DecryptError> {
        let url = self
            .addr
            .join(&format!("v1/transit/decrypt/{}", self.transit_key))?;
        let resp = self
            .http
            .post(url)
            .header("X-Vault-Token", &self.token)
            .json(&DecryptReq { ciphertext })
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(DecryptError::HttpStatus { status, body });
        }

        let parsed: DecryptResp = resp.json().await.map_err(DecryptError::JsonDecode)?;
        let plaintext = parsed
            .data
            .and_then(|data| data.plaintext)
            .ok_or(DecryptError::MissingPlaintext)?;
        decode_plaintext(&plaintext)
    }
}

fn decode_plaintext(encoded: &str) -> Result<String, DecryptError> {
    let bytes = general_purpose::STANDARD.decode(encoded)?;
    Ok(String::from_utf8(bytes)?)
}
