use std::net::SocketAddr;

use aes::Aes128;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::burrow::util::serde_b64;

/// Accepted access-key prefixes, longest first so `vh://` wins over `vh:`.
const ACCESS_KEY_PREFIXES: [&str; 4] = ["vhkey://", "vh://", "vhkey:", "vh:"];
const ACCESS_KEY_PREFIX: &str = "vh://";

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("access key has no recognized prefix")]
    BadPrefix,
    #[error("access key base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("access key json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("token secret must be at least 16 bytes")]
    ShortSecret,
}

/// Persistent credential issued by the access manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Token {
    pub token_id: uuid::Uuid,
    #[serde(with = "serde_b64")]
    pub secret: Vec<u8>,
    #[serde(default)]
    pub name: String,
    pub host_name: String,
    pub host_end_points: Vec<SocketAddr>,
    /// SHA-256 of the server certificate the client pins instead of a CA
    /// chain.
    #[serde(default, with = "serde_b64")]
    pub certificate_hash: Vec<u8>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub supported_protocol_version: Option<i32>,
}

impl Token {
    /// Encodes the token as the shareable `vh://` access key.
    pub fn to_access_key(&self) -> String {
        let json = serde_json::to_vec(self).expect("token serializes");
        format!("{ACCESS_KEY_PREFIX}{}", BASE64.encode(json))
    }

    /// Parses an access key. Whitespace and stray quotes around the key are
    /// stripped before the prefix check; copy-pasted keys commonly carry
    /// both.
    pub fn from_access_key(key: &str) -> Result<Token, TokenError> {
        let key = key.trim().trim_matches(|c| c == '"' || c == '\'').trim();
        let body = ACCESS_KEY_PREFIXES
            .iter()
            .find_map(|p| key.strip_prefix(p))
            .ok_or(TokenError::BadPrefix)?;
        let json = BASE64.decode(body.trim().as_bytes())?;
        Ok(serde_json::from_slice(&json)?)
    }

    fn cipher(&self) -> Result<Aes128, TokenError> {
        if self.secret.len() < 16 {
            return Err(TokenError::ShortSecret);
        }
        Ok(Aes128::new(GenericArray::from_slice(&self.secret[..16])))
    }

    /// Deterministic proof of token possession: the 16-byte client id
    /// encrypted as a single AES block under the token secret.
    pub fn encrypt_client_id(&self, client_id: uuid::Uuid) -> Result<Vec<u8>, TokenError> {
        let cipher = self.cipher()?;
        let mut block = GenericArray::clone_from_slice(client_id.as_bytes());
        cipher.encrypt_block(&mut block);
        Ok(block.to_vec())
    }

    /// Server-side inverse of [`Token::encrypt_client_id`].
    pub fn decrypt_client_id(&self, encrypted: &[u8]) -> Result<Option<uuid::Uuid>, TokenError> {
        if encrypted.len() != 16 {
            return Ok(None);
        }
        let cipher = self.cipher()?;
        let mut block = GenericArray::clone_from_slice(encrypted);
        cipher.decrypt_block(&mut block);
        let mut id = [0u8; 16];
        id.copy_from_slice(&block);
        Ok(Some(uuid::Uuid::from_bytes(id)))
    }
}
