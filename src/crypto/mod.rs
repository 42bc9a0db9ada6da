//! Tagged field encryption
//!
//! Encrypted values are stored as `<alg>$<payload>`. Decryption dispatches on
//! the tag so data written by an older algorithm stays readable while a new
//! one is rolled out; encryption always uses the configured algorithm.

use std::fmt;
use std::str::FromStr;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

type Sm4Ctr = ctr::Ctr128BE<sm4::Sm4>;

const GCM_NONCE_LEN: usize = 12;
const SM4_IV_LEN: usize = 16;

#[derive(Error, Debug)]
pub enum CipherError {
    #[error("unknown cipher tag: {0}")]
    UnknownTag(String),

    #[error("value is not tagged with a cipher prefix")]
    Untagged,

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("decryption failed")]
    DecryptFailed,

    #[error("invalid key material: {0}")]
    InvalidKey(String),
}

/// Supported algorithms, identified by their storage tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CipherAlgorithm {
    /// AES-256-GCM
    #[default]
    BkCrypt,
    /// SM4 in counter mode
    Sm4Ctr,
}

impl CipherAlgorithm {
    pub fn tag(&self) -> &'static str {
        match self {
            CipherAlgorithm::BkCrypt => "bkcrypt",
            CipherAlgorithm::Sm4Ctr => "sm4ctr",
        }
    }
}

impl FromStr for CipherAlgorithm {
    type Err = CipherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bkcrypt" => Ok(CipherAlgorithm::BkCrypt),
            "sm4ctr" => Ok(CipherAlgorithm::Sm4Ctr),
            other => Err(CipherError::UnknownTag(other.to_string())),
        }
    }
}

impl fmt::Display for CipherAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Encrypts and decrypts tagged values with keys derived from one secret
#[derive(Clone)]
pub struct CipherManager {
    current: CipherAlgorithm,
    aes_key: [u8; 32],
    sm4_key: [u8; 16],
}

impl fmt::Debug for CipherManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherManager")
            .field("current", &self.current)
            .finish_non_exhaustive()
    }
}

impl CipherManager {
    /// Derive per-algorithm keys from a shared secret
    pub fn new(secret: &str, current: CipherAlgorithm) -> Result<Self, CipherError> {
        if secret.is_empty() {
            return Err(CipherError::InvalidKey("secret must not be empty".into()));
        }
        let digest = Sha256::digest(secret.as_bytes());
        let mut aes_key = [0u8; 32];
        aes_key.copy_from_slice(&digest);

        let sm4_digest = Sha256::digest(format!("sm4:{}", secret).as_bytes());
        let mut sm4_key = [0u8; 16];
        sm4_key.copy_from_slice(&sm4_digest[..16]);

        Ok(Self {
            current,
            aes_key,
            sm4_key,
        })
    }

    pub fn algorithm(&self) -> CipherAlgorithm {
        self.current
    }

    /// Encrypt with the configured algorithm, returning `<tag>$<base64>`
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        self.encrypt_with(self.current, plaintext)
    }

    pub fn encrypt_with(
        &self,
        algorithm: CipherAlgorithm,
        plaintext: &str,
    ) -> Result<String, CipherError> {
        let payload = match algorithm {
            CipherAlgorithm::BkCrypt => {
                let cipher = Aes256Gcm::new_from_slice(&self.aes_key)
                    .map_err(|e| CipherError::InvalidKey(e.to_string()))?;
                let mut nonce = [0u8; GCM_NONCE_LEN];
                rand::thread_rng().fill_bytes(&mut nonce);
                let sealed = cipher
                    .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
                    .map_err(|_| CipherError::Malformed("aes-gcm seal failed".into()))?;
                let mut out = nonce.to_vec();
                out.extend_from_slice(&sealed);
                out
            }
            CipherAlgorithm::Sm4Ctr => {
                let mut iv = [0u8; SM4_IV_LEN];
                rand::thread_rng().fill_bytes(&mut iv);
                let mut buf = plaintext.as_bytes().to_vec();
                let mut cipher = Sm4Ctr::new_from_slices(&self.sm4_key, &iv)
                    .map_err(|e| CipherError::InvalidKey(e.to_string()))?;
                cipher.apply_keystream(&mut buf);
                let mut out = iv.to_vec();
                out.extend_from_slice(&buf);
                out
            }
        };
        Ok(format!("{}${}", algorithm.tag(), STANDARD.encode(payload)))
    }

    /// Decrypt any supported tagged value
    pub fn decrypt(&self, value: &str) -> Result<String, CipherError> {
        let (tag, payload) = value.split_once('$').ok_or(CipherError::Untagged)?;
        let algorithm: CipherAlgorithm = tag.parse()?;
        let raw = STANDARD
            .decode(payload)
            .map_err(|e| CipherError::Malformed(e.to_string()))?;

        let plain = match algorithm {
            CipherAlgorithm::BkCrypt => {
                if raw.len() < GCM_NONCE_LEN {
                    return Err(CipherError::Malformed("payload shorter than nonce".into()));
                }
                let (nonce, sealed) = raw.split_at(GCM_NONCE_LEN);
                let cipher = Aes256Gcm::new_from_slice(&self.aes_key)
                    .map_err(|e| CipherError::InvalidKey(e.to_string()))?;
                cipher
                    .decrypt(Nonce::from_slice(nonce), sealed)
                    .map_err(|_| CipherError::DecryptFailed)?
            }
            CipherAlgorithm::Sm4Ctr => {
                if raw.len() < SM4_IV_LEN {
                    return Err(CipherError::Malformed("payload shorter than iv".into()));
                }
                let (iv, body) = raw.split_at(SM4_IV_LEN);
                let mut buf = body.to_vec();
                let mut cipher = Sm4Ctr::new_from_slices(&self.sm4_key, iv)
                    .map_err(|e| CipherError::InvalidKey(e.to_string()))?;
                cipher.apply_keystream(&mut buf);
                buf
            }
        };

        String::from_utf8(plain).map_err(|_| CipherError::DecryptFailed)
    }

    /// Re-encrypt a value with the current algorithm if it uses another one
    pub fn migrate(&self, value: &str) -> Result<Option<String>, CipherError> {
        let tag = value.split_once('$').map(|(t, _)| t).unwrap_or_default();
        if tag == self.current.tag() {
            return Ok(None);
        }
        let plain = self.decrypt(value)?;
        self.encrypt(&plain).map(Some)
    }
}

/// A string stored encrypted at rest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncryptedString(String);

impl EncryptedString {
    pub fn seal(cipher: &CipherManager, plaintext: &str) -> Result<Self, CipherError> {
        cipher.encrypt(plaintext).map(EncryptedString)
    }

    pub fn reveal(&self, cipher: &CipherManager) -> Result<String, CipherError> {
        cipher.decrypt(&self.0)
    }

    pub fn as_stored(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(alg: CipherAlgorithm) -> CipherManager {
        CipherManager::new("unit-test-secret", alg).unwrap()
    }

    #[test]
    fn test_bkcrypt_tagged_output() {
        let m = manager(CipherAlgorithm::BkCrypt);
        let sealed = m.encrypt("s3cret").unwrap();
        assert!(sealed.starts_with("bkcrypt$"));
        assert_eq!(m.decrypt(&sealed).unwrap(), "s3cret");
    }

    #[test]
    fn test_reads_both_algorithms() {
        let writer_old = manager(CipherAlgorithm::Sm4Ctr);
        let reader_new = manager(CipherAlgorithm::BkCrypt);

        let legacy = writer_old.encrypt("registry-password").unwrap();
        assert!(legacy.starts_with("sm4ctr$"));
        assert_eq!(reader_new.decrypt(&legacy).unwrap(), "registry-password");
    }

    #[test]
    fn test_migrate_switches_tag() {
        let m = manager(CipherAlgorithm::BkCrypt);
        let legacy = m.encrypt_with(CipherAlgorithm::Sm4Ctr, "token").unwrap();

        let migrated = m.migrate(&legacy).unwrap().unwrap();
        assert!(migrated.starts_with("bkcrypt$"));
        assert_eq!(m.decrypt(&migrated).unwrap(), "token");

        assert!(m.migrate(&migrated).unwrap().is_none());
    }

    #[test]
    fn test_unknown_tag_and_untagged() {
        let m = manager(CipherAlgorithm::BkCrypt);
        assert!(matches!(m.decrypt("rot13$abc"), Err(CipherError::UnknownTag(_))));
        assert!(matches!(m.decrypt("plain"), Err(CipherError::Untagged)));
    }

    #[test]
    fn test_wrong_key_fails() {
        let a = CipherManager::new("key-a", CipherAlgorithm::BkCrypt).unwrap();
        let b = CipherManager::new("key-b", CipherAlgorithm::BkCrypt).unwrap();
        let sealed = a.encrypt("x").unwrap();
        assert!(matches!(b.decrypt(&sealed), Err(CipherError::DecryptFailed)));
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert!(CipherManager::new("", CipherAlgorithm::BkCrypt).is_err());
    }
}
