//! Operator wallet
//!
//! Loads the operator's signing key from a local JSON key file, derives the
//! ledger address from it and signs outgoing uploads and transfers.
//!
//! Key file format (JWK-style, base64url without padding):
//!
//! ```json
//! { "kty": "OKP", "crv": "Ed25519", "d": "<secret>", "x": "<public>" }
//! ```

use std::path::Path;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Wallet errors
#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    #[error("Failed to read key file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to write key file {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },

    #[error("Invalid key file: {0}")]
    InvalidKeyFile(String),

    #[error("Public key does not match secret key")]
    KeyMismatch,
}

#[derive(Debug, Serialize, Deserialize)]
struct KeyFile {
    kty: String,
    crv: String,
    d: String,
    x: String,
}

/// The operator's signing identity
pub struct Wallet {
    signing_key: SigningKey,
    address: String,
}

impl std::fmt::Debug for Wallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wallet")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl Wallet {
    /// Generate a fresh random key
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let address = address_from_public_key(signing_key.verifying_key().as_bytes());
        Self {
            signing_key,
            address,
        }
    }

    /// Load a key file from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self, WalletError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| WalletError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, WalletError> {
        let key_file: KeyFile = serde_json::from_str(content)
            .map_err(|e| WalletError::InvalidKeyFile(e.to_string()))?;

        if key_file.kty != "OKP" || key_file.crv != "Ed25519" {
            return Err(WalletError::InvalidKeyFile(format!(
                "unsupported key type {}/{}",
                key_file.kty, key_file.crv
            )));
        }

        let secret = decode_key_bytes(&key_file.d, "d")?;
        let public = decode_key_bytes(&key_file.x, "x")?;

        let signing_key = SigningKey::from_bytes(&secret);
        if signing_key.verifying_key().as_bytes() != &public {
            return Err(WalletError::KeyMismatch);
        }

        Ok(Self::from_signing_key(signing_key))
    }

    /// Serialize as a key file
    pub fn to_json(&self) -> String {
        let key_file = KeyFile {
            kty: "OKP".to_string(),
            crv: "Ed25519".to_string(),
            d: URL_SAFE_NO_PAD.encode(self.signing_key.to_bytes()),
            x: self.owner(),
        };
        // KeyFile only holds strings
        serde_json::to_string_pretty(&key_file).unwrap_or_default()
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), WalletError> {
        let path = path.as_ref();
        std::fs::write(path, self.to_json()).map_err(|source| WalletError::Write {
            path: path.display().to_string(),
            source,
        })
    }

    /// Ledger address: base64url(sha256(public key))
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Owner field for submissions: base64url public key
    pub fn owner(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.signing_key.verifying_key().as_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }
}

/// Verify a signature against a base64url owner key
pub fn verify_signature(owner: &str, message: &[u8], signature: &[u8]) -> bool {
    let Ok(public) = decode_key_bytes(owner, "owner") else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_bytes(&public) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    key.verify(message, &signature).is_ok()
}

pub fn address_from_public_key(public_key: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(public_key))
}

/// Digest of length-prefixed fields; the message that gets signed.
pub fn signature_digest(fields: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for field in fields {
        hasher.update((field.len() as u64).to_be_bytes());
        hasher.update(field);
    }
    hasher.finalize().into()
}

/// Transaction id derived from its signature
pub fn transaction_id(signature: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(signature))
}

fn decode_key_bytes(encoded: &str, field: &str) -> Result<[u8; 32], WalletError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded.trim_end_matches('='))
        .map_err(|e| WalletError::InvalidKeyFile(format!("field {}: {}", field, e)))?;
    bytes
        .try_into()
        .map_err(|_| WalletError::InvalidKeyFile(format!("field {} must be 32 bytes", field)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_file_round_trip() {
        let wallet = Wallet::generate();
        let loaded = Wallet::from_json(&wallet.to_json()).unwrap();
        assert_eq!(wallet.address(), loaded.address());
        assert_eq!(wallet.owner(), loaded.owner());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallet.json");

        let wallet = Wallet::generate();
        wallet.save(&path).unwrap();

        let loaded = Wallet::load(&path).unwrap();
        assert_eq!(wallet.address(), loaded.address());
    }

    #[test]
    fn test_missing_key_file() {
        let result = Wallet::load("/nonexistent/wallet.json");
        assert!(matches!(result, Err(WalletError::Read { .. })));
    }

    #[test]
    fn test_rejects_mismatched_public_key() {
        let a = Wallet::generate();
        let b = Wallet::generate();
        let json = format!(
            r#"{{"kty":"OKP","crv":"Ed25519","d":"{}","x":"{}"}}"#,
            URL_SAFE_NO_PAD.encode(a.signing_key.to_bytes()),
            b.owner()
        );
        assert!(matches!(Wallet::from_json(&json), Err(WalletError::KeyMismatch)));
    }

    #[test]
    fn test_rejects_unsupported_key_type() {
        let json = r#"{"kty":"RSA","crv":"","d":"","x":""}"#;
        assert!(matches!(
            Wallet::from_json(json),
            Err(WalletError::InvalidKeyFile(_))
        ));
    }

    #[test]
    fn test_sign_and_verify() {
        let wallet = Wallet::generate();
        let digest = signature_digest(&[b"target", b"100"]);
        let signature = wallet.sign(&digest);

        assert!(verify_signature(&wallet.owner(), &digest, &signature));
        assert!(!verify_signature(&wallet.owner(), b"tampered", &signature));
    }

    #[test]
    fn test_address_is_hash_of_public_key() {
        let wallet = Wallet::generate();
        let public = URL_SAFE_NO_PAD.decode(wallet.owner()).unwrap();
        assert_eq!(wallet.address(), address_from_public_key(&public));
        assert_eq!(wallet.address().len(), 43);
    }

    #[test]
    fn test_digest_is_length_prefixed() {
        assert_ne!(
            signature_digest(&[b"ab", b"c"]),
            signature_digest(&[b"a", b"bc"])
        );
    }
}
