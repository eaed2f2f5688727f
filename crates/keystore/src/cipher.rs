use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha2::{Digest, Sha256};
use snafu::OptionExt;

use super::error::{
    CipherFailureSnafu, InvalidStoredValueSnafu, KeystoreError, KeystoreResult,
};
use super::types::ENCRYPTED_VALUE_PREFIX;

/// Environment variable holding the symmetric master key.
pub const MASTER_KEY_ENV: &str = "MURMUR_MASTER_KEY";

const NONCE_LENGTH_BYTES: usize = 12;

/// Opaque encrypt/decrypt collaborator for key values at rest.
///
/// The store only depends on this seam; which cipher sits behind it is a
/// deployment decision.
pub trait KeyCipher: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> KeystoreResult<String>;
    fn decrypt(&self, stored: &str) -> KeystoreResult<String>;
}

/// AES-256-GCM cipher keyed by SHA-256 of the configured master key.
///
/// Stored form: `enc:v1:` + base64(nonce || ciphertext). The random 96-bit
/// nonce travels with the value, so no nonce state is kept anywhere.
pub struct MasterKeyCipher {
    cipher: Aes256Gcm,
}

impl MasterKeyCipher {
    pub fn new(master_key: &str) -> Self {
        let digest = Sha256::digest(master_key.as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(&digest);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    /// Reads the master key from the environment.
    ///
    /// `None` disables encryption: values are then stored and returned as
    /// plaintext, which keeps the layer usable on unconfigured instances.
    pub fn from_env() -> Option<Self> {
        let master_key = std::env::var(MASTER_KEY_ENV)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        match master_key {
            Some(master_key) => Some(Self::new(&master_key)),
            None => {
                tracing::info!(
                    "{MASTER_KEY_ENV} is not set, key values will be stored as plaintext"
                );
                None
            }
        }
    }
}

impl KeyCipher for MasterKeyCipher {
    fn encrypt(&self, plaintext: &str) -> KeystoreResult<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext =
            self.cipher
                .encrypt(&nonce, plaintext.as_bytes())
                .map_err(|_| KeystoreError::CipherFailure {
                    stage: "cipher-encrypt",
                    details: "AES-GCM encryption failed".to_string(),
                })?;

        let mut payload = Vec::with_capacity(NONCE_LENGTH_BYTES + ciphertext.len());
        payload.extend_from_slice(nonce.as_slice());
        payload.extend_from_slice(&ciphertext);

        Ok(format!("{ENCRYPTED_VALUE_PREFIX}{}", BASE64.encode(payload)))
    }

    fn decrypt(&self, stored: &str) -> KeystoreResult<String> {
        let encoded = stored
            .strip_prefix(ENCRYPTED_VALUE_PREFIX)
            .context(InvalidStoredValueSnafu {
                stage: "cipher-decrypt-prefix",
                details: "value does not carry the encrypted prefix",
            })?;

        let payload =
            BASE64
                .decode(encoded)
                .map_err(|error| KeystoreError::InvalidStoredValue {
                    stage: "cipher-decrypt-base64",
                    details: error.to_string(),
                })?;

        if payload.len() <= NONCE_LENGTH_BYTES {
            return InvalidStoredValueSnafu {
                stage: "cipher-decrypt-length",
                details: "payload shorter than nonce plus tag",
            }
            .fail();
        }

        let (nonce, ciphertext) = payload.split_at(NONCE_LENGTH_BYTES);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CipherFailureSnafu {
                stage: "cipher-decrypt",
                details: "AES-GCM rejected the value; wrong master key or corrupted data",
            }
            .build())?;

        String::from_utf8(plaintext).map_err(|error| KeystoreError::InvalidStoredValue {
            stage: "cipher-decrypt-utf8",
            details: error.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let cipher = MasterKeyCipher::new("correct horse battery staple");

        let stored = cipher.encrypt("sk-live-1234").expect("encrypt");
        assert!(stored.starts_with(ENCRYPTED_VALUE_PREFIX));
        assert_ne!(stored, "sk-live-1234");

        let plaintext = cipher.decrypt(&stored).expect("decrypt");
        assert_eq!(plaintext, "sk-live-1234");
    }

    #[test]
    fn each_encryption_uses_a_fresh_nonce() {
        let cipher = MasterKeyCipher::new("master");

        let first = cipher.encrypt("same value").expect("encrypt");
        let second = cipher.encrypt("same value").expect("encrypt");

        assert_ne!(first, second);
    }

    #[test]
    fn wrong_master_key_fails_to_decrypt() {
        let writer = MasterKeyCipher::new("master-a");
        let reader = MasterKeyCipher::new("master-b");

        let stored = writer.encrypt("sk-live-1234").expect("encrypt");
        let error = reader.decrypt(&stored).expect_err("wrong key must fail");

        assert!(matches!(error, KeystoreError::CipherFailure { .. }));
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let cipher = MasterKeyCipher::new("master");
        let stored = cipher.encrypt("sk-live-1234").expect("encrypt");

        let mut tampered = stored.into_bytes();
        let last = tampered.len() - 1;
        tampered[last] = if tampered[last] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(tampered).expect("ascii payload");

        assert!(cipher.decrypt(&tampered).is_err());
    }

    #[test]
    fn plaintext_value_is_rejected_by_decrypt() {
        let cipher = MasterKeyCipher::new("master");

        let error = cipher
            .decrypt("sk-live-plaintext")
            .expect_err("missing prefix must fail");

        assert!(matches!(error, KeystoreError::InvalidStoredValue { .. }));
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let cipher = MasterKeyCipher::new("master");

        let stored = format!("{ENCRYPTED_VALUE_PREFIX}{}", BASE64.encode([0_u8; 8]));
        let error = cipher.decrypt(&stored).expect_err("short payload must fail");

        assert!(matches!(error, KeystoreError::InvalidStoredValue { .. }));
    }
}
