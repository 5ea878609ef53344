//! Key material for the payload cipher and the keyed record stamper.
//!
//! A `DerivedKey` is produced once from a long-term secret held in process
//! configuration and then only lent to the cipher. It never leaves the crate,
//! never shows up in `Debug` output and is zeroed when dropped.

use std::fmt;
use std::fs;
use std::path::Path;

use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine};
use thiserror::Error;
use zeroize::Zeroize;

use crate::crypto::integrity::{hkdf_expand, sha256_digest};

/// AES-256 key length in bytes.
pub const KEY_LEN: usize = 32;

/// Argon2id needs at least this much salt.
pub const MIN_SALT_LEN: usize = 8;

const ARGON2_MEMORY_KIB: u32 = 19 * 1024;
const ARGON2_TIME_COST: u32 = 3;
const ARGON2_PARALLELISM: u32 = 1;

const STAMP_SUBKEY_SALT: &[u8] = b"recordguard";
const STAMP_SUBKEY_INFO: &[u8] = b"recordguard:stamp:v1";

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("encryption secret is not configured (expected in {0})")]
    MissingSecret(String),
    #[error("encryption secret is empty")]
    EmptySecret,
    #[error("invalid key length; expected {expected} bytes, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },
    #[error("salt too short; expected at least 8 bytes")]
    SaltTooShort,
    #[error("key derivation failed: {0}")]
    DerivationFailed(String),
    #[error("key source unreadable: {0}")]
    KeySourceUnreadable(String),
    #[error("key material is not valid base64")]
    Base64DecodeFailed,
}

/// Symmetric key used by the payload cipher.
pub struct DerivedKey {
    bytes: [u8; KEY_LEN],
}

impl DerivedKey {
    /// Hashes the secret with SHA-256. Every record stored so far was written
    /// under a key derived this way, so it has to stay byte-for-byte stable.
    pub fn from_secret(secret: &str) -> Result<Self, KeyError> {
        if secret.is_empty() {
            return Err(KeyError::EmptySecret);
        }
        Ok(Self {
            bytes: sha256_digest(secret.as_bytes()),
        })
    }

    /// Memory-hard derivation for deployments that start without legacy data.
    /// Deterministic for a given salt; the salt must be kept with the
    /// deployment configuration or nothing stored under it can be read back.
    pub fn from_secret_argon2id(secret: &str, salt: &[u8]) -> Result<Self, KeyError> {
        if secret.is_empty() {
            return Err(KeyError::EmptySecret);
        }
        if salt.len() < MIN_SALT_LEN {
            return Err(KeyError::SaltTooShort);
        }
        let params = Params::new(
            ARGON2_MEMORY_KIB,
            ARGON2_TIME_COST,
            ARGON2_PARALLELISM,
            Some(KEY_LEN),
        )
        .map_err(|e| KeyError::DerivationFailed(format!("{e}")))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut output = [0u8; KEY_LEN];
        argon2
            .hash_password_into(secret.as_bytes(), salt, &mut output)
            .map_err(|e| KeyError::DerivationFailed(format!("{e}")))?;

        let key = Self::from_key_bytes(&output)?;
        output.zeroize();
        Ok(key)
    }

    /// Builds a key from raw bytes. The key must be exactly 32 bytes.
    pub fn from_key_bytes(key_bytes: &[u8]) -> Result<Self, KeyError> {
        if key_bytes.len() != KEY_LEN {
            return Err(KeyError::InvalidKeyLength {
                expected: KEY_LEN,
                got: key_bytes.len(),
            });
        }
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(key_bytes);
        Ok(Self { bytes })
    }

    /// Reads the passphrase from an environment variable and hashes it.
    pub fn from_env_secret(var: &str) -> Result<Self, KeyError> {
        let mut secret = read_env(var)?;
        let key = Self::from_secret(&secret);
        secret.zeroize();
        key
    }

    /// Reads the passphrase from an environment variable and runs Argon2id.
    pub fn from_env_secret_argon2id(var: &str, salt: &[u8]) -> Result<Self, KeyError> {
        let mut secret = read_env(var)?;
        let key = Self::from_secret_argon2id(&secret, salt);
        secret.zeroize();
        key
    }

    /// Reads a base64-encoded raw key from an environment variable.
    pub fn from_env_base64(var: &str) -> Result<Self, KeyError> {
        let mut encoded = read_env(var)?;
        let key = Self::from_base64(encoded.trim());
        encoded.zeroize();
        key
    }

    /// Reads a base64-encoded raw key from disk.
    pub fn from_key_file(path: &Path) -> Result<Self, KeyError> {
        let mut content =
            fs::read_to_string(path).map_err(|e| KeyError::KeySourceUnreadable(format!("{e}")))?;
        let key = Self::from_base64(content.trim());
        content.zeroize();
        key
    }

    fn from_base64(encoded: &str) -> Result<Self, KeyError> {
        let mut decoded = decode_base64(encoded)?;
        let key = Self::from_key_bytes(&decoded);
        decoded.zeroize();
        key
    }

    /// Separate key for HMAC stamping so the cipher key is never used as a
    /// MAC key directly.
    pub fn stamping_subkey(&self) -> Result<StampKey, KeyError> {
        let mut okm = hkdf_expand(&self.bytes, STAMP_SUBKEY_SALT, STAMP_SUBKEY_INFO, KEY_LEN)
            .map_err(|e| KeyError::DerivationFailed(format!("{e}")))?;
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(&okm);
        okm.zeroize();
        Ok(StampKey { bytes })
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DerivedKey([REDACTED])")
    }
}

impl Drop for DerivedKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

/// HMAC key for keyed record fingerprints.
pub struct StampKey {
    bytes: [u8; KEY_LEN],
}

impl StampKey {
    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl fmt::Debug for StampKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StampKey([REDACTED])")
    }
}

impl Drop for StampKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

/// Accepts base64 with or without padding; operators paste both.
pub(crate) fn decode_base64(encoded: &str) -> Result<Vec<u8>, KeyError> {
    STANDARD_NO_PAD
        .decode(encoded.trim().trim_end_matches('=').as_bytes())
        .map_err(|_| KeyError::Base64DecodeFailed)
}

fn read_env(var: &str) -> Result<String, KeyError> {
    match std::env::var(var) {
        Ok(value) => Ok(value),
        Err(std::env::VarError::NotPresent) => Err(KeyError::MissingSecret(var.to_string())),
        // NotUnicode carries the raw value; only the variable name goes out.
        Err(std::env::VarError::NotUnicode(_)) => Err(KeyError::KeySourceUnreadable(format!(
            "{var}: not valid unicode"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::{DerivedKey, KeyError, KEY_LEN};
    use base64::{engine::general_purpose::STANDARD, Engine};
    use std::fs;
    use tempfile::NamedTempFile;

    #[test]
    fn same_secret_derives_same_key() {
        let a = DerivedKey::from_secret("test-secret").expect("derivation should succeed");
        let b = DerivedKey::from_secret("test-secret").expect("derivation should succeed");
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn sha256_derivation_matches_digest() {
        let key = DerivedKey::from_secret("abc").expect("derivation should succeed");
        assert_eq!(
            hex::encode(key.as_bytes()),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn different_secrets_derive_different_keys() {
        let a = DerivedKey::from_secret("secret-a").unwrap();
        let b = DerivedKey::from_secret("secret-b").unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn rejects_empty_secret() {
        assert!(matches!(DerivedKey::from_secret(""), Err(KeyError::EmptySecret)));
    }

    #[test]
    fn rejects_bad_key_lengths() {
        let err = DerivedKey::from_key_bytes(&[1u8; 16]).unwrap_err();
        assert!(matches!(
            err,
            KeyError::InvalidKeyLength {
                expected: KEY_LEN,
                got: 16
            }
        ));
    }

    #[test]
    fn argon2id_is_deterministic_per_salt() {
        let salt = b"static-test-salt-123";
        let a = DerivedKey::from_secret_argon2id("pa55phrase", salt).unwrap();
        let b = DerivedKey::from_secret_argon2id("pa55phrase", salt).unwrap();
        let c = DerivedKey::from_secret_argon2id("pa55phrase", b"another-salt-456").unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), c.as_bytes());
    }

    #[test]
    fn argon2id_rejects_short_salt() {
        let err = DerivedKey::from_secret_argon2id("pa55phrase", b"short").unwrap_err();
        assert!(matches!(err, KeyError::SaltTooShort));
    }

    #[test]
    fn reads_secret_from_env() {
        std::env::set_var("RECORDGUARD_TEST_KEYS_SECRET", "test-secret");
        let from_env = DerivedKey::from_env_secret("RECORDGUARD_TEST_KEYS_SECRET").unwrap();
        let direct = DerivedKey::from_secret("test-secret").unwrap();
        assert_eq!(from_env.as_bytes(), direct.as_bytes());
    }

    #[test]
    fn missing_env_var_names_the_variable() {
        let err = DerivedKey::from_env_secret("RECORDGUARD_TEST_KEYS_UNSET").unwrap_err();
        assert!(format!("{err}").contains("RECORDGUARD_TEST_KEYS_UNSET"));
    }

    #[cfg(unix)]
    #[test]
    fn non_unicode_secret_is_not_echoed() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let var = "RECORDGUARD_TEST_KEYS_NON_UNICODE";
        std::env::set_var(var, OsStr::from_bytes(b"hunter2-topsecret\xff"));
        let err = DerivedKey::from_env_secret(var).unwrap_err();
        let msg = format!("{err}");
        assert!(matches!(err, KeyError::KeySourceUnreadable(_)));
        assert!(msg.contains(var));
        assert!(!msg.contains("hunter2"));
        assert!(!msg.contains("topsecret"));
    }

    #[test]
    fn reads_base64_key_file() {
        let raw = [9u8; KEY_LEN];
        let file = NamedTempFile::new().expect("temp file");
        fs::write(file.path(), format!("{}\n", STANDARD.encode(raw))).unwrap();
        let key = DerivedKey::from_key_file(file.path()).expect("key file should load");
        assert_eq!(key.as_bytes(), &raw);
    }

    #[test]
    fn base64_errors_do_not_echo_input() {
        std::env::set_var("RECORDGUARD_TEST_KEYS_B64", "not*base64*key");
        let err = DerivedKey::from_env_base64("RECORDGUARD_TEST_KEYS_B64").unwrap_err();
        assert!(matches!(err, KeyError::Base64DecodeFailed));
        assert!(!format!("{err}").contains("not*base64"));
    }

    #[test]
    fn debug_is_redacted() {
        let key = DerivedKey::from_key_bytes(&[0xAB; KEY_LEN]).unwrap();
        let out = format!("{key:?}");
        assert!(out.contains("REDACTED"));
        assert!(!out.contains("171"));
        assert!(!out.to_lowercase().contains("ab, ab"));
    }

    #[test]
    fn stamping_subkey_differs_from_cipher_key() {
        let key = DerivedKey::from_secret("test-secret").unwrap();
        let sub = key.stamping_subkey().unwrap();
        let again = key.stamping_subkey().unwrap();
        assert_ne!(sub.as_bytes(), key.as_bytes());
        assert_eq!(sub.as_bytes(), again.as_bytes());
    }
}
