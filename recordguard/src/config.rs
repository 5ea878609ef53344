//! Configuration for the protection core. Configuration names where key
//! material lives (environment variables, key files) but never holds it, and
//! builds the cipher and stamper once at startup.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::crypto::cipher::PayloadCipher;
use crate::crypto::keys::{decode_base64, DerivedKey, KeyError};
use crate::stamp::{RecordStamper, SigningAlgorithm};

pub const ENV_SECRET: &str = "ENCRYPTION_SECRET";
pub const ENV_KEY_B64: &str = "ENCRYPTION_KEY_B64";
pub const ENV_KDF: &str = "ENCRYPTION_KDF";
pub const ENV_SALT_B64: &str = "ENCRYPTION_SALT_B64";
pub const ENV_STAMP_ALGORITHM: &str = "STAMP_ALGORITHM";
pub const ENV_LOG: &str = "RECORDGUARD_LOG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file unreadable: {0}")]
    Io(String),
    #[error("config parse failed: {0}")]
    Parse(String),
    #[error("key error: {0}")]
    Key(#[from] KeyError),
    #[error("no usable key source configured")]
    MissingKeySource,
    #[error("argon2id key derivation needs a salt")]
    MissingSalt,
    #[error("unknown key derivation `{0}`; expected sha256 or argon2id")]
    UnknownKdf(String),
    #[error("unsupported stamp algorithm `{0}`; expected sha256 or hmac-sha256")]
    UnknownStampAlgorithm(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyDerivation {
    #[default]
    Sha256,
    Argon2id,
}

impl KeyDerivation {
    fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(KeyDerivation::Sha256),
            "argon2id" => Ok(KeyDerivation::Argon2id),
            other => Err(ConfigError::UnknownKdf(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CipherConfig {
    /// Environment variable holding the passphrase the key is derived from.
    pub secret_env: Option<String>,
    /// Environment variable holding a base64-encoded 32 byte key.
    pub key_env: Option<String>,
    /// Path to a file that contains the base64-encoded key.
    pub key_path: Option<PathBuf>,
    #[serde(default)]
    pub kdf: KeyDerivation,
    /// Base64-encoded salt, only used with argon2id.
    pub salt_b64: Option<String>,
}

impl CipherConfig {
    /// Raw keys win over passphrases; a passphrase goes through the
    /// configured derivation.
    pub fn build_key(&self) -> Result<DerivedKey, ConfigError> {
        if let Some(var) = &self.key_env {
            return Ok(DerivedKey::from_env_base64(var)?);
        }
        if let Some(path) = &self.key_path {
            return Ok(DerivedKey::from_key_file(path)?);
        }
        let Some(var) = &self.secret_env else {
            return Err(ConfigError::MissingKeySource);
        };
        match self.kdf {
            KeyDerivation::Sha256 => Ok(DerivedKey::from_env_secret(var)?),
            KeyDerivation::Argon2id => {
                let salt_b64 = self.salt_b64.as_deref().ok_or(ConfigError::MissingSalt)?;
                let salt = decode_base64(salt_b64)?;
                Ok(DerivedKey::from_env_secret_argon2id(var, &salt)?)
            }
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StamperConfig {
    /// `sha256` (default) or `hmac-sha256`.
    pub algorithm: Option<String>,
}

impl StamperConfig {
    pub fn algorithm(&self) -> Result<SigningAlgorithm, ConfigError> {
        match self.algorithm.as_deref() {
            None => Ok(SigningAlgorithm::Sha256),
            Some(name) => name
                .parse()
                .map_err(|_| ConfigError::UnknownStampAlgorithm(name.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub cipher: CipherConfig,
    #[serde(default)]
    pub stamper: StamperConfig,
    #[serde(rename = "logLevel")]
    pub log_level: Option<String>,
}

impl CoreConfig {
    /// Reads the standard environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as `from_env` with an injectable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let kdf = match lookup(ENV_KDF) {
            Some(value) => KeyDerivation::parse(&value)?,
            None => KeyDerivation::default(),
        };
        let cipher = CipherConfig {
            secret_env: Some(ENV_SECRET.to_string()),
            key_env: lookup(ENV_KEY_B64).map(|_| ENV_KEY_B64.to_string()),
            key_path: None,
            kdf,
            salt_b64: lookup(ENV_SALT_B64),
        };
        Ok(Self {
            cipher,
            stamper: StamperConfig {
                algorithm: lookup(ENV_STAMP_ALGORITHM),
            },
            log_level: lookup(ENV_LOG),
        })
    }

    /// Log directives: the `RECORDGUARD_LOG` value wins, then `logLevel`,
    /// then `info`.
    pub fn log_directives(&self, env_override: Option<String>) -> String {
        env_override
            .or_else(|| self.log_level.clone())
            .unwrap_or_else(|| "info".to_string())
    }

    /// Derives the key once and builds the shared cipher and stamper.
    pub fn build(&self) -> Result<ProtectionCore, ConfigError> {
        let algorithm = self.stamper.algorithm()?;
        let key = self.cipher.build_key()?;
        let stamper = match algorithm {
            SigningAlgorithm::HmacSha256 => RecordStamper::hmac_sha256(key.stamping_subkey()?),
            _ => RecordStamper::sha256(),
        };
        Ok(ProtectionCore {
            cipher: PayloadCipher::new(key),
            stamper,
        })
    }
}

/// The cipher and stamper handlers receive, built once per process.
pub struct ProtectionCore {
    pub cipher: PayloadCipher,
    pub stamper: RecordStamper,
}

impl fmt::Debug for ProtectionCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtectionCore")
            .field("cipher", &"AES-256-CBC")
            .field("stamper", &self.stamper.algorithm().label())
            .finish()
    }
}

/// Loads the JSON configuration file.
pub fn load_config(path: impl AsRef<Path>) -> Result<CoreConfig, ConfigError> {
    let raw_json = fs::read_to_string(&path).map_err(|e| ConfigError::Io(format!("{e}")))?;
    serde_json::from_str(&raw_json).map_err(|e| ConfigError::Parse(format!("{e}")))
}
