//! Protection core for confidential medical and claim records: a payload
//! cipher for free-text record content at rest, and a record stamper that
//! fingerprints claims when they are created.
//!
//! Both are built once from configuration (see [`config::CoreConfig::build`])
//! and shared by reference; neither holds mutable state.

pub mod config;
pub mod crypto;
pub mod records;
pub mod stamp;

pub use config::{load_config, ConfigError, CoreConfig, ProtectionCore};
pub use crypto::cipher::{CipherError, EncryptedBlob, IntegrityFailure, PayloadCipher};
pub use crypto::keys::{DerivedKey, KeyError};
pub use stamp::{RecordFingerprint, RecordStamper, SigningAlgorithm, StampError, Verification};
