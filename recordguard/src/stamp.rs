//! Record stamping: a fingerprint over a record's canonical JSON, computed right
//! after the record is stored and kept beside it for integrity display.
//!
//! Fingerprint values look like `sig_<lowercase hex>`. The algorithm label is
//! stored separately and read back verbatim.
//!
//! Three algorithms are understood:
//!
//! - `Sha256`: plain SHA-256 of the canonical bytes. Tamper-evident against
//!   accidental change, but anyone can recompute it.
//! - `HmacSha256`: keyed with a subkey of the cipher key. Only holders of the
//!   key can produce a matching stamp. Still not non-repudiation.
//! - `LegacyChecksum`: the 32-bit rolling hash older stamps were produced with
//!   (stored under the `SHA-256` label). Accepted by `verify`, never produced.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::crypto::integrity::{hmac_sha256, legacy_checksum_hex, sha256_hex};
use crate::crypto::keys::StampKey;

pub const SIGNATURE_PREFIX: &str = "sig_";

const SHA256_HEX_LEN: usize = 64;
const LEGACY_HEX_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum StampError {
    #[error("record cannot be canonically serialized: {0}")]
    Serialization(String),
    #[error("unknown signing algorithm label")]
    UnknownAlgorithm,
    #[error("stored fingerprint is malformed")]
    MalformedFingerprint,
    #[error("keyed fingerprint requires a stamping key")]
    MissingKey,
    #[error("hmac failed: {0}")]
    Mac(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SigningAlgorithm {
    Sha256,
    HmacSha256,
    LegacyChecksum,
}

impl SigningAlgorithm {
    /// Label persisted next to the fingerprint.
    pub fn label(&self) -> &'static str {
        match self {
            SigningAlgorithm::Sha256 => "SHA-256",
            SigningAlgorithm::HmacSha256 => "HMAC-SHA256",
            // Historical mislabel, kept so old rows round-trip unchanged.
            SigningAlgorithm::LegacyChecksum => "SHA-256",
        }
    }

    pub fn is_collision_resistant(&self) -> bool {
        !matches!(self, SigningAlgorithm::LegacyChecksum)
    }
}

impl FromStr for SigningAlgorithm {
    type Err = StampError;

    /// Parses the configuration spelling. Legacy is not configurable.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(SigningAlgorithm::Sha256),
            "hmac-sha256" | "hmac_sha256" => Ok(SigningAlgorithm::HmacSha256),
            _ => Err(StampError::UnknownAlgorithm),
        }
    }
}

impl fmt::Display for SigningAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A computed or stored stamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFingerprint {
    pub algorithm: SigningAlgorithm,
    pub value: String,
}

impl RecordFingerprint {
    pub fn algorithm_label(&self) -> &'static str {
        self.algorithm.label()
    }

    /// Rebuilds a fingerprint from its stored value and label. A 16-digit
    /// value under the `SHA-256` label is a legacy checksum.
    pub fn from_stored(value: &str, label: &str) -> Result<Self, StampError> {
        let digest = value
            .strip_prefix(SIGNATURE_PREFIX)
            .ok_or(StampError::MalformedFingerprint)?;
        if !digest
            .chars()
            .all(|c| matches!(c, '0'..='9' | 'a'..='f'))
        {
            return Err(StampError::MalformedFingerprint);
        }

        let algorithm = match (label, digest.len()) {
            ("SHA-256", SHA256_HEX_LEN) => SigningAlgorithm::Sha256,
            ("SHA-256", LEGACY_HEX_LEN) => SigningAlgorithm::LegacyChecksum,
            ("HMAC-SHA256", SHA256_HEX_LEN) => SigningAlgorithm::HmacSha256,
            ("SHA-256", _) | ("HMAC-SHA256", _) => return Err(StampError::MalformedFingerprint),
            _ => return Err(StampError::UnknownAlgorithm),
        };

        Ok(Self {
            algorithm,
            value: value.to_string(),
        })
    }
}

impl fmt::Display for RecordFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

/// Result of checking a record against its stored fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    /// Recomputed value matches.
    Intact,
    /// Matches, but only under the legacy 32-bit checksum.
    WeakLegacy,
    /// Record changed after stamping, or the stamp was altered.
    Mismatch,
    /// No fingerprint was stored for the record.
    Absent,
}

/// Computes and checks record fingerprints.
#[derive(Debug)]
pub struct RecordStamper {
    algorithm: SigningAlgorithm,
    key: Option<StampKey>,
}

impl RecordStamper {
    /// Unkeyed SHA-256 stamper.
    pub fn sha256() -> Self {
        tracing::info!(algorithm = SigningAlgorithm::Sha256.label(), "record stamper ready");
        Self {
            algorithm: SigningAlgorithm::Sha256,
            key: None,
        }
    }

    /// Keyed HMAC-SHA256 stamper.
    pub fn hmac_sha256(key: StampKey) -> Self {
        tracing::info!(algorithm = SigningAlgorithm::HmacSha256.label(), "record stamper ready");
        Self {
            algorithm: SigningAlgorithm::HmacSha256,
            key: Some(key),
        }
    }

    pub fn algorithm(&self) -> SigningAlgorithm {
        self.algorithm
    }

    pub fn compute<T>(&self, record: &T) -> Result<RecordFingerprint, StampError>
    where
        T: Serialize + ?Sized,
    {
        let canonical = canonical_string(record)?;
        let value = self.digest(self.algorithm, &canonical)?;
        tracing::debug!(algorithm = self.algorithm.label(), "record stamped");
        Ok(RecordFingerprint {
            algorithm: self.algorithm,
            value,
        })
    }

    /// Checks `record` against whatever algorithm the stored stamp used. A
    /// keyed stamper still checks plain SHA-256 stamps, so existing rows stay
    /// verifiable after switching to HMAC.
    pub fn verify<T>(
        &self,
        record: &T,
        stored: Option<&RecordFingerprint>,
    ) -> Result<Verification, StampError>
    where
        T: Serialize + ?Sized,
    {
        let Some(stored) = stored else {
            return Ok(Verification::Absent);
        };

        let input = match stored.algorithm {
            SigningAlgorithm::LegacyChecksum => legacy_string(record)?,
            _ => canonical_string(record)?,
        };
        let expected = self.digest(stored.algorithm, &input)?;

        let matches: bool = expected.as_bytes().ct_eq(stored.value.as_bytes()).into();
        let outcome = match (matches, stored.algorithm) {
            (true, SigningAlgorithm::LegacyChecksum) => Verification::WeakLegacy,
            (true, _) => Verification::Intact,
            (false, _) => Verification::Mismatch,
        };
        if outcome == Verification::Mismatch {
            tracing::warn!(
                target: "recordguard::security",
                algorithm = stored.algorithm.label(),
                "record fingerprint mismatch"
            );
        }
        Ok(outcome)
    }

    fn digest(&self, algorithm: SigningAlgorithm, canonical: &str) -> Result<String, StampError> {
        let hex = match algorithm {
            SigningAlgorithm::Sha256 => sha256_hex(canonical.as_bytes()),
            SigningAlgorithm::HmacSha256 => {
                let key = self.key.as_ref().ok_or(StampError::MissingKey)?;
                let tag = hmac_sha256(key.as_bytes(), canonical.as_bytes())
                    .map_err(|e| StampError::Mac(format!("{e}")))?;
                hex::encode(tag)
            }
            SigningAlgorithm::LegacyChecksum => legacy_checksum_hex(canonical),
        };
        Ok(format!("{SIGNATURE_PREFIX}{hex}"))
    }
}

/// Serializes any record to canonical JSON: object keys sorted, no
/// whitespace, numbers in serde_json's shortest form.
pub fn canonical_string<T>(record: &T) -> Result<String, StampError>
where
    T: Serialize + ?Sized,
{
    let value =
        serde_json::to_value(record).map_err(|e| StampError::Serialization(format!("{e}")))?;
    canonical_json(&value)
}

pub fn canonical_json(value: &Value) -> Result<String, StampError> {
    match value {
        Value::Null => Ok("null".to_string()),
        Value::Bool(b) => Ok(if *b { "true" } else { "false" }.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        Value::String(s) => json_string(s),
        Value::Array(arr) => {
            let items: Result<Vec<String>, _> = arr.iter().map(canonical_json).collect();
            Ok(format!("[{}]", items?.join(",")))
        }
        Value::Object(obj) => {
            let mut keys: Vec<&String> = obj.keys().collect();
            keys.sort();
            let pairs: Result<Vec<String>, StampError> = keys
                .iter()
                .map(|k| Ok(format!("{}:{}", json_string(k)?, canonical_json(&obj[*k])?)))
                .collect();
            Ok(format!("{{{}}}", pairs?.join(",")))
        }
    }
}

/// Renders a record the way legacy checksums were taken: fields in
/// declaration or insertion order, no whitespace, integral floats without a
/// fractional part and positive exponents written as `e+`.
pub fn legacy_string<T>(record: &T) -> Result<String, StampError>
where
    T: Serialize + ?Sized,
{
    let value =
        serde_json::to_value(record).map_err(|e| StampError::Serialization(format!("{e}")))?;
    legacy_json(&value)
}

fn legacy_json(value: &Value) -> Result<String, StampError> {
    match value {
        Value::Number(n) => Ok(legacy_number(n)),
        Value::Array(arr) => {
            let items: Result<Vec<String>, _> = arr.iter().map(legacy_json).collect();
            Ok(format!("[{}]", items?.join(",")))
        }
        Value::Object(obj) => {
            let pairs: Result<Vec<String>, StampError> = obj
                .iter()
                .map(|(k, v)| Ok(format!("{}:{}", json_string(k)?, legacy_json(v)?)))
                .collect();
            Ok(format!("{{{}}}", pairs?.join(",")))
        }
        other => canonical_json(other),
    }
}

fn legacy_number(n: &Number) -> String {
    let Some(f) = n.as_f64().filter(|_| n.is_f64()) else {
        return n.to_string();
    };
    if f == 0.0 {
        return "0".to_string();
    }
    if f.fract() == 0.0 && f.abs() < 1e21 {
        return format!("{f:.0}");
    }
    let text = n.to_string();
    match text.split_once('e') {
        Some((mantissa, exp)) if !exp.starts_with('-') => format!("{mantissa}e+{exp}"),
        _ => text,
    }
}

fn json_string(s: &str) -> Result<String, StampError> {
    serde_json::to_string(s).map_err(|e| StampError::Serialization(format!("{e}")))
}
