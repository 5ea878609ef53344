//! Record schemas at the boundary between handlers and the protection core.
//!
//! Rows and form input are parsed into these types and validated before any
//! of them reach the cipher or the stamper.

use chrono::{DateTime, NaiveDate, Utc};
use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::crypto::cipher::{CipherError, PayloadCipher};
use crate::stamp::{RecordFingerprint, StampError};

const CLAIM_ID_PREFIX: &str = "CLM";
const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("required field `{0}` is missing")]
    MissingField(&'static str),
    #[error("field `{0}` is not a YYYY-MM-DD date")]
    InvalidDate(&'static str),
    #[error("claim amount must be a finite, non-negative number")]
    InvalidAmount,
    #[error("claim id must look like CLM-YYYY-NNNN")]
    InvalidClaimId,
    #[error("row does not match the expected schema: {0}")]
    Schema(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimStatus {
    Pending,
    Processing,
    Approved,
    Rejected,
}

/// Claim form input as submitted.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewClaim {
    pub patient_id: String,
    pub service_date: String,
    pub service_type: String,
    pub provider_name: String,
    pub claim_amount: String,
    pub insurance_provider: String,
    pub policy_number: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl NewClaim {
    /// Validates the form and builds the row to insert. `id` and
    /// `submitted_date` are normally assigned by the database.
    pub fn into_record(
        self,
        id: Uuid,
        claim_id: String,
        user_id: Uuid,
        submitted_date: Option<DateTime<Utc>>,
    ) -> Result<ClaimRecord, RecordError> {
        let patient_id = required("patient_id", self.patient_id)?;
        let service_date = parse_date("service_date", &self.service_date)?;
        let service_type = required("service_type", self.service_type)?;
        let provider_name = required("provider_name", self.provider_name)?;
        let claim_amount = parse_amount(&self.claim_amount)?;
        let insurance_provider = required("insurance_provider", self.insurance_provider)?;
        let policy_number = required("policy_number", self.policy_number)?;

        let record = ClaimRecord {
            id,
            claim_id,
            patient_id,
            user_id,
            service_date,
            service_type,
            provider_name,
            claim_amount,
            insurance_provider,
            policy_number,
            description: self.description.filter(|d| !d.trim().is_empty()),
            status: ClaimStatus::Pending,
            submitted_date,
            processed_date: None,
        };
        record.validate()?;
        Ok(record)
    }
}

/// A persisted insurance claim. Field order follows the table's columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimRecord {
    pub id: Uuid,
    pub claim_id: String,
    pub patient_id: String,
    pub user_id: Uuid,
    pub service_date: NaiveDate,
    pub service_type: String,
    pub provider_name: String,
    pub claim_amount: f64,
    pub insurance_provider: String,
    pub policy_number: String,
    pub description: Option<String>,
    pub status: ClaimStatus,
    pub submitted_date: Option<DateTime<Utc>>,
    pub processed_date: Option<DateTime<Utc>>,
}

impl ClaimRecord {
    /// Parses a row returned by the database and validates it.
    pub fn from_row(row: serde_json::Value) -> Result<Self, RecordError> {
        let record: ClaimRecord =
            serde_json::from_value(row).map_err(|e| RecordError::Schema(format!("{e}")))?;
        record.validate()?;
        Ok(record)
    }

    pub fn validate(&self) -> Result<(), RecordError> {
        if !is_valid_claim_id(&self.claim_id) {
            return Err(RecordError::InvalidClaimId);
        }
        if !self.claim_amount.is_finite() || self.claim_amount < 0.0 {
            return Err(RecordError::InvalidAmount);
        }
        for (name, value) in [
            ("patient_id", &self.patient_id),
            ("service_type", &self.service_type),
            ("provider_name", &self.provider_name),
            ("insurance_provider", &self.insurance_provider),
            ("policy_number", &self.policy_number),
        ] {
            if value.trim().is_empty() {
                return Err(RecordError::MissingField(name));
            }
        }
        Ok(())
    }
}

/// `CLM-<year>-<four random digits>`.
pub fn generate_claim_id(year: i32) -> String {
    let serial: u32 = OsRng.gen_range(0..10_000);
    format!("{CLAIM_ID_PREFIX}-{year}-{serial:04}")
}

pub fn is_valid_claim_id(claim_id: &str) -> bool {
    let mut parts = claim_id.split('-');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(CLAIM_ID_PREFIX), Some(year), Some(serial), None) => {
            year.len() == 4
                && serial.len() == 4
                && year.bytes().all(|b| b.is_ascii_digit())
                && serial.bytes().all(|b| b.is_ascii_digit())
        }
        _ => false,
    }
}

/// Accepts amounts typed as `1250`, `1,250.00` or `$1,250.00`.
pub fn parse_amount(text: &str) -> Result<f64, RecordError> {
    let cleaned: String = text
        .chars()
        .filter(|c| *c != '$' && *c != ',' && !c.is_whitespace())
        .collect();
    if cleaned.is_empty() {
        return Err(RecordError::MissingField("claim_amount"));
    }
    let amount: f64 = cleaned.parse().map_err(|_| RecordError::InvalidAmount)?;
    if !amount.is_finite() || amount < 0.0 {
        return Err(RecordError::InvalidAmount);
    }
    Ok(amount)
}

/// A stored stamp row, bound to its claim by `claim_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSignature {
    pub claim_id: Uuid,
    pub signature_data: String,
    pub signing_algorithm: String,
    #[serde(default)]
    pub signed_at: Option<DateTime<Utc>>,
}

impl StoredSignature {
    pub fn new(claim_id: Uuid, fingerprint: &RecordFingerprint) -> Self {
        Self {
            claim_id,
            signature_data: fingerprint.value.clone(),
            signing_algorithm: fingerprint.algorithm_label().to_string(),
            signed_at: None,
        }
    }

    pub fn fingerprint(&self) -> Result<RecordFingerprint, StampError> {
        RecordFingerprint::from_stored(&self.signature_data, &self.signing_algorithm)
    }
}

/// What the claim detail view shows for the stamp. Values are shown as
/// stored; nothing is recomputed on the read path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignatureDisplay {
    pub signature_id: String,
    pub signature_algorithm: String,
    pub signature_date: Option<DateTime<Utc>>,
}

impl From<Option<&StoredSignature>> for SignatureDisplay {
    fn from(stored: Option<&StoredSignature>) -> Self {
        match stored {
            Some(sig) => Self {
                signature_id: sig.signature_data.clone(),
                signature_algorithm: sig.signing_algorithm.clone(),
                signature_date: sig.signed_at,
            },
            None => Self {
                signature_id: "No signature found".to_string(),
                signature_algorithm: "N/A".to_string(),
                signature_date: None,
            },
        }
    }
}

/// Medical record input with its plaintext payload.
#[derive(Debug, Clone, Deserialize)]
pub struct NewMedicalRecord {
    pub patient_id: Uuid,
    pub doctor_id: Uuid,
    pub visit_date: String,
    pub plain_text_data: String,
}

impl NewMedicalRecord {
    /// Encrypts the payload and returns the two rows to insert. The plaintext
    /// goes no further than the cipher.
    pub fn seal(self, cipher: &PayloadCipher) -> Result<(MedicalRecord, EncryptedData), SealError> {
        let visit_date = parse_date("visit_date", &self.visit_date)?;
        let data = cipher.encrypt(&self.plain_text_data)?;

        let encrypted = EncryptedData {
            id: Uuid::new_v4(),
            data,
        };
        let record = MedicalRecord {
            id: Uuid::new_v4(),
            patient_id: self.patient_id,
            doctor_id: self.doctor_id,
            visit_date,
            encrypted_data_id: encrypted.id,
        };
        Ok((record, encrypted))
    }
}

#[derive(Debug, Error)]
pub enum SealError {
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error(transparent)]
    Cipher(#[from] CipherError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MedicalRecord {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub doctor_id: Uuid,
    pub visit_date: NaiveDate,
    pub encrypted_data_id: Uuid,
}

/// Row holding an `iv:ciphertext` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedData {
    pub id: Uuid,
    pub data: String,
}

/// Read-path outcome for a payload. A payload that fails to decrypt is never
/// shown in part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PayloadView {
    Readable { text: String },
    Unreadable { security_event: bool },
}

impl PayloadView {
    pub fn open(cipher: &PayloadCipher, encrypted: &EncryptedData) -> Self {
        match cipher.decrypt(&encrypted.data) {
            Ok(text) => PayloadView::Readable { text },
            Err(err) => {
                tracing::error!(
                    encrypted_data_id = %encrypted.id,
                    security_event = err.is_security_event(),
                    error = %err,
                    "medical record payload unreadable"
                );
                PayloadView::Unreadable {
                    security_event: err.is_security_event(),
                }
            }
        }
    }
}

/// A medical record joined with its opened payload, as returned to readers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecryptedMedicalRecord {
    #[serde(flatten)]
    pub record: MedicalRecord,
    pub decrypted_data: PayloadView,
}

impl DecryptedMedicalRecord {
    pub fn open(cipher: &PayloadCipher, record: MedicalRecord, encrypted: &EncryptedData) -> Self {
        Self {
            decrypted_data: PayloadView::open(cipher, encrypted),
            record,
        }
    }
}

fn required(name: &'static str, value: String) -> Result<String, RecordError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(RecordError::MissingField(name));
    }
    Ok(trimmed.to_string())
}

fn parse_date(name: &'static str, value: &str) -> Result<NaiveDate, RecordError> {
    if value.trim().is_empty() {
        return Err(RecordError::MissingField(name));
    }
    NaiveDate::parse_from_str(value.trim(), DATE_FORMAT).map_err(|_| RecordError::InvalidDate(name))
}
