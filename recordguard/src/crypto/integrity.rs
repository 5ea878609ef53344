//! Digest, MAC and key-expansion primitives shared by the cipher key handling
//! and the record stamper. Nothing in here touches record semantics.
//!
//! Digests and tags come back as fixed `[u8; 32]` arrays so key types can hold
//! them without a length check. `legacy_checksum_hex` reproduces the 32-bit
//! rolling hash older claim stamps were written with.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DigestError {
    #[error("hkdf expansion failed: {0}")]
    HkdfFailed(String),
    #[error("hmac failed: {0}")]
    HmacFailed(String),
}

type HmacSha256 = Hmac<Sha256>;

/// Produces a raw SHA-256 digest of the provided bytes.
pub fn sha256_digest(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Returns the lowercase hexadecimal representation of a SHA-256 digest.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256_digest(data))
}

/// Generates an HMAC-SHA256 tag for the provided data.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32], DigestError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| DigestError::HmacFailed(format!("{e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// Derives key material using HKDF-SHA256.
pub fn hkdf_expand(
    input_key_material: &[u8],
    salt: &[u8],
    info: &[u8],
    length: usize,
) -> Result<Vec<u8>, DigestError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), input_key_material);
    let mut okm = vec![0u8; length];
    hk.expand(info, &mut okm)
        .map_err(|e| DigestError::HkdfFailed(format!("{e}")))?;
    Ok(okm)
}

/// The 32-bit rolling checksum that older claim stamps were produced with.
///
/// Runs `h = h * 31 + unit` with 32-bit wraparound over the UTF-16 code units of
/// `text`, takes the absolute value and renders it as 16 zero-padded hex
/// digits. It is neither collision resistant nor one-way; it exists only so
/// historical stamps can still be checked.
pub fn legacy_checksum_hex(text: &str) -> String {
    let mut hash: i32 = 0;
    for unit in text.encode_utf16() {
        hash = hash
            .wrapping_shl(5)
            .wrapping_sub(hash)
            .wrapping_add(i32::from(unit));
    }
    format!("{:016x}", i64::from(hash).unsigned_abs())
}
