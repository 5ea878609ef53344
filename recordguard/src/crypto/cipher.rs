//! Payload cipher for free-text record content at rest.
//!
//! Stored format (a durable contract, do not change without a version tag):
//!
//! ```text
//! <iv hex, 32 chars>:<AES-256-CBC + PKCS#7 ciphertext hex>
//! ```
//!
//! A fresh 16-byte IV is drawn from the OS RNG for every call to `encrypt`.

use std::fmt;
use std::str::FromStr;

use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroize;

use crate::crypto::keys::{DerivedKey, KeyError};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// CBC IV length, equal to the AES block size.
pub const IV_LEN: usize = 16;
const BLOCK_LEN: usize = 16;
const DELIMITER: char = ':';

/// Why a structurally valid blob failed to open. Carries no data from the blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityFailure {
    Padding,
    Utf8,
}

impl fmt::Display for IntegrityFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityFailure::Padding => f.write_str("invalid padding"),
            IntegrityFailure::Utf8 => f.write_str("plaintext is not valid UTF-8"),
        }
    }
}

/// Cipher failures. Messages never carry key, IV or ciphertext content.
#[derive(Debug, Error)]
pub enum CipherError {
    #[error("cipher configuration error: {0}")]
    Configuration(#[from] KeyError),
    #[error("malformed encrypted payload: {0}")]
    MalformedInput(&'static str),
    #[error("encrypted payload failed integrity checks ({0})")]
    Integrity(IntegrityFailure),
}

impl CipherError {
    /// True for failures that may indicate tampering, a wrong key or corrupted
    /// storage. Callers should alert on these rather than treat them as
    /// ordinary errors.
    pub fn is_security_event(&self) -> bool {
        matches!(self, CipherError::Integrity(_))
    }
}

/// Persisted form of an encrypted payload.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptedBlob {
    iv: [u8; IV_LEN],
    ciphertext: Vec<u8>,
}

impl EncryptedBlob {
    pub fn iv(&self) -> &[u8; IV_LEN] {
        &self.iv
    }

    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }
}

impl fmt::Display for EncryptedBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{DELIMITER}{}",
            hex::encode(self.iv),
            hex::encode(&self.ciphertext)
        )
    }
}

// Blobs end up in error reports and logs; keep their bytes out.
impl fmt::Debug for EncryptedBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedBlob")
            .field("ciphertext_len", &self.ciphertext.len())
            .finish()
    }
}

impl FromStr for EncryptedBlob {
    type Err = CipherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (iv_hex, ciphertext_hex) = s
            .split_once(DELIMITER)
            .ok_or(CipherError::MalformedInput("missing ':' delimiter"))?;

        let iv_bytes = hex::decode(iv_hex)
            .map_err(|_| CipherError::MalformedInput("iv is not valid hex"))?;
        let iv: [u8; IV_LEN] = iv_bytes
            .try_into()
            .map_err(|_| CipherError::MalformedInput("iv has the wrong length"))?;

        let ciphertext = hex::decode(ciphertext_hex)
            .map_err(|_| CipherError::MalformedInput("ciphertext is not valid hex"))?;
        if ciphertext.is_empty() || ciphertext.len() % BLOCK_LEN != 0 {
            return Err(CipherError::MalformedInput(
                "ciphertext is not a whole number of blocks",
            ));
        }

        Ok(Self { iv, ciphertext })
    }
}

/// Reversible confidentiality transform for record payloads. Build one at
/// startup and share it; it holds only the read-only key.
#[derive(Debug)]
pub struct PayloadCipher {
    key: DerivedKey,
}

impl PayloadCipher {
    pub fn new(key: DerivedKey) -> Self {
        tracing::info!(cipher = "AES-256-CBC", "payload cipher ready");
        Self { key }
    }

    /// Convenience for the common deployment: key hashed from a secret.
    pub fn from_secret(secret: &str) -> Result<Self, CipherError> {
        Ok(Self::new(DerivedKey::from_secret(secret)?))
    }

    /// Encrypts `plaintext` under a fresh random IV.
    pub fn seal(&self, plaintext: &str) -> Result<EncryptedBlob, CipherError> {
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let ciphertext = Aes256CbcEnc::new_from_slices(self.key.as_bytes(), &iv)
            .map_err(|_| {
                CipherError::Configuration(KeyError::InvalidKeyLength {
                    expected: crate::crypto::keys::KEY_LEN,
                    got: self.key.as_bytes().len(),
                })
            })?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

        tracing::debug!(ciphertext_len = ciphertext.len(), "payload sealed");
        Ok(EncryptedBlob { iv, ciphertext })
    }

    /// Decrypts a parsed blob back to text.
    pub fn open(&self, blob: &EncryptedBlob) -> Result<String, CipherError> {
        let decryptor = Aes256CbcDec::new_from_slices(self.key.as_bytes(), &blob.iv)
            .map_err(|_| CipherError::MalformedInput("iv has the wrong length"))?;

        let plaintext = match decryptor.decrypt_padded_vec_mut::<Pkcs7>(&blob.ciphertext) {
            Ok(bytes) => bytes,
            Err(_) => return Err(integrity_failure(IntegrityFailure::Padding)),
        };

        match String::from_utf8(plaintext) {
            Ok(text) => Ok(text),
            Err(err) => {
                err.into_bytes().zeroize();
                Err(integrity_failure(IntegrityFailure::Utf8))
            }
        }
    }

    /// Encrypts `plaintext` and renders the stored `iv:ciphertext` string.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        Ok(self.seal(plaintext)?.to_string())
    }

    /// Parses a stored `iv:ciphertext` string and decrypts it.
    pub fn decrypt(&self, blob: &str) -> Result<String, CipherError> {
        let parsed: EncryptedBlob = blob.parse()?;
        self.open(&parsed)
    }
}

fn integrity_failure(reason: IntegrityFailure) -> CipherError {
    tracing::warn!(
        target: "recordguard::security",
        %reason,
        "encrypted payload failed integrity checks"
    );
    CipherError::Integrity(reason)
}

#[cfg(test)]
mod tests {
    use super::{CipherError, EncryptedBlob, IntegrityFailure, PayloadCipher};
    use crate::crypto::keys::DerivedKey;
    use std::collections::HashSet;

    fn cipher() -> PayloadCipher {
        PayloadCipher::from_secret("test-secret").expect("valid secret")
    }

    fn is_lower_hex(s: &str) -> bool {
        !s.is_empty() && s.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'))
    }

    #[test]
    fn round_trips_assorted_plaintexts() {
        let cipher = cipher();
        let long = "long payload ".repeat(200);
        let samples = [
            "",
            "a",
            "exactly sixteen!",
            "Patient reports mild fever.",
            "Größe 180cm, Gewicht 75kg, Überweisung",
            "患者は軽い発熱を訴えている 🤒",
            long.as_str(),
        ];
        for plaintext in samples {
            let blob = cipher.encrypt(plaintext).expect("encryption should succeed");
            let opened = cipher.decrypt(&blob).expect("decryption should succeed");
            assert_eq!(opened, plaintext);
        }
    }

    #[test]
    fn produces_stored_format() {
        let blob = cipher()
            .encrypt("Patient reports mild fever.")
            .expect("encryption should succeed");
        let (iv, ct) = blob.split_once(':').expect("delimiter present");
        assert_eq!(iv.len(), 32);
        assert!(is_lower_hex(iv));
        assert!(is_lower_hex(ct));
        // 27 bytes of text pad to two blocks
        assert_eq!(ct.len(), 64);
    }

    #[test]
    fn empty_plaintext_still_produces_a_block() {
        let blob = cipher().seal("").expect("encryption should succeed");
        assert_eq!(blob.ciphertext().len(), 16);
    }

    #[test]
    fn never_reuses_an_iv() {
        let cipher = cipher();
        let mut ivs = HashSet::new();
        let mut blobs = HashSet::new();
        for _ in 0..1000 {
            let blob = cipher.seal("same plaintext").expect("encryption should succeed");
            assert!(ivs.insert(*blob.iv()));
            assert!(blobs.insert(blob.to_string()));
        }
    }

    #[test]
    fn wrong_secret_is_an_integrity_failure() {
        let blob = cipher()
            .encrypt("Patient reports mild fever.")
            .expect("encryption should succeed");
        let other = PayloadCipher::from_secret("another-secret").expect("valid secret");
        let err = other.decrypt(&blob).unwrap_err();
        assert!(matches!(err, CipherError::Integrity(_)));
        assert!(err.is_security_event());
    }

    #[test]
    fn flipped_ciphertext_characters_are_detected() {
        let cipher = cipher();
        let blob = cipher
            .encrypt("Patient reports mild fever.")
            .expect("encryption should succeed");
        let (iv, ct) = blob.split_once(':').expect("delimiter present");

        let mut detected = 0;
        let mut trials = 0;
        for position in 0..ct.len() {
            let mut chars: Vec<char> = ct.chars().collect();
            chars[position] = if chars[position] == '0' { '1' } else { '0' };
            let tampered = format!("{iv}:{}", chars.into_iter().collect::<String>());
            trials += 1;
            match cipher.decrypt(&tampered) {
                Err(CipherError::Integrity(_)) => detected += 1,
                Ok(text) => assert_ne!(text, "Patient reports mild fever."),
                Err(other) => panic!("unexpected error kind: {other}"),
            }
        }
        assert!(detected * 10 >= trials * 9, "detected {detected} of {trials}");
    }

    #[test]
    fn rejects_missing_delimiter() {
        let err = cipher().decrypt("00112233445566778899aabbccddeeff").unwrap_err();
        assert!(matches!(err, CipherError::MalformedInput(_)));
        assert!(!err.is_security_event());
    }

    #[test]
    fn rejects_non_hex_halves() {
        let cipher = cipher();
        let good = cipher.encrypt("payload").expect("encryption should succeed");
        let (iv, ct) = good.split_once(':').expect("delimiter present");

        let bad_iv = format!("zz{}:{ct}", &iv[2..]);
        assert!(matches!(
            cipher.decrypt(&bad_iv).unwrap_err(),
            CipherError::MalformedInput(_)
        ));

        let bad_ct = format!("{iv}:{}xy", &ct[..ct.len() - 2]);
        assert!(matches!(
            cipher.decrypt(&bad_ct).unwrap_err(),
            CipherError::MalformedInput(_)
        ));
    }

    #[test]
    fn rejects_wrong_iv_length_and_partial_blocks() {
        let cipher = cipher();
        assert!(matches!(
            cipher.decrypt("0011:00112233445566778899aabbccddeeff").unwrap_err(),
            CipherError::MalformedInput(_)
        ));
        assert!(matches!(
            cipher
                .decrypt("00112233445566778899aabbccddeeff:0011")
                .unwrap_err(),
            CipherError::MalformedInput(_)
        ));
        assert!(matches!(
            cipher.decrypt("00112233445566778899aabbccddeeff:").unwrap_err(),
            CipherError::MalformedInput(_)
        ));
    }

    #[test]
    fn splits_on_the_first_delimiter_only() {
        let err = cipher()
            .decrypt("00112233445566778899aabbccddeeff:0011:2233")
            .unwrap_err();
        assert!(matches!(err, CipherError::MalformedInput(_)));
    }

    #[test]
    fn error_messages_do_not_echo_input() {
        let cipher = cipher();
        let blob = cipher.encrypt("secret diagnosis").expect("encryption should succeed");
        let (iv, ct) = blob.split_once(':').expect("delimiter present");

        let malformed = format!("{iv}:{ct}q");
        let msg = format!("{}", cipher.decrypt(&malformed).unwrap_err());
        assert!(!msg.contains(iv));
        assert!(!msg.contains('q'));

        let other = PayloadCipher::from_secret("another-secret").expect("valid secret");
        let msg = format!("{:?}", other.decrypt(&blob).unwrap_err());
        assert!(!msg.contains(iv));
        assert!(!msg.contains(ct));
    }

    #[test]
    fn blob_debug_hides_bytes() {
        let blob = cipher().seal("payload").expect("encryption should succeed");
        let out = format!("{blob:?}");
        assert!(!out.contains(&hex::encode(blob.iv())));
        let cipher_out = format!("{:?}", cipher());
        assert!(cipher_out.contains("REDACTED"));
    }

    #[test]
    fn parses_what_it_prints() {
        let blob = cipher().seal("payload").expect("encryption should succeed");
        let parsed: EncryptedBlob = blob.to_string().parse().expect("own output parses");
        assert_eq!(parsed, blob);
    }

    #[test]
    fn raw_key_and_hashed_secret_agree() {
        let hashed = PayloadCipher::from_secret("test-secret").unwrap();
        let raw = PayloadCipher::new(
            DerivedKey::from_key_bytes(&crate::crypto::integrity::sha256_digest(b"test-secret"))
                .unwrap(),
        );
        let blob = hashed.encrypt("cross-check").unwrap();
        assert_eq!(raw.decrypt(&blob).unwrap(), "cross-check");
    }

    #[test]
    fn integrity_reason_is_reported() {
        let other = PayloadCipher::from_secret("another-secret").expect("valid secret");
        let blob = cipher().encrypt("x").expect("encryption should succeed");
        match other.decrypt(&blob) {
            Err(CipherError::Integrity(reason)) => {
                assert!(matches!(reason, IntegrityFailure::Padding | IntegrityFailure::Utf8))
            }
            other => panic!("expected integrity failure, got {other:?}"),
        }
    }
}
