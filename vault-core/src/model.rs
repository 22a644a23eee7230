use alloc::{borrow::ToOwned, string::String, vec::Vec};
use core::fmt;
use core::ops::Deref;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// Longest accepted secret name, in UTF-8 bytes.
pub const MAX_NAME_LEN: usize = 32;

/// Period applied when a secret does not specify one.
pub const DEFAULT_PERIOD_SECONDS: u32 = 30;

/// Additional authenticated data prefix for records sealed under the vault key.
pub const RECORD_AAD: &[u8] = b"totp.vault.record.v1";

/// Additional authenticated data prefix for records re-sealed under a backup transport key.
pub const BACKUP_AAD: &[u8] = b"totp.vault.backup.v1";

/// Backup bundle format version.
pub const BACKUP_VERSION: u16 = 1;

/// Errors raised while validating secret records.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error("name must not be empty")]
    EmptyName,
    #[error("name is {0} bytes, the limit is 32")]
    NameTooLong(usize),
    #[error("name contains control characters")]
    InvalidNameCharacter,
    #[error("shared key must not be empty")]
    EmptyKey,
    #[error("shared key is not valid base32")]
    InvalidBase32,
    #[error("digits must be 6 or 8, got {0}")]
    UnsupportedDigits(u8),
    #[error("period must be greater than zero")]
    ZeroPeriod,
}

/// Hash function backing the HMAC of a TOTP secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TotpAlgorithm {
    #[serde(rename = "sha1")]
    Sha1,
    #[serde(rename = "sha256")]
    Sha256,
    #[serde(rename = "sha512")]
    Sha512,
}

/// Unique, human readable label of a secret.
///
/// Names are stored in plaintext so the selection list can be shown while the device is
/// locked.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SecretName(String);

impl SecretName {
    pub fn new(value: impl Into<String>) -> Result<Self, RecordError> {
        let value = value.into();
        let len = value.len();
        if len == 0 {
            return Err(RecordError::EmptyName);
        }
        if len > MAX_NAME_LEN {
            return Err(RecordError::NameTooLong(len));
        }
        if value.chars().any(char::is_control) {
            return Err(RecordError::InvalidNameCharacter);
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SecretName {
    type Error = RecordError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for SecretName {
    type Error = RecordError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value.to_owned())
    }
}

impl From<SecretName> for String {
    fn from(value: SecretName) -> Self {
        value.0
    }
}

impl Deref for SecretName {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for SecretName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for SecretName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretName({:?})", self.0)
    }
}

/// Raw TOTP seed that zeroizes its memory on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey(Zeroizing<Vec<u8>>);

impl SecretKey {
    pub fn new(bytes: Vec<u8>) -> Result<Self, RecordError> {
        if bytes.is_empty() {
            return Err(RecordError::EmptyKey);
        }
        Ok(Self(Zeroizing::new(bytes)))
    }

    /// Decode an RFC 4648 base32 secret as printed by most issuers.
    ///
    /// Whitespace is ignored, case is folded and trailing padding is optional.
    pub fn from_base32(encoded: &str) -> Result<Self, RecordError> {
        let normalized: Zeroizing<String> = Zeroizing::new(
            encoded
                .chars()
                .filter(|ch| !ch.is_ascii_whitespace() && *ch != '=')
                .map(|ch| ch.to_ascii_uppercase())
                .collect(),
        );
        let decoded = data_encoding::BASE32_NOPAD
            .decode(normalized.as_bytes())
            .map_err(|_| RecordError::InvalidBase32)?;
        Self::new(decoded)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey({} bytes)", self.0.len())
    }
}

impl Serialize for SecretKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.as_slice().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SecretKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        Ok(Self(Zeroizing::new(bytes)))
    }
}

/// A named TOTP secret and its generation parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRecord {
    pub name: SecretName,
    pub shared_key: SecretKey,
    pub digits: u8,
    pub period_seconds: u32,
    pub algorithm: TotpAlgorithm,
    pub created_at: u64,
}

impl SecretRecord {
    /// Build a record with the common defaults: SHA1, 6 digits, 30 second period.
    pub fn new(name: SecretName, shared_key: SecretKey) -> Self {
        Self {
            name,
            shared_key,
            digits: 6,
            period_seconds: DEFAULT_PERIOD_SECONDS,
            algorithm: TotpAlgorithm::Sha1,
            created_at: 0,
        }
    }

    pub fn with_algorithm(mut self, algorithm: TotpAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_digits(mut self, digits: u8) -> Result<Self, RecordError> {
        check_digits(digits)?;
        self.digits = digits;
        Ok(self)
    }

    pub fn with_period(mut self, period_seconds: u32) -> Result<Self, RecordError> {
        if period_seconds == 0 {
            return Err(RecordError::ZeroPeriod);
        }
        self.period_seconds = period_seconds;
        Ok(self)
    }

    pub fn with_created_at(mut self, created_at: u64) -> Self {
        self.created_at = created_at;
        self
    }

    /// Re-check invariants, used after decoding a record from storage or a backup.
    pub fn validate(&self) -> Result<(), RecordError> {
        if self.shared_key.is_empty() {
            return Err(RecordError::EmptyKey);
        }
        check_digits(self.digits)?;
        if self.period_seconds == 0 {
            return Err(RecordError::ZeroPeriod);
        }
        Ok(())
    }
}

fn check_digits(digits: u8) -> Result<(), RecordError> {
    match digits {
        6 | 8 => Ok(()),
        other => Err(RecordError::UnsupportedDigits(other)),
    }
}

/// Authenticated ciphertext of one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedBlob {
    pub nonce: [u8; 12],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; 16],
}

/// One record re-sealed under the backup transport key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupEntry {
    pub name: SecretName,
    pub blob: EncryptedBlob,
}

/// Wire payload exchanged with the desktop companion over the backup channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupBundle {
    pub version: u16,
    pub exported_at: u64,
    pub entries: Vec<BackupEntry>,
}

impl BackupBundle {
    pub fn to_bytes(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}

/// Bind a sealed record to its name so blobs cannot be swapped between entries.
pub fn associated_data(domain: &[u8], name: &SecretName) -> Vec<u8> {
    let mut aad = Vec::with_capacity(domain.len() + 1 + name.len());
    aad.extend_from_slice(domain);
    aad.push(b'/');
    aad.extend_from_slice(name.as_bytes());
    aad
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn name_rejects_empty_and_long_values() {
        assert_eq!(SecretName::new(""), Err(RecordError::EmptyName));
        let long = "x".repeat(MAX_NAME_LEN + 1);
        assert_eq!(
            SecretName::new(long),
            Err(RecordError::NameTooLong(MAX_NAME_LEN + 1))
        );
        assert!(SecretName::new("x".repeat(MAX_NAME_LEN)).is_ok());
        assert_eq!(
            SecretName::new("bad\nname"),
            Err(RecordError::InvalidNameCharacter)
        );
    }

    #[test]
    fn name_limit_counts_utf8_bytes() {
        assert!(SecretName::new("ü".repeat(MAX_NAME_LEN / 2)).is_ok());
        assert_eq!(
            SecretName::new("ü".repeat(MAX_NAME_LEN / 2 + 1)),
            Err(RecordError::NameTooLong(MAX_NAME_LEN + 2))
        );
        assert!(SecretName::new("𝄞".repeat(8)).is_ok());
        assert_eq!(
            SecretName::new("𝄞".repeat(9)),
            Err(RecordError::NameTooLong(36))
        );
    }

    #[test]
    fn decoding_rejects_invalid_names() {
        let encoded = postcard::to_allocvec(&String::new()).unwrap();
        assert!(postcard::from_bytes::<SecretName>(&encoded).is_err());
    }

    #[test]
    fn base32_decoding_tolerates_spacing_and_case() {
        let key = SecretKey::from_base32("gezd gnbv gy3t qojq").unwrap();
        assert_eq!(key.as_bytes(), b"1234567890");

        let padded = SecretKey::from_base32("JBSWY3DPEHPK3PXP====").unwrap();
        assert_eq!(padded.len(), 10);

        assert_eq!(
            SecretKey::from_base32("not*base32").unwrap_err(),
            RecordError::InvalidBase32
        );
    }

    #[test]
    fn record_builders_validate_parameters() {
        let record = SecretRecord::new(
            SecretName::new("mail").unwrap(),
            SecretKey::new(vec![1, 2, 3]).unwrap(),
        );
        assert_eq!(record.digits, 6);
        assert_eq!(record.period_seconds, DEFAULT_PERIOD_SECONDS);

        assert_eq!(
            record.clone().with_digits(7).unwrap_err(),
            RecordError::UnsupportedDigits(7)
        );
        assert_eq!(
            record.clone().with_period(0).unwrap_err(),
            RecordError::ZeroPeriod
        );
        assert_eq!(SecretKey::new(Vec::new()).unwrap_err(), RecordError::EmptyKey);
    }

    #[test]
    fn debug_output_hides_key_material() {
        let key = SecretKey::new(b"super-secret".to_vec()).unwrap();
        let rendered = alloc::format!("{key:?}");
        assert!(!rendered.contains("super"));
        assert!(rendered.contains("12 bytes"));
    }

    #[test]
    fn associated_data_binds_name() {
        let a = associated_data(RECORD_AAD, &SecretName::new("a").unwrap());
        let b = associated_data(RECORD_AAD, &SecretName::new("b").unwrap());
        assert_ne!(a, b);
        assert!(a.starts_with(RECORD_AAD));
    }
}
