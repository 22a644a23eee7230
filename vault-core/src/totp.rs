use alloc::{format, string::String};

use hmac::{Hmac, Mac, digest::KeyInit};
use sha1::Sha1;
use sha2::{Sha256, Sha512};

use crate::model::{SecretRecord, TotpAlgorithm};

/// Resulting TOTP code and the window it belongs to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TotpCode {
    pub code: String,
    pub counter: u64,
    pub period: u32,
    pub remaining_seconds: u32,
}

/// Errors returned while generating a TOTP value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TotpError {
    #[error("shared key must not be empty")]
    InvalidSecret,
    #[error("digits must be 6 or 8")]
    UnsupportedDigits,
    #[error("period must be greater than zero")]
    InvalidPeriod,
}

/// Generate the RFC 6238 code of `record` at `unix_time` seconds (T0 = 0).
pub fn generate(record: &SecretRecord, unix_time: u64) -> Result<TotpCode, TotpError> {
    if record.period_seconds == 0 {
        return Err(TotpError::InvalidPeriod);
    }

    let period = u64::from(record.period_seconds);
    let counter = unix_time / period;
    let value = hotp(
        record.shared_key.as_bytes(),
        counter,
        record.algorithm,
        record.digits,
    )?;
    let code = format!("{:0width$}", value, width = record.digits as usize);
    let remaining = period - unix_time % period;

    Ok(TotpCode {
        code,
        counter,
        period: record.period_seconds,
        remaining_seconds: remaining as u32,
    })
}

/// RFC 4226 HOTP value for `counter`, reduced modulo `10^digits`.
pub fn hotp(
    key: &[u8],
    counter: u64,
    algorithm: TotpAlgorithm,
    digits: u8,
) -> Result<u32, TotpError> {
    if key.is_empty() {
        return Err(TotpError::InvalidSecret);
    }
    let modulus = match digits {
        6 => 1_000_000,
        8 => 100_000_000,
        _ => return Err(TotpError::UnsupportedDigits),
    };

    let truncated = match algorithm {
        TotpAlgorithm::Sha1 => truncated_mac::<Hmac<Sha1>>(key, counter)?,
        TotpAlgorithm::Sha256 => truncated_mac::<Hmac<Sha256>>(key, counter)?,
        TotpAlgorithm::Sha512 => truncated_mac::<Hmac<Sha512>>(key, counter)?,
    };
    Ok(truncated % modulus)
}

fn truncated_mac<M>(key: &[u8], counter: u64) -> Result<u32, TotpError>
where
    M: Mac + KeyInit,
{
    let mut mac = <M as Mac>::new_from_slice(key).map_err(|_| TotpError::InvalidSecret)?;
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();
    Ok(dynamic_truncate(digest.as_slice()))
}

/// Select four bytes at the offset named by the low nibble of the last byte, top bit cleared.
fn dynamic_truncate(mac: &[u8]) -> u32 {
    let offset = (mac[mac.len() - 1] & 0x0f) as usize;
    u32::from_be_bytes([
        mac[offset] & 0x7f,
        mac[offset + 1],
        mac[offset + 2],
        mac[offset + 3],
    ])
}
