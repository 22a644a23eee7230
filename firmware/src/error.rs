//! Error taxonomy shared by every firmware operation.
use vault_core::{RecordError, TotpError};

use crate::config::ConfigError;
use crate::crypto::CryptoError;
use crate::output::TypingError;
use crate::store::RegionError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    #[error("device is locked")]
    Locked,
    #[error("wrong PIN, {remaining_attempts} attempts left")]
    WrongPin { remaining_attempts: u8 },
    #[error("PIN entry disabled for {remaining_ms} ms")]
    Backoff { remaining_ms: u64 },
    #[error("device locked out, wipe required")]
    LockedOut,
    #[error("authentication failed")]
    Authentication,
    #[error("stored data failed verification")]
    Corruption,
    #[error("secret not found")]
    NotFound,
    #[error("a secret with this name already exists")]
    DuplicateName,
    #[error("operation already in progress")]
    Busy,
    #[error("clock has never been synchronised")]
    ClockUnsynced,
    #[error("unlock cancelled")]
    Cancelled,
    #[error("no PIN has been provisioned")]
    NotProvisioned,
    #[error("a PIN is already provisioned")]
    AlreadyProvisioned,
    #[error("secret storage is full")]
    StoreFull,
    #[error("export requires explicit confirmation")]
    ExportRefused,
    #[error("invalid secret: {0}")]
    InvalidRecord(#[from] RecordError),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("storage error: {0}")]
    Storage(RegionError),
    #[error("crypto error: {0}")]
    Crypto(CryptoError),
    #[error("code generation failed: {0}")]
    Totp(#[from] TotpError),
    #[error("keystroke generation failed: {0}")]
    Keyboard(#[from] TypingError),
    #[error("malformed persisted data")]
    Codec,
}

/// Fieldless view of [`CoreError`] for the display layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Locked,
    WrongPin,
    Backoff,
    LockedOut,
    Authentication,
    Corruption,
    NotFound,
    DuplicateName,
    Busy,
    ClockUnsynced,
    Cancelled,
    NotProvisioned,
    AlreadyProvisioned,
    StoreFull,
    ExportRefused,
    InvalidRecord,
    Config,
    Storage,
    Crypto,
    Totp,
    Keyboard,
    Codec,
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Locked => ErrorKind::Locked,
            CoreError::WrongPin { .. } => ErrorKind::WrongPin,
            CoreError::Backoff { .. } => ErrorKind::Backoff,
            CoreError::LockedOut => ErrorKind::LockedOut,
            CoreError::Authentication => ErrorKind::Authentication,
            CoreError::Corruption => ErrorKind::Corruption,
            CoreError::NotFound => ErrorKind::NotFound,
            CoreError::DuplicateName => ErrorKind::DuplicateName,
            CoreError::Busy => ErrorKind::Busy,
            CoreError::ClockUnsynced => ErrorKind::ClockUnsynced,
            CoreError::Cancelled => ErrorKind::Cancelled,
            CoreError::NotProvisioned => ErrorKind::NotProvisioned,
            CoreError::AlreadyProvisioned => ErrorKind::AlreadyProvisioned,
            CoreError::StoreFull => ErrorKind::StoreFull,
            CoreError::ExportRefused => ErrorKind::ExportRefused,
            CoreError::InvalidRecord(_) => ErrorKind::InvalidRecord,
            CoreError::Config(_) => ErrorKind::Config,
            CoreError::Storage(_) => ErrorKind::Storage,
            CoreError::Crypto(_) => ErrorKind::Crypto,
            CoreError::Totp(_) => ErrorKind::Totp,
            CoreError::Keyboard(_) => ErrorKind::Keyboard,
            CoreError::Codec => ErrorKind::Codec,
        }
    }

    /// Short message shown on the device screen.
    pub fn user_message(&self) -> &'static str {
        self.kind().user_message()
    }
}

impl ErrorKind {
    pub const fn user_message(self) -> &'static str {
        match self {
            ErrorKind::Locked => "Device Locked",
            ErrorKind::WrongPin => "Wrong PIN",
            ErrorKind::Backoff => "Try Again Later",
            ErrorKind::LockedOut => "Device Locked Out",
            ErrorKind::Authentication => "Authentication Failed",
            ErrorKind::Corruption => "Storage Corrupted",
            ErrorKind::NotFound => "Secret Not Found",
            ErrorKind::DuplicateName => "Name Already Used",
            ErrorKind::Busy => "Device Busy",
            ErrorKind::ClockUnsynced => "Clock Not Synced",
            ErrorKind::Cancelled => "Unlock Cancelled",
            ErrorKind::NotProvisioned => "Set a PIN First",
            ErrorKind::AlreadyProvisioned => "PIN Already Set",
            ErrorKind::StoreFull => "Storage Full",
            ErrorKind::ExportRefused => "Export Not Confirmed",
            ErrorKind::InvalidRecord => "Invalid Secret",
            ErrorKind::Config => "Bad Configuration",
            ErrorKind::Storage => "Storage Failure",
            ErrorKind::Crypto => "Crypto Failure",
            ErrorKind::Totp => "Code Unavailable",
            ErrorKind::Keyboard => "Typing Failed",
            ErrorKind::Codec => "Data Format Error",
        }
    }
}

impl From<CryptoError> for CoreError {
    fn from(value: CryptoError) -> Self {
        match value {
            CryptoError::Authentication => CoreError::Authentication,
            other => CoreError::Crypto(other),
        }
    }
}

impl From<RegionError> for CoreError {
    fn from(value: RegionError) -> Self {
        match value {
            RegionError::Full | RegionError::TooLarge => CoreError::StoreFull,
            other => CoreError::Storage(other),
        }
    }
}

impl From<postcard::Error> for CoreError {
    fn from(_: postcard::Error) -> Self {
        CoreError::Codec
    }
}
