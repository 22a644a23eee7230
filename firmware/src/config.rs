//! Policy knobs of the device and their firmware defaults.
use crate::crypto::{CryptoError, KdfParams};

/// Consecutive wrong PINs before the device refuses further attempts until a wipe.
pub const LOCKOUT_THRESHOLD: u8 = 10;
/// Consecutive wrong PINs before the backoff delay starts.
pub const BACKOFF_THRESHOLD: u8 = 3;
/// First backoff delay, doubled for every further failure.
pub const BACKOFF_BASE_MS: u64 = 1_000;
pub const INACTIVITY_TIMEOUT_MS: u64 = 60_000;
pub const TICKS_PER_SECOND: u32 = 1_000;
pub const BUSY_RETRY_LIMIT: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("tick rate must be at least 1 Hz")]
    ZeroTickRate,
    #[error("lockout threshold must be greater than zero")]
    ZeroLockoutThreshold,
    #[error("inactivity timeout must be greater than zero")]
    ZeroInactivityTimeout,
    #[error("keystroke jitter must not exceed the hold or gap time")]
    JitterTooLarge,
    #[error("invalid key derivation parameters")]
    InvalidKdf,
}

/// Timing of emulated keystrokes, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypingProfile {
    pub hold_ms: u16,
    pub gap_ms: u16,
    /// Upper bound of the random amount added to every hold and gap.
    pub jitter_ms: u16,
    pub submit_with_enter: bool,
}

impl TypingProfile {
    pub const fn firmware_defaults() -> Self {
        Self {
            hold_ms: 40,
            gap_ms: 60,
            jitter_ms: 25,
            submit_with_enter: false,
        }
    }
}

impl Default for TypingProfile {
    fn default() -> Self {
        Self::firmware_defaults()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConfig {
    pub lockout_threshold: u8,
    pub backoff_threshold: u8,
    pub backoff_base_ms: u64,
    pub inactivity_timeout_ms: u64,
    pub ticks_per_second: u32,
    pub kdf: KdfParams,
    pub typing: TypingProfile,
    pub busy_retry_limit: u8,
}

impl DeviceConfig {
    pub const fn firmware_defaults() -> Self {
        Self {
            lockout_threshold: LOCKOUT_THRESHOLD,
            backoff_threshold: BACKOFF_THRESHOLD,
            backoff_base_ms: BACKOFF_BASE_MS,
            inactivity_timeout_ms: INACTIVITY_TIMEOUT_MS,
            ticks_per_second: TICKS_PER_SECOND,
            kdf: KdfParams::firmware(),
            typing: TypingProfile::firmware_defaults(),
            busy_retry_limit: BUSY_RETRY_LIMIT,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ticks_per_second == 0 {
            return Err(ConfigError::ZeroTickRate);
        }
        if self.lockout_threshold == 0 {
            return Err(ConfigError::ZeroLockoutThreshold);
        }
        if self.inactivity_timeout_ms == 0 {
            return Err(ConfigError::ZeroInactivityTimeout);
        }
        if self.typing.jitter_ms > self.typing.hold_ms || self.typing.jitter_ms > self.typing.gap_ms
        {
            return Err(ConfigError::JitterTooLarge);
        }
        self.kdf
            .validate()
            .map_err(|_: CryptoError| ConfigError::InvalidKdf)
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self::firmware_defaults()
    }
}
