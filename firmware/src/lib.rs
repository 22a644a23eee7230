#![cfg_attr(not(test), no_std)]

//! Firmware core of a hardware TOTP token.
//!
//! Secrets are encrypted at rest under a random vault key that only a PIN unlocks. Codes
//! are derived from a monotonic clock anchored by NTP or an RTC, and leave the device on
//! its screen or as timed keystrokes. Board drivers plug in through the traits in
//! [`output`], [`clock`] and [`store`].

extern crate alloc;

pub mod clock;
pub mod config;
pub mod crypto;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod output;
pub mod store;
pub mod unlock;

pub use clock::{ClockCheckpoint, ClockSource, ClockState, NoRtc, RealTimeClock};
pub use config::{ConfigError, DeviceConfig, TypingProfile};
pub use crypto::{CryptoError, KdfParams, PinCredential, SessionKey, TransportKey};
pub use device::Device;
pub use dispatch::{DeviceEvent, DispatchOutput, Dispatcher, PinEntry, StepResult};
pub use error::{CoreError, ErrorKind};
pub use output::{Emission, ExportConfirmation, OutputRouter, Sink};
pub use store::{FlashRegion, MemoryRegion, Region, RegionError, SecretStore};
pub use unlock::{
    AttemptCounter, LockReason, LockStatus, UnlockJob, UnlockMachine, UnlockOutcome,
    UnlockPhase, UnlockState,
};
pub use vault_core::{SecretKey, SecretName, SecretRecord, TotpAlgorithm, TotpCode};
