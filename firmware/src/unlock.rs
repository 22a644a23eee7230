//! PIN gate in front of the secret store.
//!
//! Verification is split in two so the slow key derivation can run as its own cancellable
//! step: [`UnlockMachine::submit_pin`] charges an attempt and hands out an [`UnlockJob`],
//! and [`UnlockMachine::complete`] applies the job's outcome. The failure counter is charged
//! before the KDF runs; callers persist [`UnlockMachine::attempt_counter`] after both calls
//! so losing power mid-derivation never refunds an attempt.
use alloc::vec::Vec;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::config::DeviceConfig;
use crate::crypto::{CryptoError, PinCredential, SessionKey};
use crate::error::CoreError;

const ATTEMPT_COUNTER_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockReason {
    Manual,
    Inactivity,
    PowerEvent,
    Reauthentication,
}

/// Unlocked session. Dropping it zeroes the vault key.
#[derive(Debug)]
pub struct Session {
    key: SessionKey,
    unlocked_at_ms: u64,
    last_activity_ms: u64,
}

impl Session {
    fn new(key: SessionKey, now_ms: u64) -> Self {
        Self {
            key,
            unlocked_at_ms: now_ms,
            last_activity_ms: now_ms,
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn unlocked_at_ms(&self) -> u64 {
        self.unlocked_at_ms
    }

    pub fn last_activity_ms(&self) -> u64 {
        self.last_activity_ms
    }
}

#[derive(Debug)]
pub enum UnlockState {
    Locked,
    Unlocking { attempt: u32 },
    Unlocked(Session),
    /// Terminal until the device is wiped.
    LockedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockPhase {
    Locked,
    Unlocking,
    Unlocked,
    LockedOut,
}

impl UnlockState {
    pub fn phase(&self) -> UnlockPhase {
        match self {
            UnlockState::Locked => UnlockPhase::Locked,
            UnlockState::Unlocking { .. } => UnlockPhase::Unlocking,
            UnlockState::Unlocked(_) => UnlockPhase::Unlocked,
            UnlockState::LockedOut => UnlockPhase::LockedOut,
        }
    }
}

/// Persisted count of consecutive failed PIN attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptCounter {
    version: u16,
    consecutive_failures: u8,
}

impl AttemptCounter {
    pub const fn new(consecutive_failures: u8) -> Self {
        Self {
            version: ATTEMPT_COUNTER_VERSION,
            consecutive_failures,
        }
    }

    pub const fn consecutive_failures(&self) -> u8 {
        self.consecutive_failures
    }
}

impl Default for AttemptCounter {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Failure bookkeeping with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PinAttempts {
    consecutive_failures: u8,
    backoff_until_ms: Option<u64>,
}

impl PinAttempts {
    const fn new(consecutive_failures: u8) -> Self {
        Self {
            consecutive_failures,
            backoff_until_ms: None,
        }
    }

    fn charge(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }

    fn refund(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_sub(1);
    }

    fn settle_success(&mut self) {
        *self = Self::new(0);
    }

    fn settle_failure(&mut self, config: &DeviceConfig, now_ms: u64) {
        if self.consecutive_failures >= config.backoff_threshold {
            let exponent = u32::from(self.consecutive_failures - config.backoff_threshold);
            let multiplier = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
            let delay = config.backoff_base_ms.saturating_mul(multiplier);
            self.backoff_until_ms = Some(now_ms.saturating_add(delay));
        }
    }

    fn remaining_backoff(&self, now_ms: u64) -> Option<u64> {
        self.backoff_until_ms
            .and_then(|until| (now_ms < until).then(|| until - now_ms))
    }
}

/// One key derivation, detached from the machine so it can run as a separate step.
pub struct UnlockJob {
    attempt: u32,
    pin: Zeroizing<Vec<u8>>,
    credential: PinCredential,
}

impl UnlockJob {
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Run the KDF. This is the only long-running step of the firmware.
    pub fn run(self) -> UnlockOutcome {
        UnlockOutcome {
            attempt: self.attempt,
            result: self.credential.unwrap_key(&self.pin),
        }
    }
}

impl core::fmt::Debug for UnlockJob {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("UnlockJob")
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct UnlockOutcome {
    attempt: u32,
    result: Result<SessionKey, CryptoError>,
}

/// Snapshot for the lock screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockStatus {
    pub phase: UnlockPhase,
    pub provisioned: bool,
    pub remaining_attempts: u8,
    pub backoff_remaining_ms: Option<u64>,
}

#[derive(Debug)]
pub struct UnlockMachine {
    config: DeviceConfig,
    credential: Option<PinCredential>,
    attempts: PinAttempts,
    state: UnlockState,
    next_attempt: u32,
}

impl UnlockMachine {
    /// Restore the machine at boot. A counter already at the threshold re-enters lockout; a
    /// counter past the backoff threshold re-arms its full delay from boot, since the uptime
    /// clock the delay was measured on restarts with the device.
    pub fn new(
        config: DeviceConfig,
        credential: Option<PinCredential>,
        counter: AttemptCounter,
    ) -> Self {
        let mut attempts = PinAttempts::new(counter.consecutive_failures());
        let state = if attempts.consecutive_failures >= config.lockout_threshold {
            warn!("failure counter at threshold, device locked out");
            UnlockState::LockedOut
        } else {
            attempts.settle_failure(&config, 0);
            UnlockState::Locked
        };
        Self {
            config,
            credential,
            attempts,
            state,
            next_attempt: 0,
        }
    }

    pub fn state(&self) -> &UnlockState {
        &self.state
    }

    pub fn phase(&self) -> UnlockPhase {
        self.state.phase()
    }

    pub fn is_provisioned(&self) -> bool {
        self.credential.is_some()
    }

    pub fn credential(&self) -> Option<&PinCredential> {
        self.credential.as_ref()
    }

    pub fn attempt_counter(&self) -> AttemptCounter {
        AttemptCounter::new(self.attempts.consecutive_failures)
    }

    pub fn remaining_attempts(&self) -> u8 {
        self.config
            .lockout_threshold
            .saturating_sub(self.attempts.consecutive_failures)
    }

    /// Start verifying `pin`. Submitting while unlocked drops the current session first.
    pub fn submit_pin(&mut self, pin: &[u8], now_ms: u64) -> Result<UnlockJob, CoreError> {
        match self.state {
            UnlockState::LockedOut => return Err(CoreError::LockedOut),
            UnlockState::Unlocking { .. } => return Err(CoreError::Busy),
            UnlockState::Unlocked(_) => {
                self.lock(LockReason::Reauthentication);
            }
            UnlockState::Locked => {}
        }

        let credential = self.credential.clone().ok_or(CoreError::NotProvisioned)?;
        if let Some(remaining_ms) = self.attempts.remaining_backoff(now_ms) {
            return Err(CoreError::Backoff { remaining_ms });
        }

        self.attempts.charge();
        let attempt = self.next_attempt;
        self.next_attempt = self.next_attempt.wrapping_add(1);
        self.state = UnlockState::Unlocking { attempt };

        Ok(UnlockJob {
            attempt,
            pin: Zeroizing::new(pin.to_vec()),
            credential,
        })
    }

    /// Apply the result of an [`UnlockJob`]. Outcomes of cancelled jobs are discarded.
    pub fn complete(&mut self, outcome: UnlockOutcome, now_ms: u64) -> Result<(), CoreError> {
        match self.state {
            UnlockState::Unlocking { attempt } if attempt == outcome.attempt => {}
            _ => return Err(CoreError::Cancelled),
        }

        match outcome.result {
            Ok(key) => {
                self.attempts.settle_success();
                self.state = UnlockState::Unlocked(Session::new(key, now_ms));
                info!("unlocked");
                Ok(())
            }
            Err(CryptoError::Authentication) => {
                if self.attempts.consecutive_failures >= self.config.lockout_threshold {
                    self.state = UnlockState::LockedOut;
                    warn!(
                        "{} consecutive PIN failures, device locked out",
                        self.attempts.consecutive_failures
                    );
                    return Err(CoreError::LockedOut);
                }
                self.attempts.settle_failure(&self.config, now_ms);
                self.state = UnlockState::Locked;
                let remaining_attempts = self.remaining_attempts();
                info!("wrong PIN, {remaining_attempts} attempts left");
                Err(CoreError::WrongPin { remaining_attempts })
            }
            Err(other) => {
                self.attempts.refund();
                self.state = UnlockState::Locked;
                warn!("unlock failed: {other}");
                Err(other.into())
            }
        }
    }

    /// Abort an in-flight verification. The charged attempt is refunded since nothing was
    /// learned about the PIN.
    pub fn cancel(&mut self) -> bool {
        if let UnlockState::Unlocking { .. } = self.state {
            self.attempts.refund();
            self.state = UnlockState::Locked;
            info!("unlock cancelled");
            true
        } else {
            false
        }
    }

    /// Drop the session or in-flight verification. Returns whether anything changed.
    pub fn lock(&mut self, reason: LockReason) -> bool {
        match self.state {
            UnlockState::Unlocked(_) => {
                self.state = UnlockState::Locked;
                info!("locked: {reason:?}");
                true
            }
            UnlockState::Unlocking { .. } => self.cancel(),
            UnlockState::Locked | UnlockState::LockedOut => false,
        }
    }

    /// Enforce the inactivity timeout.
    pub fn tick(&mut self, now_ms: u64) -> Option<LockReason> {
        let UnlockState::Unlocked(session) = &self.state else {
            return None;
        };
        if now_ms.saturating_sub(session.last_activity_ms) >= self.config.inactivity_timeout_ms {
            self.lock(LockReason::Inactivity);
            return Some(LockReason::Inactivity);
        }
        None
    }

    pub fn touch(&mut self, now_ms: u64) {
        if let UnlockState::Unlocked(session) = &mut self.state {
            session.last_activity_ms = session.last_activity_ms.max(now_ms);
        }
    }

    pub fn session(&self) -> Result<&Session, CoreError> {
        match &self.state {
            UnlockState::Unlocked(session) => Ok(session),
            UnlockState::LockedOut => Err(CoreError::LockedOut),
            UnlockState::Locked | UnlockState::Unlocking { .. } => Err(CoreError::Locked),
        }
    }

    pub fn status(&self, now_ms: u64) -> LockStatus {
        LockStatus {
            phase: self.phase(),
            provisioned: self.is_provisioned(),
            remaining_attempts: self.remaining_attempts(),
            backoff_remaining_ms: self.attempts.remaining_backoff(now_ms),
        }
    }

    /// Adopt a freshly provisioned credential and open a session with its vault key.
    pub fn install_credential(
        &mut self,
        credential: PinCredential,
        key: SessionKey,
        now_ms: u64,
    ) -> Result<(), CoreError> {
        if self.credential.is_some() {
            return Err(CoreError::AlreadyProvisioned);
        }
        self.credential = Some(credential);
        self.attempts.settle_success();
        self.state = UnlockState::Unlocked(Session::new(key, now_ms));
        Ok(())
    }

    /// Swap in a rewrapped credential after a PIN change. Requires a live session.
    pub fn replace_credential(&mut self, credential: PinCredential) -> Result<(), CoreError> {
        self.session()?;
        self.credential = Some(credential);
        Ok(())
    }

    /// Forget the credential and leave lockout. The caller erases storage.
    pub fn wipe(&mut self) {
        self.credential = None;
        self.attempts.settle_success();
        self.state = UnlockState::Locked;
        warn!("unlock state wiped");
    }
}
