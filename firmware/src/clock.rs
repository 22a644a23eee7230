//! Monotonic tick counter anchored to Unix time by NTP sync or an RTC peripheral.
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::error::CoreError;

const CHECKPOINT_VERSION: u16 = 1;

/// Battery-backed real-time clock, when the board has one.
pub trait RealTimeClock {
    fn read_epoch_seconds(&mut self) -> Option<u64>;
    fn write_epoch_seconds(&mut self, epoch_seconds: u64);
}

/// Board without an RTC: every power cycle starts unsynced.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRtc;

impl RealTimeClock for NoRtc {
    fn read_epoch_seconds(&mut self) -> Option<u64> {
        None
    }

    fn write_epoch_seconds(&mut self, _epoch_seconds: u64) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClockState {
    pub monotonic_ticks: u64,
    pub epoch_anchor: Option<u64>,
    pub anchor_tick: u64,
}

impl ClockState {
    fn elapsed_ticks(&self) -> u64 {
        self.monotonic_ticks.saturating_sub(self.anchor_tick)
    }
}

/// Best-effort record of the last known time, persisted so a stale RTC can be detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockCheckpoint {
    version: u16,
    pub epoch_seconds: u64,
}

impl ClockCheckpoint {
    pub const fn new(epoch_seconds: u64) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            epoch_seconds,
        }
    }
}

#[derive(Debug)]
pub struct ClockSource<C = NoRtc> {
    state: ClockState,
    ticks_per_second: u32,
    rtc: C,
}

impl<C: RealTimeClock> ClockSource<C> {
    pub fn new(ticks_per_second: u32, rtc: C) -> Result<Self, ConfigError> {
        if ticks_per_second == 0 {
            return Err(ConfigError::ZeroTickRate);
        }
        Ok(Self {
            state: ClockState::default(),
            ticks_per_second,
            rtc,
        })
    }

    /// Anchor from the RTC unless it reads earlier than the last checkpoint, which means its
    /// backup battery died. Returns whether the clock is synced afterwards.
    pub fn boot(&mut self, checkpoint: Option<ClockCheckpoint>) -> bool {
        let Some(reading) = self.rtc.read_epoch_seconds() else {
            log::info!("no RTC reading, clock waits for sync");
            return false;
        };

        if let Some(checkpoint) = checkpoint
            && reading < checkpoint.epoch_seconds
        {
            log::warn!(
                "RTC reads {reading}, earlier than checkpoint {}; ignoring it",
                checkpoint.epoch_seconds
            );
            return false;
        }

        self.anchor(reading);
        true
    }

    pub fn tick(&mut self, delta: u64) {
        self.state.monotonic_ticks = self.state.monotonic_ticks.saturating_add(delta);
    }

    /// Move to an absolute tick count read from the hardware timer. Counts behind the
    /// current one are ignored so time never runs backwards.
    pub fn advance_to(&mut self, ticks: u64) {
        if ticks > self.state.monotonic_ticks {
            self.state.monotonic_ticks = ticks;
        }
    }

    /// Jump to `epoch_seconds`. Last writer wins.
    pub fn sync(&mut self, epoch_seconds: u64) {
        if let Ok(previous) = self.now() {
            let drift = epoch_seconds as i128 - previous as i128;
            log::info!("clock resync, drift {drift}s");
        } else {
            log::info!("clock synced");
        }
        self.anchor(epoch_seconds);
        self.rtc.write_epoch_seconds(epoch_seconds);
    }

    pub fn now(&self) -> Result<u64, CoreError> {
        let anchor = self.state.epoch_anchor.ok_or(CoreError::ClockUnsynced)?;
        Ok(anchor.saturating_add(self.state.elapsed_ticks() / u64::from(self.ticks_per_second)))
    }

    pub fn now_millis(&self) -> Result<u64, CoreError> {
        let anchor = self.state.epoch_anchor.ok_or(CoreError::ClockUnsynced)?;
        Ok(anchor
            .saturating_mul(1_000)
            .saturating_add(self.ticks_to_ms(self.state.elapsed_ticks())))
    }

    /// Milliseconds since boot, available whether or not the clock is synced.
    pub fn uptime_ms(&self) -> u64 {
        self.ticks_to_ms(self.state.monotonic_ticks)
    }

    pub fn is_synced(&self) -> bool {
        self.state.epoch_anchor.is_some()
    }

    pub fn state(&self) -> ClockState {
        self.state
    }

    pub fn checkpoint(&self) -> Option<ClockCheckpoint> {
        self.now().ok().map(ClockCheckpoint::new)
    }

    fn anchor(&mut self, epoch_seconds: u64) {
        self.state.epoch_anchor = Some(epoch_seconds);
        self.state.anchor_tick = self.state.monotonic_ticks;
    }

    fn ticks_to_ms(&self, ticks: u64) -> u64 {
        let ms = u128::from(ticks) * 1_000 / u128::from(self.ticks_per_second);
        ms.min(u128::from(u64::MAX)) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeRtc {
        reading: Option<u64>,
        written: Option<u64>,
    }

    impl RealTimeClock for FakeRtc {
        fn read_epoch_seconds(&mut self) -> Option<u64> {
            self.reading
        }

        fn write_epoch_seconds(&mut self, epoch_seconds: u64) {
            self.written = Some(epoch_seconds);
        }
    }

    fn rtc(reading: Option<u64>) -> FakeRtc {
        FakeRtc {
            reading,
            written: None,
        }
    }

    #[test]
    fn rejects_zero_tick_rate() {
        assert_eq!(
            ClockSource::new(0, NoRtc).unwrap_err(),
            ConfigError::ZeroTickRate
        );
    }

    #[test]
    fn unsynced_until_first_sync() {
        let mut clock = ClockSource::new(1_000, NoRtc).unwrap();
        assert!(!clock.boot(None));
        assert_eq!(clock.now(), Err(CoreError::ClockUnsynced));
        assert_eq!(clock.checkpoint(), None);

        clock.tick(5_000);
        clock.sync(1_700_000_000);
        assert_eq!(clock.now(), Ok(1_700_000_000));
    }

    #[test]
    fn elapsed_ticks_advance_time() {
        let mut clock = ClockSource::new(100, NoRtc).unwrap();
        clock.sync(1_000);
        clock.tick(250);
        assert_eq!(clock.now(), Ok(1_002));
        assert_eq!(clock.now_millis(), Ok(1_002_500));
        assert_eq!(clock.uptime_ms(), 2_500);
    }

    #[test]
    fn resync_is_an_instant_jump() {
        let mut clock = ClockSource::new(1, NoRtc).unwrap();
        clock.sync(500);
        clock.tick(10);
        clock.sync(100);
        assert_eq!(clock.now(), Ok(100));
        clock.sync(100);
        assert_eq!(clock.now(), Ok(100));
        assert_eq!(clock.state().anchor_tick, 10);
    }

    #[test]
    fn ticks_never_go_backwards() {
        let mut clock = ClockSource::new(1, NoRtc).unwrap();
        clock.advance_to(40);
        clock.advance_to(10);
        assert_eq!(clock.state().monotonic_ticks, 40);
        clock.tick(u64::MAX);
        assert_eq!(clock.state().monotonic_ticks, u64::MAX);
    }

    #[test]
    fn rtc_anchors_at_boot_and_receives_syncs() {
        let mut clock = ClockSource::new(1, rtc(Some(2_000))).unwrap();
        assert!(clock.boot(Some(ClockCheckpoint::new(1_500))));
        assert_eq!(clock.now(), Ok(2_000));

        clock.sync(3_000);
        assert_eq!(clock.rtc.written, Some(3_000));
    }

    #[test]
    fn rtc_behind_checkpoint_is_ignored() {
        let mut clock = ClockSource::new(1, rtc(Some(10))).unwrap();
        assert!(!clock.boot(Some(ClockCheckpoint::new(1_700_000_000))));
        assert!(!clock.is_synced());
    }
}
