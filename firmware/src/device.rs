//! The token as a whole: persistent store, PIN gate, clock and output routing behind one
//! facade. Every operation that reaches secret material goes through the unlocked session.
use alloc::rc::Rc;
use alloc::vec::Vec;
use log::{info, warn};
use rand_core::{CryptoRng, RngCore};
use vault_core::{BackupBundle, SecretKey, SecretName, SecretRecord, TotpCode};

use crate::clock::{ClockSource, NoRtc, RealTimeClock};
use crate::config::DeviceConfig;
use crate::crypto::{PinCredential, TransportKey};
use crate::error::CoreError;
use crate::output::{Emission, ExportConfirmation, ListView, LockView, OutputRouter, Sink};
use crate::store::{Region, SecretStore};
use crate::unlock::{
    AttemptCounter, LockReason, LockStatus, UnlockJob, UnlockMachine, UnlockOutcome, UnlockPhase,
};

pub struct Device<R, G, C = NoRtc> {
    config: DeviceConfig,
    store: Rc<SecretStore<R>>,
    machine: UnlockMachine,
    clock: ClockSource<C>,
    router: OutputRouter,
    rng: G,
}

impl<R, G, C> Device<R, G, C>
where
    R: Region,
    G: RngCore + CryptoRng,
    C: RealTimeClock,
{
    /// Mount storage, restore the failure counter and anchor the clock if possible.
    pub async fn boot(config: DeviceConfig, region: R, rtc: C, rng: G) -> Result<Self, CoreError> {
        config.validate()?;
        let store = Rc::new(SecretStore::mount(region).await?);
        let credential = store.load_credential().await?;
        let counter = store.load_attempts().await?;
        let checkpoint = store.load_checkpoint().await?;

        let mut clock = ClockSource::new(config.ticks_per_second, rtc)?;
        clock.boot(checkpoint);

        let machine = UnlockMachine::new(config, credential, counter);
        info!(
            "booted: provisioned={}, {} failed attempts, clock synced={}",
            machine.is_provisioned(),
            counter.consecutive_failures(),
            clock.is_synced()
        );

        Ok(Self {
            config,
            store,
            machine,
            clock,
            router: OutputRouter::new(config.typing),
            rng,
        })
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Shared handle for board tasks that persist outside the dispatcher, such as a periodic
    /// clock checkpoint. While such a task holds the store, device operations see `Busy`.
    pub fn store_handle(&self) -> Rc<SecretStore<R>> {
        Rc::clone(&self.store)
    }

    pub fn phase(&self) -> UnlockPhase {
        self.machine.phase()
    }

    pub fn status(&self) -> LockStatus {
        self.machine.status(self.uptime_ms())
    }

    pub fn lock_view(&self) -> LockView {
        LockView::from_status(&self.status())
    }

    pub fn list_view(&self, selected: usize) -> Result<ListView, CoreError> {
        Ok(ListView {
            names: self.list()?,
            selected,
        })
    }

    pub fn uptime_ms(&self) -> u64 {
        self.clock.uptime_ms()
    }

    /// Set the first PIN and open a session with the new, empty vault.
    pub async fn provision(&mut self, pin: &[u8]) -> Result<(), CoreError> {
        match self.machine.phase() {
            UnlockPhase::LockedOut => return Err(CoreError::LockedOut),
            _ if self.machine.is_provisioned() => return Err(CoreError::AlreadyProvisioned),
            _ => {}
        }

        let (credential, key) = PinCredential::provision(pin, self.config.kdf, &mut self.rng)?;
        self.store.store_credential(&credential).await?;
        self.store.store_attempts(AttemptCounter::default()).await?;
        self.machine
            .install_credential(credential, key, self.clock.uptime_ms())?;
        info!("device provisioned");
        Ok(())
    }

    /// Rewrap the vault key under `new_pin`. Stored secrets are untouched.
    pub async fn change_pin(&mut self, new_pin: &[u8]) -> Result<(), CoreError> {
        let session = self.machine.session()?;
        let credential = self.machine.credential().ok_or(CoreError::NotProvisioned)?;
        let rotated = credential.rewrap(session.key(), new_pin, &mut self.rng)?;

        self.store.store_credential(&rotated).await?;
        self.machine.replace_credential(rotated)?;
        self.machine.touch(self.clock.uptime_ms());
        info!("PIN changed");
        Ok(())
    }

    /// Destroy every secret and the credential. The only way out of lockout.
    pub async fn wipe(&mut self) -> Result<(), CoreError> {
        self.store.wipe().await?;
        self.machine.wipe();
        if let Err(err) = self.checkpoint_clock().await {
            warn!("clock checkpoint after wipe failed: {err}");
        }
        Ok(())
    }

    /// Charge an attempt, persist the counter and hand out the key derivation job.
    pub async fn submit_pin(&mut self, pin: &[u8]) -> Result<UnlockJob, CoreError> {
        let job = self.machine.submit_pin(pin, self.clock.uptime_ms())?;
        if let Err(err) = self
            .store
            .store_attempts(self.machine.attempt_counter())
            .await
        {
            self.machine.cancel();
            return Err(err);
        }
        Ok(job)
    }

    /// Apply a finished key derivation. The attempt was persisted as charged by
    /// [`submit_pin`](Self::submit_pin), so the follow-up write only resets or refunds and a
    /// failure to make it is logged rather than reported over the verification result.
    pub async fn finish_unlock(&mut self, outcome: UnlockOutcome) -> Result<(), CoreError> {
        let result = self.machine.complete(outcome, self.clock.uptime_ms());
        if result != Err(CoreError::Cancelled)
            && let Err(err) = self
                .store
                .store_attempts(self.machine.attempt_counter())
                .await
        {
            warn!("failure counter not updated after verification: {err}");
        }
        result
    }

    /// Returns whether a verification was in flight.
    pub async fn cancel_unlock(&mut self) -> Result<bool, CoreError> {
        if !self.machine.cancel() {
            return Ok(false);
        }
        self.store
            .store_attempts(self.machine.attempt_counter())
            .await?;
        Ok(true)
    }

    /// Verify `pin` in one go, running the key derivation inline.
    pub async fn unlock(&mut self, pin: &[u8]) -> Result<(), CoreError> {
        let job = self.submit_pin(pin).await?;
        self.finish_unlock(job.run()).await
    }

    pub async fn lock(&mut self, reason: LockReason) -> Result<bool, CoreError> {
        let was_unlocking = self.machine.phase() == UnlockPhase::Unlocking;
        let changed = self.machine.lock(reason);
        if was_unlocking {
            self.store
                .store_attempts(self.machine.attempt_counter())
                .await?;
        }
        Ok(changed)
    }

    /// Emergency lock on brown-out or sleep. The clock checkpoint is best effort.
    pub async fn power_event(&mut self) -> Result<bool, CoreError> {
        let changed = self.lock(LockReason::PowerEvent).await?;
        if let Err(err) = self.checkpoint_clock().await {
            warn!("clock checkpoint on power event failed: {err}");
        }
        Ok(changed)
    }

    /// Advance the monotonic clock and enforce the inactivity timeout.
    pub fn tick(&mut self, delta_ticks: u64) -> Option<LockReason> {
        self.clock.tick(delta_ticks);
        self.machine.tick(self.clock.uptime_ms())
    }

    pub fn advance_to(&mut self, ticks: u64) -> Option<LockReason> {
        self.clock.advance_to(ticks);
        self.machine.tick(self.clock.uptime_ms())
    }

    /// Called by the NTP collaborator with the current Unix time.
    pub async fn sync_clock(&mut self, epoch_seconds: u64) -> Result<(), CoreError> {
        self.clock.sync(epoch_seconds);
        self.checkpoint_clock().await
    }

    pub async fn checkpoint_clock(&mut self) -> Result<(), CoreError> {
        match self.clock.checkpoint() {
            Some(checkpoint) => self.store.store_checkpoint(checkpoint).await,
            None => Ok(()),
        }
    }

    pub fn now(&self) -> Result<u64, CoreError> {
        self.clock.now()
    }

    pub fn list(&self) -> Result<Vec<SecretName>, CoreError> {
        self.store.list()
    }

    /// Store `record`, stamping `created_at` from the clock when it is unset.
    pub async fn add_secret(
        &mut self,
        mut record: SecretRecord,
        overwrite: bool,
    ) -> Result<(), CoreError> {
        let session = self.machine.session()?;
        if record.created_at == 0 {
            record.created_at = self.clock.now().unwrap_or(0);
        }
        self.store
            .put(session.key(), &mut self.rng, &record, overwrite)
            .await?;
        self.machine.touch(self.clock.uptime_ms());
        info!("secret {} stored", record.name);
        Ok(())
    }

    /// Add a secret given as the base32 string most issuers print, with default parameters.
    pub async fn import_base32(
        &mut self,
        name: &str,
        encoded: &str,
        overwrite: bool,
    ) -> Result<(), CoreError> {
        self.machine.session()?;
        let record = SecretRecord::new(
            SecretName::new(name)?,
            SecretKey::from_base32(encoded)?,
        );
        self.add_secret(record, overwrite).await
    }

    pub async fn remove_secret(&mut self, name: &SecretName) -> Result<(), CoreError> {
        let session = self.machine.session()?;
        self.store.delete(session.key(), name).await?;
        self.machine.touch(self.clock.uptime_ms());
        info!("secret {name} removed");
        Ok(())
    }

    /// Current code of `name`. Fails with `Locked` before the clock is even consulted.
    pub async fn code(&mut self, name: &SecretName) -> Result<TotpCode, CoreError> {
        let session = self.machine.session()?;
        let now = self.clock.now()?;
        let record = self.store.get(session.key(), name).await?;
        let code = vault_core::generate(&record, now)?;
        self.machine.touch(self.clock.uptime_ms());
        Ok(code)
    }

    pub async fn emit(&mut self, name: &SecretName, sink: Sink) -> Result<Emission, CoreError> {
        if sink == Sink::BackupChannel {
            return Err(CoreError::ExportRefused);
        }
        let code = self.code(name).await?;
        self.router.emit(name, &code, sink, &mut self.rng)
    }

    /// Serialized backup of every secret, re-sealed under `transport`.
    pub async fn export_backup(
        &mut self,
        confirmation: ExportConfirmation,
        transport: &TransportKey,
    ) -> Result<Vec<u8>, CoreError> {
        if confirmation != ExportConfirmation::Confirmed {
            info!("backup export declined");
            return Err(CoreError::ExportRefused);
        }
        let session = self.machine.session()?;
        let exported_at = self.clock.now().unwrap_or(0);
        let bundle = self
            .store
            .export(session.key(), transport, &mut self.rng, exported_at)
            .await?;
        self.machine.touch(self.clock.uptime_ms());
        Ok(bundle.to_bytes()?)
    }

    /// Replace all secrets with a backup. Nothing changes unless every entry verifies.
    pub async fn restore_backup(
        &mut self,
        bytes: &[u8],
        transport: &TransportKey,
    ) -> Result<usize, CoreError> {
        let session = self.machine.session()?;
        let bundle = BackupBundle::from_bytes(bytes)?;
        let restored = self
            .store
            .restore(session.key(), transport, &mut self.rng, &bundle)
            .await?;
        self.machine.touch(self.clock.uptime_ms());
        Ok(restored)
    }

    /// Tear down and hand back the storage region. Fails with `Busy` while a
    /// [`store_handle`](Self::store_handle) is still alive.
    pub fn into_region(self) -> Result<R, CoreError> {
        Rc::try_unwrap(self.store)
            .map(SecretStore::into_region)
            .map_err(|_| CoreError::Busy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KdfParams;
    use crate::store::MemoryRegion;
    use futures::executor::block_on;
    use rand_chacha::ChaCha20Rng;
    use rand_core::SeedableRng;

    const PIN: &[u8] = b"2468";

    fn config() -> DeviceConfig {
        DeviceConfig {
            kdf: KdfParams::insecure_for_tests(),
            ..DeviceConfig::firmware_defaults()
        }
    }

    fn boot(region: MemoryRegion) -> Device<MemoryRegion, ChaCha20Rng> {
        block_on(Device::boot(
            config(),
            region,
            NoRtc,
            ChaCha20Rng::from_seed([1u8; 32]),
        ))
        .unwrap()
    }

    fn name(value: &str) -> SecretName {
        SecretName::new(value).unwrap()
    }

    #[test]
    fn boot_rejects_invalid_config() {
        let config = DeviceConfig {
            ticks_per_second: 0,
            ..config()
        };
        let result = block_on(Device::<_, _, NoRtc>::boot(
            config,
            MemoryRegion::new(),
            NoRtc,
            ChaCha20Rng::from_seed([0u8; 32]),
        ));
        assert!(matches!(result, Err(CoreError::Config(_))));
    }

    #[test]
    fn unprovisioned_device_refuses_unlock() {
        let mut device = boot(MemoryRegion::new());
        assert_eq!(block_on(device.unlock(PIN)), Err(CoreError::NotProvisioned));
        assert_eq!(device.lock_view().prompt, "Set a PIN");
    }

    #[test]
    fn provision_opens_session_once() {
        let mut device = boot(MemoryRegion::new());
        block_on(device.provision(PIN)).unwrap();
        assert_eq!(device.phase(), UnlockPhase::Unlocked);
        assert_eq!(
            block_on(device.provision(PIN)),
            Err(CoreError::AlreadyProvisioned)
        );
    }

    #[test]
    fn codes_require_session_then_clock() {
        let mut device = boot(MemoryRegion::new());
        block_on(device.provision(PIN)).unwrap();
        block_on(device.import_base32("mail", "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ", false)).unwrap();

        assert_eq!(
            block_on(device.code(&name("mail"))),
            Err(CoreError::ClockUnsynced)
        );

        block_on(device.lock(LockReason::Manual)).unwrap();
        assert_eq!(block_on(device.code(&name("mail"))), Err(CoreError::Locked));

        block_on(device.sync_clock(59)).unwrap();
        block_on(device.unlock(PIN)).unwrap();
        assert_eq!(block_on(device.code(&name("mail"))).unwrap().code, "287082");
    }

    #[test]
    fn failure_counter_survives_reboot() {
        let mut device = boot(MemoryRegion::new());
        block_on(device.provision(PIN)).unwrap();
        block_on(device.lock(LockReason::Manual)).unwrap();
        assert!(block_on(device.unlock(b"0000")).is_err());

        let device = boot(device.into_region().unwrap());
        assert_eq!(device.status().remaining_attempts, 9);
    }

    #[test]
    fn interrupted_verification_keeps_charged_attempt() {
        let mut device = boot(MemoryRegion::new());
        block_on(device.provision(PIN)).unwrap();
        block_on(device.lock(LockReason::Manual)).unwrap();

        let job = block_on(device.submit_pin(PIN)).unwrap();
        drop(job);
        let device = boot(device.into_region().unwrap());
        assert_eq!(device.status().remaining_attempts, 9);
    }

    #[test]
    fn counter_write_failure_after_correct_pin_still_unlocks() {
        let mut device = boot(MemoryRegion::new());
        block_on(device.provision(PIN)).unwrap();
        block_on(device.lock(LockReason::Manual)).unwrap();

        // The charge is written, the reset after verification is not.
        let mut region = device.into_region().unwrap();
        region.cut_power_after_writes(1);
        let mut device = boot(region);
        assert_eq!(block_on(device.unlock(PIN)), Ok(()));
        assert_eq!(device.phase(), UnlockPhase::Unlocked);
        assert!(device.list().is_ok());

        let mut region = device.into_region().unwrap();
        region.restore_power();
        let device = boot(region);
        assert_eq!(device.status().remaining_attempts, 9);
    }

    #[test]
    fn removal_requires_an_unlocked_session() {
        let mut device = boot(MemoryRegion::new());
        block_on(device.provision(PIN)).unwrap();
        block_on(device.import_base32("mail", "JBSWY3DPEHPK3PXP", false)).unwrap();
        block_on(device.lock(LockReason::Manual)).unwrap();

        assert_eq!(
            block_on(device.remove_secret(&name("mail"))),
            Err(CoreError::Locked)
        );
        assert_eq!(device.list().unwrap(), vec![name("mail")]);
    }

    #[test]
    fn change_pin_keeps_secrets() {
        let mut device = boot(MemoryRegion::new());
        block_on(device.provision(PIN)).unwrap();
        block_on(device.import_base32("mail", "JBSWY3DPEHPK3PXP", false)).unwrap();
        block_on(device.change_pin(b"1357")).unwrap();
        block_on(device.lock(LockReason::Manual)).unwrap();

        assert!(matches!(
            block_on(device.unlock(PIN)),
            Err(CoreError::WrongPin { .. })
        ));
        block_on(device.unlock(b"1357")).unwrap();
        block_on(device.sync_clock(1_000)).unwrap();
        assert!(block_on(device.code(&name("mail"))).is_ok());
    }

    #[test]
    fn clock_stamps_records_and_backups() {
        let mut device = boot(MemoryRegion::new());
        block_on(device.provision(PIN)).unwrap();
        block_on(device.sync_clock(1_700_000_000)).unwrap();
        block_on(device.import_base32("mail", "JBSWY3DPEHPK3PXP", false)).unwrap();

        let session = device.machine.session().unwrap();
        let stored = block_on(device.store.get(session.key(), &name("mail"))).unwrap();
        assert_eq!(stored.created_at, 1_700_000_000);

        let bytes = block_on(
            device.export_backup(ExportConfirmation::Confirmed, &TransportKey::new([7; 32])),
        )
        .unwrap();
        let bundle = BackupBundle::from_bytes(&bytes).unwrap();
        assert_eq!(bundle.exported_at, 1_700_000_000);
    }

    #[test]
    fn backup_export_needs_confirmation_and_session() {
        let mut device = boot(MemoryRegion::new());
        block_on(device.provision(PIN)).unwrap();
        let transport = TransportKey::new([7; 32]);
        assert_eq!(
            block_on(device.export_backup(ExportConfirmation::Declined, &transport)),
            Err(CoreError::ExportRefused)
        );
        assert_eq!(
            block_on(device.emit(&name("mail"), Sink::BackupChannel)),
            Err(CoreError::ExportRefused)
        );

        block_on(device.lock(LockReason::Manual)).unwrap();
        assert_eq!(
            block_on(device.export_backup(ExportConfirmation::Confirmed, &transport)),
            Err(CoreError::Locked)
        );
    }

    #[test]
    fn wipe_clears_lockout_and_secrets() {
        let mut device = boot(MemoryRegion::new());
        block_on(device.provision(PIN)).unwrap();
        block_on(device.import_base32("mail", "JBSWY3DPEHPK3PXP", false)).unwrap();
        block_on(device.lock(LockReason::Manual)).unwrap();

        let mut elapsed = 0;
        while device.phase() != UnlockPhase::LockedOut {
            elapsed += 1_000_000;
            device.tick(elapsed);
            let _ = block_on(device.unlock(b"0000"));
        }
        assert_eq!(block_on(device.unlock(PIN)), Err(CoreError::LockedOut));

        block_on(device.wipe()).unwrap();
        assert_eq!(device.phase(), UnlockPhase::Locked);
        assert!(device.list().unwrap().is_empty());
        block_on(device.provision(b"9999")).unwrap();
    }
}
