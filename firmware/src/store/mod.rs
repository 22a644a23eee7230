//! Encrypted-at-rest storage of named TOTP secrets.
//!
//! Every secret lives in its own blob slot. The plaintext [`Manifest`] maps names to slots
//! and rewriting it is the single commit point of a mutation: new blobs are written to
//! unused slots first, the manifest is committed, and only then are replaced slots
//! released. Slots the manifest does not reference are left over from an interrupted
//! mutation and are reclaimed on mount.
//!
//! Mutations are serialized through a non-blocking mutex; a caller arriving while another
//! operation holds the store gets [`CoreError::Busy`].
mod layout;
mod region;

use alloc::vec::Vec;
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::mutex::{Mutex, MutexGuard};
use log::{debug, info, warn};
use rand_core::{CryptoRng, RngCore};
use serde::{Serialize, de::DeserializeOwned};
use vault_core::{
    BACKUP_AAD, BACKUP_VERSION, BackupBundle, BackupEntry, EncryptedBlob, RECORD_AAD,
    SecretName, SecretRecord, associated_data,
};

use crate::clock::ClockCheckpoint;
use crate::crypto::{self, PinCredential, SessionKey, TransportKey};
use crate::error::CoreError;
use crate::unlock::AttemptCounter;

pub use layout::{
    KEY_ATTEMPTS, KEY_CLOCK, KEY_CREDENTIAL, KEY_MANIFEST, MANIFEST_MAX_LEN, MAX_SECRETS,
    Manifest, ManifestEntry, SLOT_BASE, SLOT_COUNT,
};
pub use region::{FLASH_SCRATCH_LEN, FlashRegion, MemoryRegion, Region, RegionError};

// A full manifest and its key must fit the flash scratch buffer.
const _: () = assert!(MANIFEST_MAX_LEN + core::mem::size_of::<u16>() <= FLASH_SCRATCH_LEN);

struct StoreInner<R> {
    region: R,
    manifest: Manifest,
}

pub struct SecretStore<R> {
    inner: Mutex<NoopRawMutex, StoreInner<R>>,
}

impl<R: Region> SecretStore<R> {
    /// Load the manifest and reclaim slots orphaned by an interrupted mutation.
    pub async fn mount(mut region: R) -> Result<Self, CoreError> {
        let manifest = match region.read(KEY_MANIFEST).await? {
            Some(bytes) => {
                let manifest: Manifest = postcard::from_bytes(&bytes)?;
                if !manifest.is_supported() {
                    warn!("unsupported manifest version {}", manifest.version);
                    return Err(CoreError::Corruption);
                }
                manifest
            }
            None => Manifest::default(),
        };

        let mut reclaimed = 0usize;
        for slot in layout::slot_keys() {
            if manifest.contains_slot(slot) {
                continue;
            }
            if region.read(slot).await?.is_some() {
                region.remove(slot).await?;
                reclaimed += 1;
            }
        }
        if reclaimed > 0 {
            info!("reclaimed {reclaimed} orphaned secret slots");
        }
        debug!(
            "store mounted: {} secrets, generation {}",
            manifest.len(),
            manifest.generation
        );

        Ok(Self {
            inner: Mutex::new(StoreInner { region, manifest }),
        })
    }

    pub fn into_region(self) -> R {
        self.inner.into_inner().region
    }

    /// Names in lexicographic order. Names are plaintext metadata, so no session is needed.
    pub fn list(&self) -> Result<Vec<SecretName>, CoreError> {
        let inner = self.lock()?;
        Ok(inner
            .manifest
            .entries()
            .iter()
            .map(|entry| entry.name.clone())
            .collect())
    }

    pub fn len(&self) -> Result<usize, CoreError> {
        Ok(self.lock()?.manifest.len())
    }

    pub fn is_empty(&self) -> Result<bool, CoreError> {
        Ok(self.lock()?.manifest.is_empty())
    }

    /// Decrypt the record stored under `name`.
    pub async fn get(
        &self,
        session: &SessionKey,
        name: &SecretName,
    ) -> Result<SecretRecord, CoreError> {
        let mut inner = self.lock()?;
        let slot = inner.manifest.slot_of(name).ok_or(CoreError::NotFound)?;
        read_record(&mut inner.region, session, name, slot).await
    }

    /// Encrypt and store `record`. Without `overwrite` an existing name is rejected.
    pub async fn put<G>(
        &self,
        session: &SessionKey,
        rng: &mut G,
        record: &SecretRecord,
        overwrite: bool,
    ) -> Result<(), CoreError>
    where
        G: RngCore + CryptoRng,
    {
        record.validate()?;
        let mut inner = self.lock()?;
        let exists = inner.manifest.slot_of(&record.name).is_some();
        if exists && !overwrite {
            return Err(CoreError::DuplicateName);
        }
        if !exists && inner.manifest.len() >= MAX_SECRETS {
            return Err(CoreError::StoreFull);
        }
        let slot = inner.manifest.free_slot().ok_or(CoreError::StoreFull)?;

        let blob = seal_record(session, rng, RECORD_AAD, record)?;
        inner.region.write(slot, &postcard::to_allocvec(&blob)?).await?;

        let mut next = inner.manifest.clone();
        next.generation = next.generation.wrapping_add(1);
        let replaced = next.upsert(record.name.clone(), slot);
        commit(&mut inner, next).await?;
        debug!("stored secret {}", record.name);

        if let Some(old) = replaced {
            release_slot(&mut inner.region, old).await;
        }
        Ok(())
    }

    /// Remove `name`. The session proves the vault is unlocked; the blob is not opened, so
    /// an entry that reads as corrupted can still be removed.
    pub async fn delete(&self, _session: &SessionKey, name: &SecretName) -> Result<(), CoreError> {
        let mut inner = self.lock()?;
        let mut next = inner.manifest.clone();
        let slot = next.remove(name).ok_or(CoreError::NotFound)?;
        next.generation = next.generation.wrapping_add(1);
        commit(&mut inner, next).await?;
        debug!("deleted secret {name}");

        release_slot(&mut inner.region, slot).await;
        Ok(())
    }

    /// Erase the whole region: secrets, credential, counters and checkpoint.
    pub async fn wipe(&self) -> Result<(), CoreError> {
        let mut inner = self.lock()?;
        inner.region.erase_all().await?;
        inner.manifest = Manifest::default();
        warn!("secret store wiped");
        Ok(())
    }

    pub async fn load_credential(&self) -> Result<Option<PinCredential>, CoreError> {
        self.load_singleton(KEY_CREDENTIAL).await
    }

    pub async fn store_credential(&self, credential: &PinCredential) -> Result<(), CoreError> {
        self.store_singleton(KEY_CREDENTIAL, credential).await
    }

    pub async fn load_attempts(&self) -> Result<AttemptCounter, CoreError> {
        Ok(self.load_singleton(KEY_ATTEMPTS).await?.unwrap_or_default())
    }

    pub async fn store_attempts(&self, counter: AttemptCounter) -> Result<(), CoreError> {
        self.store_singleton(KEY_ATTEMPTS, &counter).await
    }

    /// A checkpoint that fails to decode is dropped; it only guards against a stale RTC.
    pub async fn load_checkpoint(&self) -> Result<Option<ClockCheckpoint>, CoreError> {
        match self.load_singleton(KEY_CLOCK).await {
            Err(CoreError::Codec) => {
                warn!("discarding unreadable clock checkpoint");
                Ok(None)
            }
            other => other,
        }
    }

    pub async fn store_checkpoint(&self, checkpoint: ClockCheckpoint) -> Result<(), CoreError> {
        self.store_singleton(KEY_CLOCK, &checkpoint).await
    }

    /// Re-seal every record under `transport` for the backup channel.
    pub async fn export<G>(
        &self,
        session: &SessionKey,
        transport: &TransportKey,
        rng: &mut G,
        exported_at: u64,
    ) -> Result<BackupBundle, CoreError>
    where
        G: RngCore + CryptoRng,
    {
        let mut inner = self.lock()?;
        let entries_meta: Vec<ManifestEntry> = inner.manifest.entries().to_vec();

        let mut entries = Vec::with_capacity(entries_meta.len());
        for entry in entries_meta {
            let record = read_record(&mut inner.region, session, &entry.name, entry.slot).await?;
            let blob = seal_record(transport, rng, BACKUP_AAD, &record)?;
            entries.push(BackupEntry {
                name: entry.name,
                blob,
            });
        }
        info!("exported {} secrets", entries.len());

        Ok(BackupBundle {
            version: BACKUP_VERSION,
            exported_at,
            entries,
        })
    }

    /// Replace the stored secrets with the contents of `bundle`.
    ///
    /// The whole bundle is decrypted and validated before anything is written, and the new
    /// set becomes visible through one manifest commit, so restore is all-or-nothing.
    pub async fn restore<G>(
        &self,
        session: &SessionKey,
        transport: &TransportKey,
        rng: &mut G,
        bundle: &BackupBundle,
    ) -> Result<usize, CoreError>
    where
        G: RngCore + CryptoRng,
    {
        if bundle.version != BACKUP_VERSION {
            warn!("unsupported backup version {}", bundle.version);
            return Err(CoreError::Codec);
        }
        if bundle.entries.len() > MAX_SECRETS {
            return Err(CoreError::StoreFull);
        }

        let mut records: Vec<SecretRecord> = Vec::with_capacity(bundle.entries.len());
        for entry in &bundle.entries {
            let aad = associated_data(BACKUP_AAD, &entry.name);
            let plaintext = crypto::decrypt(transport, &aad, &entry.blob)?;
            let record: SecretRecord = postcard::from_bytes(&plaintext)?;
            record.validate()?;
            if record.name != entry.name {
                return Err(CoreError::Corruption);
            }
            if records.iter().any(|existing| existing.name == record.name) {
                return Err(CoreError::DuplicateName);
            }
            records.push(record);
        }

        let mut inner = self.lock()?;
        let mut free = layout::slot_keys().filter(|slot| !inner.manifest.contains_slot(*slot));
        let mut planned = Vec::with_capacity(records.len());
        for record in &records {
            let slot = free.next().ok_or(CoreError::StoreFull)?;
            planned.push(ManifestEntry {
                name: record.name.clone(),
                slot,
            });
        }
        drop(free);

        for (record, entry) in records.iter().zip(&planned) {
            let blob = seal_record(session, rng, RECORD_AAD, record)?;
            inner
                .region
                .write(entry.slot, &postcard::to_allocvec(&blob)?)
                .await?;
        }

        let retired: Vec<u16> = inner.manifest.entries().iter().map(|e| e.slot).collect();
        let next = inner.manifest.replaced_with(planned);
        commit(&mut inner, next).await?;
        info!("restored {} secrets", records.len());

        for slot in retired {
            release_slot(&mut inner.region, slot).await;
        }
        Ok(records.len())
    }

    fn lock(&self) -> Result<MutexGuard<'_, NoopRawMutex, StoreInner<R>>, CoreError> {
        self.inner.try_lock().map_err(|_| CoreError::Busy)
    }

    async fn load_singleton<T: DeserializeOwned>(&self, key: u16) -> Result<Option<T>, CoreError> {
        let mut inner = self.lock()?;
        match inner.region.read(key).await? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn store_singleton<T: Serialize>(&self, key: u16, value: &T) -> Result<(), CoreError> {
        let encoded = postcard::to_allocvec(value)?;
        let mut inner = self.lock()?;
        inner.region.write(key, &encoded).await?;
        Ok(())
    }
}

fn seal_record<K, G>(
    key: &K,
    rng: &mut G,
    domain: &[u8],
    record: &SecretRecord,
) -> Result<EncryptedBlob, CoreError>
where
    K: crypto::SealingKey,
    G: RngCore + CryptoRng,
{
    let plaintext = zeroize::Zeroizing::new(postcard::to_allocvec(record)?);
    let aad = associated_data(domain, &record.name);
    Ok(crypto::encrypt(key, rng, &aad, &plaintext)?)
}

/// Any failure to produce the record a manifest entry promises is corruption.
async fn read_record<R: Region>(
    region: &mut R,
    session: &SessionKey,
    name: &SecretName,
    slot: u16,
) -> Result<SecretRecord, CoreError> {
    let bytes = region.read(slot).await?.ok_or_else(|| {
        warn!("slot {slot:#06x} for {name} is missing");
        CoreError::Corruption
    })?;
    let blob: EncryptedBlob = postcard::from_bytes(&bytes).map_err(|_| CoreError::Corruption)?;
    let aad = associated_data(RECORD_AAD, name);
    let plaintext = crypto::decrypt(session, &aad, &blob).map_err(|_| {
        warn!("secret {name} failed authentication");
        CoreError::Corruption
    })?;
    let record: SecretRecord =
        postcard::from_bytes(&plaintext).map_err(|_| CoreError::Corruption)?;
    if &record.name != name {
        return Err(CoreError::Corruption);
    }
    Ok(record)
}

async fn commit<R: Region>(inner: &mut StoreInner<R>, next: Manifest) -> Result<(), CoreError> {
    inner
        .region
        .write(KEY_MANIFEST, &postcard::to_allocvec(&next)?)
        .await?;
    inner.manifest = next;
    Ok(())
}

/// Releasing a slot after the commit is best effort; a leftover is reclaimed on mount.
async fn release_slot<R: Region>(region: &mut R, slot: u16) {
    if let Err(err) = region.remove(slot).await {
        warn!("failed to release slot {slot:#06x}: {err}");
    }
}
