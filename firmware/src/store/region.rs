//! Key/value regions the secret store persists into.
use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::future::Future;
use core::ops::Range;
use core::pin::Pin;
use core::task::{Context, Poll};

use embedded_storage_async::nor_flash::MultiwriteNorFlash;
use sequential_storage::{Error as FlashStorageError, cache::NoCache, erase_all, map};
use zeroize::Zeroizing;

/// Largest item a [`FlashRegion`] reads or writes.
pub const FLASH_SCRATCH_LEN: usize = 2048;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegionError {
    #[error("flash error: {0}")]
    Flash(String),
    #[error("power lost during write")]
    PowerLoss,
    #[error("region is full")]
    Full,
    #[error("item exceeds the scratch buffer")]
    TooLarge,
}

impl<E: core::fmt::Debug> From<FlashStorageError<E>> for RegionError {
    fn from(error: FlashStorageError<E>) -> Self {
        match error {
            FlashStorageError::FullStorage => RegionError::Full,
            FlashStorageError::ItemTooBig | FlashStorageError::BufferTooSmall(_) => {
                RegionError::TooLarge
            }
            other => RegionError::Flash(format!("{other:?}")),
        }
    }
}

/// Persistent map from `u16` keys to byte values.
///
/// A single `write` is atomic: after a power cut the key holds either the old or the new
/// value, never a mix.
#[allow(async_fn_in_trait)]
pub trait Region {
    async fn read(&mut self, key: u16) -> Result<Option<Vec<u8>>, RegionError>;
    async fn write(&mut self, key: u16, value: &[u8]) -> Result<(), RegionError>;
    async fn remove(&mut self, key: u16) -> Result<(), RegionError>;
    async fn erase_all(&mut self) -> Result<(), RegionError>;
}

/// Region backed by a `sequential-storage` map on NOR flash.
pub struct FlashRegion<S> {
    flash: S,
    range: Range<u32>,
    scratch: Zeroizing<Vec<u8>>,
}

impl<S: MultiwriteNorFlash> FlashRegion<S> {
    pub fn new(flash: S, range: Range<u32>) -> Self {
        Self {
            flash,
            range,
            scratch: Zeroizing::new(vec![0u8; FLASH_SCRATCH_LEN]),
        }
    }

    pub fn into_inner(self) -> S {
        self.flash
    }
}

impl<S: MultiwriteNorFlash> Region for FlashRegion<S> {
    async fn read(&mut self, key: u16) -> Result<Option<Vec<u8>>, RegionError> {
        let mut cache = NoCache::new();
        let item = map::fetch_item::<u16, &[u8], _>(
            &mut self.flash,
            self.range.clone(),
            &mut cache,
            self.scratch.as_mut_slice(),
            &key,
        )
        .await?;
        Ok(item.map(<[u8]>::to_vec))
    }

    async fn write(&mut self, key: u16, value: &[u8]) -> Result<(), RegionError> {
        let mut cache = NoCache::new();
        map::store_item(
            &mut self.flash,
            self.range.clone(),
            &mut cache,
            self.scratch.as_mut_slice(),
            &key,
            &value,
        )
        .await?;
        Ok(())
    }

    async fn remove(&mut self, key: u16) -> Result<(), RegionError> {
        let mut cache = NoCache::new();
        map::remove_item::<u16, _>(
            &mut self.flash,
            self.range.clone(),
            &mut cache,
            self.scratch.as_mut_slice(),
            &key,
        )
        .await?;
        Ok(())
    }

    async fn erase_all(&mut self) -> Result<(), RegionError> {
        erase_all(&mut self.flash, self.range.clone()).await?;
        Ok(())
    }
}

/// RAM-backed region for host tests and simulators. Can simulate a power cut after a
/// number of writes and can yield once per write to expose interleavings.
#[derive(Debug, Default)]
pub struct MemoryRegion {
    items: BTreeMap<u16, Vec<u8>>,
    writes_until_power_loss: Option<usize>,
    yield_on_write: bool,
    write_count: usize,
}

impl MemoryRegion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let `writes` more mutations land, then fail every later one with
    /// [`RegionError::PowerLoss`] without applying it.
    pub fn cut_power_after_writes(&mut self, writes: usize) {
        self.writes_until_power_loss = Some(writes);
    }

    pub fn restore_power(&mut self) {
        self.writes_until_power_loss = None;
    }

    pub fn yield_on_write(&mut self, enabled: bool) {
        self.yield_on_write = enabled;
    }

    /// Mutations applied so far.
    pub fn write_count(&self) -> usize {
        self.write_count
    }

    pub fn keys(&self) -> impl Iterator<Item = u16> + '_ {
        self.items.keys().copied()
    }

    /// Overwrite raw bytes, bypassing every invariant. Lets tests corrupt stored data.
    pub fn poke(&mut self, key: u16, value: Vec<u8>) {
        self.items.insert(key, value);
    }

    pub fn peek(&self, key: u16) -> Option<&[u8]> {
        self.items.get(&key).map(Vec::as_slice)
    }

    async fn before_mutation(&mut self) -> Result<(), RegionError> {
        if self.yield_on_write {
            YieldNow::default().await;
        }
        match self.writes_until_power_loss.as_mut() {
            Some(0) => return Err(RegionError::PowerLoss),
            Some(remaining) => *remaining -= 1,
            None => {}
        }
        self.write_count += 1;
        Ok(())
    }
}

impl Region for MemoryRegion {
    async fn read(&mut self, key: u16) -> Result<Option<Vec<u8>>, RegionError> {
        Ok(self.items.get(&key).cloned())
    }

    async fn write(&mut self, key: u16, value: &[u8]) -> Result<(), RegionError> {
        self.before_mutation().await?;
        self.items.insert(key, value.to_vec());
        Ok(())
    }

    async fn remove(&mut self, key: u16) -> Result<(), RegionError> {
        self.before_mutation().await?;
        self.items.remove(&key);
        Ok(())
    }

    async fn erase_all(&mut self) -> Result<(), RegionError> {
        self.before_mutation().await?;
        self.items.clear();
        Ok(())
    }
}

#[derive(Default)]
struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}
