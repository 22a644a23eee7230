//! Persisted layout: fixed keys for singleton records plus a pool of blob slots indexed by
//! the manifest.
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};
use vault_core::{MAX_NAME_LEN, SecretName};

pub const KEY_CREDENTIAL: u16 = 0x0001;
pub const KEY_ATTEMPTS: u16 = 0x0002;
pub const KEY_CLOCK: u16 = 0x0003;
pub const KEY_MANIFEST: u16 = 0x0010;

/// Most secrets the device holds.
pub const MAX_SECRETS: usize = 32;

/// First blob slot key. Twice as many slots as secrets exist so a replacement blob can be
/// written before the old one is released.
pub const SLOT_BASE: u16 = 0x0100;
pub const SLOT_COUNT: u16 = (MAX_SECRETS * 2) as u16;

const MANIFEST_VERSION: u16 = 1;

/// Largest postcard encoding of a manifest: version, generation and entry count varints,
/// then per entry a length-prefixed name and a slot varint.
pub const MANIFEST_MAX_LEN: usize = 3 + 10 + 1 + MAX_SECRETS * (1 + MAX_NAME_LEN + 3);

pub fn slot_keys() -> impl DoubleEndedIterator<Item = u16> {
    SLOT_BASE..SLOT_BASE + SLOT_COUNT
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub name: SecretName,
    pub slot: u16,
}

/// Plaintext index of stored secrets. Writing it is the commit point of every mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u16,
    pub generation: u64,
    entries: Vec<ManifestEntry>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            generation: 0,
            entries: Vec::new(),
        }
    }
}

impl Manifest {
    pub fn is_supported(&self) -> bool {
        self.version == MANIFEST_VERSION
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn slot_of(&self, name: &SecretName) -> Option<u16> {
        self.position(name).ok().map(|index| self.entries[index].slot)
    }

    pub fn contains_slot(&self, slot: u16) -> bool {
        self.entries.iter().any(|entry| entry.slot == slot)
    }

    /// Lowest slot no entry references.
    pub fn free_slot(&self) -> Option<u16> {
        slot_keys().find(|slot| !self.contains_slot(*slot))
    }

    /// Point `name` at `slot`, keeping entries sorted. Returns the slot it replaced.
    pub fn upsert(&mut self, name: SecretName, slot: u16) -> Option<u16> {
        match self.position(&name) {
            Ok(index) => Some(core::mem::replace(&mut self.entries[index].slot, slot)),
            Err(index) => {
                self.entries.insert(index, ManifestEntry { name, slot });
                None
            }
        }
    }

    pub fn remove(&mut self, name: &SecretName) -> Option<u16> {
        self.position(name)
            .ok()
            .map(|index| self.entries.remove(index).slot)
    }

    /// Successor manifest holding `entries`, which need not be sorted.
    pub fn replaced_with(&self, mut entries: Vec<ManifestEntry>) -> Self {
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Self {
            version: MANIFEST_VERSION,
            generation: self.generation.wrapping_add(1),
            entries,
        }
    }

    fn position(&self, name: &SecretName) -> Result<usize, usize> {
        self.entries
            .binary_search_by(|entry| entry.name.cmp(name))
    }
}
