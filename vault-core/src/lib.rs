//! Secret record model and pure primitives shared between the token firmware and the
//! desktop companion.
//!
//! Records are sealed into [`EncryptedBlob`](model::EncryptedBlob) envelopes with
//! [`BlobCipher`](cipher::BlobCipher) before they reach persistent storage or the backup
//! channel. Shared keys opt into `zeroize` so decrypted buffers are cleared once they drop
//! out of scope.
#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;

pub mod cipher;
pub mod model;
pub mod totp;

pub use cipher::{BlobCipher, CipherError, EnvelopeAlgorithm};
pub use model::{
    BACKUP_AAD, BACKUP_VERSION, BackupBundle, BackupEntry, DEFAULT_PERIOD_SECONDS, EncryptedBlob,
    MAX_NAME_LEN, RECORD_AAD, RecordError, SecretKey, SecretName, SecretRecord, TotpAlgorithm,
    associated_data,
};
pub use totp::{TotpCode, TotpError, generate, hotp};
