use aead::{AeadInPlace, KeyInit, Nonce, Tag};
use aes_gcm::Aes256Gcm;
use alloc::vec::Vec;
use chacha20poly1305::ChaCha20Poly1305;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::model::EncryptedBlob;

const TAG_LEN: usize = 16;

/// Symmetric encryption algorithms supported for record envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeAlgorithm {
    /// ChaCha20-Poly1305 with a 256-bit key.
    ChaCha20Poly1305,
    /// AES-256-GCM with a 256-bit key.
    Aes256Gcm,
}

/// Errors raised while sealing or opening an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CipherError {
    /// The tag did not verify: wrong key, wrong associated data, or tampered bytes.
    #[error("authentication failed")]
    Authentication,
    #[error("invalid key length")]
    InvalidKey,
    #[error("encryption failure")]
    Encryption,
}

/// AEAD envelope used to protect records at rest and in backups.
///
/// Tag verification is delegated to the RustCrypto AEAD implementations, which compare in
/// constant time.
#[derive(Debug, Clone, Zeroize, ZeroizeOnDrop)]
pub struct BlobCipher {
    #[zeroize(skip)]
    algorithm: EnvelopeAlgorithm,
    key: [u8; 32],
}

impl BlobCipher {
    /// Create a cipher using ChaCha20-Poly1305.
    pub const fn chacha20_poly1305(key: [u8; 32]) -> Self {
        Self {
            algorithm: EnvelopeAlgorithm::ChaCha20Poly1305,
            key,
        }
    }

    /// Create a cipher using AES-256-GCM.
    pub const fn aes256_gcm(key: [u8; 32]) -> Self {
        Self {
            algorithm: EnvelopeAlgorithm::Aes256Gcm,
            key,
        }
    }

    /// Encrypt `plaintext` under `nonce`, binding `aad`.
    ///
    /// Callers must never reuse a nonce with the same key.
    pub fn seal(
        &self,
        nonce: [u8; 12],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<EncryptedBlob, CipherError> {
        let mut buffer = plaintext.to_vec();
        let tag = match self.algorithm {
            EnvelopeAlgorithm::ChaCha20Poly1305 => {
                seal_in_place::<ChaCha20Poly1305>(&self.key, &nonce, aad, &mut buffer)?
            }
            EnvelopeAlgorithm::Aes256Gcm => {
                seal_in_place::<Aes256Gcm>(&self.key, &nonce, aad, &mut buffer)?
            }
        };
        Ok(EncryptedBlob {
            nonce,
            ciphertext: buffer,
            tag,
        })
    }

    /// Decrypt `blob`, failing with [`CipherError::Authentication`] on any tag mismatch.
    pub fn open(&self, aad: &[u8], blob: &EncryptedBlob) -> Result<Zeroizing<Vec<u8>>, CipherError> {
        let mut buffer = Zeroizing::new(blob.ciphertext.clone());
        match self.algorithm {
            EnvelopeAlgorithm::ChaCha20Poly1305 => {
                open_in_place::<ChaCha20Poly1305>(&self.key, blob, aad, buffer.as_mut_slice())?
            }
            EnvelopeAlgorithm::Aes256Gcm => {
                open_in_place::<Aes256Gcm>(&self.key, blob, aad, buffer.as_mut_slice())?
            }
        }
        Ok(buffer)
    }

    /// Return the configured algorithm.
    pub const fn algorithm(&self) -> EnvelopeAlgorithm {
        self.algorithm
    }
}

fn seal_in_place<A>(
    key: &[u8; 32],
    nonce: &[u8; 12],
    aad: &[u8],
    buffer: &mut [u8],
) -> Result<[u8; TAG_LEN], CipherError>
where
    A: AeadInPlace + KeyInit,
{
    let cipher = A::new_from_slice(key).map_err(|_| CipherError::InvalidKey)?;
    let tag = cipher
        .encrypt_in_place_detached(Nonce::<A>::from_slice(nonce), aad, buffer)
        .map_err(|_| CipherError::Encryption)?;
    if tag.len() != TAG_LEN {
        return Err(CipherError::Encryption);
    }
    let mut bytes = [0u8; TAG_LEN];
    bytes.copy_from_slice(tag.as_slice());
    Ok(bytes)
}

fn open_in_place<A>(
    key: &[u8; 32],
    blob: &EncryptedBlob,
    aad: &[u8],
    buffer: &mut [u8],
) -> Result<(), CipherError>
where
    A: AeadInPlace + KeyInit,
{
    let cipher = A::new_from_slice(key).map_err(|_| CipherError::InvalidKey)?;
    cipher
        .decrypt_in_place_detached(
            Nonce::<A>::from_slice(&blob.nonce),
            aad,
            buffer,
            Tag::<A>::from_slice(&blob.tag),
        )
        .map_err(|_| CipherError::Authentication)
}
