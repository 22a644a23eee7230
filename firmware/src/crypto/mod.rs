//! PIN key derivation, the persisted PIN credential, and authenticated encryption of secret
//! records.
//!
//! A random vault key encrypts every record. The PIN never touches a record directly: scrypt
//! stretches it into a key-encryption key that wraps the vault key inside the
//! [`PinCredential`]. Unwrapping is the PIN check, so a wrong PIN surfaces as an AEAD tag
//! failure and rotating the PIN only rewraps one key.
use alloc::vec::Vec;
use core::fmt;
use rand_core::{CryptoRng, RngCore};
use scrypt::{
    Params as ScryptParams,
    errors::{InvalidOutputLen, InvalidParams},
};
use serde::{Deserialize, Serialize};
use vault_core::{BlobCipher, CipherError, EncryptedBlob};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

pub const KEY_LEN: usize = 32;
pub const SALT_LEN: usize = 16;

const SCRYPT_LOG_N: u8 = 14;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;

const CREDENTIAL_VERSION: u16 = 1;
const CREDENTIAL_AAD: &[u8] = b"totp.vault.credential.v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid scrypt parameters")]
    InvalidParameters,
    #[error("invalid scrypt output length")]
    InvalidOutput,
    #[error("authentication failed")]
    Authentication,
    #[error("encryption failure")]
    CryptoFailure,
    #[error("unexpected key length")]
    KeyLength,
    #[error("unsupported credential version {0}")]
    UnsupportedVersion(u16),
}

impl From<InvalidParams> for CryptoError {
    fn from(_: InvalidParams) -> Self {
        CryptoError::InvalidParameters
    }
}

impl From<InvalidOutputLen> for CryptoError {
    fn from(_: InvalidOutputLen) -> Self {
        CryptoError::InvalidOutput
    }
}

impl From<CipherError> for CryptoError {
    fn from(value: CipherError) -> Self {
        match value {
            CipherError::Authentication => CryptoError::Authentication,
            CipherError::InvalidKey => CryptoError::KeyLength,
            CipherError::Encryption => CryptoError::CryptoFailure,
        }
    }
}

/// scrypt cost parameters, persisted next to the salt so a credential stays verifiable
/// after the firmware defaults change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    log_n: u8,
    r: u32,
    p: u32,
}

impl KdfParams {
    pub const fn new(log_n: u8, r: u32, p: u32) -> Self {
        Self { log_n, r, p }
    }

    /// Build-time cost used on the device: 16 MiB of memory per derivation.
    pub const fn firmware() -> Self {
        Self::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P)
    }

    /// Cheap parameters for host tests. Never ship these.
    pub const fn insecure_for_tests() -> Self {
        Self::new(4, 8, 1)
    }

    pub fn validate(&self) -> Result<(), CryptoError> {
        self.to_params().map(|_| ())
    }

    fn to_params(&self) -> Result<ScryptParams, CryptoError> {
        ScryptParams::new(self.log_n, self.r, self.p).map_err(Into::into)
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::firmware()
    }
}

/// Stretch a low-entropy PIN into a 256-bit key. Deliberately slow.
pub fn derive_key(
    pin: &[u8],
    salt: &[u8; SALT_LEN],
    params: &KdfParams,
) -> Result<Zeroizing<[u8; KEY_LEN]>, CryptoError> {
    let params = params.to_params()?;
    let mut derived = Zeroizing::new([0u8; KEY_LEN]);
    scrypt::scrypt(pin, salt, &params, &mut derived[..])?;
    Ok(derived)
}

/// Key material able to seal and open [`EncryptedBlob`]s.
pub trait SealingKey {
    fn cipher(&self) -> BlobCipher;
}

/// Vault key of an unlocked session. Lives only in RAM and zeroizes on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; KEY_LEN]);

impl SessionKey {
    fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let array: [u8; KEY_LEN] = bytes.try_into().map_err(|_| CryptoError::KeyLength)?;
        Ok(Self(array))
    }
}

impl SealingKey for SessionKey {
    fn cipher(&self) -> BlobCipher {
        BlobCipher::chacha20_poly1305(self.0)
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Key shared with the desktop companion for the backup channel.
///
/// How the two ends agree on it is outside the firmware core.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct TransportKey([u8; KEY_LEN]);

impl TransportKey {
    pub const fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }
}

impl SealingKey for TransportKey {
    fn cipher(&self) -> BlobCipher {
        BlobCipher::chacha20_poly1305(self.0)
    }
}

impl fmt::Debug for TransportKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TransportKey(..)")
    }
}

/// PIN-derived key. Only ever wraps the vault key.
struct KeyEncryptionKey(Zeroizing<[u8; KEY_LEN]>);

impl SealingKey for KeyEncryptionKey {
    fn cipher(&self) -> BlobCipher {
        BlobCipher::chacha20_poly1305(*self.0)
    }
}

/// Seal `plaintext` under `key` with a fresh random nonce.
pub fn encrypt<K, R>(
    key: &K,
    rng: &mut R,
    aad: &[u8],
    plaintext: &[u8],
) -> Result<EncryptedBlob, CryptoError>
where
    K: SealingKey + ?Sized,
    R: RngCore + CryptoRng,
{
    let mut nonce = [0u8; 12];
    rng.fill_bytes(&mut nonce);
    key.cipher()
        .seal(nonce, aad, plaintext)
        .map_err(CryptoError::from)
}

/// Open `blob`; any tag mismatch yields [`CryptoError::Authentication`].
pub fn decrypt<K>(key: &K, aad: &[u8], blob: &EncryptedBlob) -> Result<Zeroizing<Vec<u8>>, CryptoError>
where
    K: SealingKey + ?Sized,
{
    key.cipher().open(aad, blob).map_err(CryptoError::from)
}

/// Persisted PIN verifier: salt, KDF cost and the vault key wrapped under the PIN-derived
/// key. The raw PIN is never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinCredential {
    version: u16,
    salt: [u8; SALT_LEN],
    kdf: KdfParams,
    wrapped_key: EncryptedBlob,
}

impl PinCredential {
    /// Create a credential for `pin` around a freshly generated vault key.
    pub fn provision<R: RngCore + CryptoRng>(
        pin: &[u8],
        kdf: KdfParams,
        rng: &mut R,
    ) -> Result<(Self, SessionKey), CryptoError> {
        let vault_key = SessionKey::generate(rng);
        let credential = Self::wrap(&vault_key, pin, kdf, rng)?;
        Ok((credential, vault_key))
    }

    /// Wrap the live vault key under a new PIN. Records stay encrypted as they are.
    pub fn rewrap<R: RngCore + CryptoRng>(
        &self,
        vault_key: &SessionKey,
        new_pin: &[u8],
        rng: &mut R,
    ) -> Result<Self, CryptoError> {
        Self::wrap(vault_key, new_pin, self.kdf, rng)
    }

    /// Run the KDF and unwrap the vault key. A wrong PIN fails with
    /// [`CryptoError::Authentication`].
    pub fn unwrap_key(&self, pin: &[u8]) -> Result<SessionKey, CryptoError> {
        if self.version != CREDENTIAL_VERSION {
            return Err(CryptoError::UnsupportedVersion(self.version));
        }
        let kek = KeyEncryptionKey(derive_key(pin, &self.salt, &self.kdf)?);
        let plaintext = decrypt(&kek, CREDENTIAL_AAD, &self.wrapped_key)?;
        SessionKey::from_slice(&plaintext)
    }

    pub fn kdf(&self) -> KdfParams {
        self.kdf
    }

    fn wrap<R: RngCore + CryptoRng>(
        vault_key: &SessionKey,
        pin: &[u8],
        kdf: KdfParams,
        rng: &mut R,
    ) -> Result<Self, CryptoError> {
        let mut salt = [0u8; SALT_LEN];
        rng.fill_bytes(&mut salt);
        let kek = KeyEncryptionKey(derive_key(pin, &salt, &kdf)?);
        let wrapped_key = encrypt(&kek, rng, CREDENTIAL_AAD, &vault_key.0)?;
        Ok(Self {
            version: CREDENTIAL_VERSION,
            salt,
            kdf,
            wrapped_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha20Rng;
    use rand_core::SeedableRng;

    fn rng() -> ChaCha20Rng {
        ChaCha20Rng::from_seed([7u8; 32])
    }

    fn key_bytes(key: &SessionKey) -> [u8; KEY_LEN] {
        key.0
    }

    #[test]
    fn derivation_depends_on_pin_and_salt() {
        let params = KdfParams::insecure_for_tests();
        let a = derive_key(b"1234", &[1; SALT_LEN], &params).unwrap();
        let b = derive_key(b"1234", &[1; SALT_LEN], &params).unwrap();
        let c = derive_key(b"1235", &[1; SALT_LEN], &params).unwrap();
        let d = derive_key(b"1234", &[2; SALT_LEN], &params).unwrap();

        assert_eq!(*a, *b);
        assert_ne!(*a, *c);
        assert_ne!(*a, *d);
    }

    #[test]
    fn rejects_invalid_scrypt_params() {
        let params = KdfParams::new(1, 0, 0);
        assert_eq!(params.validate(), Err(CryptoError::InvalidParameters));
        assert_eq!(
            derive_key(b"1234", &[0; SALT_LEN], &params).unwrap_err(),
            CryptoError::InvalidParameters
        );
        assert!(KdfParams::firmware().validate().is_ok());
    }

    #[test]
    fn credential_unwraps_with_correct_pin_only() {
        let mut rng = rng();
        let (credential, key) =
            PinCredential::provision(b"123456", KdfParams::insecure_for_tests(), &mut rng)
                .unwrap();

        let unwrapped = credential.unwrap_key(b"123456").unwrap();
        assert_eq!(key_bytes(&unwrapped), key_bytes(&key));

        assert_eq!(
            credential.unwrap_key(b"654321").unwrap_err(),
            CryptoError::Authentication
        );
    }

    #[test]
    fn rewrap_keeps_vault_key_and_retires_old_pin() {
        let mut rng = rng();
        let (credential, key) =
            PinCredential::provision(b"1111", KdfParams::insecure_for_tests(), &mut rng).unwrap();

        let rotated = credential.rewrap(&key, b"2222", &mut rng).unwrap();
        assert_ne!(rotated.salt, credential.salt);
        assert_eq!(
            key_bytes(&rotated.unwrap_key(b"2222").unwrap()),
            key_bytes(&key)
        );
        assert_eq!(
            rotated.unwrap_key(b"1111").unwrap_err(),
            CryptoError::Authentication
        );
    }

    #[test]
    fn credential_survives_postcard_encoding() {
        let mut rng = rng();
        let (credential, _) =
            PinCredential::provision(b"0000", KdfParams::insecure_for_tests(), &mut rng).unwrap();
        let bytes = postcard::to_allocvec(&credential).unwrap();
        let decoded: PinCredential = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, credential);
        assert!(decoded.unwrap_key(b"0000").is_ok());
    }

    #[test]
    fn record_encryption_uses_fresh_nonces() {
        let mut rng = rng();
        let key = SessionKey::generate(&mut rng);

        let first = encrypt(&key, &mut rng, b"aad", b"payload").unwrap();
        let second = encrypt(&key, &mut rng, b"aad", b"payload").unwrap();
        assert_ne!(first.nonce, second.nonce);
        assert_ne!(first.ciphertext, second.ciphertext);

        assert_eq!(decrypt(&key, b"aad", &first).unwrap().as_slice(), b"payload");
    }

    #[test]
    fn flipped_bits_fail_with_authentication_error() {
        let mut rng = rng();
        let key = SessionKey::generate(&mut rng);
        let blob = encrypt(&key, &mut rng, b"aad", b"seed").unwrap();

        for index in 0..blob.ciphertext.len() * 8 {
            let mut tampered = blob.clone();
            tampered.ciphertext[index / 8] ^= 1 << (index % 8);
            assert_eq!(
                decrypt(&key, b"aad", &tampered).unwrap_err(),
                CryptoError::Authentication
            );
        }
        for index in 0..blob.tag.len() * 8 {
            let mut tampered = blob.clone();
            tampered.tag[index / 8] ^= 1 << (index % 8);
            assert!(decrypt(&key, b"aad", &tampered).is_err());
        }
        let mut tampered = blob.clone();
        tampered.nonce[0] ^= 0x80;
        assert_eq!(
            decrypt(&key, b"aad", &tampered).unwrap_err(),
            CryptoError::Authentication
        );
    }

    #[test]
    fn debug_output_hides_keys() {
        let mut rng = rng();
        let key = SessionKey::generate(&mut rng);
        assert_eq!(format!("{key:?}"), "SessionKey(..)");
        assert_eq!(format!("{:?}", TransportKey::new([1; 32])), "TransportKey(..)");
    }
}
