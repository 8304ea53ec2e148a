//! Cipher collaborator interface
//!
//! The engine consumes authenticated encryption through the [`Cipher`]
//! trait; every data block and index node is sealed independently with its
//! own key/iv and a 16-byte authentication tag (the "mac"). [`RingCipher`]
//! is the production implementation (AES-128-GCM via `ring`); alternative
//! ciphers plug in at engine construction.

use rand::rngs::OsRng;
use rand::RngCore;
use ring::aead;

use crate::error::{Result, VaultError};

// =============================================================================
// Key Material Sizes
// =============================================================================

/// AES-128-GCM key size in bytes
pub const KEY_SIZE: usize = 16;

/// GCM nonce size in bytes
pub const IV_SIZE: usize = 12;

/// GCM authentication tag size in bytes
pub const MAC_SIZE: usize = 16;

pub type Key = [u8; KEY_SIZE];
pub type Iv = [u8; IV_SIZE];
pub type Mac = [u8; MAC_SIZE];

// =============================================================================
// Cipher Trait
// =============================================================================

/// Authenticated encryption as consumed by the engine.
///
/// The `tweak` binds ciphertext to its location (the physical block address
/// for data blocks); decrypting with a different tweak fails authentication.
pub trait Cipher: Send + Sync {
    /// Encrypt `plaintext`, returning ciphertext of identical length and the
    /// authentication tag.
    fn encrypt(&self, plaintext: &[u8], key: &Key, iv: &Iv, tweak: u64) -> Result<(Vec<u8>, Mac)>;

    /// Decrypt and verify; any mismatch of key, iv, tweak, mac, or
    /// ciphertext yields [`VaultError::AuthFailure`].
    fn decrypt(
        &self,
        ciphertext: &[u8],
        key: &Key,
        iv: &Iv,
        tweak: u64,
        mac: &Mac,
    ) -> Result<Vec<u8>>;
}

// =============================================================================
// Production Implementation
// =============================================================================

/// AES-128-GCM cipher backed by `ring`
#[derive(Debug, Default, Clone, Copy)]
pub struct RingCipher;

impl RingCipher {
    pub fn new() -> Self {
        Self
    }

    fn sealing_key(key: &Key) -> Result<aead::LessSafeKey> {
        let unbound = aead::UnboundKey::new(&aead::AES_128_GCM, key)
            .map_err(|_| VaultError::AuthFailure)?;
        Ok(aead::LessSafeKey::new(unbound))
    }
}

impl Cipher for RingCipher {
    fn encrypt(&self, plaintext: &[u8], key: &Key, iv: &Iv, tweak: u64) -> Result<(Vec<u8>, Mac)> {
        let sealing = Self::sealing_key(key)?;
        let nonce = aead::Nonce::assume_unique_for_key(*iv);
        let aad = aead::Aad::from(tweak.to_le_bytes());

        let mut buf = plaintext.to_vec();
        let tag = sealing
            .seal_in_place_separate_tag(nonce, aad, &mut buf)
            .map_err(|_| VaultError::AuthFailure)?;

        let mut mac = [0u8; MAC_SIZE];
        mac.copy_from_slice(tag.as_ref());
        Ok((buf, mac))
    }

    fn decrypt(
        &self,
        ciphertext: &[u8],
        key: &Key,
        iv: &Iv,
        tweak: u64,
        mac: &Mac,
    ) -> Result<Vec<u8>> {
        let opening = Self::sealing_key(key)?;
        let nonce = aead::Nonce::assume_unique_for_key(*iv);
        let aad = aead::Aad::from(tweak.to_le_bytes());

        let mut buf = Vec::with_capacity(ciphertext.len() + MAC_SIZE);
        buf.extend_from_slice(ciphertext);
        buf.extend_from_slice(mac);

        let plaintext = opening
            .open_in_place(nonce, aad, &mut buf)
            .map_err(|_| VaultError::AuthFailure)?;
        Ok(plaintext.to_vec())
    }
}

// =============================================================================
// Key Material Generation
// =============================================================================

/// Generate a fresh random key
pub fn random_key() -> Key {
    let mut key = [0u8; KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    key
}

/// Generate a fresh random iv
pub fn random_iv() -> Iv {
    let mut iv = [0u8; IV_SIZE];
    OsRng.fill_bytes(&mut iv);
    iv
}

// =============================================================================
// Tests
// =============================================================================
