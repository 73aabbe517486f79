//! AES-256-GCM encryption and decryption using the `ring` crate.
//!
//! This module provides the core cryptographic primitives for the vault:
//!
//! - **Encryption/decryption**: AES-256-GCM authenticated encryption with a
//!   fresh random 96-bit IV per call. The stored format is
//!   `hex(iv):hex(tag):hex(ciphertext)`.
//! - **Key derivation**: PBKDF2-HMAC-SHA256 over the application secret and
//!   a fixed salt, so every process sharing the secret derives the same key.
//! - **Random generation**: OAuth state tokens from the system CSPRNG.
//! - **Comparison**: constant-time equality via `subtle`.
//!
//! # Security Notes
//!
//! - With a 96-bit random IV the probability of a collision is negligible for
//!   up to ~2^32 encryptions under the same key.
//! - PBKDF2 iteration count is 600,000 (OWASP 2023 for HMAC-SHA256). The key
//!   is derived once per [`Cipher`] and reused for every call.

use std::num::NonZeroU32;

use ring::aead::{
    self, Aad, BoundKey, NONCE_LEN, Nonce, NonceSequence, OpeningKey, SealingKey, UnboundKey,
};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use subtle::ConstantTimeEq;

use crate::error::{Result, VaultError};

/// Length of the AES-256-GCM key in bytes.
pub const KEY_LEN: usize = 32;

/// Length of the AES-256-GCM IV in bytes (96 bits).
pub const IV_LEN: usize = NONCE_LEN;

/// Length of the GCM authentication tag in bytes.
pub const TAG_LEN: usize = 16;

/// Number of random bytes in an OAuth state token (hex doubles it).
pub const STATE_TOKEN_BYTES: usize = 32;

/// PBKDF2 iteration count: 600,000 per OWASP 2023 recommendation for
/// HMAC-SHA256.
pub const PBKDF2_ITERATIONS: u32 = 600_000;

/// Salt mixed into the application secret. Fixed so that the key is stable
/// across restarts and instances.
const KEY_SALT: &[u8] = b"ledgerlink.integrations.credential-vault.v1";

/// Separator between the hex segments of a stored ciphertext.
const SEGMENT_SEPARATOR: char = ':';

static PBKDF2_ALG: pbkdf2::Algorithm = pbkdf2::PBKDF2_HMAC_SHA256;

static AEAD_ALG: &aead::Algorithm = &aead::AES_256_GCM;

// ---------------------------------------------------------------------------
// Nonce handling
// ---------------------------------------------------------------------------

/// A single-use nonce sequence that yields exactly one nonce and then errors.
///
/// `ring` requires a [`NonceSequence`] for sealing and opening keys. Each
/// call builds a fresh key around its own IV, so one nonce is all it needs.
struct SingleNonce(Option<[u8; IV_LEN]>);

impl SingleNonce {
    fn new(bytes: [u8; IV_LEN]) -> Self {
        Self(Some(bytes))
    }
}

impl NonceSequence for SingleNonce {
    fn advance(&mut self) -> std::result::Result<Nonce, ring::error::Unspecified> {
        self.0
            .take()
            .map(Nonce::assume_unique_for_key)
            .ok_or(ring::error::Unspecified)
    }
}

// ---------------------------------------------------------------------------
// Cipher
// ---------------------------------------------------------------------------

/// Symmetric cipher for secrets at rest.
///
/// Holds the derived 256-bit key. Cheap to share behind an `Arc`.
pub struct Cipher {
    key: [u8; KEY_LEN],
    rng: SystemRandom,
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher").field("key", &"<redacted>").finish()
    }
}

impl Cipher {
    /// Derive the vault key from `app_secret` with the full PBKDF2 work
    /// factor.
    ///
    /// This is deliberately slow (hundreds of milliseconds); build one
    /// `Cipher` at startup and share it.
    pub fn new(app_secret: &str) -> Result<Self> {
        let iterations = NonZeroU32::new(PBKDF2_ITERATIONS).ok_or_else(|| {
            VaultError::KeyDerivationFailed {
                reason: "iteration count must be non-zero".into(),
            }
        })?;
        Self::with_iterations(app_secret, iterations)
    }

    /// Derive the vault key with a custom PBKDF2 iteration count.
    ///
    /// Keys derived with different counts are incompatible; use this only
    /// where the full work factor is unaffordable (tests).
    pub fn with_iterations(app_secret: &str, iterations: NonZeroU32) -> Result<Self> {
        if app_secret.is_empty() {
            return Err(VaultError::KeyDerivationFailed {
                reason: "application secret must not be empty".into(),
            });
        }

        let mut key = [0u8; KEY_LEN];
        pbkdf2::derive(
            PBKDF2_ALG,
            iterations,
            KEY_SALT,
            app_secret.as_bytes(),
            &mut key,
        );
        tracing::debug!(iterations = iterations.get(), "derived vault key via PBKDF2");

        Ok(Self::from_key(key))
    }

    /// Build a cipher from raw key bytes.
    pub fn from_key(key: [u8; KEY_LEN]) -> Self {
        Self {
            key,
            rng: SystemRandom::new(),
        }
    }

    /// Encrypt `plaintext`, returning `hex(iv):hex(tag):hex(ciphertext)`.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::EncryptionFailed`] if IV generation or sealing
    /// fails.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut iv = [0u8; IV_LEN];
        self.rng
            .fill(&mut iv)
            .map_err(|_| VaultError::EncryptionFailed {
                reason: "failed to generate random IV".into(),
            })?;

        let unbound = UnboundKey::new(AEAD_ALG, &self.key).map_err(|_| {
            VaultError::EncryptionFailed {
                reason: "failed to create AES-256-GCM key".into(),
            }
        })?;
        let mut sealing_key = SealingKey::new(unbound, SingleNonce::new(iv));

        let mut in_out = plaintext.as_bytes().to_vec();
        let tag = sealing_key
            .seal_in_place_separate_tag(Aad::empty(), &mut in_out)
            .map_err(|_| VaultError::EncryptionFailed {
                reason: "seal_in_place failed".into(),
            })?;

        tracing::trace!(
            plaintext_len = plaintext.len(),
            ciphertext_len = in_out.len(),
            "encrypted secret"
        );

        Ok(format!(
            "{}{SEGMENT_SEPARATOR}{}{SEGMENT_SEPARATOR}{}",
            hex::encode(iv),
            hex::encode(tag.as_ref()),
            hex::encode(&in_out)
        ))
    }

    /// Decrypt a value produced by [`Cipher::encrypt`].
    ///
    /// # Errors
    ///
    /// - [`VaultError::MalformedCiphertext`] if the value is not three hex
    ///   segments of the expected sizes.
    /// - [`VaultError::DecryptionFailed`] if the tag does not verify (wrong
    ///   key or tampered data) or the plaintext is not UTF-8.
    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        let segments: Vec<&str> = encoded.split(SEGMENT_SEPARATOR).collect();
        let [iv_hex, tag_hex, ct_hex] = segments.as_slice() else {
            return Err(VaultError::MalformedCiphertext {
                reason: format!("expected 3 segments, found {}", segments.len()),
            });
        };

        let iv: [u8; IV_LEN] = decode_segment("iv", iv_hex)?
            .try_into()
            .map_err(|v: Vec<u8>| VaultError::MalformedCiphertext {
                reason: format!("iv must be {IV_LEN} bytes, got {}", v.len()),
            })?;
        let tag = decode_segment("tag", tag_hex)?;
        if tag.len() != TAG_LEN {
            return Err(VaultError::MalformedCiphertext {
                reason: format!("tag must be {TAG_LEN} bytes, got {}", tag.len()),
            });
        }
        let mut in_out = decode_segment("ciphertext", ct_hex)?;
        in_out.extend_from_slice(&tag);

        let unbound = UnboundKey::new(AEAD_ALG, &self.key).map_err(|_| {
            VaultError::DecryptionFailed {
                reason: "failed to create AES-256-GCM key".into(),
            }
        })?;
        let mut opening_key = OpeningKey::new(unbound, SingleNonce::new(iv));

        let plaintext = opening_key
            .open_in_place(Aad::empty(), &mut in_out)
            .map_err(|_| VaultError::DecryptionFailed {
                reason: "authentication failed: wrong key or corrupted data".into(),
            })?;

        String::from_utf8(plaintext.to_vec()).map_err(|_| VaultError::DecryptionFailed {
            reason: "plaintext is not valid UTF-8".into(),
        })
    }
}

fn decode_segment(name: &str, segment: &str) -> Result<Vec<u8>> {
    hex::decode(segment).map_err(|e| VaultError::MalformedCiphertext {
        reason: format!("{name} segment is not hex: {e}"),
    })
}

// ---------------------------------------------------------------------------
// Tokens and comparison
// ---------------------------------------------------------------------------

/// Generate a random, hex-encoded OAuth state token (64 characters).
///
/// # Errors
///
/// Returns [`VaultError::Internal`] if the system CSPRNG fails.
pub fn generate_state_token() -> Result<String> {
    let mut buf = [0u8; STATE_TOKEN_BYTES];
    SystemRandom::new()
        .fill(&mut buf)
        .map_err(|_| VaultError::Internal("failed to generate random bytes".into()))?;
    Ok(hex::encode(buf))
}

/// Constant-time equality for raw secrets.
///
/// Inputs of different length compare unequal; the length itself is not
/// treated as secret.
pub fn secure_compare(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
