//! KEK (key-encrypting-key) encryption at rest.
//!
//! Node private keys are encrypted under a KEK before writing to disk:
//! Argon2id derives an AES-256 key from the KEK bytes, then AES-256-GCM
//! seals the PKCS#8 DER. An absent or empty KEK means "unencrypted".
//!
//! The KEK carries a version counter that must strictly increase on
//! every rotation; the keystore persists it as a PEM header so version
//! tracking survives even with a misbehaving header plugin.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use argon2::Argon2;
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroize;

use crate::keys::CryptoError;

/// Salt length for Argon2id key derivation.
const SALT_LEN: usize = 16;

/// Nonce length for AES-256-GCM.
const NONCE_LEN: usize = 12;

/// A key-encrypting key and its monotonic version.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KekData {
    /// Raw KEK bytes. `None` or empty means keys are stored in plaintext.
    pub kek: Option<Vec<u8>>,
    /// Strictly increasing on every successful rotation.
    pub version: u64,
}

impl KekData {
    pub fn new(kek: Option<Vec<u8>>, version: u64) -> Self {
        Self { kek, version }
    }

    /// Whether this KEK actually encrypts anything.
    pub fn is_encrypting(&self) -> bool {
        self.kek.as_deref().is_some_and(|k| !k.is_empty())
    }
}

/// Ciphertext plus the KDF/AEAD parameters needed to reverse it.
#[derive(Debug, Clone)]
pub struct EncryptedBlob {
    pub ciphertext: Vec<u8>,
    pub salt: Vec<u8>,
    pub nonce: Vec<u8>,
}

/// Encrypt plaintext under a KEK.
///
/// Fresh salt and nonce are drawn from the OS CSPRNG per call, so
/// encrypting the same plaintext twice never produces equal blobs.
pub fn encrypt(plaintext: &[u8], kek: &[u8]) -> Result<EncryptedBlob, CryptoError> {
    let mut salt = vec![0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);

    let mut nonce_bytes = vec![0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);

    let mut aes_key = derive_aes_key(kek, &salt)?;
    let cipher = Aes256Gcm::new_from_slice(&aes_key)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;
    aes_key.zeroize();

    let nonce_arr: [u8; NONCE_LEN] = nonce_bytes
        .clone()
        .try_into()
        .expect("nonce is always NONCE_LEN bytes");
    let nonce = Nonce::from(nonce_arr);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    Ok(EncryptedBlob {
        ciphertext,
        salt,
        nonce: nonce_bytes,
    })
}

/// Decrypt a blob encrypted with [`encrypt`].
///
/// An AEAD authentication failure maps to [`CryptoError::WrongKek`],
/// distinct from structural errors, so callers can tell "wrong KEK"
/// apart from "corrupt file".
pub fn decrypt(blob: &EncryptedBlob, kek: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut aes_key = derive_aes_key(kek, &blob.salt)?;
    let cipher = Aes256Gcm::new_from_slice(&aes_key)
        .map_err(|e| CryptoError::Decryption(e.to_string()))?;
    aes_key.zeroize();

    let nonce_arr: [u8; NONCE_LEN] = blob
        .nonce
        .clone()
        .try_into()
        .map_err(|_| CryptoError::Decryption("invalid nonce length".into()))?;
    let nonce = Nonce::from(nonce_arr);

    cipher
        .decrypt(&nonce, blob.ciphertext.as_ref())
        .map_err(|_| CryptoError::WrongKek)
}

/// Derive a 256-bit AES key from KEK bytes using Argon2id.
fn derive_aes_key(kek: &[u8], salt: &[u8]) -> Result<[u8; 32], CryptoError> {
    let mut key = [0u8; 32];
    Argon2::default()
        .hash_password_into(kek, salt, &mut key)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(key)
}
