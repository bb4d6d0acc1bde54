//! Encrypted-at-rest storage for the node's leaf certificate and key.
//!
//! The key file is PEM with metadata headers. When a KEK is configured
//! the PEM contents are the AES-256-GCM ciphertext of the PKCS#8 DER
//! (KDF parameters ride along as headers); without a KEK the DER is
//! stored plaintext. The `kek-version` header is managed here and never
//! delegated, so version tracking survives a misbehaving header plugin.
//!
//! Writes are two-phase: the cert goes to a `.tmp` sibling first, the
//! key is committed atomically, then the cert is renamed into place.
//! `read()` repairs the one crash window this leaves open.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use reef_crypto::kek::{self, EncryptedBlob, KekData};
use reef_crypto::keys;

use crate::error::CaError;
use crate::paths::{self, CertPaths};
use crate::rootca;

/// Header carrying the KEK version. Always written, always preserved.
const KEK_VERSION_HEADER: &str = "kek-version";
/// Headers carrying the AEAD parameters when the key is encrypted.
const SALT_HEADER: &str = "enc-salt";
const NONCE_HEADER: &str = "enc-nonce";
const ALG_HEADER: &str = "enc-alg";
const ALG_VALUE: &str = "aes-256-gcm";

/// Pluggable PEM-header metadata attached to the key block.
///
/// Implementations own every header except the reserved KEK/AEAD ones
/// above. The keystore calls `unmarshal` on read, `marshal` on write,
/// and `update_kek` when the KEK rotates.
pub trait HeaderManager: Send {
    fn unmarshal(&mut self, headers: &[(String, String)], kek: &KekData) -> Result<(), CaError>;
    fn marshal(&self, kek: &KekData) -> Result<Vec<(String, String)>, CaError>;
    fn update_kek(&mut self, old: &KekData, new: &KekData);
}

/// Header manager that attaches no metadata.
#[derive(Debug, Default)]
pub struct NoopHeaders;

impl HeaderManager for NoopHeaders {
    fn unmarshal(&mut self, _headers: &[(String, String)], _kek: &KekData) -> Result<(), CaError> {
        Ok(())
    }

    fn marshal(&self, _kek: &KekData) -> Result<Vec<(String, String)>, CaError> {
        Ok(Vec::new())
    }

    fn update_kek(&mut self, _old: &KekData, _new: &KekData) {}
}

struct KrwState {
    kek: KekData,
    headers: Box<dyn HeaderManager>,
}

/// Reads and writes the node cert + key pair under `CertPaths`.
pub struct KeyReadWriter {
    paths: CertPaths,
    state: Mutex<KrwState>,
}

impl KeyReadWriter {
    pub fn new(paths: CertPaths, kek: Option<KekData>, headers: Box<dyn HeaderManager>) -> Self {
        Self {
            paths,
            state: Mutex::new(KrwState {
                kek: kek.unwrap_or_default(),
                headers,
            }),
        }
    }

    pub fn paths(&self) -> &CertPaths {
        &self.paths
    }

    /// Current KEK data (clone).
    pub fn kek_data(&self) -> KekData {
        self.state.lock().expect("keystore lock poisoned").kek.clone()
    }

    /// Read the committed (cert, key) pair, decrypting the key.
    ///
    /// Returns plaintext PEM for both. Recovers or discards a leftover
    /// `.tmp` cert from an interrupted `write()`.
    pub fn read(&self) -> Result<(Vec<u8>, Vec<u8>), CaError> {
        let mut state = self.state.lock().expect("keystore lock poisoned");

        let raw = read_file(&self.paths.node_key)?;
        let parsed = parse_key_pem(&raw, &state.kek)?;

        state.kek.version = parsed.kek_version;
        let kek = state.kek.clone();
        state.headers.unmarshal(&parsed.extra_headers, &kek)?;

        let key_pem = plaintext_key_pem(&parsed.tag, &parsed.der);
        let keypair = keys::keypair_from_any_der(&parsed.tag, &parsed.der)
            .map_err(|e| CaError::CorruptKey(e.to_string()))?;
        let key_spki = keypair.public_key_der();

        let cert_pem = self.recover_cert(&key_spki)?;
        Ok((cert_pem, key_pem))
    }

    /// Write a new (cert, key) pair, optionally switching to a new KEK.
    pub fn write(
        &self,
        cert_pem: &[u8],
        key_pem: &[u8],
        new_kek: Option<KekData>,
    ) -> Result<(), CaError> {
        let mut state = self.state.lock().expect("keystore lock poisoned");

        if let Some(kek) = new_kek {
            let old = std::mem::replace(&mut state.kek, kek);
            let new = state.kek.clone();
            state.headers.update_kek(&old, &new);
        }

        let serialized = serialize_key_pem(key_pem, &state.kek, state.headers.as_ref())?;

        // Phase 1: cert to a temp sibling.
        let cert_tmp = tmp_path(&self.paths.node_cert);
        paths::write_cert_file(&cert_tmp, cert_pem)?;

        // Phase 2: commit the key atomically.
        let key_tmp = tmp_path(&self.paths.node_key);
        paths::write_key_file(&key_tmp, &serialized)?;
        std::fs::rename(&key_tmp, &self.paths.node_key)?;

        // Phase 3: move the cert into place.
        std::fs::rename(&cert_tmp, &self.paths.node_cert)?;

        tracing::debug!(
            path = %self.paths.node_key.display(),
            kek_version = state.kek.version,
            encrypted = state.kek.is_encrypting(),
            "node key written"
        );
        Ok(())
    }

    /// Inspect and mutate the pluggable headers, then rewrite the key file.
    pub fn view_and_update_headers<F>(&self, f: F) -> Result<(), CaError>
    where
        F: FnOnce(&mut dyn HeaderManager, &KekData) -> Result<(), CaError>,
    {
        let mut state = self.state.lock().expect("keystore lock poisoned");
        let kek = state.kek.clone();
        f(state.headers.as_mut(), &kek)?;
        self.rewrite_key(&mut state, &kek)
    }

    /// Rotate the KEK. The new version must strictly increase.
    pub fn view_and_rotate_kek<F>(&self, f: F) -> Result<(), CaError>
    where
        F: FnOnce(&KekData) -> Result<KekData, CaError>,
    {
        let mut state = self.state.lock().expect("keystore lock poisoned");
        let new = f(&state.kek)?;
        if new.version <= state.kek.version {
            return Err(CaError::KekVersionNotMonotonic {
                current: state.kek.version,
                new: new.version,
            });
        }

        let old = std::mem::replace(&mut state.kek, new);
        let new_clone = state.kek.clone();
        state.headers.update_kek(&old, &new_clone);

        if let Err(e) = self.rewrite_key(&mut state, &old) {
            // The file is still under the old KEK; roll the in-memory
            // state back so reads keep working.
            let failed = std::mem::replace(&mut state.kek, old);
            let restored = state.kek.clone();
            state.headers.update_kek(&failed, &restored);
            return Err(e);
        }

        tracing::info!(
            old_version = old.version,
            new_version = state.kek.version,
            "KEK rotated"
        );
        Ok(())
    }

    /// Move the key from the legacy filename to the current one.
    ///
    /// Idempotent: a second call after success changes nothing.
    pub fn migrate(&self) -> Result<(), CaError> {
        if self.paths.node_key.exists() {
            return Ok(());
        }
        if self.paths.legacy_node_key.exists() {
            std::fs::rename(&self.paths.legacy_node_key, &self.paths.node_key)?;
            tracing::info!(
                from = %self.paths.legacy_node_key.display(),
                to = %self.paths.node_key.display(),
                "node key migrated to current location"
            );
        }
        Ok(())
    }

    /// Downgrade the on-disk key from PKCS#8 to SEC1.
    ///
    /// Fails with [`CaError::AlreadyDowngraded`] when the key already
    /// carries the `EC PRIVATE KEY` tag.
    pub fn downgrade_key(&self) -> Result<(), CaError> {
        let mut state = self.state.lock().expect("keystore lock poisoned");

        let raw = read_file(&self.paths.node_key)?;
        let parsed = parse_key_pem(&raw, &state.kek)?;
        if parsed.tag == keys::SEC1_TAG {
            return Err(CaError::AlreadyDowngraded);
        }

        state.kek.version = parsed.kek_version;

        let sec1 = keys::pkcs8_der_to_sec1_der(&parsed.der)
            .map_err(|e| CaError::CorruptKey(e.to_string()))?;
        let plain = plaintext_key_pem(keys::SEC1_TAG, &sec1);
        let serialized = serialize_key_pem(&plain, &state.kek, state.headers.as_ref())?;
        atomic_write_key(&self.paths.node_key, &serialized)
    }

    /// Re-serialize the key file in place from its current contents.
    ///
    /// `decrypt_kek` is the KEK the on-disk file was written under; after
    /// a rotation that differs from `state.kek`.
    fn rewrite_key(&self, state: &mut KrwState, decrypt_kek: &KekData) -> Result<(), CaError> {
        let raw = read_file(&self.paths.node_key)?;
        let on_disk = pem::parse(&raw).map_err(|e| CaError::CorruptKey(e.to_string()))?;
        let tag = on_disk.tag().to_string();
        let der = decrypt_contents(&on_disk, decrypt_kek)?;

        let plain = plaintext_key_pem(&tag, &der);
        let serialized = serialize_key_pem(&plain, &state.kek, state.headers.as_ref())?;
        atomic_write_key(&self.paths.node_key, &serialized)
    }

    /// Return a usable cert for the committed key, repairing tmp leftovers.
    fn recover_cert(&self, key_spki: &[u8]) -> Result<Vec<u8>, CaError> {
        let cert_tmp = tmp_path(&self.paths.node_cert);

        match read_file(&self.paths.node_cert) {
            Ok(cert) if cert_matches_key(&cert, key_spki) => {
                // Committed pair is consistent; a stale tmp is garbage.
                let _ = std::fs::remove_file(&cert_tmp);
                return Ok(cert);
            }
            Ok(committed) => {
                // Committed cert does not match the key. Either the tmp
                // cert completes an interrupted write, or the store is
                // genuinely inconsistent.
                if let Ok(tmp) = read_file(&cert_tmp) {
                    if cert_matches_key(&tmp, key_spki) {
                        std::fs::rename(&cert_tmp, &self.paths.node_cert)?;
                        tracing::warn!(
                            path = %self.paths.node_cert.display(),
                            "recovered certificate from interrupted write"
                        );
                        return Ok(tmp);
                    }
                    let _ = std::fs::remove_file(&cert_tmp);
                }
                let _ = committed;
                Err(CaError::CertKeyMismatch)
            }
            Err(CaError::KeyNotFound(_)) => {
                if let Ok(tmp) = read_file(&cert_tmp) {
                    if cert_matches_key(&tmp, key_spki) {
                        std::fs::rename(&cert_tmp, &self.paths.node_cert)?;
                        return Ok(tmp);
                    }
                    let _ = std::fs::remove_file(&cert_tmp);
                }
                Err(CaError::KeyNotFound(
                    self.paths.node_cert.display().to_string(),
                ))
            }
            Err(e) => Err(e),
        }
    }
}

// ── PEM (de)serialization ───────────────────────────────────────────

struct ParsedKey {
    tag: String,
    der: Vec<u8>,
    kek_version: u64,
    extra_headers: Vec<(String, String)>,
}

fn parse_key_pem(raw: &[u8], kek: &KekData) -> Result<ParsedKey, CaError> {
    let block = pem::parse(raw).map_err(|e| CaError::CorruptKey(e.to_string()))?;

    let kek_version = block
        .headers()
        .get(KEK_VERSION_HEADER)
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);

    let extra_headers: Vec<(String, String)> = block
        .headers()
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .filter(|(k, _)| {
            k != KEK_VERSION_HEADER && k != SALT_HEADER && k != NONCE_HEADER && k != ALG_HEADER
        })
        .collect();

    let der = decrypt_contents(&block, kek)?;

    Ok(ParsedKey {
        tag: block.tag().to_string(),
        der,
        kek_version,
        extra_headers,
    })
}

/// Decrypt the PEM contents according to the AEAD headers and the KEK.
///
/// An encrypted block without a KEK, or a plaintext block while a KEK is
/// configured, is reported as [`CaError::WrongKek`] — the stored material
/// and the configured KEK disagree.
fn decrypt_contents(block: &pem::Pem, kek: &KekData) -> Result<Vec<u8>, CaError> {
    let salt = block.headers().get(SALT_HEADER);
    let nonce = block.headers().get(NONCE_HEADER);

    match (salt, nonce, kek.is_encrypting()) {
        (Some(salt), Some(nonce), true) => {
            let blob = EncryptedBlob {
                ciphertext: block.contents().to_vec(),
                salt: reef_crypto::encoding::hex_decode(salt).map_err(CaError::CorruptKey)?,
                nonce: reef_crypto::encoding::hex_decode(nonce).map_err(CaError::CorruptKey)?,
            };
            let kek_bytes = kek.kek.as_deref().unwrap_or_default();
            Ok(kek::decrypt(&blob, kek_bytes)?)
        }
        (None, None, false) => Ok(block.contents().to_vec()),
        // Encrypted on disk but no KEK configured, or vice versa.
        _ => Err(CaError::WrongKek),
    }
}

fn serialize_key_pem(
    key_pem: &[u8],
    kek: &KekData,
    headers: &dyn HeaderManager,
) -> Result<Vec<u8>, CaError> {
    let block = pem::parse(key_pem).map_err(|e| CaError::CorruptKey(e.to_string()))?;
    let tag = block.tag().to_string();
    let der = block.contents().to_vec();

    let mut out = if kek.is_encrypting() {
        let kek_bytes = kek.kek.as_deref().unwrap_or_default();
        let blob = kek::encrypt(&der, kek_bytes)?;
        let mut p = pem::Pem::new(tag, blob.ciphertext);
        p.headers_mut().add(ALG_HEADER, ALG_VALUE);
        p.headers_mut()
            .add(SALT_HEADER, &reef_crypto::encoding::hex_encode(&blob.salt));
        p.headers_mut()
            .add(NONCE_HEADER, &reef_crypto::encoding::hex_encode(&blob.nonce));
        p
    } else {
        pem::Pem::new(tag, der)
    };

    out.headers_mut()
        .add(KEK_VERSION_HEADER, &kek.version.to_string());
    for (k, v) in headers.marshal(kek)? {
        out.headers_mut().add(&k, &v);
    }

    Ok(encode_lf(&out))
}

fn plaintext_key_pem(tag: &str, der: &[u8]) -> Vec<u8> {
    encode_lf(&pem::Pem::new(tag.to_string(), der.to_vec()))
}

// rcgen emits LF-terminated PEM; keep on-disk material consistent.
fn encode_lf(block: &pem::Pem) -> Vec<u8> {
    pem::encode_config(
        block,
        pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF),
    )
    .into_bytes()
}

// ── Filesystem helpers ──────────────────────────────────────────────

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".tmp");
    PathBuf::from(os)
}

fn read_file(path: &Path) -> Result<Vec<u8>, CaError> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(CaError::KeyNotFound(path.display().to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

fn atomic_write_key(path: &Path, contents: &[u8]) -> Result<(), CaError> {
    let tmp = tmp_path(path);
    paths::write_key_file(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Whether the first cert in `cert_pem` was issued for `key_spki`.
fn cert_matches_key(cert_pem: &[u8], key_spki: &[u8]) -> bool {
    rootca::leaf_public_key_der(cert_pem)
        .map(|spki| spki == key_spki)
        .unwrap_or(false)
}
