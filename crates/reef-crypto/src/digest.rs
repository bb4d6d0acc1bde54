//! Root-bundle digests for trust pinning.
//!
//! The cluster root is identified externally by a digest of the whole
//! PEM bundle — multi-root bundles are verified as a unit, never
//! cert-by-cert. Join tokens bind to this digest.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::encoding::hex_encode;

/// Digest prefix identifying the hash algorithm.
const DIGEST_PREFIX: &str = "sha256:";

/// Compute the content digest of a PEM bundle.
///
/// Returns `"sha256:<hex>"` over the raw bytes of the full bundle.
pub fn bundle_digest(bundle: &[u8]) -> String {
    let hash = Sha256::digest(bundle);
    format!("{DIGEST_PREFIX}{}", hex_encode(&hash))
}

/// The bare hex portion of a bundle digest (used inside join tokens).
pub fn bundle_digest_hex(bundle: &[u8]) -> String {
    let hash = Sha256::digest(bundle);
    hex_encode(&hash)
}

/// Compare two digest strings in constant time.
pub fn digests_match(a: &str, b: &str) -> bool {
    let a_bytes = a.as_bytes();
    let b_bytes = b.as_bytes();

    if a_bytes.len() != b_bytes.len() {
        return false;
    }

    a_bytes.ct_eq(b_bytes).into()
}
