//! CA domain error types.
//!
//! Variants group into the classes callers dispatch on: malformed input
//! (fail fast), policy violations (fail fast, surfaced verbatim),
//! transient infrastructure (retried against another peer), state races
//! (re-read and retry once), and fatal local failures (propagated).

use reef_crypto::CryptoError;

#[derive(Debug, thiserror::Error)]
pub enum CaError {
    // ── Malformed input ─────────────────────────────────────────────
    #[error("invalid PEM: {0}")]
    InvalidPem(String),

    #[error("invalid CSR: {0}")]
    InvalidCsr(String),

    #[error("invalid join token: {0}")]
    InvalidJoinToken(String),

    // ── Policy violations ───────────────────────────────────────────
    #[error("remote CA does not match fingerprint: {0}")]
    RemoteCaMismatch(String),

    #[error("certificate expired or not yet valid: {0}")]
    CertificateExpired(String),

    #[error("disallowed signature algorithm or key size: {0}")]
    DisallowedAlgorithm(String),

    #[error("certificate key mismatch")]
    CertKeyMismatch,

    #[error("certificate signed by unknown authority: {0}")]
    UnknownAuthority(String),

    #[error("chain members share no overlapping validity window")]
    NoValidityOverlap,

    #[error("no signing key available for local signing")]
    NoSigner,

    #[error("certificate is not a CA certificate")]
    NotCaCert,

    // ── Keystore ────────────────────────────────────────────────────
    #[error("invalid KEK")]
    WrongKek,

    #[error("key not found at {0}")]
    KeyNotFound(String),

    #[error("corrupt key material: {0}")]
    CorruptKey(String),

    #[error("key is already in the downgraded format")]
    AlreadyDowngraded,

    #[error("KEK version {new} does not advance past {current}")]
    KekVersionNotMonotonic { current: u64, new: u64 },

    // ── Transient infrastructure ────────────────────────────────────
    #[error("no more peers to try")]
    NoMorePeers,

    #[error("remote peer error: {0}")]
    Remote(String),

    #[error("no external CA URLs configured")]
    NoExternalUrls,

    #[error("external CA response exceeds size ceiling")]
    ExternalResponseTooLarge,

    #[error("external CA request timed out")]
    ExternalTimeout,

    #[error("external CA request failed: {0}")]
    External(String),

    // ── Concurrency / state ─────────────────────────────────────────
    #[error("node {0} is unknown to this peer")]
    NodeUnknown(String),

    #[error("node {0} was deleted from the cluster")]
    NodeDeleted(String),

    #[error("store transaction conflict")]
    StoreConflict,

    #[error("operation cancelled")]
    Cancelled,

    // ── Fatal local ─────────────────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("{0}")]
    Internal(String),
}

impl From<CryptoError> for CaError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::WrongKek => CaError::WrongKek,
            CryptoError::Io(e) => CaError::Io(e),
            other => CaError::CorruptKey(other.to_string()),
        }
    }
}

impl CaError {
    /// Whether a retry against a different peer could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CaError::Remote(_) | CaError::ExternalTimeout | CaError::StoreConflict
        )
    }
}
