//! Reef Crypto — cryptographic utilities for the cluster CA.
//!
//! Provides ECDSA P-256 key management, KEK-based encryption at rest
//! for node private keys, and content digests for root-bundle pinning.

pub mod digest;
pub mod encoding;
pub mod kek;
pub mod keys;

pub use kek::KekData;
pub use keys::CryptoError;
