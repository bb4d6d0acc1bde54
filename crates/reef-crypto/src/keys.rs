//! ECDSA P-256 key generation and encoding.
//!
//! Node and CA private keys are ECDSA P-256. Keys are handled as
//! PKCS#8 by default; a one-way downgrade to SEC1 ("EC PRIVATE KEY")
//! exists for consumers that cannot read PKCS#8.

use p256::ecdsa::SigningKey;
use p256::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use p256::SecretKey;
use rand::rngs::OsRng;

/// PEM tag for PKCS#8 private keys.
pub const PKCS8_TAG: &str = "PRIVATE KEY";

/// PEM tag for SEC1 EC private keys (the downgrade target).
pub const SEC1_TAG: &str = "EC PRIVATE KEY";

/// ECDSA P-256 signing key with zeroize-aware encodings.
pub struct NodeKeyPair {
    signing_key: SigningKey,
}

impl NodeKeyPair {
    /// Generate a fresh keypair from the OS CSPRNG.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::random(&mut OsRng),
        }
    }

    /// Access the inner signing key for certificate operations.
    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    /// Parse a keypair from PKCS#8 DER bytes.
    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self, CryptoError> {
        let signing_key = SigningKey::from_pkcs8_der(der)
            .map_err(|e| CryptoError::KeyEncoding(e.to_string()))?;
        Ok(Self { signing_key })
    }

    /// Export the private key in PKCS#8 PEM format.
    /// Caller is responsible for zeroizing the returned string.
    pub fn to_pkcs8_pem(&self) -> Result<zeroize::Zeroizing<String>, CryptoError> {
        self.signing_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| CryptoError::KeyEncoding(e.to_string()))
    }

    /// Export the private key in PKCS#8 DER format.
    pub fn to_pkcs8_der(&self) -> Result<Vec<u8>, CryptoError> {
        let doc = self
            .signing_key
            .to_pkcs8_der()
            .map_err(|e| CryptoError::KeyEncoding(e.to_string()))?;
        Ok(doc.as_bytes().to_vec())
    }

    /// Export the public key as SPKI DER (the issuer-matching identity).
    pub fn public_key_der(&self) -> Vec<u8> {
        self.signing_key
            .verifying_key()
            .to_public_key_der()
            .expect("SPKI encoding of a valid P-256 key cannot fail")
            .as_bytes()
            .to_vec()
    }

    /// Export the public key in PEM format.
    pub fn public_key_pem(&self) -> String {
        self.signing_key
            .verifying_key()
            .to_public_key_pem(LineEnding::LF)
            .expect("SPKI encoding of a valid P-256 key cannot fail")
    }
}

/// Convert a PKCS#8 private key (PEM contents, DER bytes) to SEC1 DER.
///
/// This is the key-format downgrade path. The caller decides whether the
/// input is already SEC1 by inspecting the PEM tag before calling.
pub fn pkcs8_der_to_sec1_der(pkcs8_der: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let secret = SecretKey::from_pkcs8_der(pkcs8_der)
        .map_err(|e| CryptoError::KeyEncoding(e.to_string()))?;
    let sec1 = secret
        .to_sec1_der()
        .map_err(|e| CryptoError::KeyEncoding(e.to_string()))?;
    Ok(sec1.to_vec())
}

/// Parse a private key from either PKCS#8 or SEC1 DER bytes.
pub fn keypair_from_any_der(tag: &str, der: &[u8]) -> Result<NodeKeyPair, CryptoError> {
    match tag {
        PKCS8_TAG => NodeKeyPair::from_pkcs8_der(der),
        SEC1_TAG => {
            let secret = SecretKey::from_sec1_der(der)
                .map_err(|e| CryptoError::KeyEncoding(e.to_string()))?;
            Ok(NodeKeyPair {
                signing_key: SigningKey::from(&secret),
            })
        }
        other => Err(CryptoError::KeyEncoding(format!(
            "unsupported private key PEM tag: {other}"
        ))),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("key encoding: {0}")]
    KeyEncoding(String),
    #[error("encryption: {0}")]
    Encryption(String),
    #[error("invalid KEK")]
    WrongKek,
    #[error("decryption: {0}")]
    Decryption(String),
    #[error("key derivation: {0}")]
    KeyDerivation(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
