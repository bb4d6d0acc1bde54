//! Root certificate authority: construction, validation, and signing.
//!
//! A `RootCa` is immutable once built. "Updating" the cluster root means
//! constructing a new `RootCa` and swapping the `SharedRootCa` pointer;
//! readers never observe a half-updated bundle.
//!
//! Certificates are issued with `rcgen`; parsing and chain/signature
//! validation go through `x509-parser`.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, TimeZone, Utc};
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};
use serde::{Deserialize, Serialize};
use x509_parser::prelude::{FromDer, X509Certificate};
use x509_parser::public_key::PublicKey;

use crate::error::CaError;
use crate::keystore::KeyReadWriter;

/// Root CA certificate validity.
const ROOT_CA_VALIDITY_YEARS: i64 = 10;

/// Default leaf certificate lifetime.
pub const DEFAULT_LEAF_EXPIRY_DAYS: i64 = 30;

/// Clock-skew grace applied to `not_before` on issued leafs.
const NOT_BEFORE_SKEW_MINUTES: i64 = 5;

/// Uncompressed EC point sizes for the allowed curves (P-256, P-384).
const ALLOWED_EC_POINT_SIZES: [usize; 2] = [65, 97];

/// Minimum RSA modulus size in bits.
const MIN_RSA_BITS: usize = 2048;

/// Identity of a certificate's immediate issuer: the intermediate when
/// one is present, otherwise the root. Cheap to compare, so rotation
/// progress never requires re-validating full chains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuerInfo {
    /// SPKI DER of the issuer's public key.
    pub public_key: Vec<u8>,
    /// DER-encoded subject DN of the issuer.
    pub subject: Vec<u8>,
}

/// Signing material for a CA that can issue certificates locally.
pub struct LocalSigner {
    cert_pem: Vec<u8>,
    key: KeyPair,
    /// rcgen issuer rebuilt from the signing cert, used by `signed_by`.
    issuer_cert: rcgen::Certificate,
}

impl LocalSigner {
    pub fn cert_pem(&self) -> &[u8] {
        &self.cert_pem
    }

    pub fn key_pem(&self) -> String {
        self.key.serialize_pem()
    }
}

/// An immutable root of trust: cert bundle, optional intermediates,
/// optional signer, and the configured leaf lifetime.
pub struct RootCa {
    certs: Vec<u8>,
    intermediates: Vec<u8>,
    signer: Option<LocalSigner>,
    digest: String,
    expiry: Duration,
}

impl std::fmt::Debug for RootCa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootCa")
            .field("digest", &self.digest)
            .field("has_signer", &self.signer.is_some())
            .field("expiry", &self.expiry)
            .finish_non_exhaustive()
    }
}

impl RootCa {
    /// Generate a fresh self-signed root with a years-scale validity.
    pub fn create(cn: &str) -> Result<RootCa, CaError> {
        let key = KeyPair::generate().map_err(|e| CaError::Certificate(e.to_string()))?;

        let mut params = CertificateParams::default();
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, cn);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let not_before = Utc::now();
        let not_after = not_before + Duration::days(ROOT_CA_VALIDITY_YEARS * 365);
        params.not_before = to_offset_datetime(not_before);
        params.not_after = to_offset_datetime(not_after);

        let cert = params
            .self_signed(&key)
            .map_err(|e| CaError::Certificate(e.to_string()))?;
        let cert_pem = cert.pem().into_bytes();

        RootCa::new(
            &cert_pem,
            Some((&cert_pem, key.serialize_pem().as_bytes())),
            Duration::days(DEFAULT_LEAF_EXPIRY_DAYS),
            None,
        )
    }

    /// Build and validate a root of trust from PEM material.
    ///
    /// Validates that the roots decode, are within validity, and use an
    /// allowed algorithm; that the signer (when present) matches its key
    /// and the issuing identity implied by intermediates/roots; and that
    /// intermediates chain to one of the roots.
    pub fn new(
        certs_pem: &[u8],
        signer: Option<(&[u8], &[u8])>,
        expiry: Duration,
        intermediates_pem: Option<&[u8]>,
    ) -> Result<RootCa, CaError> {
        let roots = parse_certs_meta(certs_pem)?;
        if roots.is_empty() {
            return Err(CaError::InvalidPem("no certificates in root bundle".into()));
        }
        let now = Utc::now().timestamp();
        for root in &roots {
            check_validity(root, now)?;
            check_algorithm(root)?;
        }

        let intermediates = intermediates_pem.unwrap_or_default().to_vec();
        let inter_meta = if intermediates.is_empty() {
            Vec::new()
        } else {
            // The intermediate chain must be well-formed, validly dated,
            // and terminate at one of the roots.
            validate_cert_chain(certs_pem, &intermediates, false)?
        };

        let signer = match signer {
            Some((cert_pem, key_pem)) => Some(build_signer(
                cert_pem,
                key_pem,
                &roots,
                &inter_meta,
                now,
            )?),
            None => None,
        };

        Ok(RootCa {
            digest: reef_crypto::digest::bundle_digest(certs_pem),
            certs: certs_pem.to_vec(),
            intermediates,
            signer,
            expiry,
        })
    }

    pub fn certs(&self) -> &[u8] {
        &self.certs
    }

    pub fn intermediates(&self) -> &[u8] {
        &self.intermediates
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    pub fn has_signer(&self) -> bool {
        self.signer.is_some()
    }

    pub fn signer(&self) -> Option<&LocalSigner> {
        self.signer.as_ref()
    }

    /// Parse an untrusted CSR and issue a leaf for it.
    ///
    /// Every requester-supplied subject and SAN field is discarded; the
    /// issued certificate carries only the server-supplied `cn/ou/org`
    /// plus the requester's public key. Fails closed without a signer.
    pub fn parse_validate_and_sign_csr(
        &self,
        csr_pem: &[u8],
        cn: &str,
        ou: &str,
        org: &str,
    ) -> Result<Vec<u8>, CaError> {
        let signer = self.signer.as_ref().ok_or(CaError::NoSigner)?;

        let csr_str =
            std::str::from_utf8(csr_pem).map_err(|e| CaError::InvalidCsr(e.to_string()))?;
        let mut csr = CertificateSigningRequestParams::from_pem(csr_str)
            .map_err(|e| CaError::InvalidCsr(e.to_string()))?;

        // Replace the requester's params wholesale; only the public key
        // survives from the request.
        csr.params = leaf_params(cn, ou, org, self.expiry)?;

        let cert = csr
            .signed_by(&signer.issuer_cert, &signer.key)
            .map_err(|e| CaError::Certificate(e.to_string()))?;

        let mut bundle = cert.pem().into_bytes();
        bundle.extend_from_slice(&self.intermediates);

        tracing::debug!(cn, ou, "signed node CSR");
        Ok(bundle)
    }

    /// Issue a complete (cert bundle, key) pair locally.
    ///
    /// Convenience path used when the signer lives in-process; the
    /// remote path goes through a CSR instead.
    pub fn issue_leaf_pair(
        &self,
        cn: &str,
        ou: &str,
        org: &str,
    ) -> Result<(Vec<u8>, Vec<u8>), CaError> {
        let signer = self.signer.as_ref().ok_or(CaError::NoSigner)?;

        let leaf_key = KeyPair::generate().map_err(|e| CaError::Certificate(e.to_string()))?;
        let params = leaf_params(cn, ou, org, self.expiry)?;
        let cert = params
            .signed_by(&leaf_key, &signer.issuer_cert, &signer.key)
            .map_err(|e| CaError::Certificate(e.to_string()))?;

        let mut bundle = cert.pem().into_bytes();
        bundle.extend_from_slice(&self.intermediates);

        Ok((bundle, leaf_key.serialize_pem().into_bytes()))
    }

    /// Cross-sign another root: an intermediate carrying the other
    /// root's subject and public key, signed by this root.
    ///
    /// The other root must be a CA certificate and must carry its key
    /// pair (a `RootRotation` always does; key-less roots cross-sign
    /// via the external CA instead).
    pub fn cross_sign_ca_certificate(&self, other: &RootCa) -> Result<Vec<u8>, CaError> {
        let signer = self.signer.as_ref().ok_or(CaError::NoSigner)?;
        let other_signer = other.signer.as_ref().ok_or(CaError::NoSigner)?;

        let other_meta = parse_certs_meta(&other.certs)?;
        let first = other_meta
            .first()
            .ok_or_else(|| CaError::InvalidPem("empty root bundle".into()))?;
        if !first.is_ca {
            return Err(CaError::NotCaCert);
        }

        // Rebuild params from the other root so subject, CA flags and
        // validity carry over exactly; sign with *this* root.
        let other_pem =
            std::str::from_utf8(&other.certs).map_err(|e| CaError::InvalidPem(e.to_string()))?;
        let first_block = first_pem_block(other_pem)?;
        let params = CertificateParams::from_ca_cert_pem(&first_block)
            .map_err(|e| CaError::Certificate(e.to_string()))?;

        let cert = params
            .signed_by(&other_signer.key, &signer.issuer_cert, &signer.key)
            .map_err(|e| CaError::Certificate(e.to_string()))?;

        tracing::info!(
            new_root = %reef_crypto::digest::bundle_digest(&other.certs),
            "cross-signed new root under current root"
        );
        Ok(cert.pem().into_bytes())
    }

    /// The issuer identity that leafs issued by this CA will carry.
    pub fn local_issuer_info(&self) -> Result<IssuerInfo, CaError> {
        if !self.intermediates.is_empty() {
            let inter = parse_certs_meta(&self.intermediates)?;
            let first = inter
                .first()
                .ok_or_else(|| CaError::InvalidPem("empty intermediate bundle".into()))?;
            return Ok(IssuerInfo {
                public_key: first.spki.clone(),
                subject: first.subject.clone(),
            });
        }
        if let Some(signer) = &self.signer {
            let meta = parse_certs_meta(&signer.cert_pem)?;
            let first = meta
                .first()
                .ok_or_else(|| CaError::InvalidPem("empty signer cert".into()))?;
            return Ok(IssuerInfo {
                public_key: first.spki.clone(),
                subject: first.subject.clone(),
            });
        }
        let roots = parse_certs_meta(&self.certs)?;
        let first = roots
            .first()
            .ok_or_else(|| CaError::InvalidPem("empty root bundle".into()))?;
        Ok(IssuerInfo {
            public_key: first.spki.clone(),
            subject: first.subject.clone(),
        })
    }

    /// Issuer identity of a leaf bundle (leaf first, optional chain).
    ///
    /// The immediate issuer is the second cert when the bundle carries
    /// one; otherwise the root in this CA's pool that matches the
    /// leaf's issuer DN.
    pub fn issuer_info(&self, leaf_bundle_pem: &[u8]) -> Result<IssuerInfo, CaError> {
        let certs = parse_certs_meta(leaf_bundle_pem)?;
        let leaf = certs
            .first()
            .ok_or_else(|| CaError::InvalidPem("empty certificate bundle".into()))?;

        if let Some(issuer) = certs.get(1) {
            return Ok(IssuerInfo {
                public_key: issuer.spki.clone(),
                subject: issuer.subject.clone(),
            });
        }

        let roots = parse_certs_meta(&self.certs)?;
        roots
            .iter()
            .find(|r| r.subject == leaf.issuer)
            .map(|r| IssuerInfo {
                public_key: r.spki.clone(),
                subject: r.subject.clone(),
            })
            .ok_or_else(|| CaError::UnknownAuthority("issuer not in root pool".into()))
    }

    /// Validate a cert bundle against this CA's root pool.
    pub fn validate_against_pool(
        &self,
        certs_pem: &[u8],
        allow_expired: bool,
    ) -> Result<Vec<CertMeta>, CaError> {
        validate_cert_chain(&self.certs, certs_pem, allow_expired)
    }

    /// Issue a leaf locally and persist it through the keystore.
    ///
    /// Returns the issuer identity and expiry the caller tracks against
    /// root rotation.
    pub fn issue_and_save_new_certificates(
        &self,
        krw: &KeyReadWriter,
        cn: &str,
        ou: &str,
        org: &str,
    ) -> Result<(IssuerInfo, DateTime<Utc>), CaError> {
        let (cert, key) = self.issue_leaf_pair(cn, ou, org)?;
        krw.write(&cert, &key, None)?;

        let expiry = leaf_expiry(&cert)?;
        let issuer = self.issuer_info(&cert)?;
        tracing::info!(cn, ou, expires = %expiry, "issued and saved node certificate");
        Ok((issuer, expiry))
    }
}

/// Shared, atomically-swapped root-of-trust snapshot.
///
/// The lock is held only for the pointer swap; readers clone the `Arc`
/// and work against an immutable snapshot.
#[derive(Clone)]
pub struct SharedRootCa {
    inner: Arc<RwLock<Arc<RootCa>>>,
}

impl SharedRootCa {
    pub fn new(root: RootCa) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(root))),
        }
    }

    /// Current snapshot.
    pub fn get(&self) -> Arc<RootCa> {
        self.inner.read().expect("root lock poisoned").clone()
    }

    /// Replace the root wholesale; returns the previous snapshot.
    pub fn swap(&self, new: RootCa) -> Arc<RootCa> {
        let mut guard = self.inner.write().expect("root lock poisoned");
        std::mem::replace(&mut *guard, Arc::new(new))
    }

    /// Like `swap`, for a snapshot that is already shared.
    pub fn swap_arc(&self, new: &Arc<RootCa>) -> Arc<RootCa> {
        let mut guard = self.inner.write().expect("root lock poisoned");
        std::mem::replace(&mut *guard, new.clone())
    }
}

// ── Parsing and chain validation ────────────────────────────────────

/// Owned facts about one parsed certificate.
#[derive(Debug, Clone)]
pub struct CertMeta {
    pub der: Vec<u8>,
    pub subject: Vec<u8>,
    pub issuer: Vec<u8>,
    pub spki: Vec<u8>,
    pub not_before: i64,
    pub not_after: i64,
    pub is_ca: bool,
}

/// Parse every certificate in a PEM bundle into owned metadata.
pub fn parse_certs_meta(bundle: &[u8]) -> Result<Vec<CertMeta>, CaError> {
    let mut out = Vec::new();
    for block in x509_parser::pem::Pem::iter_from_buffer(bundle) {
        let block = block.map_err(|e| CaError::InvalidPem(e.to_string()))?;
        if block.label != "CERTIFICATE" {
            continue;
        }
        let (_, cert) = X509Certificate::from_der(&block.contents)
            .map_err(|e| CaError::InvalidPem(e.to_string()))?;
        out.push(meta_from(&cert, &block.contents));
    }
    Ok(out)
}

fn meta_from(cert: &X509Certificate<'_>, der: &[u8]) -> CertMeta {
    let is_ca = cert
        .basic_constraints()
        .ok()
        .flatten()
        .map(|bc| bc.value.ca)
        .unwrap_or(false);
    CertMeta {
        der: der.to_vec(),
        subject: cert.subject().as_raw().to_vec(),
        issuer: cert.issuer().as_raw().to_vec(),
        spki: cert.public_key().raw.to_vec(),
        not_before: cert.validity().not_before.timestamp(),
        not_after: cert.validity().not_after.timestamp(),
        is_ca,
    }
}

/// SPKI DER of the first certificate in a PEM bundle.
pub fn leaf_public_key_der(bundle: &[u8]) -> Result<Vec<u8>, CaError> {
    parse_certs_meta(bundle)?
        .into_iter()
        .next()
        .map(|m| m.spki)
        .ok_or_else(|| CaError::InvalidPem("no certificate in bundle".into()))
}

/// Expiry of the first certificate in a PEM bundle.
pub fn leaf_expiry(bundle: &[u8]) -> Result<DateTime<Utc>, CaError> {
    let meta = parse_certs_meta(bundle)?;
    let leaf = meta
        .first()
        .ok_or_else(|| CaError::InvalidPem("no certificate in bundle".into()))?;
    Utc.timestamp_opt(leaf.not_after, 0)
        .single()
        .ok_or_else(|| CaError::Certificate("certificate expiry out of range".into()))
}

/// OU of the first certificate in a PEM bundle, if any.
pub fn leaf_organizational_unit(bundle: &[u8]) -> Result<Option<String>, CaError> {
    let meta = parse_certs_meta(bundle)?;
    let leaf = meta
        .first()
        .ok_or_else(|| CaError::InvalidPem("no certificate in bundle".into()))?;
    let (_, cert) = X509Certificate::from_der(&leaf.der)
        .map_err(|e| CaError::InvalidPem(e.to_string()))?;
    let ou = cert
        .subject()
        .iter_organizational_unit()
        .next()
        .and_then(|ou| ou.as_str().ok())
        .map(|s| s.to_string());
    Ok(ou)
}

/// Validity window of the first certificate in a PEM bundle.
pub fn leaf_validity(bundle: &[u8]) -> Result<(DateTime<Utc>, DateTime<Utc>), CaError> {
    let meta = parse_certs_meta(bundle)?;
    let leaf = meta
        .first()
        .ok_or_else(|| CaError::InvalidPem("no certificate in bundle".into()))?;
    let nb = Utc
        .timestamp_opt(leaf.not_before, 0)
        .single()
        .ok_or_else(|| CaError::Certificate("not_before out of range".into()))?;
    let na = Utc
        .timestamp_opt(leaf.not_after, 0)
        .single()
        .ok_or_else(|| CaError::Certificate("not_after out of range".into()))?;
    Ok((nb, na))
}

/// Build and validate a chain from `certs_pem` against the `pool_pem`
/// trust anchors. Returns the chain leaf-first, anchor last.
///
/// Concatenated certs must already be in chain order; each signature is
/// verified; and all members (anchor included) must share at least one
/// overlapping validity instant even when `allow_expired` waives the
/// "valid right now" requirement.
pub fn validate_cert_chain(
    pool_pem: &[u8],
    certs_pem: &[u8],
    allow_expired: bool,
) -> Result<Vec<CertMeta>, CaError> {
    let pool = parse_certs_meta(pool_pem)?;
    if pool.is_empty() {
        return Err(CaError::InvalidPem("empty trust pool".into()));
    }
    let certs = parse_certs_meta(certs_pem)?;
    if certs.is_empty() {
        return Err(CaError::InvalidPem("no certificates to validate".into()));
    }

    // Concatenated certs must form a chain: each issued by the next.
    for pair in certs.windows(2) {
        if pair[0].issuer != pair[1].subject || !verify_signed_by(&pair[0], &pair[1])? {
            return Err(CaError::UnknownAuthority(
                "concatenated certificates do not form a chain".into(),
            ));
        }
    }

    // The last cert must anchor at the pool: either signed by a pool
    // cert, or itself present in the pool.
    let last = certs.last().expect("chain is non-empty");
    let mut chain = certs.clone();
    let anchored = pool.iter().any(|p| p.der == last.der);
    if !anchored {
        let anchor = pool
            .iter()
            .find(|p| {
                last.issuer == p.subject && verify_signed_by(last, p).unwrap_or(false)
            })
            .ok_or_else(|| {
                CaError::UnknownAuthority("chain does not terminate at a trusted root".into())
            })?;
        chain.push(anchor.clone());
    }

    // Every chain member must have been simultaneously valid at some
    // instant, even in expiry-tolerant mode.
    let overlap_start = chain.iter().map(|c| c.not_before).max().unwrap_or(0);
    let overlap_end = chain.iter().map(|c| c.not_after).min().unwrap_or(0);
    if overlap_start > overlap_end {
        return Err(CaError::NoValidityOverlap);
    }

    if !allow_expired {
        let now = Utc::now().timestamp();
        if now < overlap_start || now > overlap_end {
            return Err(CaError::CertificateExpired(format!(
                "chain valid from {overlap_start} to {overlap_end}"
            )));
        }
    }

    Ok(chain)
}

/// Verify that `child`'s signature was produced by `parent`'s key.
fn verify_signed_by(child: &CertMeta, parent: &CertMeta) -> Result<bool, CaError> {
    let (_, child_cert) = X509Certificate::from_der(&child.der)
        .map_err(|e| CaError::InvalidPem(e.to_string()))?;
    let (_, parent_cert) = X509Certificate::from_der(&parent.der)
        .map_err(|e| CaError::InvalidPem(e.to_string()))?;
    Ok(child_cert
        .verify_signature(Some(parent_cert.public_key()))
        .is_ok())
}

// ── Construction helpers ────────────────────────────────────────────

fn check_validity(meta: &CertMeta, now: i64) -> Result<(), CaError> {
    if now < meta.not_before || now > meta.not_after {
        return Err(CaError::CertificateExpired(format!(
            "valid from {} to {}",
            meta.not_before, meta.not_after
        )));
    }
    Ok(())
}

fn check_algorithm(meta: &CertMeta) -> Result<(), CaError> {
    let (_, cert) = X509Certificate::from_der(&meta.der)
        .map_err(|e| CaError::InvalidPem(e.to_string()))?;
    match cert.public_key().parsed() {
        Ok(PublicKey::EC(point)) => {
            if ALLOWED_EC_POINT_SIZES.contains(&point.data().len()) {
                Ok(())
            } else {
                Err(CaError::DisallowedAlgorithm(format!(
                    "EC point size {} not allowed",
                    point.data().len()
                )))
            }
        }
        Ok(PublicKey::RSA(rsa)) => {
            if rsa.key_size() >= MIN_RSA_BITS {
                Ok(())
            } else {
                Err(CaError::DisallowedAlgorithm(format!(
                    "RSA modulus {} below {MIN_RSA_BITS} bits",
                    rsa.key_size()
                )))
            }
        }
        _ => Err(CaError::DisallowedAlgorithm(
            "unsupported public key type".into(),
        )),
    }
}

fn build_signer(
    cert_pem: &[u8],
    key_pem: &[u8],
    roots: &[CertMeta],
    intermediates: &[CertMeta],
    now: i64,
) -> Result<LocalSigner, CaError> {
    let key_str = std::str::from_utf8(key_pem).map_err(|e| CaError::CorruptKey(e.to_string()))?;
    let key = KeyPair::from_pem(key_str).map_err(|e| CaError::CorruptKey(e.to_string()))?;

    let meta = parse_certs_meta(cert_pem)?;
    let cert_meta = meta
        .first()
        .ok_or_else(|| CaError::InvalidPem("empty signing cert".into()))?;

    if cert_meta.spki != key.public_key_der() {
        return Err(CaError::CertKeyMismatch);
    }
    check_validity(cert_meta, now)?;
    check_algorithm(cert_meta)?;

    // The signer must be the identity leafs will chain through: the
    // first intermediate when intermediates exist, else one of the
    // roots themselves.
    if let Some(first_inter) = intermediates.first() {
        if first_inter.spki != cert_meta.spki {
            return Err(CaError::UnknownAuthority(
                "signer key does not match the intermediate chain".into(),
            ));
        }
    } else if !roots.iter().any(|r| r.spki == cert_meta.spki) {
        return Err(CaError::UnknownAuthority(
            "signer key does not match any root".into(),
        ));
    }

    let cert_str =
        std::str::from_utf8(cert_pem).map_err(|e| CaError::InvalidPem(e.to_string()))?;
    let first_block = first_pem_block(cert_str)?;
    let params = CertificateParams::from_ca_cert_pem(&first_block)
        .map_err(|e| CaError::Certificate(e.to_string()))?;
    let issuer_cert = params
        .self_signed(&key)
        .map_err(|e| CaError::Certificate(e.to_string()))?;

    Ok(LocalSigner {
        cert_pem: cert_pem.to_vec(),
        key,
        issuer_cert,
    })
}

/// Extract the first PEM block from a bundle string.
fn first_pem_block(bundle: &str) -> Result<String, CaError> {
    const END: &str = "-----END CERTIFICATE-----";
    match bundle.find(END) {
        Some(idx) => Ok(bundle[..idx + END.len()].to_string()),
        None => Err(CaError::InvalidPem("no certificate block found".into())),
    }
}

/// Server-controlled leaf params: CN/OU/O subject plus `[cn, ou]` DNS SANs.
fn leaf_params(cn: &str, ou: &str, org: &str, expiry: Duration) -> Result<CertificateParams, CaError> {
    let mut params = CertificateParams::new(vec![cn.to_string(), ou.to_string()])
        .map_err(|e| CaError::Certificate(e.to_string()))?;

    params.distinguished_name = DistinguishedName::new();
    params.distinguished_name.push(DnType::CommonName, cn);
    params
        .distinguished_name
        .push(DnType::OrganizationalUnitName, ou);
    params.distinguished_name.push(DnType::OrganizationName, org);

    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];

    let not_before = Utc::now() - Duration::minutes(NOT_BEFORE_SKEW_MINUTES);
    let not_after = Utc::now() + expiry;
    params.not_before = to_offset_datetime(not_before);
    params.not_after = to_offset_datetime(not_after);

    Ok(params)
}

fn to_offset_datetime(dt: DateTime<Utc>) -> time::OffsetDateTime {
    time::OffsetDateTime::from_unix_timestamp(dt.timestamp())
        .unwrap_or_else(|_| time::OffsetDateTime::now_utc())
}
