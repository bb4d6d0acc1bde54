//! Node-side issuance: join tokens and the request/poll protocol that
//! turns a fresh key pair into a persisted, validated certificate.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rcgen::{CertificateParams, KeyPair};
use tokio_util::sync::CancellationToken;

use crate::api::{CaClient, IssueCertificateRequest, Peer, PeerBroker};
use crate::error::CaError;
use crate::keystore::KeyReadWriter;
use crate::rootca::{validate_cert_chain, IssuerInfo};
use crate::store::{IssuanceState, NodeRole};

/// Join token prefix; a token is `REEF-<v>[-<fips>]-<hash>-<secret>`.
const TOKEN_PREFIX: &str = "REEF";

/// Secret length in random bytes (hex-encoded in the token).
const TOKEN_SECRET_BYTES: usize = 16;

/// Hex sha256 length, as embedded in the token hash segment.
const TOKEN_HASH_LEN: usize = 64;

/// A parsed join token. Version 1 tokens have four segments; version 2
/// adds a FIPS marker segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinToken {
    pub version: u8,
    pub fips: bool,
    /// Hex sha256 of the root bundle this token was minted against.
    pub root_digest_hex: String,
    pub secret: String,
}

impl JoinToken {
    /// Parse and shape-check a token string. Malformed tokens fail
    /// here, before any network round trip.
    pub fn parse(token: &str) -> Result<JoinToken, CaError> {
        let segments: Vec<&str> = token.split('-').collect();
        if segments.first() != Some(&TOKEN_PREFIX) {
            return Err(CaError::InvalidJoinToken("bad prefix".into()));
        }
        let (version, fips, hash, secret) = match (segments.len(), segments.get(1)) {
            (4, Some(&"1")) => (1u8, false, segments[2], segments[3]),
            (5, Some(&"2")) => {
                let fips = match segments[2] {
                    "0" => false,
                    "1" => true,
                    other => {
                        return Err(CaError::InvalidJoinToken(format!(
                            "bad FIPS marker {other:?}"
                        )))
                    }
                };
                (2u8, fips, segments[3], segments[4])
            }
            (_, Some(v @ (&"1" | &"2"))) => {
                return Err(CaError::InvalidJoinToken(format!(
                    "wrong segment count for version {v}"
                )))
            }
            _ => return Err(CaError::InvalidJoinToken("unknown token version".into())),
        };

        if hash.len() != TOKEN_HASH_LEN || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CaError::InvalidJoinToken("bad root digest segment".into()));
        }
        if secret.is_empty() || !secret.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CaError::InvalidJoinToken("bad secret segment".into()));
        }

        Ok(JoinToken {
            version,
            fips,
            root_digest_hex: hash.to_string(),
            secret: secret.to_string(),
        })
    }

    /// Mint a fresh token bound to a root bundle.
    pub fn generate(root_bundle_pem: &[u8], fips: bool) -> JoinToken {
        use rand::RngCore;
        let mut raw = [0u8; TOKEN_SECRET_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut raw);
        JoinToken {
            version: 2,
            fips,
            root_digest_hex: reef_crypto::digest::bundle_digest_hex(root_bundle_pem),
            secret: reef_crypto::encoding::hex_encode(&raw),
        }
    }

    /// Check a downloaded root bundle against the digest this token
    /// was minted for. A mismatch is `RemoteCaMismatch`, distinct from
    /// a malformed token.
    pub fn verify_root(&self, root_bundle_pem: &[u8]) -> Result<(), CaError> {
        let actual = reef_crypto::digest::bundle_digest_hex(root_bundle_pem);
        if !reef_crypto::digest::digests_match(&self.root_digest_hex, &actual) {
            return Err(CaError::RemoteCaMismatch(format!(
                "root bundle digest {actual} does not match token"
            )));
        }
        Ok(())
    }
}

impl std::fmt::Display for JoinToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.version {
            1 => write!(
                f,
                "{TOKEN_PREFIX}-1-{}-{}",
                self.root_digest_hex, self.secret
            ),
            _ => write!(
                f,
                "{TOKEN_PREFIX}-2-{}-{}-{}",
                if self.fips { "1" } else { "0" },
                self.root_digest_hex,
                self.secret
            ),
        }
    }
}

// ── Certificate request protocol ────────────────────────────────────

/// Knobs for one issuance attempt.
#[derive(Debug, Clone)]
pub struct CertificateRequestConfig {
    /// Join token for first contact; `None` for renewals.
    pub token: Option<String>,
    /// Existing node id for renewals.
    pub node_id: Option<String>,
    /// Role to request on renewal; joins get their role from the
    /// token, renewals without one keep their current role.
    pub role: Option<NodeRole>,
    /// Per-RPC deadline before failing over to the next peer.
    pub attempt_timeout: Duration,
    /// Delay between status polls while the request is pending.
    pub poll_interval: Duration,
}

impl Default for CertificateRequestConfig {
    fn default() -> Self {
        Self {
            token: None,
            node_id: None,
            role: None,
            attempt_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Fetch the remote trust bundle and verify it against the token
/// digest before trusting it. First contact only; afterwards the local
/// bundle is authoritative.
pub async fn download_root_ca(
    client: &dyn CaClient,
    broker: &PeerBroker,
    token: &JoinToken,
) -> Result<Vec<u8>, CaError> {
    let mut failures = 0usize;
    loop {
        let peer = broker.remote_peer()?;
        match client.root_ca_certificate(&peer).await {
            Ok(bundle) => {
                token.verify_root(&bundle)?;
                return Ok(bundle);
            }
            Err(e) if e.is_transient() => {
                failures += 1;
                if failures >= broker.len() {
                    return Err(CaError::NoMorePeers);
                }
                tracing::debug!(peer = %peer.addr, error = %e, "trust bundle fetch failed, trying next peer");
            }
            Err(e) => return Err(e),
        }
    }
}

/// Generate a key pair and CSR, submit it, poll until issued, validate
/// the returned chain against `trust_pool`, and persist through the
/// keystore.
///
/// Transport failures and per-attempt timeouts fail over to the next
/// peer and resume polling the same request; `NodeUnknown` from a peer
/// resubmits the CSR; cancellation aborts immediately.
pub async fn request_and_save_new_certificates(
    cancel: &CancellationToken,
    krw: &KeyReadWriter,
    trust_pool: &[u8],
    client: &dyn CaClient,
    broker: &PeerBroker,
    config: &CertificateRequestConfig,
) -> Result<(IssuerInfo, DateTime<Utc>), CaError> {
    // Shape-check the token before spending a round trip on it.
    let token_secret = match &config.token {
        Some(raw) => Some(JoinToken::parse(raw)?.secret),
        None => None,
    };

    let key = KeyPair::generate().map_err(|e| CaError::Certificate(e.to_string()))?;
    let csr = CertificateParams::new(Vec::<String>::new())
        .map_err(|e| CaError::Certificate(e.to_string()))?
        .serialize_request(&key)
        .map_err(|e| CaError::Certificate(e.to_string()))?
        .pem()
        .map_err(|e| CaError::Certificate(e.to_string()))?
        .into_bytes();

    let mut peer = broker.remote_peer()?;
    let mut failures = 0usize;
    let mut node_id = submit(
        cancel, client, &peer, broker, &csr, &token_secret, config, &mut failures,
    )
    .await?;

    loop {
        if cancel.is_cancelled() {
            return Err(CaError::Cancelled);
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => return Err(CaError::Cancelled),
            res = tokio::time::timeout(
                config.attempt_timeout,
                client.certificate_status(&peer, &node_id),
            ) => res,
        };

        match status {
            Ok(Ok(resp)) => {
                failures = 0;
                match resp.state {
                    IssuanceState::Issued => {
                        let chain = validate_cert_chain(trust_pool, &resp.certificate, false)?;
                        let issuer = chain
                            .get(1)
                            .or_else(|| chain.first())
                            .map(|c| IssuerInfo {
                                public_key: c.spki.clone(),
                                subject: c.subject.clone(),
                            })
                            .ok_or_else(|| {
                                CaError::Certificate("issued chain is empty".into())
                            })?;

                        krw.write(&resp.certificate, key.serialize_pem().as_bytes(), None)?;
                        let expiry = crate::rootca::leaf_expiry(&resp.certificate)?;
                        tracing::info!(node_id, expires = %expiry, "obtained and saved certificate");
                        return Ok((issuer, expiry));
                    }
                    IssuanceState::Failed => {
                        return Err(CaError::Remote(resp.err));
                    }
                    IssuanceState::Pending | IssuanceState::Rotate => {
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(CaError::Cancelled),
                            _ = tokio::time::sleep(config.poll_interval) => {}
                        }
                    }
                }
            }
            // This peer lost the request (restart, wrong replica):
            // resubmit rather than poll a node that will never appear.
            Ok(Err(CaError::NodeUnknown(_) | CaError::NodeDeleted(_))) => {
                tracing::info!(node_id, peer = %peer.addr, "peer does not know this request, resubmitting");
                node_id = submit(
                    cancel, client, &peer, broker, &csr, &token_secret, config, &mut failures,
                )
                .await?;
            }
            Ok(Err(e)) if e.is_transient() => {
                peer = next_peer(broker, &mut failures, &e)?;
            }
            Ok(Err(e)) => return Err(e),
            Err(_elapsed) => {
                peer = next_peer(broker, &mut failures, &CaError::ExternalTimeout)?;
            }
        }
    }
}

/// Submit the CSR, failing over across peers on transport errors.
#[allow(clippy::too_many_arguments)]
async fn submit(
    cancel: &CancellationToken,
    client: &dyn CaClient,
    peer: &Peer,
    broker: &PeerBroker,
    csr: &[u8],
    token_secret: &Option<String>,
    config: &CertificateRequestConfig,
    failures: &mut usize,
) -> Result<String, CaError> {
    let mut peer = peer.clone();
    loop {
        if cancel.is_cancelled() {
            return Err(CaError::Cancelled);
        }
        let req = IssueCertificateRequest {
            csr: csr.to_vec(),
            token_secret: token_secret.clone(),
            node_id: config.node_id.clone(),
            role: config.role,
        };
        let res = tokio::select! {
            _ = cancel.cancelled() => return Err(CaError::Cancelled),
            res = tokio::time::timeout(config.attempt_timeout, client.issue_certificate(&peer, req)) => res,
        };
        match res {
            Ok(Ok(resp)) => {
                *failures = 0;
                return Ok(resp.node_id);
            }
            Ok(Err(e)) if e.is_transient() => {
                peer = next_peer(broker, failures, &e)?;
            }
            Ok(Err(e)) => return Err(e),
            Err(_elapsed) => {
                peer = next_peer(broker, failures, &CaError::ExternalTimeout)?;
            }
        }
    }
}

fn next_peer(broker: &PeerBroker, failures: &mut usize, cause: &CaError) -> Result<Peer, CaError> {
    *failures += 1;
    if *failures >= broker.len().max(1) * 2 {
        return Err(CaError::NoMorePeers);
    }
    let peer = broker.remote_peer()?;
    tracing::debug!(peer = %peer.addr, error = %cause, "failing over to next peer");
    Ok(peer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;

    use crate::api::{
        CertificateStatusResponse, IssueCertificateResponse, StoreCaClient, UnlockKeyResponse,
    };
    use crate::paths::CertPaths;
    use crate::rootca::RootCa;
    use crate::store::{
        CertificateStatus, ClusterRecord, JoinTokens, MemStore, StoredRootCa,
    };

    fn tmp_dir(tag: &str) -> std::path::PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .subsec_nanos();
        let dir = std::env::temp_dir().join(format!("reef-issuance-{tag}-{nanos}"));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn krw(tag: &str) -> KeyReadWriter {
        KeyReadWriter::new(
            CertPaths::new(&tmp_dir(tag)),
            None,
            Box::new(crate::keystore::NoopHeaders),
        )
    }

    // ── Token tests ─────────────────────────────────────────────────

    #[test]
    fn token_round_trip_v2() {
        let token = JoinToken::generate(b"ROOT BUNDLE", true);
        let parsed = JoinToken::parse(&token.to_string()).unwrap();
        assert_eq!(parsed, token);
        assert!(parsed.fips);

        parsed.verify_root(b"ROOT BUNDLE").unwrap();
        let err = parsed.verify_root(b"OTHER BUNDLE").unwrap_err();
        assert!(matches!(err, CaError::RemoteCaMismatch(_)));
    }

    #[test]
    fn token_v1_four_segments() {
        let mut token = JoinToken::generate(b"ROOT", false);
        token.version = 1;
        let s = token.to_string();
        assert_eq!(s.split('-').count(), 4);
        let parsed = JoinToken::parse(&s).unwrap();
        assert_eq!(parsed.version, 1);
        assert!(!parsed.fips);
    }

    #[test]
    fn malformed_tokens_rejected_with_invalid_join_token() {
        let good = JoinToken::generate(b"ROOT", false).to_string();
        let cases = [
            "SWMTKN-1-abc-def".to_string(), // wrong prefix
            "REEF-3-abc-def".to_string(),   // unknown version
            "REEF-1-abc".to_string(),       // too few segments for v1
            "REEF-2-0-abc".to_string(),     // too few segments for v2
            format!("{good}-extra"),        // too many segments
        ];
        for case in &cases {
            let err = JoinToken::parse(case).unwrap_err();
            assert!(matches!(err, CaError::InvalidJoinToken(_)), "case {case}");
        }

        // v2 with a bad FIPS marker.
        let v2 = JoinToken::generate(b"ROOT", false).to_string();
        let bad_fips = v2.replacen("-0-", "-x-", 1);
        assert!(matches!(
            JoinToken::parse(&bad_fips).unwrap_err(),
            CaError::InvalidJoinToken(_)
        ));

        // Non-hex digest segment.
        let token = JoinToken {
            version: 1,
            fips: false,
            root_digest_hex: "zz".repeat(32),
            secret: "aa".repeat(16),
        };
        assert!(matches!(
            JoinToken::parse(&token.to_string()).unwrap_err(),
            CaError::InvalidJoinToken(_)
        ));
    }

    // ── Protocol tests ──────────────────────────────────────────────

    /// Signs pending requests in the background so the polling client
    /// has something to converge on.
    fn spawn_signer(store: Arc<MemStore>, root: Arc<RootCa>) {
        tokio::spawn(async move {
            let mut rx = store.subscribe();
            loop {
                {
                    let nodes = store.view(|v| v.nodes());
                    for node in nodes {
                        if node.certificate.status.state != IssuanceState::Pending {
                            continue;
                        }
                        let cert = root
                            .parse_validate_and_sign_csr(
                                &node.certificate.csr,
                                &node.id,
                                "worker",
                                "cluster",
                            )
                            .unwrap();
                        let id = node.id.clone();
                        store
                            .update(move |tx| {
                                let mut n = tx.node(&id).unwrap();
                                n.certificate.status =
                                    CertificateStatus::new(IssuanceState::Issued);
                                n.certificate.certificate = cert.clone();
                                tx.put_node(n);
                                Ok(())
                            })
                            .unwrap();
                    }
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        });
    }

    fn cluster_store(root: &RootCa, worker_secret: &str) -> Arc<MemStore> {
        let store = Arc::new(MemStore::new());
        let cert = root.certs().to_vec();
        let worker_secret = worker_secret.to_string();
        store
            .update(|tx| {
                let mut cluster: ClusterRecord = tx.cluster();
                cluster.root_ca = StoredRootCa {
                    ca_cert: cert.clone(),
                    ca_key: Vec::new(),
                    join_tokens: JoinTokens {
                        worker: worker_secret.clone(),
                        manager: String::new(),
                    },
                    root_rotation: None,
                };
                tx.put_cluster(cluster);
                Ok(())
            })
            .unwrap();
        store
    }

    #[tokio::test]
    async fn join_issue_and_save() {
        let root = Arc::new(RootCa::create("rootCN").unwrap());
        let token = JoinToken::generate(root.certs(), false);
        let store = cluster_store(&root, &token.secret);
        spawn_signer(store.clone(), root.clone());

        let client = StoreCaClient::new(store.clone());
        let broker = PeerBroker::new(vec![Peer {
            id: "m1".into(),
            addr: "local".into(),
        }]);

        // First contact: download and verify the trust bundle.
        let bundle = download_root_ca(&client, &broker, &token).await.unwrap();
        assert_eq!(bundle, root.certs());

        let krw = krw("join");
        let cancel = CancellationToken::new();
        let config = CertificateRequestConfig {
            token: Some(token.to_string()),
            poll_interval: Duration::from_millis(20),
            ..Default::default()
        };

        let (issuer, expiry) = request_and_save_new_certificates(
            &cancel, &krw, &bundle, &client, &broker, &config,
        )
        .await
        .unwrap();

        assert!(expiry > Utc::now());
        assert_eq!(issuer, root.local_issuer_info().unwrap());

        // Key landed on disk and matches the cert.
        let (cert, _key) = krw.read().unwrap();
        validate_cert_chain(&bundle, &cert, false).unwrap();
    }

    #[tokio::test]
    async fn failed_issuance_surfaces_remote_error() {
        let root = Arc::new(RootCa::create("rootCN").unwrap());
        let token = JoinToken::generate(root.certs(), false);
        let store = cluster_store(&root, &token.secret);

        // Failing signer: marks everything Failed.
        {
            let store = store.clone();
            tokio::spawn(async move {
                let mut rx = store.subscribe();
                loop {
                    for node in store.view(|v| v.nodes()) {
                        if node.certificate.status.state == IssuanceState::Pending {
                            store
                                .update(|tx| {
                                    let mut n = tx.node(&node.id).unwrap();
                                    n.certificate.status = CertificateStatus {
                                        state: IssuanceState::Failed,
                                        err: "signer on fire".into(),
                                    };
                                    tx.put_node(n);
                                    Ok(())
                                })
                                .unwrap();
                        }
                    }
                    if rx.changed().await.is_err() {
                        return;
                    }
                }
            });
        }

        let client = StoreCaClient::new(store.clone());
        let broker = PeerBroker::new(vec![Peer {
            id: "m1".into(),
            addr: "local".into(),
        }]);
        let krw = krw("failed");
        let config = CertificateRequestConfig {
            token: Some(token.to_string()),
            poll_interval: Duration::from_millis(20),
            ..Default::default()
        };
        let err = request_and_save_new_certificates(
            &CancellationToken::new(),
            &krw,
            root.certs(),
            &client,
            &broker,
            &config,
        )
        .await
        .unwrap_err();
        match err {
            CaError::Remote(msg) => assert!(msg.contains("signer on fire")),
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn cancellation_aborts_polling() {
        let root = Arc::new(RootCa::create("rootCN").unwrap());
        let token = JoinToken::generate(root.certs(), false);
        // No signer running: request stays Pending forever.
        let store = cluster_store(&root, &token.secret);
        let client = StoreCaClient::new(store);
        let broker = PeerBroker::new(vec![Peer {
            id: "m1".into(),
            addr: "local".into(),
        }]);
        let krw = krw("cancel");
        let config = CertificateRequestConfig {
            token: Some(token.to_string()),
            poll_interval: Duration::from_secs(60),
            ..Default::default()
        };

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            canceller.cancel();
        });

        let err = request_and_save_new_certificates(
            &cancel,
            &krw,
            root.certs(),
            &client,
            &broker,
            &config,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CaError::Cancelled));
    }

    /// Forgets every request: always answers `NodeUnknown` on status,
    /// forcing resubmission, then delegates to the real store client
    /// after `amnesia_polls` attempts.
    struct AmnesiacClient {
        inner: StoreCaClient,
        forgets_left: AtomicUsize,
    }

    #[async_trait]
    impl CaClient for AmnesiacClient {
        async fn issue_certificate(
            &self,
            peer: &Peer,
            req: IssueCertificateRequest,
        ) -> Result<IssueCertificateResponse, CaError> {
            self.inner.issue_certificate(peer, req).await
        }

        async fn certificate_status(
            &self,
            peer: &Peer,
            node_id: &str,
        ) -> Result<CertificateStatusResponse, CaError> {
            if self
                .forgets_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(CaError::NodeUnknown(node_id.to_string()));
            }
            self.inner.certificate_status(peer, node_id).await
        }

        async fn root_ca_certificate(&self, peer: &Peer) -> Result<Vec<u8>, CaError> {
            self.inner.root_ca_certificate(peer).await
        }

        async fn unlock_key(&self, peer: &Peer) -> Result<UnlockKeyResponse, CaError> {
            self.inner.unlock_key(peer).await
        }
    }

    #[tokio::test]
    async fn node_unknown_triggers_resubmit() {
        let root = Arc::new(RootCa::create("rootCN").unwrap());
        let token = JoinToken::generate(root.certs(), false);
        let store = cluster_store(&root, &token.secret);
        spawn_signer(store.clone(), root.clone());

        let client = AmnesiacClient {
            inner: StoreCaClient::new(store.clone()),
            forgets_left: AtomicUsize::new(2),
        };
        let broker = PeerBroker::new(vec![Peer {
            id: "m1".into(),
            addr: "local".into(),
        }]);
        let krw = krw("amnesia");
        let config = CertificateRequestConfig {
            token: Some(token.to_string()),
            poll_interval: Duration::from_millis(20),
            ..Default::default()
        };

        request_and_save_new_certificates(
            &CancellationToken::new(),
            &krw,
            root.certs(),
            &client,
            &broker,
            &config,
        )
        .await
        .unwrap();

        // Each forgotten poll caused a fresh submission.
        assert!(store.view(|v| v.nodes()).len() >= 2);
    }

    #[tokio::test]
    async fn malformed_token_fails_before_any_rpc() {
        let root = RootCa::create("rootCN").unwrap();
        let store = Arc::new(MemStore::new());
        let client = StoreCaClient::new(store);
        // Empty broker: any RPC attempt would fail with NoMorePeers
        // instead of InvalidJoinToken.
        let broker = PeerBroker::new(Vec::new());
        let krw = krw("badtoken");
        let config = CertificateRequestConfig {
            token: Some("REEF-9-bogus".into()),
            ..Default::default()
        };

        let err = request_and_save_new_certificates(
            &CancellationToken::new(),
            &krw,
            root.certs(),
            &client,
            &broker,
            &config,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CaError::InvalidJoinToken(_)));
    }
}
