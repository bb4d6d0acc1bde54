//! Manager-side CA: signs pending requests and reconciles root
//! rotations against the cluster store.
//!
//! The loop is level-triggered: every pass re-reads the store and
//! moves it one step closer to the desired state. Transactions that
//! conflict are dropped on the floor and picked up next pass, so any
//! number of concurrent instances converge on the same result.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::CaError;
use crate::external::ExternalCa;
use crate::issuance::JoinToken;
use crate::rootca::{parse_certs_meta, IssuerInfo, RootCa, SharedRootCa};
use crate::store::{
    CertificateStatus, ClusterRecord, IssuanceState, MemStore, RootRotation, StoredRootCa, TlsInfo,
};

/// Upper bound on nodes flagged for rotation in one pass, so a large
/// cluster is not pushed into renewing all at once.
pub const DEFAULT_ROTATION_BATCH_SIZE: usize = 100;

const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct CaServerConfig {
    pub rotation_batch_size: usize,
    pub tick_interval: Duration,
    /// Organization written into every issued leaf.
    pub org: String,
}

impl Default for CaServerConfig {
    fn default() -> Self {
        Self {
            rotation_batch_size: DEFAULT_ROTATION_BATCH_SIZE,
            tick_interval: DEFAULT_TICK_INTERVAL,
            org: "reef".to_string(),
        }
    }
}

struct CachedRoot {
    key: String,
    root: Arc<RootCa>,
}

pub struct CaServer {
    store: Arc<MemStore>,
    shared: SharedRootCa,
    external: Option<Arc<ExternalCa>>,
    config: CaServerConfig,
    cache: Mutex<Option<CachedRoot>>,
}

impl CaServer {
    /// Build a server around an existing cluster store. When the store
    /// has no CA configured yet, `bootstrap` seeds one.
    pub fn new(store: Arc<MemStore>, initial_root: RootCa, config: CaServerConfig) -> Self {
        Self {
            store,
            shared: SharedRootCa::new(initial_root),
            external: None,
            config,
            cache: Mutex::new(None),
        }
    }

    pub fn with_external(mut self, external: Arc<ExternalCa>) -> Self {
        self.external = Some(external);
        self
    }

    /// Create a brand-new cluster CA and commit it to the store,
    /// with join tokens bound to the new bundle.
    pub fn bootstrap(store: &MemStore, cn: &str) -> Result<RootCa, CaError> {
        let root = RootCa::create(cn)?;
        let certs = root.certs().to_vec();
        let key = root
            .signer()
            .map(|s| s.key_pem().into_bytes())
            .unwrap_or_default();
        store.update(|tx| {
            let mut cluster = tx.cluster();
            cluster.root_ca = StoredRootCa {
                ca_cert: certs.clone(),
                ca_key: key.clone(),
                join_tokens: crate::store::JoinTokens {
                    worker: JoinToken::generate(&certs, false).to_string(),
                    manager: JoinToken::generate(&certs, false).to_string(),
                },
                root_rotation: None,
            };
            tx.put_cluster(cluster);
            Ok(())
        })?;
        tracing::info!(cn, digest = %root.digest(), "bootstrapped cluster CA");
        Ok(root)
    }

    /// The current root-of-trust snapshot other components read.
    pub fn shared_root(&self) -> SharedRootCa {
        self.shared.clone()
    }

    /// Begin rotating the cluster to `new_root`, which must carry its
    /// signing key. The new root is cross-signed by the current one
    /// (locally, or via the external CA when the current key is held
    /// externally) and the rotation is attached to the cluster record.
    ///
    /// Starting a rotation while one is in progress supersedes it; the
    /// reconciliation loop re-flags nodes that landed on the stale
    /// target.
    pub async fn start_root_rotation(
        &self,
        cancel: &CancellationToken,
        new_root: &RootCa,
    ) -> Result<(), CaError> {
        let new_signer = new_root.signer().ok_or(CaError::NoSigner)?;
        let cluster = self.store.cluster();
        let current = self.current_signing_root(&cluster)?;

        if let Some(rotation) = &cluster.root_ca.root_rotation {
            if rotation.new_cert == new_root.certs() {
                tracing::debug!("rotation to this root already in progress");
                return Ok(());
            }
        }
        if cluster.root_ca.ca_cert == new_root.certs() {
            return Ok(());
        }

        let cross_signed = if current.has_signer() {
            current.cross_sign_ca_certificate(new_root)?
        } else {
            let external = self.external.as_ref().ok_or(CaError::NoSigner)?;
            external.cross_sign_root(cancel, new_root.certs()).await?
        };

        let rotation = RootRotation {
            old_cert: cluster.root_ca.ca_cert.clone(),
            new_cert: new_root.certs().to_vec(),
            new_key: new_signer.key_pem().into_bytes(),
            cross_signed_cert: cross_signed,
        };

        self.store.update(|tx| {
            let mut cluster = tx.cluster();
            cluster.root_ca.root_rotation = Some(rotation.clone());
            tx.put_cluster(cluster);
            Ok(())
        })?;
        tracing::info!(new_root = %new_root.digest(), "root rotation started");
        Ok(())
    }

    /// Run until cancelled: periodic ticks plus store-change wakeups.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut changes = self.store.subscribe();
        tracing::info!("CA server loop started");
        loop {
            if let Err(e) = self.reconcile_once(&cancel).await {
                tracing::warn!(error = %e, "reconciliation pass failed");
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("CA server loop stopping");
                    return;
                }
                _ = tokio::time::sleep(self.config.tick_interval) => {}
                res = changes.changed() => {
                    if res.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// One reconciliation pass. Public so embedders and tests can
    /// drive the loop at their own cadence.
    pub async fn reconcile_once(&self, cancel: &CancellationToken) -> Result<(), CaError> {
        let cluster = self.store.cluster();
        let signing_root = self.current_signing_root(&cluster)?;

        self.sign_outstanding(cancel, &cluster, &signing_root).await?;

        if cluster.root_ca.root_rotation.is_some() {
            self.advance_rotation(&cluster)?;
        }
        Ok(())
    }

    /// The root to sign with right now: mid-rotation that is the new
    /// root with the cross-signed intermediate, trust-anchored at the
    /// old bundle; otherwise the stored cluster CA.
    fn current_signing_root(&self, cluster: &ClusterRecord) -> Result<Arc<RootCa>, CaError> {
        let ca = &cluster.root_ca;
        let cache_key = match &ca.root_rotation {
            Some(rot) => format!(
                "rot:{}",
                reef_crypto::digest::bundle_digest_hex(&rot.new_cert)
            ),
            None => format!(
                "ca:{}",
                reef_crypto::digest::bundle_digest_hex(&ca.ca_cert)
            ),
        };

        {
            let cache = self.cache.lock().expect("root cache lock poisoned");
            if let Some(cached) = cache.as_ref() {
                if cached.key == cache_key {
                    return Ok(cached.root.clone());
                }
            }
        }

        let expiry = self.shared.get().expiry();
        let root = match &ca.root_rotation {
            Some(rot) => RootCa::new(
                &ca.ca_cert,
                Some((&rot.new_cert, &rot.new_key)),
                expiry,
                Some(&rot.cross_signed_cert),
            )?,
            None => {
                let signer = if ca.ca_key.is_empty() {
                    None
                } else {
                    Some((ca.ca_cert.as_slice(), ca.ca_key.as_slice()))
                };
                RootCa::new(&ca.ca_cert, signer, expiry, None)?
            }
        };

        let root = Arc::new(root);
        self.shared.swap_arc(&root);
        *self.cache.lock().expect("root cache lock poisoned") = Some(CachedRoot {
            key: cache_key,
            root: root.clone(),
        });
        Ok(root)
    }

    /// Sign every `Pending` CSR, and re-sign `Rotate` nodes from their
    /// stored CSR so rotation progresses without a node round trip.
    async fn sign_outstanding(
        &self,
        cancel: &CancellationToken,
        cluster: &ClusterRecord,
        root: &RootCa,
    ) -> Result<(), CaError> {
        let trust_digest = reef_crypto::digest::bundle_digest(&cluster.root_ca.ca_cert);
        let nodes = self.store.view(|v| v.nodes());

        for node in nodes {
            if cancel.is_cancelled() {
                return Err(CaError::Cancelled);
            }
            let state = node.certificate.status.state;
            if state != IssuanceState::Pending && state != IssuanceState::Rotate {
                continue;
            }
            if node.certificate.csr.is_empty() {
                // Nothing to sign from; the node must resubmit.
                continue;
            }

            let signed = self
                .sign_one(cancel, root, &node.certificate.csr, &node.id, node.certificate.role.ou())
                .await;

            let outcome = match signed {
                Ok(cert) => {
                    let issuer = root.local_issuer_info()?;
                    Some((
                        CertificateStatus::new(IssuanceState::Issued),
                        cert,
                        Some(TlsInfo {
                            trust_root_digest: trust_digest.clone(),
                            cert_issuer_subject: issuer.subject,
                            cert_issuer_public_key: issuer.public_key,
                        }),
                    ))
                }
                Err(CaError::Cancelled) => return Err(CaError::Cancelled),
                Err(e) => {
                    tracing::warn!(node = %node.id, error = %e, "failed to sign CSR");
                    Some((
                        CertificateStatus {
                            state: IssuanceState::Failed,
                            err: e.to_string(),
                        },
                        Vec::new(),
                        None,
                    ))
                }
            };

            if let Some((status, cert, tls_info)) = outcome {
                let id = node.id.clone();
                let res = self.store.update(|tx| {
                    let mut n = match tx.node(&id) {
                        Some(n) => n,
                        // Deleted mid-pass; nothing to record.
                        None => return Ok(()),
                    };
                    // Only land the result if the request we signed is
                    // still the current one.
                    if n.certificate.csr != node.certificate.csr
                        || n.certificate.status.state != state
                    {
                        return Ok(());
                    }
                    n.certificate.status = status.clone();
                    if !cert.is_empty() {
                        n.certificate.certificate = cert.clone();
                    }
                    if tls_info.is_some() {
                        n.tls_info = tls_info.clone();
                    }
                    tx.put_node(n);
                    Ok(())
                });
                match res {
                    Ok(()) => {
                        if status.state == IssuanceState::Issued {
                            tracing::info!(node = %node.id, "issued certificate");
                        }
                    }
                    // Another instance got there first; next pass sees
                    // the fresh state.
                    Err(CaError::StoreConflict) => continue,
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    async fn sign_one(
        &self,
        cancel: &CancellationToken,
        root: &RootCa,
        csr: &[u8],
        cn: &str,
        ou: &str,
    ) -> Result<Vec<u8>, CaError> {
        if root.has_signer() {
            root.parse_validate_and_sign_csr(csr, cn, ou, &self.config.org)
        } else if let Some(external) = &self.external {
            external.sign(cancel, csr).await
        } else {
            Err(CaError::NoSigner)
        }
    }

    /// Flag nodes still on the old issuer (bounded per pass), and
    /// commit the new root once everyone has converged.
    fn advance_rotation(&self, cluster: &ClusterRecord) -> Result<(), CaError> {
        let rotation = match &cluster.root_ca.root_rotation {
            Some(r) => r.clone(),
            None => return Ok(()),
        };
        let desired = desired_issuer(&rotation)?;
        let nodes = self.store.view(|v| v.nodes());

        let mut flagged = 0usize;
        let mut converged = true;
        for node in &nodes {
            let state = node.certificate.status.state;
            let matches_desired = node
                .tls_info
                .as_ref()
                .map(|t| t.issuer_info() == desired)
                .unwrap_or(false);

            if matches_desired && state == IssuanceState::Issued {
                continue;
            }
            converged = false;

            // In-flight states will pick up the desired root when the
            // signing pass gets to them.
            if state == IssuanceState::Pending || state == IssuanceState::Rotate {
                continue;
            }
            if flagged >= self.config.rotation_batch_size {
                continue;
            }

            let id = node.id.clone();
            let res = self.store.update(|tx| {
                let mut n = match tx.node(&id) {
                    Some(n) => n,
                    None => return Ok(()),
                };
                if n.certificate.status.state == IssuanceState::Pending
                    || n.certificate.status.state == IssuanceState::Rotate
                {
                    return Ok(());
                }
                n.certificate.status = CertificateStatus::new(IssuanceState::Rotate);
                tx.put_node(n);
                Ok(())
            });
            match res {
                Ok(()) => flagged += 1,
                Err(CaError::StoreConflict) => continue,
                Err(e) => return Err(e),
            }
        }

        if flagged > 0 {
            tracing::info!(flagged, "flagged nodes for root rotation");
        }

        if converged {
            self.commit_rotation(&rotation)?;
        }
        Ok(())
    }

    /// Everyone is on the new issuer: make the new root the cluster CA
    /// and drop the rotation. Join tokens are re-minted because they
    /// bind to the bundle digest.
    fn commit_rotation(&self, rotation: &RootRotation) -> Result<(), CaError> {
        let res = self.store.update(|tx| {
            let mut cluster = tx.cluster();
            match &cluster.root_ca.root_rotation {
                Some(current) if current == rotation => {}
                // Superseded or already committed; nothing to do.
                _ => return Ok(()),
            }
            cluster.root_ca.ca_cert = rotation.new_cert.clone();
            cluster.root_ca.ca_key = rotation.new_key.clone();
            cluster.root_ca.root_rotation = None;
            cluster.root_ca.join_tokens.worker =
                JoinToken::generate(&rotation.new_cert, false).to_string();
            cluster.root_ca.join_tokens.manager =
                JoinToken::generate(&rotation.new_cert, false).to_string();
            tx.put_cluster(cluster);
            Ok(())
        });
        match res {
            Ok(()) => {
                tracing::info!(
                    new_root = %reef_crypto::digest::bundle_digest(&rotation.new_cert),
                    "root rotation complete"
                );
                Ok(())
            }
            Err(CaError::StoreConflict) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Issuer identity leafs must end up under for this rotation: the new
/// root itself.
fn desired_issuer(rotation: &RootRotation) -> Result<IssuerInfo, CaError> {
    let meta = parse_certs_meta(&rotation.new_cert)?;
    let first = meta
        .first()
        .ok_or_else(|| CaError::InvalidPem("rotation has an empty new root".into()))?;
    Ok(IssuerInfo {
        public_key: first.spki.clone(),
        subject: first.subject.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{NodeCertificate, NodeRecord, NodeRole};

    fn csr_for(id: &str) -> Vec<u8> {
        let key = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, id);
        params
            .serialize_request(&key)
            .unwrap()
            .pem()
            .unwrap()
            .into_bytes()
    }

    fn pending_node(id: &str, role: NodeRole) -> NodeRecord {
        NodeRecord {
            id: id.to_string(),
            version: 0,
            certificate: NodeCertificate {
                role,
                csr: csr_for(id),
                status: CertificateStatus::new(IssuanceState::Pending),
                certificate: Vec::new(),
            },
            tls_info: None,
        }
    }

    fn test_server(store: Arc<MemStore>) -> CaServer {
        let root = CaServer::bootstrap(&store, "rootCN").unwrap();
        CaServer::new(store, root, CaServerConfig::default())
    }

    async fn settle(server: &CaServer, passes: usize) {
        let cancel = CancellationToken::new();
        for _ in 0..passes {
            server.reconcile_once(&cancel).await.unwrap();
        }
    }

    #[tokio::test]
    async fn pending_csrs_get_signed() {
        let store = Arc::new(MemStore::new());
        let server = test_server(store.clone());
        store
            .update(|tx| {
                tx.put_node(pending_node("n1", NodeRole::Worker));
                tx.put_node(pending_node("n2", NodeRole::Manager));
                Ok(())
            })
            .unwrap();

        settle(&server, 1).await;

        let pool = store.cluster().root_ca.ca_cert;
        for id in ["n1", "n2"] {
            let node = store.view(|v| v.node(id)).unwrap();
            assert_eq!(node.certificate.status.state, IssuanceState::Issued);
            crate::rootca::validate_cert_chain(&pool, &node.certificate.certificate, false)
                .unwrap();
            assert!(node.tls_info.is_some());
        }

        // Roles land in the OU.
        let n2 = store.view(|v| v.node("n2")).unwrap();
        let ou = crate::rootca::leaf_organizational_unit(&n2.certificate.certificate)
            .unwrap()
            .unwrap();
        assert_eq!(ou, "manager");
    }

    #[tokio::test]
    async fn bad_csr_marked_failed() {
        let store = Arc::new(MemStore::new());
        let server = test_server(store.clone());
        store
            .update(|tx| {
                let mut node = pending_node("broken", NodeRole::Worker);
                node.certificate.csr = b"garbage".to_vec();
                tx.put_node(node);
                Ok(())
            })
            .unwrap();

        settle(&server, 1).await;

        let node = store.view(|v| v.node("broken")).unwrap();
        assert_eq!(node.certificate.status.state, IssuanceState::Failed);
        assert!(!node.certificate.status.err.is_empty());
    }

    #[tokio::test]
    async fn rotation_converges_and_commits() {
        let store = Arc::new(MemStore::new());
        let server = test_server(store.clone());
        store
            .update(|tx| {
                for i in 0..5 {
                    tx.put_node(pending_node(&format!("n{i}"), NodeRole::Worker));
                }
                Ok(())
            })
            .unwrap();
        settle(&server, 1).await;

        let old_cert = store.cluster().root_ca.ca_cert;
        let new_root = RootCa::create("rootCN-gen2").unwrap();
        let cancel = CancellationToken::new();
        server
            .start_root_rotation(&cancel, &new_root)
            .await
            .unwrap();
        assert!(store.cluster().root_ca.root_rotation.is_some());

        // Each pass flags and re-signs; bounded number of passes until
        // every node is under the new root and the rotation clears.
        settle(&server, 6).await;

        let cluster = store.cluster();
        assert!(cluster.root_ca.root_rotation.is_none());
        assert_eq!(cluster.root_ca.ca_cert, new_root.certs());
        assert_ne!(cluster.root_ca.ca_cert, old_cert);

        let desired = IssuerInfo {
            public_key: parse_certs_meta(new_root.certs()).unwrap()[0].spki.clone(),
            subject: parse_certs_meta(new_root.certs()).unwrap()[0].subject.clone(),
        };
        for node in store.view(|v| v.nodes()) {
            assert_eq!(node.certificate.status.state, IssuanceState::Issued);
            assert_eq!(node.tls_info.unwrap().issuer_info(), desired);
        }

        // Tokens were re-minted against the new bundle.
        let token = JoinToken::parse(&cluster.root_ca.join_tokens.worker).unwrap();
        token.verify_root(new_root.certs()).unwrap();
    }

    #[tokio::test]
    async fn mid_rotation_leafs_validate_against_old_root() {
        let store = Arc::new(MemStore::new());
        let server = test_server(store.clone());
        store
            .update(|tx| {
                tx.put_node(pending_node("n0", NodeRole::Worker));
                Ok(())
            })
            .unwrap();
        settle(&server, 1).await;

        let old_cert = store.cluster().root_ca.ca_cert;
        let new_root = RootCa::create("gen2").unwrap();
        let cancel = CancellationToken::new();
        server
            .start_root_rotation(&cancel, &new_root)
            .await
            .unwrap();

        // One pass: n0 flagged; next pass: re-signed under the new
        // root with the cross-signed intermediate appended.
        settle(&server, 2).await;
        let node = store.view(|v| v.node("n0")).unwrap();
        assert_eq!(node.certificate.status.state, IssuanceState::Issued);
        let chain =
            crate::rootca::validate_cert_chain(&old_cert, &node.certificate.certificate, false)
                .unwrap();
        // leaf -> cross-signed new root -> old root
        assert_eq!(chain.len(), 3);
    }

    #[tokio::test]
    async fn rotation_batch_size_caps_flagging() {
        let store = Arc::new(MemStore::new());
        let root = CaServer::bootstrap(&store, "rootCN").unwrap();
        let server = CaServer::new(
            store.clone(),
            root,
            CaServerConfig {
                rotation_batch_size: 1,
                ..Default::default()
            },
        );
        store
            .update(|tx| {
                for i in 0..3 {
                    tx.put_node(pending_node(&format!("n{i}"), NodeRole::Worker));
                }
                Ok(())
            })
            .unwrap();
        settle(&server, 1).await;

        let new_root = RootCa::create("gen2").unwrap();
        let cancel = CancellationToken::new();
        server
            .start_root_rotation(&cancel, &new_root)
            .await
            .unwrap();

        // A single pass flags at most one node.
        server.reconcile_once(&cancel).await.unwrap();
        let rotating = store
            .view(|v| v.nodes())
            .into_iter()
            .filter(|n| n.certificate.status.state == IssuanceState::Rotate)
            .count();
        assert_eq!(rotating, 1);
    }

    #[tokio::test]
    async fn nodes_without_tls_info_always_flagged() {
        let store = Arc::new(MemStore::new());
        let server = test_server(store.clone());

        // A node that was issued out-of-band: Issued but no TLS info.
        store
            .update(|tx| {
                let mut node = pending_node("opaque", NodeRole::Worker);
                node.certificate.status = CertificateStatus::new(IssuanceState::Issued);
                tx.put_node(node);
                Ok(())
            })
            .unwrap();

        let new_root = RootCa::create("gen2").unwrap();
        let cancel = CancellationToken::new();
        server
            .start_root_rotation(&cancel, &new_root)
            .await
            .unwrap();
        server.reconcile_once(&cancel).await.unwrap();

        let node = store.view(|v| v.node("opaque")).unwrap();
        assert_eq!(node.certificate.status.state, IssuanceState::Rotate);
    }

    #[tokio::test]
    async fn rotation_converges_from_mixed_states() {
        let store = Arc::new(MemStore::new());
        let server = test_server(store.clone());

        // One issued normally first.
        store
            .update(|tx| {
                tx.put_node(pending_node("issued", NodeRole::Worker));
                Ok(())
            })
            .unwrap();
        settle(&server, 1).await;

        // Then a spread of in-flight and failed states.
        store
            .update(|tx| {
                tx.put_node(pending_node("pending", NodeRole::Worker));

                let mut failed = pending_node("failed", NodeRole::Worker);
                failed.certificate.status = CertificateStatus {
                    state: IssuanceState::Failed,
                    err: "previous signer crashed".into(),
                };
                tx.put_node(failed);

                let mut rotating = pending_node("rotating", NodeRole::Manager);
                rotating.certificate.status = CertificateStatus::new(IssuanceState::Rotate);
                tx.put_node(rotating);
                Ok(())
            })
            .unwrap();

        let new_root = RootCa::create("gen2").unwrap();
        let cancel = CancellationToken::new();
        server
            .start_root_rotation(&cancel, &new_root)
            .await
            .unwrap();
        settle(&server, 8).await;

        let cluster = store.cluster();
        assert!(cluster.root_ca.root_rotation.is_none());
        assert_eq!(cluster.root_ca.ca_cert, new_root.certs());
        let desired = desired_issuer(&RootRotation {
            old_cert: Vec::new(),
            new_cert: new_root.certs().to_vec(),
            new_key: Vec::new(),
            cross_signed_cert: Vec::new(),
        })
        .unwrap();
        for node in store.view(|v| v.nodes()) {
            assert_eq!(
                node.certificate.status.state,
                IssuanceState::Issued,
                "node {}",
                node.id
            );
            assert_eq!(node.tls_info.unwrap().issuer_info(), desired);
        }
    }

    #[tokio::test]
    async fn superseded_rotation_reflags_stale_target() {
        let store = Arc::new(MemStore::new());
        let server = test_server(store.clone());
        store
            .update(|tx| {
                tx.put_node(pending_node("n0", NodeRole::Worker));
                Ok(())
            })
            .unwrap();
        settle(&server, 1).await;

        let cancel = CancellationToken::new();
        let root_b = RootCa::create("gen-b").unwrap();
        server.start_root_rotation(&cancel, &root_b).await.unwrap();
        // Converge fully onto B.
        settle(&server, 6).await;
        assert_eq!(store.cluster().root_ca.ca_cert, root_b.certs());

        // Rotate again to C; the node sitting on B must be re-flagged
        // and converge onto C.
        let root_c = RootCa::create("gen-c").unwrap();
        server.start_root_rotation(&cancel, &root_c).await.unwrap();
        settle(&server, 6).await;

        let cluster = store.cluster();
        assert!(cluster.root_ca.root_rotation.is_none());
        assert_eq!(cluster.root_ca.ca_cert, root_c.certs());
    }

    #[tokio::test]
    async fn two_instances_converge_without_flapping() {
        let store = Arc::new(MemStore::new());
        let root = CaServer::bootstrap(&store, "rootCN").unwrap();
        let cluster = store.cluster();
        let server_a = CaServer::new(
            store.clone(),
            RootCa::new(
                &cluster.root_ca.ca_cert,
                Some((&cluster.root_ca.ca_cert, &cluster.root_ca.ca_key)),
                root.expiry(),
                None,
            )
            .unwrap(),
            CaServerConfig::default(),
        );
        let server_b = CaServer::new(store.clone(), root, CaServerConfig::default());

        store
            .update(|tx| {
                for i in 0..4 {
                    tx.put_node(pending_node(&format!("n{i}"), NodeRole::Worker));
                }
                Ok(())
            })
            .unwrap();

        let new_root = RootCa::create("gen2").unwrap();
        let cancel = CancellationToken::new();
        server_a
            .start_root_rotation(&cancel, &new_root)
            .await
            .unwrap();

        // Both loops interleave passes; conflicts are skipped, not
        // fatal, and the cluster still converges.
        for _ in 0..8 {
            server_a.reconcile_once(&cancel).await.unwrap();
            server_b.reconcile_once(&cancel).await.unwrap();
        }

        let cluster = store.cluster();
        assert!(cluster.root_ca.root_rotation.is_none());
        assert_eq!(cluster.root_ca.ca_cert, new_root.certs());
        for node in store.view(|v| v.nodes()) {
            assert_eq!(node.certificate.status.state, IssuanceState::Issued);
        }
    }

    #[tokio::test]
    async fn rotation_to_current_root_is_a_noop() {
        let store = Arc::new(MemStore::new());
        let server = test_server(store.clone());
        let cluster = store.cluster();
        let same = RootCa::new(
            &cluster.root_ca.ca_cert,
            Some((&cluster.root_ca.ca_cert, &cluster.root_ca.ca_key)),
            chrono::Duration::days(30),
            None,
        )
        .unwrap();

        let cancel = CancellationToken::new();
        server.start_root_rotation(&cancel, &same).await.unwrap();
        assert!(store.cluster().root_ca.root_rotation.is_none());
    }

    #[tokio::test]
    async fn run_loop_reacts_to_store_changes() {
        let store = Arc::new(MemStore::new());
        let server = Arc::new(test_server(store.clone()));
        let cancel = CancellationToken::new();
        let handle = {
            let server = server.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { server.run(cancel).await })
        };

        store
            .update(|tx| {
                tx.put_node(pending_node("n1", NodeRole::Worker));
                Ok(())
            })
            .unwrap();

        // The watch wakeup signs it without waiting for the tick.
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        loop {
            let state = store
                .view(|v| v.node("n1"))
                .unwrap()
                .certificate
                .status
                .state;
            if state == IssuanceState::Issued {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "node never signed");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        cancel.cancel();
        handle.await.unwrap();
    }
}
