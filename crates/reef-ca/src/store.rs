//! Cluster state store: cluster and node records with transactional
//! updates, optimistic concurrency, and a change signal for loops that
//! reconcile against the stored state.
//!
//! Records carry a version bumped on every committed write. A write
//! whose record version no longer matches the stored one fails the
//! whole transaction with `StoreConflict`; callers re-read and retry.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::CaError;
use crate::rootca::IssuerInfo;

// ── Record types ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Manager,
    Worker,
}

impl NodeRole {
    /// The OU embedded in certificates issued for this role.
    pub fn ou(&self) -> &'static str {
        match self {
            NodeRole::Manager => "manager",
            NodeRole::Worker => "worker",
        }
    }

    pub fn from_ou(ou: &str) -> Option<NodeRole> {
        match ou {
            "manager" => Some(NodeRole::Manager),
            "worker" => Some(NodeRole::Worker),
            _ => None,
        }
    }
}

/// Where a node's certificate sits in the issuance lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssuanceState {
    /// CSR submitted, awaiting a signature.
    Pending,
    /// Certificate issued under the current desired root.
    Issued,
    /// Issuance failed; the error is recorded alongside.
    Failed,
    /// Issued, but under a superseded root; must be re-issued.
    Rotate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateStatus {
    pub state: IssuanceState,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub err: String,
}

impl CertificateStatus {
    pub fn new(state: IssuanceState) -> Self {
        Self {
            state,
            err: String::new(),
        }
    }
}

/// A node's certificate material as tracked by the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCertificate {
    pub role: NodeRole,
    /// The CSR the node submitted; kept so rotation can re-sign
    /// without a node round-trip.
    #[serde(default)]
    pub csr: Vec<u8>,
    pub status: CertificateStatus,
    /// Issued certificate bundle, PEM.
    #[serde(default)]
    pub certificate: Vec<u8>,
}

/// TLS facts about a node, as last reported or recorded at issuance:
/// the trust-root digest it runs with and its leaf's issuer identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsInfo {
    pub trust_root_digest: String,
    pub cert_issuer_subject: Vec<u8>,
    pub cert_issuer_public_key: Vec<u8>,
}

impl TlsInfo {
    pub fn issuer_info(&self) -> IssuerInfo {
        IssuerInfo {
            public_key: self.cert_issuer_public_key.clone(),
            subject: self.cert_issuer_subject.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: String,
    /// Optimistic concurrency version, managed by the store.
    #[serde(default)]
    pub version: u64,
    pub certificate: NodeCertificate,
    /// Absent until the node has completed a TLS handshake or been
    /// issued a certificate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_info: Option<TlsInfo>,
}

/// An in-progress root rotation. Present on the cluster record from
/// `start_root_rotation` until every node converges on the new root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootRotation {
    /// The root being rotated away from, PEM.
    pub old_cert: Vec<u8>,
    /// The root being rotated to, PEM.
    pub new_cert: Vec<u8>,
    /// The new root's private key, PEM. Always present: rotations are
    /// prepared with the key in hand so managers can sign locally.
    pub new_key: Vec<u8>,
    /// `new_cert` cross-signed by the old root, PEM.
    pub cross_signed_cert: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinTokens {
    pub worker: String,
    pub manager: String,
}

/// The cluster's CA configuration as stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRootCa {
    /// Trust bundle, PEM.
    pub ca_cert: Vec<u8>,
    /// Signing key, PEM; empty when signing is delegated externally.
    #[serde(default)]
    pub ca_key: Vec<u8>,
    #[serde(default)]
    pub join_tokens: JoinTokens,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_rotation: Option<RootRotation>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRecord {
    #[serde(default)]
    pub version: u64,
    pub root_ca: StoredRootCa,
    /// KEK handed to managers that encrypt their TLS key at rest;
    /// empty when autolock is off.
    #[serde(default)]
    pub unlock_key: Vec<u8>,
    #[serde(default)]
    pub unlock_key_version: u64,
}

// ── Store ───────────────────────────────────────────────────────────

#[derive(Default)]
struct Inner {
    cluster: ClusterRecord,
    nodes: BTreeMap<String, NodeRecord>,
    seq: u64,
}

/// In-memory transactional store.
pub struct MemStore {
    inner: Mutex<Inner>,
    changes: watch::Sender<u64>,
}

impl MemStore {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            inner: Mutex::new(Inner::default()),
            changes,
        }
    }

    /// Change signal: the value advances on every committed write.
    /// Receivers re-read the store rather than replaying events, so a
    /// slow consumer only ever does one catch-up pass.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Read-only snapshot access.
    pub fn view<R>(&self, f: impl FnOnce(&View<'_>) -> R) -> R {
        let inner = self.inner.lock().expect("store lock poisoned");
        f(&View { inner: &*inner })
    }

    /// Current cluster record without holding a view closure.
    pub fn cluster(&self) -> ClusterRecord {
        self.view(|v| v.cluster())
    }

    /// Run `f` against a transaction; all writes land atomically on
    /// success, none on error. Version mismatches surface as
    /// `StoreConflict` before anything is applied.
    pub fn update(&self, f: impl FnOnce(&mut Tx<'_>) -> Result<(), CaError>) -> Result<(), CaError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let mut tx = Tx {
            inner: &*inner,
            cluster_put: None,
            node_puts: Vec::new(),
            node_deletes: Vec::new(),
        };
        f(&mut tx)?;

        // Validate every versioned write before applying any.
        if let Some(cluster) = &tx.cluster_put {
            if cluster.version != inner.cluster.version {
                return Err(CaError::StoreConflict);
            }
        }
        for node in &tx.node_puts {
            match inner.nodes.get(&node.id) {
                Some(existing) if existing.version != node.version => {
                    return Err(CaError::StoreConflict)
                }
                None if node.version != 0 => return Err(CaError::StoreConflict),
                _ => {}
            }
        }
        for id in &tx.node_deletes {
            if !inner.nodes.contains_key(id) {
                return Err(CaError::NodeUnknown(id.clone()));
            }
        }

        let cluster_put = tx.cluster_put.take();
        let node_puts = std::mem::take(&mut tx.node_puts);
        let node_deletes = std::mem::take(&mut tx.node_deletes);
        drop(tx);

        let mut changed = false;
        if let Some(mut cluster) = cluster_put {
            cluster.version += 1;
            inner.cluster = cluster;
            changed = true;
        }
        for mut node in node_puts {
            node.version += 1;
            inner.nodes.insert(node.id.clone(), node);
            changed = true;
        }
        for id in node_deletes {
            inner.nodes.remove(&id);
            changed = true;
        }

        if changed {
            inner.seq += 1;
            let _ = self.changes.send(inner.seq);
        }
        Ok(())
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Read handle inside `view`.
pub struct View<'a> {
    inner: &'a Inner,
}

impl View<'_> {
    pub fn cluster(&self) -> ClusterRecord {
        self.inner.cluster.clone()
    }

    pub fn node(&self, id: &str) -> Option<NodeRecord> {
        self.inner.nodes.get(id).cloned()
    }

    pub fn nodes(&self) -> Vec<NodeRecord> {
        self.inner.nodes.values().cloned().collect()
    }
}

/// Write handle inside `update`. Reads see the pre-transaction state
/// plus this transaction's own pending writes.
pub struct Tx<'a> {
    inner: &'a Inner,
    cluster_put: Option<ClusterRecord>,
    node_puts: Vec<NodeRecord>,
    node_deletes: Vec<String>,
}

impl Tx<'_> {
    pub fn cluster(&self) -> ClusterRecord {
        self.cluster_put
            .clone()
            .unwrap_or_else(|| self.inner.cluster.clone())
    }

    pub fn put_cluster(&mut self, cluster: ClusterRecord) {
        self.cluster_put = Some(cluster);
    }

    pub fn node(&self, id: &str) -> Option<NodeRecord> {
        if let Some(pending) = self.node_puts.iter().rev().find(|n| n.id == id) {
            return Some(pending.clone());
        }
        if self.node_deletes.iter().any(|d| d == id) {
            return None;
        }
        self.inner.nodes.get(id).cloned()
    }

    pub fn nodes(&self) -> Vec<NodeRecord> {
        let mut out: BTreeMap<String, NodeRecord> = self.inner.nodes.clone();
        for id in &self.node_deletes {
            out.remove(id);
        }
        for node in &self.node_puts {
            out.insert(node.id.clone(), node.clone());
        }
        out.into_values().collect()
    }

    pub fn put_node(&mut self, node: NodeRecord) {
        self.node_puts.push(node);
    }

    pub fn delete_node(&mut self, id: &str) {
        self.node_deletes.push(id.to_string());
    }
}
