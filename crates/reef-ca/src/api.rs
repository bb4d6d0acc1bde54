//! Client-side surface of the CA: the request/response types, the
//! `CaClient` transport trait, peer failover, and the in-process
//! client managers use to serve requests straight from the store.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::CaError;
use crate::store::{
    CertificateStatus, IssuanceState, MemStore, NodeCertificate, NodeRecord, NodeRole,
};

/// A CA endpoint a node can talk to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: String,
    pub addr: String,
}

/// Certificate issuance request. Joining nodes carry a join-token
/// secret and no node id; renewing nodes carry their id and no token.
/// A renewal may also carry a desired role, so a promoted or demoted
/// node picks up its new role on the next certificate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueCertificateRequest {
    pub csr: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<NodeRole>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueCertificateResponse {
    pub node_id: String,
}

/// Poll response: issuance state plus, once issued, the certificate
/// bundle and the trust bundle to run with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateStatusResponse {
    pub state: IssuanceState,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub err: String,
    #[serde(default)]
    pub certificate: Vec<u8>,
    #[serde(default)]
    pub root_ca_bundle: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnlockKeyResponse {
    pub unlock_key: Vec<u8>,
    pub version: u64,
}

/// Transport-agnostic CA operations a node performs against a manager.
#[async_trait]
pub trait CaClient: Send + Sync {
    async fn issue_certificate(
        &self,
        peer: &Peer,
        req: IssueCertificateRequest,
    ) -> Result<IssueCertificateResponse, CaError>;

    async fn certificate_status(
        &self,
        peer: &Peer,
        node_id: &str,
    ) -> Result<CertificateStatusResponse, CaError>;

    /// Fetch the remote trust bundle, unauthenticated. Callers verify
    /// it against a join token digest before trusting it.
    async fn root_ca_certificate(&self, peer: &Peer) -> Result<Vec<u8>, CaError>;

    async fn unlock_key(&self, peer: &Peer) -> Result<UnlockKeyResponse, CaError>;
}

// ── Peer failover ───────────────────────────────────────────────────

/// Round-robin over the known CA endpoints. Transient failures move
/// to the next peer; an empty set fails fast with `NoMorePeers`.
pub struct PeerBroker {
    state: Mutex<BrokerState>,
}

struct BrokerState {
    peers: Vec<Peer>,
    next: usize,
}

impl PeerBroker {
    pub fn new(peers: Vec<Peer>) -> Self {
        Self {
            state: Mutex::new(BrokerState { peers, next: 0 }),
        }
    }

    /// Next peer in rotation.
    pub fn remote_peer(&self) -> Result<Peer, CaError> {
        let mut state = self.state.lock().expect("broker lock poisoned");
        if state.peers.is_empty() {
            return Err(CaError::NoMorePeers);
        }
        let peer = state.peers[state.next % state.peers.len()].clone();
        state.next = state.next.wrapping_add(1);
        Ok(peer)
    }

    /// Replace the peer set wholesale, e.g. after a membership change.
    pub fn set_peers(&self, peers: Vec<Peer>) {
        let mut state = self.state.lock().expect("broker lock poisoned");
        state.peers = peers;
        state.next = 0;
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("broker lock poisoned").peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── In-process client ───────────────────────────────────────────────

/// `CaClient` that reads and writes the local store directly. Managers
/// renew through this without a network hop; the signing loop picks up
/// the pending CSR like any other.
pub struct StoreCaClient {
    store: Arc<MemStore>,
}

impl StoreCaClient {
    pub fn new(store: Arc<MemStore>) -> Self {
        Self { store }
    }

    fn role_for_token(&self, secret: &str) -> Result<NodeRole, CaError> {
        let cluster = self.store.cluster();
        let tokens = &cluster.root_ca.join_tokens;
        if !tokens.manager.is_empty() && secret == tokens.manager {
            Ok(NodeRole::Manager)
        } else if !tokens.worker.is_empty() && secret == tokens.worker {
            Ok(NodeRole::Worker)
        } else {
            Err(CaError::InvalidJoinToken("secret does not match".into()))
        }
    }
}

/// Random 128-bit node id, hex.
pub fn generate_node_id() -> String {
    let mut raw = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut raw);
    reef_crypto::encoding::hex_encode(&raw)
}

#[async_trait]
impl CaClient for StoreCaClient {
    async fn issue_certificate(
        &self,
        _peer: &Peer,
        req: IssueCertificateRequest,
    ) -> Result<IssueCertificateResponse, CaError> {
        // Token decides the role for joins; renewals keep their role.
        let token_role = match &req.token_secret {
            Some(secret) => Some(self.role_for_token(secret)?),
            None => None,
        };

        let existing = req
            .node_id
            .as_deref()
            .and_then(|id| self.store.view(|v| v.node(id)));

        match (existing, token_role) {
            (Some(node), _) => {
                // Renewal: reset the CSR and go back to pending. A
                // requested role rides along; absent one the node
                // keeps the role it has.
                let node_id = node.id.clone();
                self.store.update(|tx| {
                    let mut node = tx
                        .node(&node_id)
                        .ok_or_else(|| CaError::NodeUnknown(node_id.clone()))?;
                    node.certificate.csr = req.csr.clone();
                    node.certificate.status = CertificateStatus::new(IssuanceState::Pending);
                    node.certificate.certificate.clear();
                    if let Some(role) = req.role {
                        node.certificate.role = role;
                    }
                    tx.put_node(node);
                    Ok(())
                })?;
                Ok(IssueCertificateResponse { node_id })
            }
            (None, Some(role)) => {
                let node_id = req
                    .node_id
                    .clone()
                    .unwrap_or_else(generate_node_id);
                self.store.update(|tx| {
                    tx.put_node(NodeRecord {
                        id: node_id.clone(),
                        version: 0,
                        certificate: NodeCertificate {
                            role,
                            csr: req.csr.clone(),
                            status: CertificateStatus::new(IssuanceState::Pending),
                            certificate: Vec::new(),
                        },
                        tls_info: None,
                    });
                    Ok(())
                })?;
                Ok(IssueCertificateResponse { node_id })
            }
            (None, None) => Err(CaError::NodeUnknown(
                req.node_id.unwrap_or_default(),
            )),
        }
    }

    async fn certificate_status(
        &self,
        _peer: &Peer,
        node_id: &str,
    ) -> Result<CertificateStatusResponse, CaError> {
        let (node, cluster) = self
            .store
            .view(|v| (v.node(node_id), v.cluster()));
        let node = node.ok_or_else(|| CaError::NodeUnknown(node_id.to_string()))?;
        Ok(CertificateStatusResponse {
            state: node.certificate.status.state,
            err: node.certificate.status.err,
            certificate: node.certificate.certificate,
            root_ca_bundle: cluster.root_ca.ca_cert,
        })
    }

    async fn root_ca_certificate(&self, _peer: &Peer) -> Result<Vec<u8>, CaError> {
        Ok(self.store.cluster().root_ca.ca_cert)
    }

    async fn unlock_key(&self, _peer: &Peer) -> Result<UnlockKeyResponse, CaError> {
        let cluster = self.store.cluster();
        Ok(UnlockKeyResponse {
            unlock_key: cluster.unlock_key,
            version: cluster.unlock_key_version,
        })
    }
}
