//! External CA client: delegates leaf signing and root cross-signing
//! to remote signer endpoints over HTTPS.
//!
//! Endpoints are tried in order; transient transport failures move to
//! the next one. Client TLS credentials can be swapped at runtime
//! without interrupting in-flight requests.

use std::sync::RwLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::CaError;

/// Hard ceiling on a signer response body. A signer that streams more
/// than this is broken or hostile.
const MAX_RESPONSE_BYTES: usize = 1 << 20;

/// Default per-request deadline.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One remote signer endpoint, with the trust bundle used to verify
/// its server certificate.
#[derive(Debug, Clone)]
pub struct ExternalEndpoint {
    pub url: Url,
    /// PEM bundle of roots to trust for this endpoint's TLS server
    /// cert; empty to use system roots.
    pub trust_bundle_pem: Vec<u8>,
}

#[derive(Serialize)]
struct SignRequest<'a> {
    certificate_request: &'a str,
    /// Set when the payload is a CA certificate to cross-sign rather
    /// than a CSR to issue from.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    cross_sign: bool,
}

#[derive(Deserialize)]
struct SignResponse {
    success: bool,
    #[serde(default)]
    result: Option<SignResult>,
    #[serde(default)]
    errors: Vec<String>,
}

#[derive(Deserialize)]
struct SignResult {
    certificate: String,
}

/// Client for a set of external signer endpoints.
///
/// Each endpoint gets its own HTTP client trusting only that
/// endpoint's bundle; endpoint A's server cert chaining to endpoint
/// B's roots is not accepted.
pub struct ExternalCa {
    endpoints: Vec<ExternalEndpoint>,
    clients: RwLock<Vec<reqwest::Client>>,
    request_timeout: Duration,
}

impl ExternalCa {
    pub fn new(endpoints: Vec<ExternalEndpoint>) -> Result<Self, CaError> {
        let clients = build_clients(&endpoints, None, DEFAULT_REQUEST_TIMEOUT)?;
        Ok(Self {
            endpoints,
            clients: RwLock::new(clients),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, CaError> {
        self.request_timeout = timeout;
        let clients = build_clients(&self.endpoints, None, timeout)?;
        *self.clients.write().expect("client lock poisoned") = clients;
        Ok(self)
    }

    /// Install new client TLS credentials (combined cert + key PEM).
    ///
    /// Rebuilds the HTTP clients behind the lock; requests already in
    /// flight finish on the old clients, new requests pick up the new
    /// identity.
    pub fn swap_credentials(&self, cert_pem: &[u8], key_pem: &[u8]) -> Result<(), CaError> {
        let mut identity = cert_pem.to_vec();
        identity.extend_from_slice(key_pem);
        let clients = build_clients(&self.endpoints, Some(&identity), self.request_timeout)?;
        *self.clients.write().expect("client lock poisoned") = clients;
        tracing::debug!("swapped external CA client credentials");
        Ok(())
    }

    /// Submit a CSR for signing; returns the issued certificate PEM.
    pub async fn sign(&self, cancel: &CancellationToken, csr_pem: &[u8]) -> Result<Vec<u8>, CaError> {
        self.request(cancel, csr_pem, false).await
    }

    /// Ask the external signer to cross-sign a CA certificate;
    /// returns the intermediate PEM.
    pub async fn cross_sign_root(
        &self,
        cancel: &CancellationToken,
        root_pem: &[u8],
    ) -> Result<Vec<u8>, CaError> {
        self.request(cancel, root_pem, true).await
    }

    async fn request(
        &self,
        cancel: &CancellationToken,
        payload_pem: &[u8],
        cross_sign: bool,
    ) -> Result<Vec<u8>, CaError> {
        if self.endpoints.is_empty() {
            return Err(CaError::NoExternalUrls);
        }
        let payload =
            std::str::from_utf8(payload_pem).map_err(|e| CaError::InvalidPem(e.to_string()))?;

        // Snapshot the clients once; a concurrent credential swap must
        // not change identity mid-operation.
        let clients = self.clients.read().expect("client lock poisoned").clone();

        let mut last_err = CaError::NoExternalUrls;
        for (endpoint, client) in self.endpoints.iter().zip(&clients) {
            let attempt = self.one_request(client, endpoint, payload, cross_sign);
            let res = tokio::select! {
                _ = cancel.cancelled() => return Err(CaError::Cancelled),
                res = attempt => res,
            };
            match res {
                Ok(cert) => return Ok(cert),
                Err(e @ (CaError::ExternalResponseTooLarge | CaError::Remote(_))) => {
                    // The signer answered and refused; another endpoint
                    // will refuse the same way.
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(url = %endpoint.url, error = %e, "external signer request failed");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn one_request(
        &self,
        client: &reqwest::Client,
        endpoint: &ExternalEndpoint,
        payload: &str,
        cross_sign: bool,
    ) -> Result<Vec<u8>, CaError> {
        let response = client
            .post(endpoint.url.clone())
            .json(&SignRequest {
                certificate_request: payload,
                cross_sign,
            })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CaError::ExternalTimeout
                } else {
                    CaError::External(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(CaError::External(format!(
                "signer returned HTTP {}",
                response.status()
            )));
        }

        let body = read_limited(response).await?;
        let parsed: SignResponse =
            serde_json::from_slice(&body).map_err(|e| CaError::External(e.to_string()))?;
        if !parsed.success {
            return Err(CaError::Remote(parsed.errors.join("; ")));
        }
        match parsed.result {
            Some(result) => Ok(result.certificate.into_bytes()),
            None => Err(CaError::External("signer reported success without a certificate".into())),
        }
    }
}

/// Read a response body, enforcing the size ceiling as bytes arrive
/// rather than trusting Content-Length.
async fn read_limited(mut response: reqwest::Response) -> Result<Vec<u8>, CaError> {
    if let Some(len) = response.content_length() {
        if len as usize > MAX_RESPONSE_BYTES {
            return Err(CaError::ExternalResponseTooLarge);
        }
    }
    let mut body = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| CaError::External(e.to_string()))?
    {
        if body.len() + chunk.len() > MAX_RESPONSE_BYTES {
            return Err(CaError::ExternalResponseTooLarge);
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

fn build_clients(
    endpoints: &[ExternalEndpoint],
    identity_pem: Option<&[u8]>,
    timeout: Duration,
) -> Result<Vec<reqwest::Client>, CaError> {
    endpoints
        .iter()
        .map(|e| build_client(e, identity_pem, timeout))
        .collect()
}

fn build_client(
    endpoint: &ExternalEndpoint,
    identity_pem: Option<&[u8]>,
    timeout: Duration,
) -> Result<reqwest::Client, CaError> {
    let mut builder = reqwest::Client::builder().timeout(timeout).use_rustls_tls();

    if !endpoint.trust_bundle_pem.is_empty() {
        for cert in reqwest::Certificate::from_pem_bundle(&endpoint.trust_bundle_pem)
            .map_err(|e| CaError::InvalidPem(e.to_string()))?
        {
            builder = builder.add_root_certificate(cert);
        }
    }

    if let Some(pem) = identity_pem {
        let identity =
            reqwest::Identity::from_pem(pem).map_err(|e| CaError::CorruptKey(e.to_string()))?;
        builder = builder.identity(identity);
    }

    builder
        .build()
        .map_err(|e| CaError::External(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(url: &str) -> ExternalEndpoint {
        ExternalEndpoint {
            url: Url::parse(url).unwrap(),
            trust_bundle_pem: Vec::new(),
        }
    }

    #[tokio::test]
    async fn empty_endpoint_set_fails_fast() {
        let ca = ExternalCa::new(Vec::new()).unwrap();
        let err = ca
            .sign(&CancellationToken::new(), b"CSR")
            .await
            .unwrap_err();
        assert!(matches!(err, CaError::NoExternalUrls));
    }

    #[tokio::test]
    async fn unreachable_endpoints_surface_transport_error() {
        // Nothing listens on these ports; both attempts fail and the
        // last transport error is reported.
        let ca = ExternalCa::new(vec![
            endpoint("http://127.0.0.1:1/sign"),
            endpoint("http://127.0.0.1:2/sign"),
        ])
        .unwrap();
        let err = ca
            .sign(&CancellationToken::new(), b"CSR")
            .await
            .unwrap_err();
        assert!(matches!(err, CaError::External(_) | CaError::ExternalTimeout));
    }

    #[tokio::test]
    async fn cancellation_wins_over_retry() {
        let ca = ExternalCa::new(vec![endpoint("http://203.0.113.1:9/sign")])
            .unwrap()
            .with_timeout(Duration::from_secs(60))
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = ca.sign(&cancel, b"CSR").await.unwrap_err();
        assert!(matches!(err, CaError::Cancelled));
    }

    #[test]
    fn swap_credentials_accepts_fresh_identity() {
        let root = crate::rootca::RootCa::create("external-client").unwrap();
        let (cert, key) = root.issue_leaf_pair("client", "manager", "c").unwrap();

        let ca = ExternalCa::new(vec![endpoint("https://signer.example/sign")]).unwrap();
        ca.swap_credentials(&cert, &key).unwrap();
    }

    #[test]
    fn each_endpoint_gets_its_own_client() {
        let root_a = crate::rootca::RootCa::create("signer-a").unwrap();
        let root_b = crate::rootca::RootCa::create("signer-b").unwrap();

        let ca = ExternalCa::new(vec![
            ExternalEndpoint {
                url: Url::parse("https://a.example/sign").unwrap(),
                trust_bundle_pem: root_a.certs().to_vec(),
            },
            ExternalEndpoint {
                url: Url::parse("https://b.example/sign").unwrap(),
                trust_bundle_pem: root_b.certs().to_vec(),
            },
        ])
        .unwrap();

        // One client per endpoint, so a's roots never vouch for b.
        assert_eq!(ca.clients.read().unwrap().len(), 2);

        // A corrupt bundle fails that endpoint's client construction.
        let res = ExternalCa::new(vec![ExternalEndpoint {
            url: Url::parse("https://c.example/sign").unwrap(),
            trust_bundle_pem: b"not a pem bundle".to_vec(),
        }]);
        assert!(matches!(res.err(), Some(CaError::InvalidPem(_))));
    }

    #[test]
    fn sign_request_wire_shape() {
        let plain = serde_json::to_value(SignRequest {
            certificate_request: "CSR",
            cross_sign: false,
        })
        .unwrap();
        assert_eq!(plain, serde_json::json!({"certificate_request": "CSR"}));

        let cross = serde_json::to_value(SignRequest {
            certificate_request: "ROOT",
            cross_sign: true,
        })
        .unwrap();
        assert_eq!(
            cross,
            serde_json::json!({"certificate_request": "ROOT", "cross_sign": true})
        );
    }

    #[test]
    fn sign_response_parses_errors() {
        let resp: SignResponse = serde_json::from_str(
            r#"{"success": false, "errors": ["policy refused", "bad CSR"]}"#,
        )
        .unwrap();
        assert!(!resp.success);
        assert_eq!(resp.errors.len(), 2);

        let ok: SignResponse = serde_json::from_str(
            r#"{"success": true, "result": {"certificate": "PEM"}}"#,
        )
        .unwrap();
        assert_eq!(ok.result.unwrap().certificate, "PEM");
    }
}
