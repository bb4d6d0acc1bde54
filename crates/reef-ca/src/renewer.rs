//! Background certificate renewal.
//!
//! The renewer sleeps until a randomized point in the second half of
//! the certificate's remaining validity, renews through the issuance
//! protocol, and reports outcomes on an event channel. `renew_now`
//! forces an immediate attempt; repeated calls before the loop wakes
//! coalesce into one.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::api::{CaClient, PeerBroker};
use crate::error::CaError;
use crate::issuance::{request_and_save_new_certificates, CertificateRequestConfig};
use crate::keystore::KeyReadWriter;
use crate::rootca::IssuerInfo;
use crate::store::NodeRole;

/// Renew somewhere in [0.50, 0.75] of the remaining validity, so a
/// fleet issued together does not renew together.
const RENEW_FRACTION_MIN: f64 = 0.50;
const RENEW_FRACTION_SPREAD: f64 = 0.25;

/// Fixed delay before retrying after a failed renewal.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// What a completed (or failed) renewal produced.
#[derive(Debug, Clone)]
pub enum RenewalEvent {
    Renewed(CertificateInfo),
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct CertificateInfo {
    pub issuer: IssuerInfo,
    pub expiry: DateTime<Utc>,
    /// Role carried in the new certificate's OU, when recognized.
    pub role: Option<NodeRole>,
}

struct RenewerState {
    expiry: DateTime<Utc>,
    expected_role: Option<NodeRole>,
    trust_pool: Vec<u8>,
}

pub struct TlsRenewer {
    krw: Arc<KeyReadWriter>,
    client: Arc<dyn CaClient>,
    broker: Arc<PeerBroker>,
    config: CertificateRequestConfig,
    retry_interval: Duration,
    state: Mutex<RenewerState>,
    kick: Notify,
}

impl TlsRenewer {
    pub fn new(
        krw: Arc<KeyReadWriter>,
        client: Arc<dyn CaClient>,
        broker: Arc<PeerBroker>,
        config: CertificateRequestConfig,
        trust_pool: Vec<u8>,
        current_expiry: DateTime<Utc>,
    ) -> Self {
        Self {
            krw,
            client,
            broker,
            config,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            state: Mutex::new(RenewerState {
                expiry: current_expiry,
                expected_role: None,
                trust_pool,
            }),
            kick: Notify::new(),
        }
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Force a renewal on the next loop wakeup. Calls made while one
    /// is already queued coalesce.
    pub fn renew_now(&self) {
        self.kick.notify_one();
    }

    /// Request a different role on the next renewal and trigger one;
    /// the new certificate carries the role in its OU.
    pub fn set_expected_role(&self, role: NodeRole) {
        self.state.lock().expect("renewer lock poisoned").expected_role = Some(role);
        self.renew_now();
    }

    /// Replace the trust pool new chains are validated against, e.g.
    /// after a root rotation lands.
    pub fn update_trust_pool(&self, pool: Vec<u8>) {
        self.state.lock().expect("renewer lock poisoned").trust_pool = pool;
    }

    /// Spawn the renewal loop. The returned channel yields one event
    /// per attempt and closes when the loop stops.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> mpsc::Receiver<RenewalEvent> {
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            self.run(cancel, tx).await;
        });
        rx
    }

    async fn run(&self, cancel: CancellationToken, tx: mpsc::Sender<RenewalEvent>) {
        let mut next_delay = {
            let state = self.state.lock().expect("renewer lock poisoned");
            renew_delay(state.expiry, Utc::now())
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("certificate renewer stopping");
                    return;
                }
                _ = tokio::time::sleep(next_delay) => {}
                _ = self.kick.notified() => {}
            }

            let event = match self.renew(&cancel).await {
                Ok(info) => {
                    next_delay = renew_delay(info.expiry, Utc::now());
                    tracing::info!(expires = %info.expiry, "renewed certificate");
                    RenewalEvent::Renewed(info)
                }
                Err(CaError::Cancelled) => return,
                Err(e) => {
                    next_delay = self.retry_interval;
                    tracing::warn!(error = %e, "certificate renewal failed");
                    RenewalEvent::Failed(e.to_string())
                }
            };

            if tx.send(event).await.is_err() {
                // Receiver gone; nobody is listening anymore.
                return;
            }
        }
    }

    async fn renew(&self, cancel: &CancellationToken) -> Result<CertificateInfo, CaError> {
        let (trust_pool, expected_role) = {
            let state = self.state.lock().expect("renewer lock poisoned");
            (state.trust_pool.clone(), state.expected_role)
        };

        // Carry the expected role so a promotion or demotion lands in
        // the renewed certificate.
        let mut config = self.config.clone();
        if expected_role.is_some() {
            config.role = expected_role;
        }

        let (issuer, expiry) = request_and_save_new_certificates(
            cancel,
            &self.krw,
            &trust_pool,
            self.client.as_ref(),
            &self.broker,
            &config,
        )
        .await?;

        let (cert, _key) = self.krw.read()?;
        let role = crate::rootca::leaf_organizational_unit(&cert)?
            .as_deref()
            .and_then(NodeRole::from_ou);

        let mut state = self.state.lock().expect("renewer lock poisoned");
        state.expiry = expiry;
        if let (Some(expected), Some(actual)) = (state.expected_role, role) {
            if expected != actual {
                tracing::warn!(
                    ?expected,
                    ?actual,
                    "renewed certificate carries a different role than expected"
                );
            }
        }

        Ok(CertificateInfo {
            issuer,
            expiry,
            role,
        })
    }
}

/// Time until the next renewal attempt: a random point in
/// [0.50, 0.75] of the remaining validity, or immediately if the
/// certificate is already past due.
fn renew_delay(expiry: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    let remaining = expiry - now;
    if remaining <= chrono::Duration::zero() {
        return Duration::ZERO;
    }
    let fraction = RENEW_FRACTION_MIN + rand::thread_rng().gen::<f64>() * RENEW_FRACTION_SPREAD;
    let millis = (remaining.num_milliseconds() as f64 * fraction) as u64;
    Duration::from_millis(millis)
}
