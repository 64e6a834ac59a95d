//! SKID reconciler.
//!
//! A single long-lived task that keeps the `uuid → SKID` table in sync with
//! the trust list. Each tick fetches the signed certificate list, matches
//! certificate public keys against locally known identities, and atomically
//! swaps the published mapping.
//!
//! Failure tolerance: the previous mapping keeps serving while fetches fail;
//! once the configured number of consecutive failures is reached the mapping
//! is cleared, so signing requests cannot use stale SKIDs indefinitely.
use crate::client::{ClientError, TrustListSource};
use crate::protocol::{Protocol, ProtocolError, Skid, SKID_LEN};
use crate::store::StoreError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;
use x509_cert::der::{Decode, Encode};
use x509_cert::Certificate;

/// Tick period and failure budget. Both profiles tolerate roughly one hour
/// of trust-list outage before clearing the mapping.
#[derive(Debug, Clone, Copy)]
pub struct ReconcilerProfile {
    pub interval: Duration,
    pub max_fail_count: u32,
}

impl ReconcilerProfile {
    pub fn new(reload_every_minute: bool) -> Self {
        if reload_every_minute {
            Self {
                interval: Duration::from_secs(60),
                max_fail_count: 60,
            }
        } else {
            Self {
                interval: Duration::from_secs(3600),
                max_fail_count: 3,
            }
        }
    }
}

pub struct SkidReconciler {
    protocol: Arc<Protocol>,
    source: Arc<dyn TrustListSource>,
    profile: ReconcilerProfile,
    fail_count: u32,
}

impl SkidReconciler {
    pub fn new(
        protocol: Arc<Protocol>,
        source: Arc<dyn TrustListSource>,
        profile: ReconcilerProfile,
    ) -> Self {
        Self {
            protocol,
            source,
            profile,
            fail_count: 0,
        }
    }

    /// Drive the reconciler until shutdown. The first refresh runs
    /// immediately; later ones at the profile interval.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.profile.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.refresh().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::debug!("skid reconciler shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// One reconciliation cycle.
    pub async fn refresh(&mut self) {
        let certificates = match self.source.certificates().await {
            Ok(certificates) => {
                self.fail_count = 0;
                metrics::counter!("trust_list_refresh_total", "outcome" => "success").increment(1);
                certificates
            }
            Err(err) => {
                self.fail_count += 1;
                metrics::counter!("trust_list_refresh_total", "outcome" => "failure").increment(1);
                tracing::error!(
                    error = %err,
                    fail_count = self.fail_count,
                    max = self.profile.max_fail_count,
                    "loading certificate list failed"
                );

                if self.fail_count != self.profile.max_fail_count {
                    // Previous mapping keeps serving until the budget is spent.
                    return;
                }

                tracing::warn!(
                    fail_count = self.fail_count,
                    "clearing local KID lookup after repeated failures to load \
                     the public key certificate list"
                );
                Vec::new()
            }
        };

        let mut fresh: HashMap<Uuid, Skid> = HashMap::new();
        for entry in &certificates {
            let kid_b64 = BASE64.encode(&entry.kid);

            let certificate = match Certificate::from_der(&entry.raw_data) {
                Ok(certificate) => certificate,
                Err(err) => {
                    tracing::error!(kid = %kid_b64, error = %err, "unparseable certificate");
                    continue;
                }
            };

            let spki_der = match certificate
                .tbs_certificate
                .subject_public_key_info
                .to_der()
            {
                Ok(der) => der,
                Err(err) => {
                    tracing::error!(kid = %kid_b64, error = %err, "unreadable public key info");
                    continue;
                }
            };

            let Ok(pub_key_pem) = self.protocol.crypto().public_key_der_to_pem(&spki_der) else {
                // Not a P-256 key; cannot belong to a local identity.
                continue;
            };

            let uid = match self.protocol.get_uuid_for_public_key(&pub_key_pem).await {
                Ok(uid) => uid,
                Err(ProtocolError::Store(StoreError::NotFound)) => continue,
                Err(err) => {
                    tracing::error!(kid = %kid_b64, error = %err, "uuid lookup failed");
                    continue;
                }
            };

            if entry.kid.len() != SKID_LEN {
                tracing::error!(
                    kid = %kid_b64,
                    len = entry.kid.len(),
                    "invalid KID length, expected {SKID_LEN} bytes"
                );
                continue;
            }
            let mut skid = [0u8; SKID_LEN];
            skid.copy_from_slice(&entry.kid);
            fresh.insert(uid, skid);
        }

        let matched = fresh.len();
        metrics::gauge!("skid_mappings").set(matched as f64);
        self.protocol.set_skid_store(fresh).await;
        tracing::info!(matched, "loaded matching certificates from server");
    }
}
