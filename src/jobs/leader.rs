//! Lease-based leader election over `coordination.k8s.io/v1`
//!
//! One Lease object arbitrates which replica runs the singleton jobs.
//! The holder renews well inside the lease duration; everyone else
//! retries on a short period and takes over once the lease expires.

use crate::error::{MailError, MailResult};
use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, PostParams};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long an acquired lease is valid without renewal
pub const LEASE_DURATION: Duration = Duration::from_secs(15);
/// The holder steps down if it cannot renew within this window
pub const RENEW_DEADLINE: Duration = Duration::from_secs(10);
/// Acquire/renew attempt cadence
pub const RETRY_PERIOD: Duration = Duration::from_secs(2);

/// Lease-based elector; `run` drives a watch channel of leadership
pub struct LeaderElector {
    api: Api<Lease>,
    lease_name: String,
    identity: String,
}

impl LeaderElector {
    pub fn new(client: kube::Client, namespace: &str, lease_name: &str, identity: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            lease_name: lease_name.to_string(),
            identity: identity.to_string(),
        }
    }

    /// Run the election loop until cancelled, publishing leadership
    /// transitions on the returned channel. The initial value is false.
    pub fn run(self, cancel: CancellationToken) -> tokio::sync::watch::Receiver<bool> {
        let (tx, rx) = tokio::sync::watch::channel(false);

        tokio::spawn(async move {
            let mut is_leader = false;
            let mut last_renewal = tokio::time::Instant::now();

            loop {
                tokio::select! {
                    _ = tokio::time::sleep(RETRY_PERIOD) => {}
                    _ = cancel.cancelled() => break,
                }

                match self.try_acquire_or_renew().await {
                    Ok(true) => {
                        last_renewal = tokio::time::Instant::now();
                        if !is_leader {
                            info!(identity = %self.identity, lease = %self.lease_name, "acquired leadership");
                            is_leader = true;
                            let _ = tx.send(true);
                        }
                    }
                    Ok(false) => {
                        if is_leader {
                            info!(identity = %self.identity, "lost leadership");
                            is_leader = false;
                            let _ = tx.send(false);
                        } else {
                            debug!(identity = %self.identity, "not leader");
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "lease operation failed");
                        // Step down once renewal has been failing too long
                        if is_leader && last_renewal.elapsed() >= RENEW_DEADLINE {
                            warn!(identity = %self.identity, "renew deadline exceeded, stepping down");
                            is_leader = false;
                            let _ = tx.send(false);
                        }
                    }
                }
            }

            if is_leader {
                let _ = tx.send(false);
                if let Err(e) = self.release().await {
                    warn!(error = %e, "failed to release lease on shutdown");
                }
            }
        });

        rx
    }

    /// One acquire/renew attempt. Returns whether we hold the lease.
    async fn try_acquire_or_renew(&self) -> MailResult<bool> {
        let now = MicroTime(Utc::now());

        let existing = self
            .api
            .get_opt(&self.lease_name)
            .await
            .map_err(lease_error)?;

        let Some(mut lease) = existing else {
            // No lease yet: create it with ourselves as holder
            let lease = self.fresh_lease(now, 0);
            return match self.api.create(&PostParams::default(), &lease).await {
                Ok(_) => Ok(true),
                // Lost the creation race
                Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
                Err(e) => Err(lease_error(e)),
            };
        };

        let spec = lease.spec.clone().unwrap_or_default();
        let holder = spec.holder_identity.clone().unwrap_or_default();

        if holder == self.identity {
            // Renew
            if let Some(spec) = lease.spec.as_mut() {
                spec.renew_time = Some(now);
            }
            self.api
                .replace(&self.lease_name, &PostParams::default(), &lease)
                .await
                .map_err(lease_error)?;
            return Ok(true);
        }

        // Someone else holds it; take over only after expiry
        let expired = spec
            .renew_time
            .as_ref()
            .map(|renewed| {
                let age = Utc::now().signed_duration_since(renewed.0);
                age.num_seconds() >= LEASE_DURATION.as_secs() as i64
            })
            .unwrap_or(true);

        if !expired {
            return Ok(false);
        }

        let transitions = spec.lease_transitions.unwrap_or(0) + 1;
        let mut takeover = self.fresh_lease(now, transitions);
        takeover.metadata.resource_version = lease.metadata.resource_version.clone();
        match self
            .api
            .replace(&self.lease_name, &PostParams::default(), &takeover)
            .await
        {
            Ok(_) => {
                info!(
                    identity = %self.identity,
                    previous = %holder,
                    "took over expired lease"
                );
                Ok(true)
            }
            // Conflict: another candidate won the takeover
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(lease_error(e)),
        }
    }

    /// Clear the holder so the next candidate acquires immediately
    async fn release(&self) -> MailResult<()> {
        let Some(mut lease) = self
            .api
            .get_opt(&self.lease_name)
            .await
            .map_err(lease_error)?
        else {
            return Ok(());
        };

        let holder = lease
            .spec
            .as_ref()
            .and_then(|s| s.holder_identity.clone())
            .unwrap_or_default();
        if holder != self.identity {
            return Ok(());
        }

        if let Some(spec) = lease.spec.as_mut() {
            spec.holder_identity = None;
            spec.renew_time = None;
        }
        self.api
            .replace(&self.lease_name, &PostParams::default(), &lease)
            .await
            .map_err(lease_error)?;
        Ok(())
    }

    fn fresh_lease(&self, now: MicroTime, transitions: i32) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(LEASE_DURATION.as_secs() as i32),
                acquire_time: Some(now.clone()),
                renew_time: Some(now),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        }
    }
}

fn lease_error(e: kube::Error) -> MailError {
    MailError::transient(format!("lease API: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_election_constants() {
        assert_eq!(LEASE_DURATION, Duration::from_secs(15));
        assert_eq!(RENEW_DEADLINE, Duration::from_secs(10));
        assert_eq!(RETRY_PERIOD, Duration::from_secs(2));
        assert!(RENEW_DEADLINE < LEASE_DURATION);
        assert!(RETRY_PERIOD < RENEW_DEADLINE);
    }
}
