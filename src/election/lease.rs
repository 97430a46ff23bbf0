//! Lease backend: acquire/renew/release/observe against a
//! `coordination.k8s.io/v1` `Lease`, the same resource kind
//! `client-go`'s `leaderelection.LeaseLock` (used by the original Go
//! implementation) and `kube-runtime`'s own `lease` module target.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, Patch, PatchParams, PostParams};
use thiserror::Error;

/// HTTP status the Kubernetes API server returns when a `create`/`replace`
/// is rejected because the object already exists or its `resourceVersion`
/// no longer matches what the caller fetched — the compare-and-swap signal
/// this backend relies on to keep acquisition/renewal safe under races.
const HTTP_CONFLICT: u16 = 409;

/// Parameters identifying and sizing a lease election, validated once at
/// construction (spec.md §4.1): `retry_period < renew_deadline <
/// lease_duration`.
#[derive(Debug, Clone)]
pub struct LeaseParams {
    pub name: String,
    pub namespace: String,
    pub identity: String,
    pub lease_duration: ChronoDuration,
    pub renew_deadline: ChronoDuration,
    pub retry_period: ChronoDuration,
}

#[derive(Debug, Error)]
pub enum LeaseParamsError {
    #[error("retry_period ({retry_period:?}) must be less than renew_deadline ({renew_deadline:?})")]
    RetryNotLessThanRenew {
        retry_period: ChronoDuration,
        renew_deadline: ChronoDuration,
    },
    #[error("renew_deadline ({renew_deadline:?}) must be less than lease_duration ({lease_duration:?})")]
    RenewNotLessThanDuration {
        renew_deadline: ChronoDuration,
        lease_duration: ChronoDuration,
    },
}

impl LeaseParams {
    pub fn validate(&self) -> Result<(), LeaseParamsError> {
        if self.retry_period >= self.renew_deadline {
            return Err(LeaseParamsError::RetryNotLessThanRenew {
                retry_period: self.retry_period,
                renew_deadline: self.renew_deadline,
            });
        }
        if self.renew_deadline >= self.lease_duration {
            return Err(LeaseParamsError::RenewNotLessThanDuration {
                renew_deadline: self.renew_deadline,
                lease_duration: self.lease_duration,
            });
        }
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum LeaseState {
    Unheld,
    HeldByOther {
        holder: String,
        expires_at: DateTime<Utc>,
    },
    HeldBySelf {
        expires_at: DateTime<Utc>,
    },
}

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
    #[error("lease {holder:?} already holds the lease, refusing to steal it before it expires")]
    Conflict { holder: String },
}

pub struct LeaseBackend {
    api: Api<Lease>,
    params: LeaseParams,
}

impl LeaseBackend {
    pub fn new(client: kube::Client, params: LeaseParams) -> Self {
        let api = Api::namespaced(client, &params.namespace);
        Self { api, params }
    }

    pub fn identity(&self) -> &str {
        &self.params.identity
    }

    /// Fetches the current lease (if any) and computes its [`LeaseState`]
    /// relative to `now`.
    #[tracing::instrument(skip(self))]
    pub async fn state(&self, now: DateTime<Utc>) -> Result<LeaseState, LeaseError> {
        match self.api.get_opt(&self.params.name).await? {
            None => Ok(LeaseState::Unheld),
            Some(lease) => Ok(self.state_of(lease.spec.unwrap_or_default(), now)),
        }
    }

    fn state_of(&self, spec: LeaseSpec, now: DateTime<Utc>) -> LeaseState {
        let lease_duration = spec
            .lease_duration_seconds
            .map(|secs| ChronoDuration::seconds(secs.into()))
            .unwrap_or_else(ChronoDuration::zero);
        let renew_time = spec.renew_time.map(|t| t.0);

        match spec.holder_identity {
            None => LeaseState::Unheld,
            Some(holder) if holder == self.params.identity => LeaseState::HeldBySelf {
                expires_at: renew_time.unwrap_or(now) + lease_duration,
            },
            Some(holder) => LeaseState::HeldByOther {
                holder,
                expires_at: renew_time.unwrap_or(now) + lease_duration,
            },
        }
    }

    /// Attempts to acquire or renew the lease. Returns `Ok(true)` iff this
    /// member holds the lease after the call returns, `Ok(false)` if it is
    /// held by an unexpired other holder *or* if a concurrent acquisition
    /// by another member won the compare-and-swap race.
    ///
    /// Every write carries the `resourceVersion` observed on the `get` that
    /// preceded it (`create` for a not-yet-existing lease is the degenerate
    /// case of this: the API server rejects a second concurrent `create`
    /// outright). The API server rejects a stale write with `409 Conflict`,
    /// which this backend maps to `Ok(false)` rather than stealing the
    /// lease — the single-holder invariant in spec.md §3 depends on this
    /// being an actual compare-and-swap, not last-write-wins.
    #[tracing::instrument(skip(self))]
    pub async fn try_acquire_or_renew(&self, now: DateTime<Utc>) -> Result<bool, LeaseError> {
        match self.api.get_opt(&self.params.name).await? {
            None => self.create(now).await,
            Some(existing) => {
                let spec = existing.spec.clone().unwrap_or_default();
                match self.state_of(spec, now) {
                    LeaseState::HeldBySelf { .. } => self.replace_renew(existing, now).await,
                    LeaseState::HeldByOther { holder, expires_at } if expires_at > now => {
                        tracing::debug!(%holder, %expires_at, "lease held by another member");
                        Ok(false)
                    }
                    LeaseState::HeldByOther { .. } | LeaseState::Unheld => {
                        self.replace_acquire(existing, now).await
                    }
                }
            }
        }
    }

    async fn create(&self, now: DateTime<Utc>) -> Result<bool, LeaseError> {
        let lease = Lease {
            metadata: kube::api::ObjectMeta {
                name: Some(self.params.name.clone()),
                namespace: Some(self.params.namespace.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.params.identity.clone()),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_duration_seconds: Some(self.params.lease_duration.num_seconds() as i32),
                lease_transitions: Some(0),
                ..Default::default()
            }),
        };

        match self.api.create(&PostParams::default(), &lease).await {
            Ok(_) => Ok(true),
            // Another member created it first in the same instant: this
            // attempt lost the race and does not hold the lease.
            Err(kube::Error::Api(err)) if err.code == HTTP_CONFLICT => {
                tracing::debug!("lease created concurrently by another member, losing the race");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn replace_renew(&self, existing: Lease, now: DateTime<Utc>) -> Result<bool, LeaseError> {
        let mut lease = existing;
        let mut spec = lease.spec.take().unwrap_or_default();
        spec.renew_time = Some(MicroTime(now));
        spec.lease_duration_seconds = Some(self.params.lease_duration.num_seconds() as i32);
        lease.spec = Some(spec);

        self.replace(lease).await
    }

    async fn replace_acquire(&self, existing: Lease, now: DateTime<Utc>) -> Result<bool, LeaseError> {
        let mut lease = existing;
        let mut spec = lease.spec.take().unwrap_or_default();
        let transitions = spec.lease_transitions.unwrap_or(0) + 1;
        spec.holder_identity = Some(self.params.identity.clone());
        spec.acquire_time = Some(MicroTime(now));
        spec.renew_time = Some(MicroTime(now));
        spec.lease_duration_seconds = Some(self.params.lease_duration.num_seconds() as i32);
        spec.lease_transitions = Some(transitions);
        lease.spec = Some(spec);

        self.replace(lease).await
    }

    /// Updates via `Api::replace`, which submits the fetched object
    /// (`resourceVersion` included) as a whole-object update. The API
    /// server performs the compare-and-swap: a concurrent writer that got
    /// there first bumps `resourceVersion`, so this write is rejected with
    /// `409 Conflict` rather than silently overwriting it.
    async fn replace(&self, lease: Lease) -> Result<bool, LeaseError> {
        let name = lease
            .metadata
            .name
            .clone()
            .unwrap_or_else(|| self.params.name.clone());
        match self.api.replace(&name, &PostParams::default(), &lease).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(err)) if err.code == HTTP_CONFLICT => {
                tracing::debug!("lease updated concurrently by another member, losing the race");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Best-effort release: clears the holder fields iff this member still
    /// holds the lease. A lease already stolen by another holder is a
    /// no-op, mirroring `AlreadyStolen` handling in the original
    /// `election/elector.go`.
    #[tracing::instrument(skip(self))]
    pub async fn release(&self) -> Result<(), LeaseError> {
        let Some(existing) = self.api.get_opt(&self.params.name).await? else {
            return Ok(());
        };
        let spec = existing.spec.unwrap_or_default();

        match spec.holder_identity {
            Some(ref holder) if holder == &self.params.identity => {
                let patch = serde_json::json!({
                    "spec": {
                        "holderIdentity": serde_json::Value::Null,
                        "acquireTime": serde_json::Value::Null,
                        "renewTime": serde_json::Value::Null,
                    }
                });
                self.api
                    .patch(
                        &self.params.name,
                        &PatchParams::default(),
                        &Patch::Merge(&patch),
                    )
                    .await?;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn params() -> LeaseParams {
        LeaseParams {
            name: "prometheus".into(),
            namespace: "monitoring".into(),
            identity: "self".into(),
            lease_duration: ChronoDuration::seconds(15),
            renew_deadline: ChronoDuration::seconds(10),
            retry_period: ChronoDuration::seconds(2),
        }
    }

    #[test]
    fn params_reject_retry_not_less_than_renew() {
        let mut p = params();
        p.retry_period = ChronoDuration::seconds(10);
        assert!(matches!(
            p.validate(),
            Err(LeaseParamsError::RetryNotLessThanRenew { .. })
        ));
    }

    #[test]
    fn params_reject_renew_not_less_than_duration() {
        let mut p = params();
        p.renew_deadline = ChronoDuration::seconds(15);
        assert!(matches!(
            p.validate(),
            Err(LeaseParamsError::RenewNotLessThanDuration { .. })
        ));
    }

    #[test]
    fn params_accept_strictly_ordered_triple() {
        assert!(params().validate().is_ok());
    }
}
