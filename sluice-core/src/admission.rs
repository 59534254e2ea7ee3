use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use sluice_common::{DegradationPolicy, LeaseId, ResourceClassConfig, SluiceError};
use sluice_db_entities::Lease::LeaseState;
use tracing::*;
use uuid::Uuid;

use crate::clock::Clock;
use crate::store::{Degradation, LeaseRecord, SharedStore, SlotAcquire};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaseGrant {
    pub lease_id: LeaseId,
    pub resource_class: String,
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapacityDenial {
    pub resource_class: String,
    pub active: u32,
    pub limit: u32,
    pub estimated_wait: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Admission {
    Granted(LeaseGrant),
    Denied(CapacityDenial),
}

impl Admission {
    pub fn acquired(&self) -> bool {
        matches!(self, Self::Granted(_))
    }

    pub fn lease_id(&self) -> Option<LeaseId> {
        match self {
            Self::Granted(grant) => Some(grant.lease_id),
            Self::Denied(_) => None,
        }
    }

    pub fn estimated_wait_ms(&self) -> Option<u64> {
        match self {
            Self::Granted(_) => None,
            Self::Denied(denial) => Some(denial.estimated_wait.as_millis() as u64),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ClassStatus {
    pub resource_class: String,
    pub limit: u32,
    pub active: u32,
    /// Oldest first
    pub leases: Vec<LeaseRecord>,
}

/// Hands out bounded-concurrency leases per resource class.
///
/// This is the only component that moves leases between states. The
/// reaper goes through [`AdmissionController::expire_overdue`] too.
pub struct AdmissionController {
    classes: HashMap<String, ResourceClassConfig>,
    store: SharedStore,
    degradation: Degradation,
    clock: Arc<dyn Clock>,
    reap_interval: Duration,
}

impl AdmissionController {
    pub fn new(
        classes: &[ResourceClassConfig],
        store: SharedStore,
        degradation: Degradation,
        clock: Arc<dyn Clock>,
        reap_interval: Duration,
    ) -> Self {
        Self {
            classes: classes
                .iter()
                .map(|class| (class.name.clone(), class.clone()))
                .collect(),
            store,
            degradation,
            clock,
            reap_interval,
        }
    }

    pub fn resource_classes(&self) -> impl Iterator<Item = &ResourceClassConfig> {
        self.classes.values()
    }

    pub fn resource_class(&self, name: &str) -> Result<&ResourceClassConfig, SluiceError> {
        self.classes
            .get(name)
            .ok_or_else(|| SluiceError::UnknownResourceClass(name.to_owned()))
    }

    pub async fn try_acquire(
        &self,
        resource_class: &str,
        owner: &str,
    ) -> Result<Admission, SluiceError> {
        let class = self.resource_class(resource_class)?;
        let now = self.clock.now();
        let lease = LeaseRecord {
            id: Uuid::new_v4(),
            resource_class: class.name.clone(),
            owner: owner.to_owned(),
            state: LeaseState::Active,
            acquired_at: now,
            expires_at: lease_expiry(class, now)?,
        };

        let outcome = match self.store.acquire_slot(&lease, class.limit).await {
            Ok(outcome) => outcome,
            Err(error) => {
                self.degradation
                    .recover(error)?
                    .acquire_slot(&lease, class.limit)
                    .await?
            }
        };

        match outcome {
            SlotAcquire::Acquired => {
                debug!(class = %class.name, %owner, lease = %lease.id, "Lease granted");
                Ok(Admission::Granted(LeaseGrant {
                    lease_id: lease.id,
                    resource_class: lease.resource_class,
                    owner: lease.owner,
                    expires_at: lease.expires_at,
                }))
            }
            SlotAcquire::Full { active, oldest } => {
                let estimated_wait = self.estimate_wait(oldest.as_ref(), now);
                debug!(
                    class = %class.name,
                    %owner,
                    active,
                    limit = class.limit,
                    wait_ms = estimated_wait.as_millis() as u64,
                    "Lease denied, class at capacity"
                );
                Ok(Admission::Denied(CapacityDenial {
                    resource_class: class.name.clone(),
                    active,
                    limit: class.limit,
                    estimated_wait,
                }))
            }
        }
    }

    /// Frees the lease's slot. Unknown and already finished leases are a
    /// no-op and return `false`.
    pub async fn release(&self, lease_id: LeaseId) -> Result<bool, SluiceError> {
        let released = self.finish(lease_id, LeaseState::Released).await?;
        if let Some(lease) = &released {
            debug!(class = %lease.resource_class, lease = %lease.id, "Lease released");
        }
        Ok(released.is_some())
    }

    /// Pushes an active lease's expiry forward by its class TTL.
    pub async fn renew(&self, lease_id: LeaseId) -> Result<Option<DateTime<Utc>>, SluiceError> {
        let Some((store, lease)) = self.locate(lease_id).await? else {
            return Ok(None);
        };
        if lease.state != LeaseState::Active {
            return Ok(None);
        }
        let class = self.resource_class(&lease.resource_class)?;
        let expires_at = lease_expiry(class, self.clock.now())?;

        Ok(store
            .extend_lease(lease_id, expires_at)
            .await?
            .map(|lease| lease.expires_at))
    }

    pub async fn status(&self, resource_class: &str) -> Result<ClassStatus, SluiceError> {
        let class = self.resource_class(resource_class)?;
        let leases = match self.store.active_leases(&class.name).await {
            Ok(leases) => leases,
            Err(error) => self.degradation.recover(error)?.active_leases(&class.name).await?,
        };
        Ok(ClassStatus {
            resource_class: class.name.clone(),
            limit: class.limit,
            active: leases.len() as u32,
            leases,
        })
    }

    /// Expires the class's leases whose TTL has run out, freeing their slots.
    pub async fn expire_overdue(
        &self,
        resource_class: &str,
    ) -> Result<Vec<LeaseRecord>, SluiceError> {
        let class = self.resource_class(resource_class)?;
        let now = self.clock.now();

        let mut expired = match self.store.expire_overdue(&class.name, now).await {
            Ok(expired) => expired,
            Err(error) => {
                self.degradation.recover(error)?;
                vec![]
            }
        };
        if self.degradation.policy() == DegradationPolicy::LocalFallback {
            expired.extend(
                self.degradation
                    .fallback()
                    .expire_overdue(&class.name, now)
                    .await?,
            );
        }

        for lease in &expired {
            warn!(
                class = %lease.resource_class,
                lease = %lease.id,
                owner = %lease.owner,
                acquired_at = %lease.acquired_at,
                "Lease expired without release"
            );
        }
        Ok(expired)
    }

    /// Remaining TTL of the longest-held lease. Once that lease is overdue
    /// its slot frees up on the next reaper pass.
    fn estimate_wait(&self, oldest: Option<&LeaseRecord>, now: DateTime<Utc>) -> Duration {
        match oldest {
            Some(lease) if !lease.is_overdue(now) => (lease.expires_at - now)
                .to_std()
                .unwrap_or(self.reap_interval),
            _ => self.reap_interval,
        }
    }

    async fn finish(
        &self,
        lease_id: LeaseId,
        state: LeaseState,
    ) -> Result<Option<LeaseRecord>, SluiceError> {
        let now = self.clock.now();
        let finished = match self.store.finish_lease(lease_id, state, now).await {
            Ok(finished) => finished,
            Err(error) => {
                self.degradation.recover(error)?;
                None
            }
        };
        match finished {
            Some(lease) => Ok(Some(lease)),
            // The lease may have been granted while the shared store was down
            None if self.degradation.policy() == DegradationPolicy::LocalFallback => {
                self.degradation
                    .fallback()
                    .finish_lease(lease_id, state, now)
                    .await
            }
            None => Ok(None),
        }
    }

    async fn locate(
        &self,
        lease_id: LeaseId,
    ) -> Result<Option<(&SharedStore, LeaseRecord)>, SluiceError> {
        match self.store.get_lease(lease_id).await {
            Ok(Some(lease)) => return Ok(Some((&self.store, lease))),
            Ok(None) => (),
            Err(error) => {
                self.degradation.recover(error)?;
            }
        }
        if self.degradation.policy() == DegradationPolicy::FailClosed {
            return Ok(None);
        }
        let fallback = self.degradation.fallback();
        Ok(fallback.get_lease(lease_id).await?.map(|lease| (fallback, lease)))
    }
}

fn lease_expiry(
    class: &ResourceClassConfig,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, SluiceError> {
    TimeDelta::from_std(class.lease_ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .ok_or_else(|| {
            SluiceError::InvalidConfig(format!(
                "lease TTL of resource class {} is out of range",
                class.name
            ))
        })
}
