//! The shared atomic store every instance coordinates through.
//!
//! Each method is a single atomic step from the caller's point of view.
//! Compound logic (check then grant, insert then count) lives in the
//! store implementation so that concurrent callers on any instance
//! observe one linearizable outcome.

mod database;
mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
pub use database::DatabaseStore;
pub use memory::MemoryStore;
use sluice_common::{DegradationPolicy, LeaseId, SluiceError};
use sluice_db_entities::Lease::LeaseState;
use sluice_db_entities::{Lease, ProcessedEvent, UsageRecord};
use tracing::{error, warn};
use uuid::Uuid;

pub type SharedStore = Arc<dyn AtomicStore>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaseRecord {
    pub id: LeaseId,
    pub resource_class: String,
    pub owner: String,
    pub state: LeaseState,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LeaseRecord {
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

impl From<Lease::Model> for LeaseRecord {
    fn from(model: Lease::Model) -> Self {
        Self {
            id: model.id,
            resource_class: model.resource_class,
            owner: model.owner,
            state: model.state,
            acquired_at: model.acquired_at,
            expires_at: model.expires_at,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SlotAcquire {
    Acquired,
    /// The class is at its limit. `oldest` is the active lease that
    /// has been held the longest, if the store could see one.
    Full {
        active: u32,
        oldest: Option<LeaseRecord>,
    },
}

/// Occupancy of one rate-limit key right after a marker was pushed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MarkerWindow {
    /// Markers in the window, including the one just pushed
    pub count: u32,
    pub oldest: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventRecord {
    pub id: Uuid,
    pub provider: String,
    pub event_id: String,
    pub event_type: String,
    pub claimed_at: DateTime<Utc>,
}

impl From<ProcessedEvent::Model> for EventRecord {
    fn from(model: ProcessedEvent::Model) -> Self {
        Self {
            id: model.id,
            provider: model.provider,
            event_id: model.event_id,
            event_type: model.event_type,
            claimed_at: model.claimed_at,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UsageEntry {
    pub id: Uuid,
    pub subject: String,
    pub scope: String,
    pub amount: i64,
    pub recorded_at: DateTime<Utc>,
}

impl From<UsageRecord::Model> for UsageEntry {
    fn from(model: UsageRecord::Model) -> Self {
        Self {
            id: model.id,
            subject: model.subject,
            scope: model.scope,
            amount: model.amount,
            recorded_at: model.recorded_at,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UsageAppend {
    pub appended: bool,
    pub scope_used: i64,
    pub subject_used: i64,
}

impl UsageAppend {
    fn evaluate(scope_used: i64, subject_used: i64, scope_cap: i64, subject_cap: i64) -> Self {
        Self {
            appended: scope_used < scope_cap && subject_used < subject_cap,
            scope_used,
            subject_used,
        }
    }
}

#[async_trait]
pub trait AtomicStore: Send + Sync {
    /// Grants a slot for `lease` if fewer than `limit` leases of its class
    /// are active, and records the lease in the same step.
    async fn acquire_slot(&self, lease: &LeaseRecord, limit: u32)
        -> Result<SlotAcquire, SluiceError>;

    /// Moves an active lease into `state` and frees its slot.
    /// Returns `None` when the lease is unknown or already finished.
    async fn finish_lease(
        &self,
        lease_id: LeaseId,
        state: LeaseState,
        at: DateTime<Utc>,
    ) -> Result<Option<LeaseRecord>, SluiceError>;

    async fn extend_lease(
        &self,
        lease_id: LeaseId,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<LeaseRecord>, SluiceError>;

    async fn get_lease(&self, lease_id: LeaseId) -> Result<Option<LeaseRecord>, SluiceError>;

    /// Active leases of a class, oldest first.
    async fn active_leases(&self, resource_class: &str) -> Result<Vec<LeaseRecord>, SluiceError>;

    /// Expires every active lease of the class whose TTL ran out
    /// at or before `now`, freeing their slots.
    async fn expire_overdue(
        &self,
        resource_class: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<LeaseRecord>, SluiceError>;

    /// Drops the key's markers at or before `window_start`, adds a marker
    /// under `token` and reports what the window holds afterwards.
    async fn push_marker(
        &self,
        key: &str,
        token: Uuid,
        at: DateTime<Utc>,
        window_start: DateTime<Utc>,
    ) -> Result<MarkerWindow, SluiceError>;

    async fn remove_marker(&self, key: &str, token: Uuid) -> Result<(), SluiceError>;

    /// Deletes markers of every key at or before `before`.
    async fn prune_markers(&self, before: DateTime<Utc>) -> Result<u64, SluiceError>;

    /// Returns `false` if an event with the same provider and id exists.
    async fn insert_event_if_absent(&self, event: &EventRecord) -> Result<bool, SluiceError>;

    async fn find_event(
        &self,
        provider: &str,
        event_id: &str,
    ) -> Result<Option<EventRecord>, SluiceError>;

    /// Appends `entry` unless its subject has used `subject_cap` or its
    /// scope has used `scope_cap`. Totals are read and the entry written
    /// in one step, the returned totals exclude the entry.
    async fn append_usage_within(
        &self,
        entry: &UsageEntry,
        scope_cap: i64,
        subject_cap: i64,
    ) -> Result<UsageAppend, SluiceError>;

    /// Total recorded usage of a subject, optionally narrowed to one scope.
    async fn sum_usage(&self, subject: &str, scope: Option<&str>) -> Result<i64, SluiceError>;
}

/// Picks the store a subsystem continues on after the shared store failed.
#[derive(Clone)]
pub struct Degradation {
    subsystem: &'static str,
    policy: DegradationPolicy,
    fallback: SharedStore,
}

impl Degradation {
    pub fn new(subsystem: &'static str, policy: DegradationPolicy, fallback: SharedStore) -> Self {
        Self {
            subsystem,
            policy,
            fallback,
        }
    }

    pub fn fail_closed(subsystem: &'static str) -> Self {
        Self::new(
            subsystem,
            DegradationPolicy::FailClosed,
            Arc::new(MemoryStore::new()),
        )
    }

    pub fn policy(&self) -> DegradationPolicy {
        self.policy
    }

    pub fn fallback(&self) -> &SharedStore {
        &self.fallback
    }

    /// Hands out the fallback store for an outage, or gives the error back
    /// when it is not an outage or the subsystem fails closed.
    pub fn recover(&self, error: SluiceError) -> Result<&SharedStore, SluiceError> {
        if !error.is_store_unavailable() {
            return Err(error);
        }
        match self.policy {
            DegradationPolicy::LocalFallback => {
                warn!(
                    subsystem = self.subsystem,
                    %error,
                    "Shared store unavailable, continuing on the local store"
                );
                Ok(&self.fallback)
            }
            DegradationPolicy::FailClosed => {
                error!(
                    subsystem = self.subsystem,
                    %error,
                    "Shared store unavailable, refusing the operation"
                );
                Err(error)
            }
        }
    }
}
