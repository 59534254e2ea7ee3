use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sluice_common::{LeaseId, SluiceError};
use sluice_db_entities::Lease::LeaseState;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    AtomicStore, EventRecord, LeaseRecord, MarkerWindow, SlotAcquire, UsageAppend, UsageEntry,
};

/// In-process store. Serves as the local fallback when the shared store
/// is unreachable, and as the whole store for single-instance setups.
///
/// Only active leases are kept, finished ones are dropped.
#[derive(Default)]
pub struct MemoryStore {
    leases: Mutex<HashMap<LeaseId, LeaseRecord>>,
    markers: Mutex<HashMap<String, VecDeque<(DateTime<Utc>, Uuid)>>>,
    events: Mutex<HashMap<(String, String), EventRecord>>,
    usage: Mutex<Vec<UsageEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AtomicStore for MemoryStore {
    async fn acquire_slot(
        &self,
        lease: &LeaseRecord,
        limit: u32,
    ) -> Result<SlotAcquire, SluiceError> {
        let mut leases = self.leases.lock().await;
        let held: Vec<&LeaseRecord> = leases
            .values()
            .filter(|l| l.resource_class == lease.resource_class)
            .collect();

        if held.len() >= limit as usize {
            let oldest = held.iter().min_by_key(|l| l.acquired_at).map(|l| (*l).clone());
            return Ok(SlotAcquire::Full {
                active: held.len() as u32,
                oldest,
            });
        }

        leases.insert(lease.id, lease.clone());
        Ok(SlotAcquire::Acquired)
    }

    async fn finish_lease(
        &self,
        lease_id: LeaseId,
        state: LeaseState,
        _at: DateTime<Utc>,
    ) -> Result<Option<LeaseRecord>, SluiceError> {
        Ok(self.leases.lock().await.remove(&lease_id).map(|mut lease| {
            lease.state = state;
            lease
        }))
    }

    async fn extend_lease(
        &self,
        lease_id: LeaseId,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<LeaseRecord>, SluiceError> {
        Ok(self.leases.lock().await.get_mut(&lease_id).map(|lease| {
            lease.expires_at = expires_at;
            lease.clone()
        }))
    }

    async fn get_lease(&self, lease_id: LeaseId) -> Result<Option<LeaseRecord>, SluiceError> {
        Ok(self.leases.lock().await.get(&lease_id).cloned())
    }

    async fn active_leases(&self, resource_class: &str) -> Result<Vec<LeaseRecord>, SluiceError> {
        let mut held: Vec<LeaseRecord> = self
            .leases
            .lock()
            .await
            .values()
            .filter(|l| l.resource_class == resource_class)
            .cloned()
            .collect();
        held.sort_by_key(|l| l.acquired_at);
        Ok(held)
    }

    async fn expire_overdue(
        &self,
        resource_class: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<LeaseRecord>, SluiceError> {
        let mut leases = self.leases.lock().await;
        let overdue: Vec<LeaseId> = leases
            .values()
            .filter(|l| l.resource_class == resource_class && l.is_overdue(now))
            .map(|l| l.id)
            .collect();

        Ok(overdue
            .into_iter()
            .filter_map(|id| leases.remove(&id))
            .map(|mut lease| {
                lease.state = LeaseState::Expired;
                lease
            })
            .collect())
    }

    async fn push_marker(
        &self,
        key: &str,
        token: Uuid,
        at: DateTime<Utc>,
        window_start: DateTime<Utc>,
    ) -> Result<MarkerWindow, SluiceError> {
        let mut markers = self.markers.lock().await;
        let window = markers.entry(key.to_owned()).or_default();
        window.retain(|(timestamp, _)| *timestamp > window_start);
        window.push_back((at, token));

        let oldest = window.iter().map(|(t, _)| *t).min().unwrap_or(at);
        Ok(MarkerWindow {
            count: window.len() as u32,
            oldest,
        })
    }

    async fn remove_marker(&self, key: &str, token: Uuid) -> Result<(), SluiceError> {
        let mut markers = self.markers.lock().await;
        if let Some(window) = markers.get_mut(key) {
            window.retain(|(_, t)| *t != token);
            if window.is_empty() {
                markers.remove(key);
            }
        }
        Ok(())
    }

    async fn prune_markers(&self, before: DateTime<Utc>) -> Result<u64, SluiceError> {
        let mut markers = self.markers.lock().await;
        let mut removed = 0;
        for window in markers.values_mut() {
            let len = window.len();
            window.retain(|(timestamp, _)| *timestamp > before);
            removed += (len - window.len()) as u64;
        }
        markers.retain(|_, window| !window.is_empty());
        Ok(removed)
    }

    async fn insert_event_if_absent(&self, event: &EventRecord) -> Result<bool, SluiceError> {
        let mut events = self.events.lock().await;
        match events.entry((event.provider.clone(), event.event_id.clone())) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(event.clone());
                Ok(true)
            }
        }
    }

    async fn find_event(
        &self,
        provider: &str,
        event_id: &str,
    ) -> Result<Option<EventRecord>, SluiceError> {
        Ok(self
            .events
            .lock()
            .await
            .get(&(provider.to_owned(), event_id.to_owned()))
            .cloned())
    }

    async fn append_usage_within(
        &self,
        entry: &UsageEntry,
        scope_cap: i64,
        subject_cap: i64,
    ) -> Result<UsageAppend, SluiceError> {
        let mut usage = self.usage.lock().await;
        let outcome = UsageAppend::evaluate(
            total(&usage, &entry.subject, Some(&entry.scope)),
            total(&usage, &entry.subject, None),
            scope_cap,
            subject_cap,
        );
        if outcome.appended {
            usage.push(entry.clone());
        }
        Ok(outcome)
    }

    async fn sum_usage(&self, subject: &str, scope: Option<&str>) -> Result<i64, SluiceError> {
        Ok(total(&self.usage.lock().await, subject, scope))
    }
}

fn total(usage: &[UsageEntry], subject: &str, scope: Option<&str>) -> i64 {
    usage
        .iter()
        .filter(|e| e.subject == subject && scope.is_none_or(|s| e.scope == s))
        .map(|e| e.amount)
        .sum()
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;

    fn lease(class: &str, acquired_at: DateTime<Utc>) -> LeaseRecord {
        LeaseRecord {
            id: Uuid::new_v4(),
            resource_class: class.to_owned(),
            owner: "user-1".to_owned(),
            state: LeaseState::Active,
            acquired_at,
            expires_at: acquired_at + TimeDelta::minutes(5),
        }
    }

    #[tokio::test]
    async fn test_acquire_stops_at_limit() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let first = lease("compile", now);

        assert_eq!(
            store.acquire_slot(&first, 2).await.unwrap(),
            SlotAcquire::Acquired
        );
        assert_eq!(
            store
                .acquire_slot(&lease("compile", now + TimeDelta::seconds(1)), 2)
                .await
                .unwrap(),
            SlotAcquire::Acquired
        );

        match store.acquire_slot(&lease("compile", now), 2).await.unwrap() {
            SlotAcquire::Full { active, oldest } => {
                assert_eq!(active, 2);
                assert_eq!(oldest.map(|l| l.id), Some(first.id));
            }
            SlotAcquire::Acquired => panic!("expected the class to be full"),
        }

        // other classes are unaffected
        assert_eq!(
            store.acquire_slot(&lease("analysis", now), 1).await.unwrap(),
            SlotAcquire::Acquired
        );
    }

    #[tokio::test]
    async fn test_finish_is_one_shot() {
        let store = MemoryStore::new();
        let held = lease("compile", Utc::now());
        store.acquire_slot(&held, 1).await.unwrap();

        let finished = store
            .finish_lease(held.id, LeaseState::Released, Utc::now())
            .await
            .unwrap();
        assert_eq!(finished.map(|l| l.state), Some(LeaseState::Released));
        assert!(store
            .finish_lease(held.id, LeaseState::Released, Utc::now())
            .await
            .unwrap()
            .is_none());
        assert!(store.active_leases("compile").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_prune_markers_drops_empty_keys() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let start = now - TimeDelta::hours(1);
        store
            .push_marker("login:a", Uuid::new_v4(), now - TimeDelta::minutes(50), start)
            .await
            .unwrap();
        store
            .push_marker("login:a", Uuid::new_v4(), now, start)
            .await
            .unwrap();
        store
            .push_marker("login:b", Uuid::new_v4(), now - TimeDelta::minutes(40), start)
            .await
            .unwrap();

        let removed = store
            .prune_markers(now - TimeDelta::minutes(30))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.markers.lock().await.len(), 1);
    }
}
