use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Alias, Expr, OnConflict};
use sea_orm::ActiveValue::Set;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DatabaseTransaction,
    DbBackend, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect,
    TransactionTrait,
};
use sluice_common::{LeaseId, SluiceError};
use sluice_db_entities::Lease::LeaseState;
use sluice_db_entities::{
    Lease, ProcessedEvent, QuotaSubject, RateLimitBucket, RateLimitMarker, ResourceSlot,
    UsageRecord,
};
use uuid::Uuid;

use super::{
    AtomicStore, EventRecord, LeaseRecord, MarkerWindow, SlotAcquire, UsageAppend, UsageEntry,
};

/// Shared store on top of the SQL database all instances connect to.
///
/// Capacity lives in `resource_slots.active` and only moves through
/// conditional updates, so the row lock taken by the `UPDATE` is what
/// arbitrates between instances.
pub struct DatabaseStore {
    db: DatabaseConnection,
}

impl DatabaseStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Creates the capacity row of a class if it does not exist yet.
    pub async fn ensure_slot(&self, resource_class: &str) -> Result<(), SluiceError> {
        let db = &self.db;
        ensure_slot(db, resource_class, Utc::now()).await
    }
}

async fn ensure_slot<C: ConnectionTrait>(
    db: &C,
    resource_class: &str,
    now: DateTime<Utc>,
) -> Result<(), SluiceError> {
    let values = ResourceSlot::ActiveModel {
        name: Set(resource_class.to_owned()),
        active: Set(0),
        updated_at: Set(now),
    };
    ResourceSlot::Entity::insert(values)
        .on_conflict(
            OnConflict::column(ResourceSlot::Column::Name)
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(db)
        .await?;
    Ok(())
}

async fn finish_in(
    txn: &DatabaseTransaction,
    lease: Lease::Model,
    state: LeaseState,
    at: DateTime<Utc>,
) -> Result<Option<LeaseRecord>, SluiceError> {
    let moved = Lease::Entity::update_many()
        .set(Lease::ActiveModel {
            state: Set(state),
            finished_at: Set(Some(at)),
            ..Default::default()
        })
        .filter(Lease::Column::Id.eq(lease.id))
        .filter(Lease::Column::State.eq(LeaseState::Active))
        .exec(txn)
        .await?;

    if moved.rows_affected == 0 {
        return Ok(None);
    }

    ResourceSlot::Entity::update_many()
        .col_expr(
            ResourceSlot::Column::Active,
            Expr::col(ResourceSlot::Column::Active).sub(1),
        )
        .col_expr(ResourceSlot::Column::UpdatedAt, Expr::value(at))
        .filter(ResourceSlot::Column::Name.eq(lease.resource_class.as_str()))
        .filter(ResourceSlot::Column::Active.gt(0))
        .exec(txn)
        .await?;

    let mut record = LeaseRecord::from(lease);
    record.state = state;
    Ok(Some(record))
}

#[async_trait]
impl AtomicStore for DatabaseStore {
    async fn acquire_slot(
        &self,
        lease: &LeaseRecord,
        limit: u32,
    ) -> Result<SlotAcquire, SluiceError> {
        let limit = i32::try_from(limit).unwrap_or(i32::MAX);
        let db = &self.db;
        let txn = db.begin().await?;

        ensure_slot(&txn, &lease.resource_class, lease.acquired_at).await?;

        let granted = ResourceSlot::Entity::update_many()
            .col_expr(
                ResourceSlot::Column::Active,
                Expr::col(ResourceSlot::Column::Active).add(1),
            )
            .col_expr(ResourceSlot::Column::UpdatedAt, Expr::value(lease.acquired_at))
            .filter(ResourceSlot::Column::Name.eq(lease.resource_class.as_str()))
            .filter(ResourceSlot::Column::Active.lt(limit))
            .exec(&txn)
            .await?
            .rows_affected
            > 0;

        if !granted {
            let active = ResourceSlot::Entity::find_by_id(lease.resource_class.clone())
                .one(&txn)
                .await?
                .map(|slot| slot.active.max(0) as u32)
                .unwrap_or(0);
            let oldest = Lease::Entity::find()
                .filter(Lease::Column::ResourceClass.eq(lease.resource_class.as_str()))
                .filter(Lease::Column::State.eq(LeaseState::Active))
                .order_by_asc(Lease::Column::AcquiredAt)
                .one(&txn)
                .await?;
            txn.commit().await?;
            return Ok(SlotAcquire::Full {
                active,
                oldest: oldest.map(Into::into),
            });
        }

        let values = Lease::ActiveModel {
            id: Set(lease.id),
            resource_class: Set(lease.resource_class.clone()),
            owner: Set(lease.owner.clone()),
            state: Set(LeaseState::Active),
            acquired_at: Set(lease.acquired_at),
            expires_at: Set(lease.expires_at),
            finished_at: Set(None),
        };
        values.insert(&txn).await?;
        txn.commit().await?;

        Ok(SlotAcquire::Acquired)
    }

    async fn finish_lease(
        &self,
        lease_id: LeaseId,
        state: LeaseState,
        at: DateTime<Utc>,
    ) -> Result<Option<LeaseRecord>, SluiceError> {
        let db = &self.db;
        let txn = db.begin().await?;

        let Some(lease) = Lease::Entity::find_by_id(lease_id).one(&txn).await? else {
            return Ok(None);
        };
        let finished = finish_in(&txn, lease, state, at).await?;
        txn.commit().await?;
        Ok(finished)
    }

    async fn extend_lease(
        &self,
        lease_id: LeaseId,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<LeaseRecord>, SluiceError> {
        let db = &self.db;
        let result = Lease::Entity::update_many()
            .set(Lease::ActiveModel {
                expires_at: Set(expires_at),
                ..Default::default()
            })
            .filter(Lease::Column::Id.eq(lease_id))
            .filter(Lease::Column::State.eq(LeaseState::Active))
            .exec(db)
            .await?;

        if result.rows_affected == 0 {
            return Ok(None);
        }
        Ok(Lease::Entity::find_by_id(lease_id)
            .one(db)
            .await?
            .map(Into::into))
    }

    async fn get_lease(&self, lease_id: LeaseId) -> Result<Option<LeaseRecord>, SluiceError> {
        let db = &self.db;
        Ok(Lease::Entity::find_by_id(lease_id)
            .one(db)
            .await?
            .map(Into::into))
    }

    async fn active_leases(&self, resource_class: &str) -> Result<Vec<LeaseRecord>, SluiceError> {
        let db = &self.db;
        Ok(Lease::Entity::find()
            .filter(Lease::Column::ResourceClass.eq(resource_class))
            .filter(Lease::Column::State.eq(LeaseState::Active))
            .order_by_asc(Lease::Column::AcquiredAt)
            .all(db)
            .await?
            .into_iter()
            .map(Into::into)
            .collect())
    }

    async fn expire_overdue(
        &self,
        resource_class: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<LeaseRecord>, SluiceError> {
        let db = &self.db;
        let txn = db.begin().await?;

        let overdue = Lease::Entity::find()
            .filter(Lease::Column::ResourceClass.eq(resource_class))
            .filter(Lease::Column::State.eq(LeaseState::Active))
            .filter(Lease::Column::ExpiresAt.lte(now))
            .all(&txn)
            .await?;

        let mut expired = Vec::with_capacity(overdue.len());
        for lease in overdue {
            // another instance's reaper may have won the race for this one
            if let Some(record) = finish_in(&txn, lease, LeaseState::Expired, now).await? {
                expired.push(record);
            }
        }
        txn.commit().await?;
        Ok(expired)
    }

    async fn push_marker(
        &self,
        key: &str,
        token: Uuid,
        at: DateTime<Utc>,
        window_start: DateTime<Utc>,
    ) -> Result<MarkerWindow, SluiceError> {
        let db = &self.db;
        let txn = db.begin().await?;

        // Row lock on the bucket serializes writers of this key until commit
        RateLimitBucket::Entity::insert(RateLimitBucket::ActiveModel {
            key: Set(key.to_owned()),
            touched_at: Set(at),
        })
        .on_conflict(
            OnConflict::column(RateLimitBucket::Column::Key)
                .update_column(RateLimitBucket::Column::TouchedAt)
                .to_owned(),
        )
        .exec_without_returning(&txn)
        .await?;

        RateLimitMarker::Entity::delete_many()
            .filter(RateLimitMarker::Column::Key.eq(key))
            .filter(RateLimitMarker::Column::Timestamp.lte(window_start))
            .exec(&txn)
            .await?;

        RateLimitMarker::Entity::insert(RateLimitMarker::ActiveModel {
            token: Set(token),
            key: Set(key.to_owned()),
            timestamp: Set(at),
        })
        .exec_without_returning(&txn)
        .await?;

        let count = RateLimitMarker::Entity::find()
            .filter(RateLimitMarker::Column::Key.eq(key))
            .count(&txn)
            .await?;
        let oldest = RateLimitMarker::Entity::find()
            .filter(RateLimitMarker::Column::Key.eq(key))
            .order_by_asc(RateLimitMarker::Column::Timestamp)
            .one(&txn)
            .await?
            .map(|marker| marker.timestamp)
            .unwrap_or(at);

        txn.commit().await?;

        Ok(MarkerWindow {
            count: u32::try_from(count).unwrap_or(u32::MAX),
            oldest,
        })
    }

    async fn remove_marker(&self, key: &str, token: Uuid) -> Result<(), SluiceError> {
        let db = &self.db;
        RateLimitMarker::Entity::delete_many()
            .filter(RateLimitMarker::Column::Key.eq(key))
            .filter(RateLimitMarker::Column::Token.eq(token))
            .exec(db)
            .await?;
        Ok(())
    }

    async fn prune_markers(&self, before: DateTime<Utc>) -> Result<u64, SluiceError> {
        let db = &self.db;
        let markers = RateLimitMarker::Entity::delete_many()
            .filter(RateLimitMarker::Column::Timestamp.lte(before))
            .exec(db)
            .await?;
        RateLimitBucket::Entity::delete_many()
            .filter(RateLimitBucket::Column::TouchedAt.lte(before))
            .exec(db)
            .await?;
        Ok(markers.rows_affected)
    }

    async fn insert_event_if_absent(&self, event: &EventRecord) -> Result<bool, SluiceError> {
        let db = &self.db;
        let values = ProcessedEvent::ActiveModel {
            id: Set(event.id),
            provider: Set(event.provider.clone()),
            event_id: Set(event.event_id.clone()),
            event_type: Set(event.event_type.clone()),
            claimed_at: Set(event.claimed_at),
        };

        // The unique (provider, event_id) index makes this the single
        // arbiter between concurrent deliveries.
        let inserted = ProcessedEvent::Entity::insert(values)
            .on_conflict(
                OnConflict::columns([
                    ProcessedEvent::Column::Provider,
                    ProcessedEvent::Column::EventId,
                ])
                .do_nothing()
                .to_owned(),
            )
            .exec_without_returning(db)
            .await?;
        Ok(inserted > 0)
    }

    async fn find_event(
        &self,
        provider: &str,
        event_id: &str,
    ) -> Result<Option<EventRecord>, SluiceError> {
        let db = &self.db;
        Ok(ProcessedEvent::Entity::find()
            .filter(ProcessedEvent::Column::Provider.eq(provider))
            .filter(ProcessedEvent::Column::EventId.eq(event_id))
            .one(db)
            .await?
            .map(Into::into))
    }

    async fn append_usage_within(
        &self,
        entry: &UsageEntry,
        scope_cap: i64,
        subject_cap: i64,
    ) -> Result<UsageAppend, SluiceError> {
        let db = &self.db;
        let txn = db.begin().await?;

        // Row lock on the subject serializes recorders until commit
        QuotaSubject::Entity::insert(QuotaSubject::ActiveModel {
            subject: Set(entry.subject.clone()),
            touched_at: Set(entry.recorded_at),
        })
        .on_conflict(
            OnConflict::column(QuotaSubject::Column::Subject)
                .update_column(QuotaSubject::Column::TouchedAt)
                .to_owned(),
        )
        .exec_without_returning(&txn)
        .await?;

        let outcome = UsageAppend::evaluate(
            sum_usage(&txn, &entry.subject, Some(&entry.scope)).await?,
            sum_usage(&txn, &entry.subject, None).await?,
            scope_cap,
            subject_cap,
        );
        if outcome.appended {
            UsageRecord::ActiveModel {
                id: Set(entry.id),
                subject: Set(entry.subject.clone()),
                scope: Set(entry.scope.clone()),
                amount: Set(entry.amount),
                recorded_at: Set(entry.recorded_at),
            }
            .insert(&txn)
            .await?;
        }

        txn.commit().await?;
        Ok(outcome)
    }

    async fn sum_usage(&self, subject: &str, scope: Option<&str>) -> Result<i64, SluiceError> {
        sum_usage(&self.db, subject, scope).await
    }
}

async fn sum_usage<C: ConnectionTrait>(
    db: &C,
    subject: &str,
    scope: Option<&str>,
) -> Result<i64, SluiceError> {
    // SUM(bigint) is NUMERIC on Postgres
    let integer = match db.get_database_backend() {
        DbBackend::MySql => "SIGNED",
        _ => "BIGINT",
    };

    let mut query = UsageRecord::Entity::find()
        .select_only()
        .column_as(
            Expr::expr(UsageRecord::Column::Amount.sum()).cast_as(Alias::new(integer)),
            "total",
        )
        .filter(UsageRecord::Column::Subject.eq(subject));
    if let Some(scope) = scope {
        query = query.filter(UsageRecord::Column::Scope.eq(scope));
    }

    let total: Option<Option<i64>> = query.into_tuple().one(db).await?;
    Ok(total.flatten().unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeDelta;
    use futures::future::join_all;

    use super::*;
    use crate::db::connect_in_memory;

    async fn store() -> DatabaseStore {
        DatabaseStore::new(connect_in_memory().await.unwrap())
    }

    fn lease(class: &str, acquired_at: DateTime<Utc>) -> LeaseRecord {
        LeaseRecord {
            id: Uuid::new_v4(),
            resource_class: class.to_owned(),
            owner: "project-7".to_owned(),
            state: LeaseState::Active,
            acquired_at,
            expires_at: acquired_at + TimeDelta::minutes(5),
        }
    }

    #[tokio::test]
    async fn test_slot_counter_tracks_leases() {
        let store = store().await;
        let now = Utc::now();
        let first = lease("analysis", now);
        let second = lease("analysis", now + TimeDelta::seconds(1));

        assert_eq!(
            store.acquire_slot(&first, 2).await.unwrap(),
            SlotAcquire::Acquired
        );
        assert_eq!(
            store.acquire_slot(&second, 2).await.unwrap(),
            SlotAcquire::Acquired
        );
        match store.acquire_slot(&lease("analysis", now), 2).await.unwrap() {
            SlotAcquire::Full { active, oldest } => {
                assert_eq!(active, 2);
                assert_eq!(oldest.map(|l| l.id), Some(first.id));
            }
            SlotAcquire::Acquired => panic!("expected the class to be full"),
        }

        let released = store
            .finish_lease(first.id, LeaseState::Released, now)
            .await
            .unwrap();
        assert_eq!(released.map(|l| l.state), Some(LeaseState::Released));

        // a second release of the same lease must not free another slot
        assert!(store
            .finish_lease(first.id, LeaseState::Released, now)
            .await
            .unwrap()
            .is_none());

        assert_eq!(
            store
                .acquire_slot(&lease("analysis", now), 2)
                .await
                .unwrap(),
            SlotAcquire::Acquired
        );
        assert!(matches!(
            store.acquire_slot(&lease("analysis", now), 2).await.unwrap(),
            SlotAcquire::Full { active: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_concurrent_acquires_never_exceed_limit() {
        let store = Arc::new(store().await);
        let now = Utc::now();

        let attempts = (0..10).map(|_| {
            let store = store.clone();
            async move { store.acquire_slot(&lease("compile", now), 3).await }
        });
        let granted = join_all(attempts)
            .await
            .into_iter()
            .filter(|r| matches!(r, Ok(SlotAcquire::Acquired)))
            .count();

        assert_eq!(granted, 3);
        assert_eq!(store.active_leases("compile").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_expire_overdue_frees_slots() {
        let store = store().await;
        let now = Utc::now();
        let stale = lease("compile", now - TimeDelta::minutes(10));
        let fresh = lease("compile", now);
        store.acquire_slot(&stale, 2).await.unwrap();
        store.acquire_slot(&fresh, 2).await.unwrap();

        let expired = store.expire_overdue("compile", now).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, stale.id);
        assert_eq!(expired[0].state, LeaseState::Expired);

        let stored = store.get_lease(stale.id).await.unwrap().unwrap();
        assert_eq!(stored.state, LeaseState::Expired);
        assert_eq!(
            store.acquire_slot(&lease("compile", now), 2).await.unwrap(),
            SlotAcquire::Acquired
        );
    }

    #[tokio::test]
    async fn test_extend_only_touches_active_leases() {
        let store = store().await;
        let now = Utc::now();
        let held = lease("compile", now);
        store.acquire_slot(&held, 1).await.unwrap();

        let later = now + TimeDelta::minutes(30);
        let extended = store.extend_lease(held.id, later).await.unwrap().unwrap();
        assert_eq!(extended.expires_at, later);

        store
            .finish_lease(held.id, LeaseState::Released, now)
            .await
            .unwrap();
        assert!(store.extend_lease(held.id, later).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_markers_count_within_window() {
        let store = store().await;
        let now = Utc::now();
        let window_start = now - TimeDelta::hours(1);

        store
            .push_marker("chat:u1", Uuid::new_v4(), now - TimeDelta::minutes(90), now - TimeDelta::hours(3))
            .await
            .unwrap();
        let first = now - TimeDelta::minutes(20);
        store
            .push_marker("chat:u1", Uuid::new_v4(), first, window_start)
            .await
            .unwrap();

        let token = Uuid::new_v4();
        let window = store
            .push_marker("chat:u1", token, now, window_start)
            .await
            .unwrap();
        // the 90 minute old marker fell out of the window
        assert_eq!(window.count, 2);
        assert_eq!(window.oldest, first);

        store.remove_marker("chat:u1", token).await.unwrap();
        let window = store
            .push_marker("chat:u1", Uuid::new_v4(), now, window_start)
            .await
            .unwrap();
        assert_eq!(window.count, 2);
    }

    #[tokio::test]
    async fn test_event_insert_is_first_writer_wins() {
        let store = store().await;
        let event = |id: &str| EventRecord {
            id: Uuid::new_v4(),
            provider: "stripe".to_owned(),
            event_id: id.to_owned(),
            event_type: "invoice.paid".to_owned(),
            claimed_at: Utc::now(),
        };

        assert!(store.insert_event_if_absent(&event("evt_1")).await.unwrap());
        assert!(!store.insert_event_if_absent(&event("evt_1")).await.unwrap());
        assert!(store.insert_event_if_absent(&event("evt_2")).await.unwrap());

        let found = store.find_event("stripe", "evt_1").await.unwrap().unwrap();
        assert_eq!(found.event_type, "invoice.paid");
        assert!(store.find_event("paddle", "evt_1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_usage_sums_by_subject_and_scope() {
        let store = store().await;
        let entry = |scope: &str, amount| UsageEntry {
            id: Uuid::new_v4(),
            subject: "user-1".to_owned(),
            scope: scope.to_owned(),
            amount,
            recorded_at: Utc::now(),
        };

        assert_eq!(store.sum_usage("user-1", None).await.unwrap(), 0);
        for (scope, amount) in [("drafting", 120), ("drafting", 30), ("review", 50)] {
            let append = store
                .append_usage_within(&entry(scope, amount), 1000, 1000)
                .await
                .unwrap();
            assert!(append.appended);
        }

        assert_eq!(store.sum_usage("user-1", Some("drafting")).await.unwrap(), 150);
        assert_eq!(store.sum_usage("user-1", None).await.unwrap(), 200);
        assert_eq!(store.sum_usage("user-2", None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_usage_append_stops_at_either_cap() {
        let store = store().await;
        let entry = |scope: &str, amount| UsageEntry {
            id: Uuid::new_v4(),
            subject: "user-1".to_owned(),
            scope: scope.to_owned(),
            amount,
            recorded_at: Utc::now(),
        };

        let first = store
            .append_usage_within(&entry("drafting", 100), 100, 150)
            .await
            .unwrap();
        assert!(first.appended);

        // scope is at its cap, the entry is not written
        let full = store
            .append_usage_within(&entry("drafting", 1), 100, 150)
            .await
            .unwrap();
        assert_eq!(
            full,
            UsageAppend {
                appended: false,
                scope_used: 100,
                subject_used: 100,
            }
        );

        let other = store
            .append_usage_within(&entry("review", 50), 100, 150)
            .await
            .unwrap();
        assert!(other.appended);

        // subject total reached, a fresh scope does not help
        let fresh = store
            .append_usage_within(&entry("summary", 1), 100, 150)
            .await
            .unwrap();
        assert!(!fresh.appended);
        assert_eq!(fresh.subject_used, 150);
        assert_eq!(store.sum_usage("user-1", None).await.unwrap(), 150);
    }
}
