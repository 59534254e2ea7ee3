use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::ActiveValue::Set;
use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use sluice_common::{LeaseId, SluiceError, WorkId};
use sluice_db_entities::WorkRecord;
use sluice_db_entities::WorkRecord::WorkStatus;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewWork {
    pub resource_class: String,
    pub owner: String,
    pub lease_id: Option<LeaseId>,
    pub started_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkEntry {
    pub id: WorkId,
    pub resource_class: String,
    pub owner: String,
    pub lease_id: Option<LeaseId>,
    pub status: WorkStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

impl From<WorkRecord::Model> for WorkEntry {
    fn from(model: WorkRecord::Model) -> Self {
        Self {
            id: model.id,
            resource_class: model.resource_class,
            owner: model.owner,
            lease_id: model.lease_id,
            status: model.status,
            started_at: model.started_at,
            finished_at: model.finished_at,
            failure_reason: model.failure_reason,
        }
    }
}

/// Durable records of guarded work, as shown to users.
///
/// Settling (`succeed`, `fail`) only applies to running records and
/// reports whether anything changed.
#[async_trait]
pub trait WorkTracker: Send + Sync {
    async fn begin(&self, work: NewWork) -> Result<WorkId, SluiceError>;

    async fn succeed(&self, id: WorkId, at: DateTime<Utc>) -> Result<bool, SluiceError>;

    async fn fail(&self, id: WorkId, reason: &str, at: DateTime<Utc>)
        -> Result<bool, SluiceError>;

    /// Fails every running record of the class started before the cutoff.
    async fn fail_stale(
        &self,
        resource_class: &str,
        started_before: DateTime<Utc>,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<u64, SluiceError>;

    async fn get(&self, id: WorkId) -> Result<Option<WorkEntry>, SluiceError>;
}

pub struct DatabaseWorkTracker {
    db: DatabaseConnection,
}

impl DatabaseWorkTracker {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    async fn settle(
        &self,
        id: WorkId,
        status: WorkStatus,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool, SluiceError> {
        let db = &self.db;
        let result = WorkRecord::Entity::update_many()
            .set(WorkRecord::ActiveModel {
                status: Set(status),
                finished_at: Set(Some(at)),
                failure_reason: Set(reason.map(str::to_owned)),
                ..Default::default()
            })
            .filter(WorkRecord::Column::Id.eq(id))
            .filter(WorkRecord::Column::Status.eq(WorkStatus::Running))
            .exec(db)
            .await?;
        Ok(result.rows_affected > 0)
    }
}

#[async_trait]
impl WorkTracker for DatabaseWorkTracker {
    async fn begin(&self, work: NewWork) -> Result<WorkId, SluiceError> {
        let db = &self.db;
        let id = Uuid::new_v4();
        let values = WorkRecord::ActiveModel {
            id: Set(id),
            resource_class: Set(work.resource_class),
            owner: Set(work.owner),
            lease_id: Set(work.lease_id),
            status: Set(WorkStatus::Running),
            started_at: Set(work.started_at),
            finished_at: Set(None),
            failure_reason: Set(None),
        };
        values.insert(db).await?;
        Ok(id)
    }

    async fn succeed(&self, id: WorkId, at: DateTime<Utc>) -> Result<bool, SluiceError> {
        self.settle(id, WorkStatus::Succeeded, None, at).await
    }

    async fn fail(
        &self,
        id: WorkId,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, SluiceError> {
        self.settle(id, WorkStatus::Failed, Some(reason), at).await
    }

    async fn fail_stale(
        &self,
        resource_class: &str,
        started_before: DateTime<Utc>,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<u64, SluiceError> {
        let db = &self.db;
        let result = WorkRecord::Entity::update_many()
            .set(WorkRecord::ActiveModel {
                status: Set(WorkStatus::Failed),
                finished_at: Set(Some(at)),
                failure_reason: Set(Some(reason.to_owned())),
                ..Default::default()
            })
            .filter(WorkRecord::Column::ResourceClass.eq(resource_class))
            .filter(WorkRecord::Column::Status.eq(WorkStatus::Running))
            .filter(WorkRecord::Column::StartedAt.lt(started_before))
            .exec(db)
            .await?;
        Ok(result.rows_affected)
    }

    async fn get(&self, id: WorkId) -> Result<Option<WorkEntry>, SluiceError> {
        let db = &self.db;
        Ok(WorkRecord::Entity::find_by_id(id)
            .one(db)
            .await?
            .map(Into::into))
    }
}

/// Work records for the in-memory backend.
#[derive(Default)]
pub struct MemoryWorkTracker {
    records: Mutex<HashMap<WorkId, WorkEntry>>,
}

impl MemoryWorkTracker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkTracker for MemoryWorkTracker {
    async fn begin(&self, work: NewWork) -> Result<WorkId, SluiceError> {
        let id = Uuid::new_v4();
        self.records.lock().await.insert(
            id,
            WorkEntry {
                id,
                resource_class: work.resource_class,
                owner: work.owner,
                lease_id: work.lease_id,
                status: WorkStatus::Running,
                started_at: work.started_at,
                finished_at: None,
                failure_reason: None,
            },
        );
        Ok(id)
    }

    async fn succeed(&self, id: WorkId, at: DateTime<Utc>) -> Result<bool, SluiceError> {
        let mut records = self.records.lock().await;
        Ok(match records.get_mut(&id) {
            Some(entry) if entry.status == WorkStatus::Running => {
                entry.status = WorkStatus::Succeeded;
                entry.finished_at = Some(at);
                true
            }
            _ => false,
        })
    }

    async fn fail(
        &self,
        id: WorkId,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, SluiceError> {
        let mut records = self.records.lock().await;
        Ok(match records.get_mut(&id) {
            Some(entry) if entry.status == WorkStatus::Running => {
                entry.status = WorkStatus::Failed;
                entry.finished_at = Some(at);
                entry.failure_reason = Some(reason.to_owned());
                true
            }
            _ => false,
        })
    }

    async fn fail_stale(
        &self,
        resource_class: &str,
        started_before: DateTime<Utc>,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<u64, SluiceError> {
        let mut failed = 0;
        for entry in self.records.lock().await.values_mut() {
            if entry.resource_class == resource_class
                && entry.status == WorkStatus::Running
                && entry.started_at < started_before
            {
                entry.status = WorkStatus::Failed;
                entry.finished_at = Some(at);
                entry.failure_reason = Some(reason.to_owned());
                failed += 1;
            }
        }
        Ok(failed)
    }

    async fn get(&self, id: WorkId) -> Result<Option<WorkEntry>, SluiceError> {
        Ok(self.records.lock().await.get(&id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;

    fn new_work(class: &str, started_at: DateTime<Utc>) -> NewWork {
        NewWork {
            resource_class: class.to_owned(),
            owner: "user-1".to_owned(),
            lease_id: None,
            started_at,
        }
    }

    async fn exercise(tracker: &dyn WorkTracker) {
        let now = Utc::now();
        let stale = tracker
            .begin(new_work("compile", now - TimeDelta::hours(2)))
            .await
            .unwrap();
        let fresh = tracker.begin(new_work("compile", now)).await.unwrap();
        let other = tracker
            .begin(new_work("analysis", now - TimeDelta::hours(2)))
            .await
            .unwrap();

        let failed = tracker
            .fail_stale("compile", now - TimeDelta::hours(1), "worker vanished", now)
            .await
            .unwrap();
        assert_eq!(failed, 1);

        let entry = tracker.get(stale).await.unwrap().unwrap();
        assert_eq!(entry.status, WorkStatus::Failed);
        assert_eq!(entry.failure_reason.as_deref(), Some("worker vanished"));
        assert_eq!(
            tracker.get(other).await.unwrap().unwrap().status,
            WorkStatus::Running
        );

        assert!(tracker.succeed(fresh, now).await.unwrap());
        // settled records stay settled
        assert!(!tracker.fail(fresh, "late", now).await.unwrap());
        assert!(!tracker.succeed(stale, now).await.unwrap());
        assert_eq!(
            tracker.get(fresh).await.unwrap().unwrap().status,
            WorkStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn test_database_tracker() {
        let db = crate::db::connect_in_memory().await.unwrap();
        exercise(&DatabaseWorkTracker::new(db)).await;
    }

    #[tokio::test]
    async fn test_memory_tracker() {
        exercise(&MemoryWorkTracker::new()).await;
    }
}
