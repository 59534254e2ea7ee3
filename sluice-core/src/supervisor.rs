use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use sluice_common::{LeaseId, SluiceError, WorkId};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::*;

use crate::admission::{AdmissionController, LeaseGrant};
use crate::clock::Clock;
use crate::work::{NewWork, WorkTracker};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome<T> {
    Succeeded(T),
    Failed(String),
}

pub struct JobHandle<T> {
    work_id: WorkId,
    lease_id: LeaseId,
    abort: AbortHandle,
    completion: oneshot::Receiver<JobOutcome<T>>,
}

impl<T> JobHandle<T> {
    pub fn work_id(&self) -> WorkId {
        self.work_id
    }

    pub fn lease_id(&self) -> LeaseId {
        self.lease_id
    }

    /// Aborts the work. Its record is failed and its lease released.
    pub fn cancel(&self) {
        self.abort.abort();
    }

    pub async fn wait(self) -> JobOutcome<T> {
        self.completion
            .await
            .unwrap_or_else(|_| JobOutcome::Failed("supervisor task dropped".to_owned()))
    }
}

/// Runs admitted work out of band. Whatever way the work ends, its
/// record is settled and its lease released.
pub struct Supervisor {
    admission: Arc<AdmissionController>,
    work: Arc<dyn WorkTracker>,
    clock: Arc<dyn Clock>,
}

impl Supervisor {
    pub fn new(
        admission: Arc<AdmissionController>,
        work: Arc<dyn WorkTracker>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            admission,
            work,
            clock,
        }
    }

    pub async fn spawn<F, T, E>(&self, grant: &LeaseGrant, task: F) -> Result<JobHandle<T>, SluiceError>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Display + Send + 'static,
    {
        let lease_id = grant.lease_id;
        let begun = self
            .work
            .begin(NewWork {
                resource_class: grant.resource_class.clone(),
                owner: grant.owner.clone(),
                lease_id: Some(lease_id),
                started_at: self.clock.now(),
            })
            .await;
        let work_id = match begun {
            Ok(work_id) => work_id,
            Err(error) => {
                if let Err(release_error) = self.admission.release(lease_id).await {
                    error!(lease = %lease_id, error = %release_error, "Failed to release lease");
                }
                return Err(error);
            }
        };

        let worker = tokio::spawn(task);
        let abort = worker.abort_handle();
        let (completion_tx, completion_rx) = oneshot::channel();

        let admission = self.admission.clone();
        let work = self.work.clone();
        let clock = self.clock.clone();
        tokio::spawn(async move {
            let outcome = match worker.await {
                Ok(Ok(value)) => JobOutcome::Succeeded(value),
                Ok(Err(error)) => JobOutcome::Failed(error.to_string()),
                Err(join_error) if join_error.is_panic() => {
                    JobOutcome::Failed("worker panicked".to_owned())
                }
                Err(_) => JobOutcome::Failed("worker cancelled".to_owned()),
            };

            let now = clock.now();
            let settled = match &outcome {
                JobOutcome::Succeeded(_) => work.succeed(work_id, now).await,
                JobOutcome::Failed(reason) => {
                    warn!(work = %work_id, %reason, "Work failed");
                    work.fail(work_id, reason, now).await
                }
            };
            if let Err(error) = settled {
                error!(work = %work_id, %error, "Failed to settle work record");
            }

            if let Err(error) = admission.release(lease_id).await {
                error!(lease = %lease_id, %error, "Failed to release lease");
            }

            let _ = completion_tx.send(outcome);
        });

        Ok(JobHandle {
            work_id,
            lease_id,
            abort,
            completion: completion_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use sluice_common::{DegradationPolicy, ResourceClassConfig};
    use sluice_db_entities::WorkRecord::WorkStatus;

    use super::*;
    use crate::admission::Admission;
    use crate::clock::SystemClock;
    use crate::store::{Degradation, MemoryStore};
    use crate::work::MemoryWorkTracker;

    struct Fixture {
        admission: Arc<AdmissionController>,
        work: Arc<dyn WorkTracker>,
        supervisor: Supervisor,
    }

    fn fixture() -> Fixture {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let admission = Arc::new(AdmissionController::new(
            &[ResourceClassConfig {
                name: "compile".to_owned(),
                limit: 1,
                lease_ttl: Duration::from_secs(300),
                stale_after: Duration::from_secs(900),
            }],
            Arc::new(MemoryStore::new()),
            Degradation::new(
                "admission",
                DegradationPolicy::LocalFallback,
                Arc::new(MemoryStore::new()),
            ),
            clock.clone(),
            Duration::from_secs(300),
        ));
        let work: Arc<dyn WorkTracker> = Arc::new(MemoryWorkTracker::new());
        let supervisor = Supervisor::new(admission.clone(), work.clone(), clock);
        Fixture {
            admission,
            work,
            supervisor,
        }
    }

    async fn grant(admission: &AdmissionController) -> LeaseGrant {
        match admission.try_acquire("compile", "u1").await.unwrap() {
            Admission::Granted(grant) => grant,
            Admission::Denied(_) => panic!("slot should be free"),
        }
    }

    #[tokio::test]
    async fn test_success_settles_and_releases() {
        let f = fixture();
        let grant = grant(&f.admission).await;
        let handle = f
            .supervisor
            .spawn(&grant, async { Ok::<_, String>(42) })
            .await
            .unwrap();
        let work_id = handle.work_id();

        assert_eq!(handle.wait().await, JobOutcome::Succeeded(42));
        assert_eq!(
            f.work.get(work_id).await.unwrap().unwrap().status,
            WorkStatus::Succeeded
        );
        assert_eq!(f.admission.status("compile").await.unwrap().active, 0);
    }

    #[tokio::test]
    async fn test_error_fails_record_with_reason() {
        let f = fixture();
        let grant = grant(&f.admission).await;
        let handle = f
            .supervisor
            .spawn(&grant, async { Err::<(), _>("compiler exited with 1") })
            .await
            .unwrap();
        let work_id = handle.work_id();

        assert_eq!(
            handle.wait().await,
            JobOutcome::Failed("compiler exited with 1".to_owned())
        );
        let entry = f.work.get(work_id).await.unwrap().unwrap();
        assert_eq!(entry.status, WorkStatus::Failed);
        assert_eq!(entry.failure_reason.as_deref(), Some("compiler exited with 1"));
        assert!(f.admission.try_acquire("compile", "u2").await.unwrap().acquired());
    }

    #[tokio::test]
    async fn test_panic_still_releases_lease() {
        let f = fixture();
        let grant = grant(&f.admission).await;
        let handle = f
            .supervisor
            .spawn(&grant, async {
                if true {
                    panic!("boom");
                }
                Ok::<(), String>(())
            })
            .await
            .unwrap();

        assert!(matches!(handle.wait().await, JobOutcome::Failed(reason) if reason.contains("panicked")));
        assert_eq!(f.admission.status("compile").await.unwrap().active, 0);
    }

    #[tokio::test]
    async fn test_cancel_fails_and_releases() {
        let f = fixture();
        let grant = grant(&f.admission).await;
        let handle = f
            .supervisor
            .spawn(&grant, async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok::<(), String>(())
            })
            .await
            .unwrap();
        let work_id = handle.work_id();

        handle.cancel();
        assert!(matches!(handle.wait().await, JobOutcome::Failed(reason) if reason.contains("cancelled")));
        assert_eq!(
            f.work.get(work_id).await.unwrap().unwrap().status,
            WorkStatus::Failed
        );
        assert_eq!(f.admission.status("compile").await.unwrap().active, 0);
    }
}
