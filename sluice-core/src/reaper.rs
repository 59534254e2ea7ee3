use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::*;

use crate::admission::AdmissionController;
use crate::clock::Clock;
use crate::rate_limiting::RateLimiterRegistry;
use crate::work::WorkTracker;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReapStats {
    pub stale_work_failed: u64,
    pub leases_expired: u64,
    pub markers_pruned: u64,
}

impl ReapStats {
    pub fn is_empty(&self) -> bool {
        self.stale_work_failed == 0 && self.leases_expired == 0 && self.markers_pruned == 0
    }
}

/// Reclaims what crashed or stalled workers left behind.
///
/// Each sweep is its own failure domain: an error is logged and the
/// remaining sweeps still run.
pub struct LeaseReaper {
    admission: Arc<AdmissionController>,
    work: Arc<dyn WorkTracker>,
    rate_limiters: Arc<RateLimiterRegistry>,
    clock: Arc<dyn Clock>,
}

impl LeaseReaper {
    pub fn new(
        admission: Arc<AdmissionController>,
        work: Arc<dyn WorkTracker>,
        rate_limiters: Arc<RateLimiterRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            admission,
            work,
            rate_limiters,
            clock,
        }
    }

    pub async fn sweep(&self) -> ReapStats {
        let mut stats = ReapStats::default();
        let now = self.clock.now();

        for class in self.admission.resource_classes() {
            let Some(cutoff) = chrono::TimeDelta::from_std(class.stale_after)
                .ok()
                .and_then(|stale_after| now.checked_sub_signed(stale_after))
            else {
                continue;
            };
            let reason = format!(
                "no completion within {}s, worker presumed lost",
                class.stale_after.as_secs()
            );
            match self.work.fail_stale(&class.name, cutoff, &reason, now).await {
                Ok(failed) => stats.stale_work_failed += failed,
                Err(error) => {
                    error!(class = %class.name, %error, "Stale work sweep failed")
                }
            }
        }

        for class in self.admission.resource_classes() {
            match self.admission.expire_overdue(&class.name).await {
                Ok(expired) => stats.leases_expired += expired.len() as u64,
                Err(error) => {
                    error!(class = %class.name, %error, "Orphaned lease sweep failed")
                }
            }
        }

        match self.rate_limiters.prune_expired().await {
            Ok(pruned) => stats.markers_pruned = pruned,
            Err(error) => error!(%error, "Rate limit marker sweep failed"),
        }

        if !stats.is_empty() {
            info!(
                stale_work = stats.stale_work_failed,
                expired_leases = stats.leases_expired,
                pruned_markers = stats.markers_pruned,
                "Reaper sweep completed"
            );
        }
        stats
    }

    pub fn spawn(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                self.sweep().await;
            }
        })
    }
}
