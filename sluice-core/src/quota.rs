use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use sluice_common::{QuotaConfig, SluiceError};
use tracing::*;
use uuid::Uuid;

use crate::clock::Clock;
use crate::store::{SharedStore, UsageEntry};

/// Which cap stopped a subject.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaScope {
    Scope,
    Subject,
}

impl fmt::Display for QuotaScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scope => write!(f, "scope"),
            Self::Subject => write!(f, "subject"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BudgetCheck {
    pub subject: String,
    pub scope: String,
    pub allowed: bool,
    /// Consumed within the scope
    pub used: i64,
    pub cap: i64,
    pub subject_used: i64,
    pub subject_cap: i64,
    /// Headroom under whichever cap is closer
    pub remaining: i64,
    pub reason: Option<QuotaScope>,
}

impl BudgetCheck {
    fn evaluate(
        config: &QuotaConfig,
        subject: &str,
        scope: &str,
        used: i64,
        subject_used: i64,
    ) -> Self {
        let cap = config.cap_for_scope(scope);
        let subject_cap = config.subject_cap;

        // the lifetime cap wins the report: a new scope would not help
        let reason = if subject_used >= subject_cap {
            Some(QuotaScope::Subject)
        } else if used >= cap {
            Some(QuotaScope::Scope)
        } else {
            None
        };

        Self {
            subject: subject.to_owned(),
            scope: scope.to_owned(),
            allowed: reason.is_none(),
            used,
            cap,
            subject_used,
            subject_cap,
            remaining: (cap - used).min(subject_cap - subject_used).max(0),
            reason,
        }
    }

    /// Human-readable explanation of a denial.
    pub fn message(&self) -> Option<String> {
        self.reason.map(|reason| match reason {
            QuotaScope::Subject => format!(
                "{} has used {} of its lifetime allowance of {}",
                self.subject, self.subject_used, self.subject_cap
            ),
            QuotaScope::Scope => format!(
                "{} has used {} of {} allowed in {}, start a new {} to continue",
                self.subject, self.used, self.cap, self.scope, reason
            ),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UsageOutcome {
    /// Carries the budget after the new usage
    Recorded(BudgetCheck),
    Refused(BudgetCheck),
}

/// Hard usage caps per subject and per scope, derived from the durable
/// usage records on every check. Fails closed when the store is down.
pub struct QuotaMeter {
    config: QuotaConfig,
    store: SharedStore,
    clock: Arc<dyn Clock>,
}

impl QuotaMeter {
    pub fn new(config: QuotaConfig, store: SharedStore, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            store,
            clock,
        }
    }

    pub async fn check_budget(&self, subject: &str, scope: &str) -> Result<BudgetCheck, SluiceError> {
        let used = self.store.sum_usage(subject, Some(scope)).await?;
        let subject_used = self.store.sum_usage(subject, None).await?;
        let check = BudgetCheck::evaluate(&self.config, subject, scope, used, subject_used);
        if !check.allowed {
            debug!(%subject, %scope, used, subject_used, reason = ?check.reason, "Quota exhausted");
        }
        Ok(check)
    }

    pub async fn record_usage(
        &self,
        subject: &str,
        scope: &str,
        amount: i64,
    ) -> Result<UsageOutcome, SluiceError> {
        if amount <= 0 {
            return Err(SluiceError::InvalidAmount(amount));
        }

        let append = self
            .store
            .append_usage_within(
                &UsageEntry {
                    id: Uuid::new_v4(),
                    subject: subject.to_owned(),
                    scope: scope.to_owned(),
                    amount,
                    recorded_at: self.clock.now(),
                },
                self.config.cap_for_scope(scope),
                self.config.subject_cap,
            )
            .await?;

        let before = BudgetCheck::evaluate(
            &self.config,
            subject,
            scope,
            append.scope_used,
            append.subject_used,
        );
        if !append.appended {
            info!(%subject, %scope, amount, reason = ?before.reason, "Usage refused, quota exhausted");
            return Ok(UsageOutcome::Refused(before));
        }

        let after = BudgetCheck::evaluate(
            &self.config,
            subject,
            scope,
            append.scope_used.saturating_add(amount),
            append.subject_used.saturating_add(amount),
        );
        if !after.allowed {
            info!(%subject, %scope, used = after.used, reason = ?after.reason, "Quota reached");
        }
        Ok(UsageOutcome::Recorded(after))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::clock::SystemClock;
    use crate::store::testing::UnavailableStore;
    use crate::store::{DatabaseStore, MemoryStore};

    fn config() -> QuotaConfig {
        QuotaConfig {
            subject_cap: 1000,
            scope_cap: 300,
            scope_caps: BTreeMap::from([("appendix".to_owned(), 50)]),
        }
    }

    #[tokio::test]
    async fn test_scope_cap_is_a_hard_stop() {
        let db = crate::db::connect_in_memory().await.unwrap();
        let meter = QuotaMeter::new(config(), Arc::new(DatabaseStore::new(db)), Arc::new(SystemClock));

        let fresh = meter.check_budget("u1", "draft-1").await.unwrap();
        assert!(fresh.allowed);
        assert_eq!(fresh.remaining, 300);

        match meter.record_usage("u1", "draft-1", 320).await.unwrap() {
            UsageOutcome::Recorded(after) => {
                assert!(!after.allowed);
                assert_eq!(after.reason, Some(QuotaScope::Scope));
                assert_eq!(after.remaining, 0);
            }
            UsageOutcome::Refused(_) => panic!("usage under the cap must be recorded"),
        }

        let denied = meter.check_budget("u1", "draft-1").await.unwrap();
        assert!(!denied.allowed);
        assert!(denied.message().unwrap().contains("draft-1"));

        assert!(matches!(
            meter.record_usage("u1", "draft-1", 5).await.unwrap(),
            UsageOutcome::Refused(_)
        ));
        assert_eq!(meter.check_budget("u1", "draft-1").await.unwrap().used, 320);

        // a fresh scope has its own budget
        assert!(meter.check_budget("u1", "draft-2").await.unwrap().allowed);
    }

    async fn race_to_the_cap(store: SharedStore) {
        let config = QuotaConfig {
            subject_cap: 1000,
            scope_cap: 5,
            scope_caps: BTreeMap::new(),
        };
        let meter = QuotaMeter::new(config, store, Arc::new(SystemClock));
        meter.record_usage("u1", "draft", 4).await.unwrap();

        let (a, b) = tokio::join!(
            meter.record_usage("u1", "draft", 1),
            meter.record_usage("u1", "draft", 1),
        );
        let recorded = [a.unwrap(), b.unwrap()]
            .into_iter()
            .filter(|outcome| matches!(outcome, UsageOutcome::Recorded(_)))
            .count();
        assert_eq!(recorded, 1);
        assert_eq!(meter.check_budget("u1", "draft").await.unwrap().used, 5);
    }

    #[tokio::test]
    async fn test_concurrent_usage_never_overshoots_cap() {
        let db = crate::db::connect_in_memory().await.unwrap();
        race_to_the_cap(Arc::new(DatabaseStore::new(db))).await;
        race_to_the_cap(Arc::new(MemoryStore::new())).await;
    }

    #[tokio::test]
    async fn test_subject_cap_spans_scopes() {
        let meter = QuotaMeter::new(config(), Arc::new(MemoryStore::new()), Arc::new(SystemClock));
        for scope in ["a", "b", "c", "d"] {
            meter.record_usage("u1", scope, 250).await.unwrap();
        }

        let check = meter.check_budget("u1", "e").await.unwrap();
        assert!(!check.allowed);
        assert_eq!(check.reason, Some(QuotaScope::Subject));
        assert_eq!(check.subject_used, 1000);
        assert!(meter.check_budget("u2", "e").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_remaining_uses_closest_cap() {
        let meter = QuotaMeter::new(config(), Arc::new(MemoryStore::new()), Arc::new(SystemClock));
        meter.record_usage("u1", "a", 280).await.unwrap();
        meter.record_usage("u1", "b", 280).await.unwrap();
        meter.record_usage("u1", "c", 280).await.unwrap();

        assert_eq!(meter.check_budget("u1", "d").await.unwrap().remaining, 160);
        assert_eq!(meter.check_budget("u1", "appendix").await.unwrap().remaining, 50);
    }

    #[tokio::test]
    async fn test_invalid_amounts_rejected() {
        let meter = QuotaMeter::new(config(), Arc::new(MemoryStore::new()), Arc::new(SystemClock));
        assert!(matches!(
            meter.record_usage("u1", "a", 0).await,
            Err(SluiceError::InvalidAmount(0))
        ));
        assert!(matches!(
            meter.record_usage("u1", "a", -3).await,
            Err(SluiceError::InvalidAmount(-3))
        ));
    }

    #[tokio::test]
    async fn test_outage_fails_closed() {
        let meter = QuotaMeter::new(config(), Arc::new(UnavailableStore), Arc::new(SystemClock));
        assert!(meter
            .check_budget("u1", "a")
            .await
            .unwrap_err()
            .is_store_unavailable());
    }
}
