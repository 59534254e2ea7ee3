use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use sluice_common::{DegradationPolicy, RateLimitPolicyConfig, SluiceError};
use tracing::debug;

use super::limiter::window_start;
use super::{RateLimitDecision, SlidingWindowLimiter};
use crate::clock::Clock;
use crate::store::{Degradation, SharedStore};

pub struct RateLimiterRegistry {
    limiters: HashMap<String, SlidingWindowLimiter>,
    store: SharedStore,
    degradation: Degradation,
    clock: Arc<dyn Clock>,
}

impl RateLimiterRegistry {
    pub fn new(
        policies: &BTreeMap<String, RateLimitPolicyConfig>,
        store: SharedStore,
        degradation: Degradation,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let limiters = policies
            .iter()
            .map(|(name, config)| {
                let limiter = SlidingWindowLimiter::new(
                    name,
                    config,
                    store.clone(),
                    degradation.clone(),
                    clock.clone(),
                );
                (name.clone(), limiter)
            })
            .collect();

        Self {
            limiters,
            store,
            degradation,
            clock,
        }
    }

    pub fn get(&self, policy: &str) -> Result<&SlidingWindowLimiter, SluiceError> {
        self.limiters
            .get(policy)
            .ok_or_else(|| SluiceError::UnknownRateLimitPolicy(policy.to_owned()))
    }

    pub async fn check(
        &self,
        policy: &str,
        subject: &str,
    ) -> Result<RateLimitDecision, SluiceError> {
        self.get(policy)?.check(subject).await
    }

    pub fn policies(&self) -> impl Iterator<Item = &SlidingWindowLimiter> {
        self.limiters.values()
    }

    pub fn longest_window(&self) -> Option<Duration> {
        self.limiters.values().map(|l| l.window()).max()
    }

    /// Deletes markers that no policy's window can reach anymore.
    pub async fn prune_expired(&self) -> Result<u64, SluiceError> {
        let Some(retention) = self.longest_window() else {
            return Ok(0);
        };
        let before = window_start(self.clock.now(), retention);

        let mut pruned = match self.store.prune_markers(before).await {
            Ok(pruned) => pruned,
            Err(error) => {
                self.degradation.recover(error)?;
                0
            }
        };
        if self.degradation.policy() == DegradationPolicy::LocalFallback {
            pruned += self.degradation.fallback().prune_markers(before).await?;
        }

        debug!(pruned, ?retention, "Pruned rate limit markers");
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeDelta, Utc};

    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    fn registry() -> (RateLimiterRegistry, ManualClock) {
        let mut policies = BTreeMap::new();
        policies.insert(
            "generate".to_owned(),
            RateLimitPolicyConfig {
                limit: 1,
                window: Duration::from_secs(60),
            },
        );
        policies.insert(
            "login".to_owned(),
            RateLimitPolicyConfig {
                limit: 1,
                window: Duration::from_secs(600),
            },
        );
        let clock = ManualClock::new(Utc::now());
        let registry = RateLimiterRegistry::new(
            &policies,
            Arc::new(MemoryStore::new()),
            Degradation::new(
                "rate_limit",
                DegradationPolicy::LocalFallback,
                Arc::new(MemoryStore::new()),
            ),
            Arc::new(clock.clone()),
        );
        (registry, clock)
    }

    #[tokio::test]
    async fn test_policies_count_separately() {
        let (registry, _) = registry();
        assert!(registry.check("generate", "u1").await.unwrap().allowed);
        assert!(registry.check("login", "u1").await.unwrap().allowed);
        assert!(!registry.check("generate", "u1").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_unknown_policy() {
        let (registry, _) = registry();
        assert!(matches!(
            registry.check("upload", "u1").await,
            Err(SluiceError::UnknownRateLimitPolicy(_))
        ));
    }

    #[tokio::test]
    async fn test_prune_keeps_markers_within_longest_window() {
        let (registry, clock) = registry();
        assert_eq!(registry.longest_window(), Some(Duration::from_secs(600)));

        registry.check("generate", "u1").await.unwrap();
        registry.check("login", "u1").await.unwrap();

        clock.advance(TimeDelta::seconds(300));
        assert_eq!(registry.prune_expired().await.unwrap(), 0);

        clock.advance(TimeDelta::seconds(301));
        assert_eq!(registry.prune_expired().await.unwrap(), 2);
    }
}
