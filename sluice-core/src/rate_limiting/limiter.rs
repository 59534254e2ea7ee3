use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use sluice_common::{RateLimitPolicyConfig, SluiceError};
use tracing::*;
use uuid::Uuid;

use crate::clock::Clock;
use crate::store::{Degradation, SharedStore};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    /// Zero when allowed
    pub retry_after_seconds: u64,
}

/// Rolling-window request counter for one named policy.
///
/// Every request leaves a timestamped marker under `{policy}:{subject}`;
/// a request is allowed while the markers in `(now - window, now]` do not
/// exceed the limit. Denied requests take their own marker back out so
/// they do not extend the subject's lockout.
pub struct SlidingWindowLimiter {
    policy: String,
    limit: u32,
    window: Duration,
    store: SharedStore,
    degradation: Degradation,
    clock: Arc<dyn Clock>,
}

impl SlidingWindowLimiter {
    pub fn new(
        policy: &str,
        config: &RateLimitPolicyConfig,
        store: SharedStore,
        degradation: Degradation,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            policy: policy.to_owned(),
            limit: config.limit,
            window: config.window,
            store,
            degradation,
            clock,
        }
    }

    pub fn policy(&self) -> &str {
        &self.policy
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn key(&self, subject: &str) -> String {
        format!("{}:{}", self.policy, subject)
    }

    pub async fn check(&self, subject: &str) -> Result<RateLimitDecision, SluiceError> {
        let now = self.clock.now();
        let window_start = window_start(now, self.window);
        let key = self.key(subject);
        let token = Uuid::new_v4();

        let (store, occupancy) = match self
            .store
            .push_marker(&key, token, now, window_start)
            .await
        {
            Ok(occupancy) => (&self.store, occupancy),
            Err(error) => {
                let fallback = self.degradation.recover(error)?;
                let occupancy = fallback
                    .push_marker(&key, token, now, window_start)
                    .await?;
                (fallback, occupancy)
            }
        };

        if occupancy.count <= self.limit {
            return Ok(RateLimitDecision {
                allowed: true,
                remaining: self.limit - occupancy.count,
                retry_after_seconds: 0,
            });
        }

        if let Err(error) = store.remove_marker(&key, token).await {
            warn!(%key, %error, "Could not withdraw the marker of a denied request");
        }

        let retry_after_seconds = retry_after_seconds(self.window, now - occupancy.oldest);
        debug!(
            policy = %self.policy,
            %subject,
            limit = self.limit,
            retry_after_seconds,
            "Rate limit exceeded"
        );
        Ok(RateLimitDecision {
            allowed: false,
            remaining: 0,
            retry_after_seconds,
        })
    }
}

pub(crate) fn window_start(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(window)
        .ok()
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Time until the oldest marker leaves the window, rounded up to whole
/// seconds and kept within `1..=window`.
fn retry_after_seconds(window: Duration, oldest_age: TimeDelta) -> u64 {
    let age_ms = oldest_age.num_milliseconds().max(0) as u128;
    let remaining_ms = window.as_millis().saturating_sub(age_ms);
    let seconds = u64::try_from(remaining_ms.div_ceil(1000)).unwrap_or(u64::MAX);
    seconds.clamp(1, window.as_secs().max(1))
}
