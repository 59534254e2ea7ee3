use std::sync::Arc;

use sluice_common::SluiceError;
use tracing::*;
use uuid::Uuid;

use crate::clock::Clock;
use crate::store::{EventRecord, SharedStore};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// First delivery, the caller owns the side effect
    Claimed,
    Duplicate,
}

impl ClaimOutcome {
    pub fn should_process(self) -> bool {
        self == Self::Claimed
    }
}

/// Exactly-once gate for externally delivered events such as payment
/// webhooks. Claims are permanent and there is no local fallback: a
/// ledger that cannot reach the shared store refuses to answer.
pub struct IdempotencyLedger {
    store: SharedStore,
    clock: Arc<dyn Clock>,
}

impl IdempotencyLedger {
    pub fn new(store: SharedStore, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Must be called before the side effect is applied.
    pub async fn claim(
        &self,
        provider: &str,
        event_id: &str,
        event_type: &str,
    ) -> Result<ClaimOutcome, SluiceError> {
        let record = EventRecord {
            id: Uuid::new_v4(),
            provider: provider.to_owned(),
            event_id: event_id.to_owned(),
            event_type: event_type.to_owned(),
            claimed_at: self.clock.now(),
        };

        let inserted = self
            .store
            .insert_event_if_absent(&record)
            .await
            .inspect_err(|error| {
                if error.is_store_unavailable() {
                    error!(%provider, %event_id, %error, "Cannot claim event, shared store unavailable");
                }
            })?;

        if inserted {
            debug!(%provider, %event_id, %event_type, "Event claimed");
            Ok(ClaimOutcome::Claimed)
        } else {
            info!(%provider, %event_id, %event_type, "Duplicate delivery ignored");
            Ok(ClaimOutcome::Duplicate)
        }
    }

    pub async fn lookup(
        &self,
        provider: &str,
        event_id: &str,
    ) -> Result<Option<EventRecord>, SluiceError> {
        self.store.find_event(provider, event_id).await
    }
}
