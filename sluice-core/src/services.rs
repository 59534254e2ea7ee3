use std::sync::Arc;

use anyhow::Result;
use sea_orm::DatabaseConnection;
use sluice_common::{SluiceConfig, StoreBackend};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::*;

use crate::admission::AdmissionController;
use crate::clock::{Clock, SystemClock};
use crate::db::connect_to_db;
use crate::idempotency::IdempotencyLedger;
use crate::quota::QuotaMeter;
use crate::rate_limiting::RateLimiterRegistry;
use crate::reaper::LeaseReaper;
use crate::store::{DatabaseStore, Degradation, MemoryStore, SharedStore};
use crate::supervisor::Supervisor;
use crate::work::{DatabaseWorkTracker, MemoryWorkTracker, WorkTracker};

#[derive(Clone)]
pub struct Services {
    pub db: Option<Arc<Mutex<DatabaseConnection>>>,
    pub config: Arc<SluiceConfig>,
    pub clock: Arc<dyn Clock>,
    pub admission: Arc<AdmissionController>,
    pub rate_limiters: Arc<RateLimiterRegistry>,
    pub idempotency: Arc<IdempotencyLedger>,
    pub quota: Arc<QuotaMeter>,
    pub work: Arc<dyn WorkTracker>,
    pub supervisor: Arc<Supervisor>,
    pub reaper: Arc<LeaseReaper>,
}

impl Services {
    pub async fn new(config: SluiceConfig) -> Result<Self> {
        config.validate()?;

        match config.store.store.backend {
            StoreBackend::Database => {
                let db = connect_to_db(&config).await?;

                // Stores share the pool, the locked handle is for callers
                let store = DatabaseStore::new(db.clone());
                for class in &config.store.resource_classes {
                    store.ensure_slot(&class.name).await?;
                }
                let work = DatabaseWorkTracker::new(db.clone());

                Ok(Self::assemble(
                    config,
                    Some(Arc::new(Mutex::new(db))),
                    Arc::new(store),
                    Arc::new(work),
                    Arc::new(SystemClock),
                ))
            }
            StoreBackend::Memory => Ok(Self::assemble(
                config,
                None,
                Arc::new(MemoryStore::new()),
                Arc::new(MemoryWorkTracker::new()),
                Arc::new(SystemClock),
            )),
        }
    }

    pub fn assemble(
        config: SluiceConfig,
        db: Option<Arc<Mutex<DatabaseConnection>>>,
        store: SharedStore,
        work: Arc<dyn WorkTracker>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let policies = &config.store.store.degradation;
        let fallback: SharedStore = Arc::new(MemoryStore::new());

        let admission = Arc::new(AdmissionController::new(
            &config.store.resource_classes,
            store.clone(),
            Degradation::new("admission", policies.admission, fallback.clone()),
            clock.clone(),
            config.store.reaper.interval,
        ));

        let rate_limiters = Arc::new(RateLimiterRegistry::new(
            &config.store.rate_limits,
            store.clone(),
            Degradation::new("rate_limit", policies.rate_limit, fallback),
            clock.clone(),
        ));

        // Idempotency and quota never degrade
        let idempotency = Arc::new(IdempotencyLedger::new(store.clone(), clock.clone()));
        let quota = Arc::new(QuotaMeter::new(
            config.store.quota.clone(),
            store,
            clock.clone(),
        ));

        let supervisor = Arc::new(Supervisor::new(
            admission.clone(),
            work.clone(),
            clock.clone(),
        ));
        let reaper = Arc::new(LeaseReaper::new(
            admission.clone(),
            work.clone(),
            rate_limiters.clone(),
            clock.clone(),
        ));

        Self {
            db,
            config: Arc::new(config),
            clock,
            admission,
            rate_limiters,
            idempotency,
            quota,
            work,
            supervisor,
            reaper,
        }
    }

    /// Spawns the periodic reaper unless it is disabled in the config.
    pub fn start_reaper(&self) -> Option<JoinHandle<()>> {
        let reaper = &self.config.store.reaper;
        if !reaper.enable {
            warn!("Reaper is disabled, abandoned leases will not be reclaimed by this instance");
            return None;
        }
        info!(interval = ?reaper.interval, "Starting lease reaper");
        Some(self.reaper.clone().spawn(reaper.interval))
    }
}
