mod defaults;

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use defaults::*;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{Secret, SluiceError};

/// Upper bound for `lease_ttl` and `stale_after`.
pub const MAX_LEASE_DURATION: Duration = Duration::from_secs(365 * 86_400);

/// A named category of scarce downstream capacity.
///
/// Resource classes are read once at startup and never change while the
/// service runs.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq, JsonSchema)]
pub struct ResourceClassConfig {
    pub name: String,

    /// Maximum number of simultaneously active leases
    pub limit: u32,

    /// How long a lease survives without release or renewal
    #[serde(default = "_default_lease_ttl", with = "humantime_serde")]
    #[schemars(with = "String")]
    pub lease_ttl: Duration,

    /// Work records running for longer than this are failed by the reaper
    #[serde(default = "_default_stale_after", with = "humantime_serde")]
    #[schemars(with = "String")]
    pub stale_after: Duration,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq, JsonSchema)]
pub struct RateLimitPolicyConfig {
    pub limit: u32,

    #[serde(default = "_default_rate_limit_window", with = "humantime_serde")]
    #[schemars(with = "String")]
    pub window: Duration,
}

/// What a subsystem does when the shared store cannot be reached.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DegradationPolicy {
    /// Continue on an in-process store. Only coordinates within one instance.
    #[default]
    LocalFallback,
    /// Surface the outage to the caller as an error.
    FailClosed,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, JsonSchema)]
pub struct DegradationConfig {
    #[serde(default)]
    pub admission: DegradationPolicy,

    #[serde(default)]
    pub rate_limit: DegradationPolicy,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Database,
    /// Single-process only, for development and tests
    Memory,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, JsonSchema)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    #[serde(default)]
    pub degradation: DegradationConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, JsonSchema)]
pub struct QuotaConfig {
    /// Lifetime cap per subject, across all scopes
    #[serde(default = "_default_subject_cap")]
    pub subject_cap: i64,

    /// Cap applied to each scope unless overridden
    #[serde(default = "_default_scope_cap")]
    pub scope_cap: i64,

    #[serde(default)]
    pub scope_caps: BTreeMap<String, i64>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            subject_cap: _default_subject_cap(),
            scope_cap: _default_scope_cap(),
            scope_caps: BTreeMap::new(),
        }
    }
}

impl QuotaConfig {
    pub fn cap_for_scope(&self, scope: &str) -> i64 {
        self.scope_caps
            .get(scope)
            .copied()
            .unwrap_or(self.scope_cap)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, JsonSchema)]
pub struct ReaperConfig {
    #[serde(default = "_default_true")]
    pub enable: bool,

    #[serde(default = "_default_reaper_interval", with = "humantime_serde")]
    #[schemars(with = "String")]
    pub interval: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            enable: true,
            interval: _default_reaper_interval(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, JsonSchema)]
pub struct HttpConfig {
    #[serde(default = "_default_false")]
    pub enable: bool,

    #[serde(default = "_default_http_listen")]
    pub listen: SocketAddr,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enable: false,
            listen: _default_http_listen(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, JsonSchema)]
pub struct SluiceConfigStore {
    #[serde(default = "_default_database_url")]
    #[schemars(with = "String")]
    pub database_url: Secret<String>,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub resource_classes: Vec<ResourceClassConfig>,

    #[serde(default)]
    pub rate_limits: BTreeMap<String, RateLimitPolicyConfig>,

    #[serde(default)]
    pub quota: QuotaConfig,

    #[serde(default)]
    pub reaper: ReaperConfig,

    #[serde(default)]
    pub http: HttpConfig,
}

impl Default for SluiceConfigStore {
    fn default() -> Self {
        Self {
            database_url: _default_database_url(),
            store: <_>::default(),
            resource_classes: vec![],
            rate_limits: BTreeMap::new(),
            quota: <_>::default(),
            reaper: <_>::default(),
            http: <_>::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SluiceConfig {
    pub store: SluiceConfigStore,
    pub paths_relative_to: PathBuf,
}

impl SluiceConfig {
    pub fn resource_class(&self, name: &str) -> Option<&ResourceClassConfig> {
        self.store.resource_classes.iter().find(|c| c.name == name)
    }

    pub fn validate(&self) -> Result<(), SluiceError> {
        let mut names = HashSet::new();
        for class in &self.store.resource_classes {
            if !names.insert(class.name.as_str()) {
                return Err(SluiceError::InvalidConfig(format!(
                    "resource class {} is defined more than once",
                    class.name
                )));
            }
            if class.limit == 0 {
                return Err(SluiceError::InvalidConfig(format!(
                    "resource class {} has a zero limit",
                    class.name
                )));
            }
            if class.lease_ttl.is_zero() {
                return Err(SluiceError::InvalidConfig(format!(
                    "resource class {} has a zero lease TTL",
                    class.name
                )));
            }
            if class.lease_ttl > MAX_LEASE_DURATION || class.stale_after > MAX_LEASE_DURATION {
                return Err(SluiceError::InvalidConfig(format!(
                    "resource class {} has a lease TTL or stale_after longer than {} days",
                    class.name,
                    MAX_LEASE_DURATION.as_secs() / 86_400
                )));
            }
            if class.stale_after < class.lease_ttl {
                warn!(
                    class = %class.name,
                    "`stale_after` is shorter than `lease_ttl`, work may be failed while its lease is still valid"
                );
            }
        }

        for (name, policy) in &self.store.rate_limits {
            // policy and subject share one marker key
            if name.contains(':') {
                return Err(SluiceError::InvalidConfig(format!(
                    "rate limit policy name {name} must not contain ':'"
                )));
            }
            if policy.limit == 0 || policy.window.is_zero() {
                return Err(SluiceError::InvalidConfig(format!(
                    "rate limit policy {name} needs a non-zero limit and window"
                )));
            }
        }

        let quota = &self.store.quota;
        if quota.subject_cap <= 0
            || quota.scope_cap <= 0
            || quota.scope_caps.values().any(|cap| *cap <= 0)
        {
            return Err(SluiceError::InvalidConfig(
                "quota caps must be positive".to_owned(),
            ));
        }

        if self.store.reaper.interval.is_zero() {
            return Err(SluiceError::InvalidConfig(
                "reaper interval must be non-zero".to_owned(),
            ));
        }

        if self.store.store.backend == StoreBackend::Memory {
            warn!("The in-memory store only coordinates within this process, do not run multiple instances against it");
        }

        Ok(())
    }
}
