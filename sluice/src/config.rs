use std::path::Path;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use sluice_common::{SluiceConfig, SluiceConfigStore};
use tracing::*;

pub fn load_config(path: &Path) -> Result<SluiceConfig> {
    let store: SluiceConfigStore = Config::builder()
        .add_source(File::from(path))
        .add_source(
            Environment::with_prefix("SLUICE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("Could not load config")?
        .try_deserialize()
        .context("Could not parse config")?;

    let config = SluiceConfig {
        store,
        paths_relative_to: path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default(),
    };
    config.validate().context("Invalid config")?;

    info!(
        "Using config: {path:?} (resource classes: {}, rate limit policies: {}, backend: {:?})",
        config.store.resource_classes.len(),
        config.store.rate_limits.len(),
        config.store.store.backend,
    );
    Ok(config)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use sluice_common::{DegradationPolicy, StoreBackend};

    use super::*;

    fn write_config(name: &str, contents: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("sluice-config-{}-{name}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("sluice.yaml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_loads_yaml() {
        let path = write_config(
            "valid",
            r#"
database_url: "sqlite:data/db"
store:
  backend: memory
  degradation:
    admission: fail_closed
resource_classes:
  - name: compile
    limit: 4
    lease_ttl: 5m
    stale_after: 15m
rate_limits:
  generate:
    limit: 10
    window: 1h
reaper:
  interval: 30s
"#,
        );

        let config = load_config(&path).unwrap();
        assert_eq!(config.paths_relative_to, path.parent().unwrap());
        assert_eq!(config.store.store.backend, StoreBackend::Memory);
        assert_eq!(
            config.store.store.degradation.admission,
            DegradationPolicy::FailClosed
        );
        let class = config.resource_class("compile").unwrap();
        assert_eq!(class.limit, 4);
        assert_eq!(class.lease_ttl, Duration::from_secs(300));
        assert_eq!(
            config.store.rate_limits["generate"].window,
            Duration::from_secs(3600)
        );
        assert_eq!(config.store.reaper.interval, Duration::from_secs(30));
    }

    #[test]
    fn test_rejects_invalid_config() {
        let path = write_config(
            "zero-limit",
            r#"
resource_classes:
  - name: compile
    limit: 0
    lease_ttl: 5m
    stale_after: 15m
"#,
        );
        assert!(load_config(&path).is_err());
    }
}
