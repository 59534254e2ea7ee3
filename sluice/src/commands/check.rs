use anyhow::Result;
use sluice_common::StoreBackend;
use sluice_core::db::connect_to_db;
use tracing::*;

use crate::config::load_config;

pub(crate) async fn command(cli: &crate::Cli) -> Result<()> {
    let config = load_config(&cli.config)?;
    if config.store.store.backend == StoreBackend::Database {
        connect_to_db(&config).await?;
        info!("Database is reachable and migrated");
    }
    info!("No problems found");
    Ok(())
}
