use anyhow::Result;
use sluice_common::StoreBackend;
use sluice_core::Services;
use tracing::*;

use crate::config::load_config;

pub(crate) async fn command(cli: &crate::Cli) -> Result<()> {
    let config = load_config(&cli.config)?;
    if config.store.store.backend == StoreBackend::Memory {
        warn!("The in-memory store starts empty, there is nothing to reap");
    }
    let services = Services::new(config).await?;

    let stats = services.reaper.sweep().await;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
