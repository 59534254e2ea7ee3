use std::time::Duration;

use anyhow::Result;
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, TransactionTrait};
use sluice_common::SluiceConfig;
use sluice_db_migrations::migrate_database;
use tracing::*;

pub async fn connect_to_db(config: &SluiceConfig) -> Result<DatabaseConnection> {
    let mut url = url::Url::parse(&config.store.database_url.expose_secret()[..])?;
    if url.scheme() == "sqlite" {
        let path = url.path();
        let mut abs_path = config.paths_relative_to.clone();
        abs_path.push(path);
        abs_path.push("db.sqlite3");

        if let Some(parent) = abs_path.parent() {
            std::fs::create_dir_all(parent)?
        }

        url.set_path(
            abs_path
                .to_str()
                .ok_or_else(|| anyhow::anyhow!("Failed to convert database path to string"))?,
        );

        url.set_query(Some("mode=rwc"));

        let db = Database::connect(ConnectOptions::new(url.to_string())).await?;
        db.begin().await?.commit().await?;
        drop(db);
    }

    // A short acquire timeout turns an unreachable database into a
    // store outage quickly enough for the degradation policy to matter.
    let mut opt = ConnectOptions::new(url.to_string());
    opt.max_connections(100)
        .min_connections(5)
        .connect_timeout(Duration::from_secs(8))
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(8))
        .max_lifetime(Duration::from_secs(8))
        .sqlx_logging(true);

    let connection = Database::connect(opt).await?;

    migrate_database(&connection).await?;
    debug!(backend = ?connection.get_database_backend(), "Database ready");
    Ok(connection)
}

#[cfg(test)]
pub(crate) async fn connect_in_memory() -> Result<DatabaseConnection, sea_orm::DbErr> {
    let mut opt = ConnectOptions::new("sqlite::memory:");
    // one connection, or every checkout would see a fresh empty database
    opt.max_connections(1).min_connections(1).sqlx_logging(false);
    let connection = Database::connect(opt).await?;
    migrate_database(&connection).await?;
    Ok(connection)
}
