use sea_orm::DatabaseConnection;
use sea_orm_migration::prelude::*;
use sea_orm_migration::MigrationTrait;
use tracing::debug;

mod m00001_admission;
mod m00002_rate_limit_markers;
mod m00003_processed_events;
mod m00004_usage_records;
mod m00005_work_records;
mod m00006_quota_subjects;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m00001_admission::Migration),
            Box::new(m00002_rate_limit_markers::Migration),
            Box::new(m00003_processed_events::Migration),
            Box::new(m00004_usage_records::Migration),
            Box::new(m00005_work_records::Migration),
            Box::new(m00006_quota_subjects::Migration),
        ]
    }
}

pub async fn migrate_database(connection: &DatabaseConnection) -> Result<(), DbErr> {
    Migrator::up(connection, None).await?;
    debug!("Database schema is up to date");
    Ok(())
}
