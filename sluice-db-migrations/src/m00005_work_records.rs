use sea_orm::Schema;
use sea_orm_migration::prelude::*;

pub mod work_record {
    use chrono::{DateTime, Utc};
    use sea_orm::entity::prelude::*;
    use uuid::Uuid;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "work_records")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub id: Uuid,
        pub resource_class: String,
        pub owner: String,
        pub lease_id: Option<Uuid>,
        pub status: String,
        pub started_at: DateTime<Utc>,
        pub finished_at: Option<DateTime<Utc>>,
        #[sea_orm(column_type = "Text", nullable)]
        pub failure_reason: Option<String>,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m00005_work_records"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let builder = manager.get_database_backend();
        let schema = Schema::new(builder);

        manager
            .create_table(schema.create_table_from_entity(work_record::Entity))
            .await?;

        // "running work of a class started before the staleness cutoff"
        manager
            .create_index(
                Index::create()
                    .table(work_record::Entity)
                    .name("idx_work_records_class_status_started_at")
                    .col(Alias::new("resource_class"))
                    .col(Alias::new("status"))
                    .col(Alias::new("started_at"))
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .table(work_record::Entity)
                    .name("idx_work_records_class_status_started_at")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(work_record::Entity).to_owned())
            .await?;

        Ok(())
    }
}
