use sea_orm::Schema;
use sea_orm_migration::prelude::*;

pub mod processed_event {
    use chrono::{DateTime, Utc};
    use sea_orm::entity::prelude::*;
    use uuid::Uuid;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "processed_events")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub id: Uuid,
        pub provider: String,
        pub event_id: String,
        pub event_type: String,
        pub claimed_at: DateTime<Utc>,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m00003_processed_events"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let builder = manager.get_database_backend();
        let schema = Schema::new(builder);

        manager
            .create_table(schema.create_table_from_entity(processed_event::Entity))
            .await?;

        // The ledger's exactly-once guarantee rests on this constraint
        manager
            .create_index(
                Index::create()
                    .table(processed_event::Entity)
                    .name("idx_processed_events_provider_event_id")
                    .col(Alias::new("provider"))
                    .col(Alias::new("event_id"))
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .table(processed_event::Entity)
                    .name("idx_processed_events_provider_event_id")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(processed_event::Entity).to_owned())
            .await?;

        Ok(())
    }
}
