use sea_orm::Schema;
use sea_orm_migration::prelude::*;

pub mod usage_record {
    use chrono::{DateTime, Utc};
    use sea_orm::entity::prelude::*;
    use uuid::Uuid;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "usage_records")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub id: Uuid,
        pub subject: String,
        pub scope: String,
        pub amount: i64,
        pub recorded_at: DateTime<Utc>,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m00004_usage_records"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let builder = manager.get_database_backend();
        let schema = Schema::new(builder);

        manager
            .create_table(schema.create_table_from_entity(usage_record::Entity))
            .await?;

        manager
            .create_index(
                Index::create()
                    .table(usage_record::Entity)
                    .name("idx_usage_records_subject_scope")
                    .col(Alias::new("subject"))
                    .col(Alias::new("scope"))
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .table(usage_record::Entity)
                    .name("idx_usage_records_subject_scope")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(usage_record::Entity).to_owned())
            .await?;

        Ok(())
    }
}
