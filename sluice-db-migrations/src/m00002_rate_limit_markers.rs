use sea_orm::Schema;
use sea_orm_migration::prelude::*;

pub mod rate_limit_marker {
    use chrono::{DateTime, Utc};
    use sea_orm::entity::prelude::*;
    use uuid::Uuid;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "rate_limit_markers")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub token: Uuid,
        pub key: String,
        pub timestamp: DateTime<Utc>,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

pub mod rate_limit_bucket {
    use chrono::{DateTime, Utc};
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "rate_limit_buckets")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub key: String,
        pub touched_at: DateTime<Utc>,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m00002_rate_limit_markers"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let builder = manager.get_database_backend();
        let schema = Schema::new(builder);

        manager
            .create_table(schema.create_table_from_entity(rate_limit_bucket::Entity))
            .await?;

        manager
            .create_table(schema.create_table_from_entity(rate_limit_marker::Entity))
            .await?;

        manager
            .create_index(
                Index::create()
                    .table(rate_limit_marker::Entity)
                    .name("idx_rate_limit_markers_key_timestamp")
                    .col(Alias::new("key"))
                    .col(Alias::new("timestamp"))
                    .to_owned(),
            )
            .await?;

        // Global retention sweep
        manager
            .create_index(
                Index::create()
                    .table(rate_limit_marker::Entity)
                    .name("idx_rate_limit_markers_timestamp")
                    .col(Alias::new("timestamp"))
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .table(rate_limit_marker::Entity)
                    .name("idx_rate_limit_markers_timestamp")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .table(rate_limit_marker::Entity)
                    .name("idx_rate_limit_markers_key_timestamp")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(rate_limit_marker::Entity).to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(rate_limit_bucket::Entity).to_owned())
            .await?;

        Ok(())
    }
}
