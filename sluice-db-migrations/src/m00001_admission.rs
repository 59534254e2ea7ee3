use sea_orm::Schema;
use sea_orm_migration::prelude::*;

pub mod resource_slot {
    use chrono::{DateTime, Utc};
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "resource_slots")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub name: String,
        pub active: i32,
        pub updated_at: DateTime<Utc>,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

pub mod lease {
    use chrono::{DateTime, Utc};
    use sea_orm::entity::prelude::*;
    use uuid::Uuid;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "leases")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub id: Uuid,
        pub resource_class: String,
        pub owner: String,
        pub state: String,
        pub acquired_at: DateTime<Utc>,
        pub expires_at: DateTime<Utc>,
        pub finished_at: Option<DateTime<Utc>>,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m00001_admission"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let builder = manager.get_database_backend();
        let schema = Schema::new(builder);

        manager
            .create_table(schema.create_table_from_entity(resource_slot::Entity))
            .await?;

        manager
            .create_table(schema.create_table_from_entity(lease::Entity))
            .await?;

        // "active leases of a class, oldest first"
        manager
            .create_index(
                Index::create()
                    .table(lease::Entity)
                    .name("idx_leases_class_state_acquired_at")
                    .col(Alias::new("resource_class"))
                    .col(Alias::new("state"))
                    .col(Alias::new("acquired_at"))
                    .to_owned(),
            )
            .await?;

        // "active leases whose TTL marker has passed"
        manager
            .create_index(
                Index::create()
                    .table(lease::Entity)
                    .name("idx_leases_state_expires_at")
                    .col(Alias::new("state"))
                    .col(Alias::new("expires_at"))
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .table(lease::Entity)
                    .name("idx_leases_state_expires_at")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .table(lease::Entity)
                    .name("idx_leases_class_state_acquired_at")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(lease::Entity).to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(resource_slot::Entity).to_owned())
            .await?;

        Ok(())
    }
}
