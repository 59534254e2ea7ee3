use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "rate_limit_markers")]
pub struct Model {
    /// Unique per request, so a denied request can remove exactly its own marker
    #[sea_orm(primary_key, auto_increment = false)]
    pub token: Uuid,

    /// `{policy}:{subject}`
    pub key: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
