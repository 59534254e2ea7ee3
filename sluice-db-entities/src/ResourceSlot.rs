use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;

/// Capacity accounting for one resource class.
///
/// `active` is only ever changed through conditional updates so that it
/// stays within `0..=limit` under concurrent writers.
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
