//! BuildPlatform entity model

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;

/// Interned by `(os_name, platform, architecture)`
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "build_platform")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub os_name: String,
    pub platform: String,
    pub architecture: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
