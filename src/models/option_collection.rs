//! OptionCollection entity model
//!
//! Membership rows linking an option-collection hash to each option it
//! contains.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "option_collection")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub option_collection_hash: String,
    pub option_id: i32,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::option::Entity",
        from = "Column::OptionId",
        to = "super::option::Column::Id"
    )]
    JobOption,
}

impl Related<super::option::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::JobOption.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
