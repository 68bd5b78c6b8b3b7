//! JobType entity model

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "job_type")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub job_group_id: i32,
    pub name: String,
    pub symbol: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::job_group::Entity",
        from = "Column::JobGroupId",
        to = "super::job_group::Column::Id"
    )]
    JobGroup,
}

impl Related<super::job_group::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::JobGroup.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
