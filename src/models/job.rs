//! Job entity model
//!
//! This module contains the SeaORM entity model for the job table. A row is
//! addressed by `(repository_id, job_guid)` and only ever moves forward through
//! `pending → running → completed`.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "job")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    pub repository_id: i32,

    /// Stable identifier of the job across its lifetime (the Pulse `taskId`)
    pub job_guid: String,

    pub revision: String,

    pub build_platform_id: i32,

    pub machine_platform_id: i32,

    pub machine_id: i32,

    pub option_collection_hash: String,

    pub job_type_id: i32,

    pub product_id: i32,

    pub who: String,

    pub reason: String,

    pub tier: i16,

    pub build_system_type: String,

    /// `pending`, `running` or `completed`
    pub state: String,

    /// Ordinal of `state`, stored so forward-only updates can be guarded in SQL
    pub state_ordinal: i16,

    /// Only set once the job is completed
    pub result: Option<String>,

    pub submit_timestamp: Option<i64>,

    pub start_timestamp: Option<i64>,

    pub end_timestamp: Option<i64>,

    /// Guid of the job this one was coalesced into, if any
    pub coalesced_to_guid: Option<String>,

    pub last_modified: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::repository::Entity",
        from = "Column::RepositoryId",
        to = "super::repository::Column::Id"
    )]
    Repository,
    #[sea_orm(has_many = "super::job_log::Entity")]
    JobLog,
}

impl Related<super::repository::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Repository.def()
    }
}

impl Related<super::job_log::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::JobLog.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
