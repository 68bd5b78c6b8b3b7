//! Repository entity model
//!
//! Repositories are created out-of-band; the ingestion core only reads them to
//! map a Pulse `origin.project` onto a repository id.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "repository")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    /// Project name as published in Pulse messages (e.g. `autoland`)
    pub name: String,

    /// Version control system, `hg` or `git`
    pub dvcs_type: String,

    pub url: String,

    pub branch: Option<String>,

    /// `active` or `onhold`
    pub active_status: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
