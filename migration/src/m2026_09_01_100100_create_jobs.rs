//! Migration to create the job table.
//!
//! A job row is addressed by `(repository_id, job_guid)`. `state_ordinal` is
//! stored next to `state` so forward-only updates can be guarded in SQL.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Job::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Job::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Job::RepositoryId).integer().not_null())
                    .col(ColumnDef::new(Job::JobGuid).string_len(50).not_null())
                    .col(ColumnDef::new(Job::Revision).string_len(50).not_null())
                    .col(ColumnDef::new(Job::BuildPlatformId).integer().not_null())
                    .col(ColumnDef::new(Job::MachinePlatformId).integer().not_null())
                    .col(ColumnDef::new(Job::MachineId).integer().not_null())
                    .col(
                        ColumnDef::new(Job::OptionCollectionHash)
                            .string_len(40)
                            .not_null(),
                    )
                    .col(ColumnDef::new(Job::JobTypeId).integer().not_null())
                    .col(ColumnDef::new(Job::ProductId).integer().not_null())
                    .col(ColumnDef::new(Job::Who).string_len(50).not_null())
                    .col(ColumnDef::new(Job::Reason).string_len(125).not_null())
                    .col(ColumnDef::new(Job::Tier).small_integer().not_null().default(1))
                    .col(ColumnDef::new(Job::BuildSystemType).string_len(25).not_null())
                    .col(ColumnDef::new(Job::State).string_len(25).not_null())
                    .col(ColumnDef::new(Job::StateOrdinal).small_integer().not_null())
                    .col(ColumnDef::new(Job::Result).string_len(25).null())
                    .col(ColumnDef::new(Job::SubmitTimestamp).big_integer().null())
                    .col(ColumnDef::new(Job::StartTimestamp).big_integer().null())
                    .col(ColumnDef::new(Job::EndTimestamp).big_integer().null())
                    .col(ColumnDef::new(Job::CoalescedToGuid).string_len(50).null())
                    .col(
                        ColumnDef::new(Job::LastModified)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_job_repository_id")
                            .from(Job::Table, Job::RepositoryId)
                            .to(Repository::Table, Repository::Id),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("uq_job_repository_guid")
                    .table(Job::Table)
                    .col(Job::RepositoryId)
                    .col(Job::JobGuid)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_job_repository_revision")
                    .table(Job::Table)
                    .col(Job::RepositoryId)
                    .col(Job::Revision)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_job_repository_revision").to_owned())
            .await?;
        manager
            .drop_index(Index::drop().name("uq_job_repository_guid").to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Job::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Job {
    Table,
    Id,
    RepositoryId,
    JobGuid,
    Revision,
    BuildPlatformId,
    MachinePlatformId,
    MachineId,
    OptionCollectionHash,
    JobTypeId,
    ProductId,
    Who,
    Reason,
    Tier,
    BuildSystemType,
    State,
    StateOrdinal,
    Result,
    SubmitTimestamp,
    StartTimestamp,
    EndTimestamp,
    CoalescedToGuid,
    LastModified,
}

#[derive(DeriveIden)]
enum Repository {
    Table,
    Id,
}
