//! Migration to create the job_log table holding log references per job.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(JobLog::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(JobLog::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(JobLog::JobId).big_integer().not_null())
                    .col(ColumnDef::new(JobLog::Name).string_len(50).not_null())
                    .col(ColumnDef::new(JobLog::Url).string_len(255).not_null())
                    .col(
                        ColumnDef::new(JobLog::ParseStatus)
                            .string_len(25)
                            .not_null()
                            .default("pending"),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_job_log_job_id")
                            .from(JobLog::Table, JobLog::JobId)
                            .to(Job::Table, Job::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("uq_job_log_job_url")
                    .table(JobLog::Table)
                    .col(JobLog::JobId)
                    .col(JobLog::Url)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(JobLog::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum JobLog {
    Table,
    Id,
    JobId,
    Name,
    Url,
    ParseStatus,
}

#[derive(DeriveIden)]
enum Job {
    Table,
    Id,
}
