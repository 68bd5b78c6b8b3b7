//! Migration to create the reference-data tables.
//!
//! Repositories are managed out-of-band; every other table here is interned by
//! the ingestion core with get-or-create semantics, so each one carries a
//! unique index over its natural key.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Repository::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Repository::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Repository::Name).string_len(50).not_null())
                    .col(ColumnDef::new(Repository::DvcsType).string_len(25).not_null())
                    .col(ColumnDef::new(Repository::Url).string_len(255).not_null())
                    .col(ColumnDef::new(Repository::Branch).string_len(50).null())
                    .col(
                        ColumnDef::new(Repository::ActiveStatus)
                            .string_len(7)
                            .not_null()
                            .default("active"),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("uq_repository_name")
                    .table(Repository::Table)
                    .col(Repository::Name)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(RepositoryVersion::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(RepositoryVersion::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(RepositoryVersion::RepositoryId)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(RepositoryVersion::Version)
                            .string_len(50)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(RepositoryVersion::VersionTimestamp)
                            .big_integer()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_repository_version_repository_id")
                            .from(RepositoryVersion::Table, RepositoryVersion::RepositoryId)
                            .to(Repository::Table, Repository::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("uq_repository_version")
                    .table(RepositoryVersion::Table)
                    .col(RepositoryVersion::RepositoryId)
                    .col(RepositoryVersion::Version)
                    .unique()
                    .to_owned(),
            )
            .await?;

        for (table, index) in [
            (Platform::BuildPlatform, "uq_build_platform"),
            (Platform::MachinePlatform, "uq_machine_platform"),
        ] {
            manager
                .create_table(
                    Table::create()
                        .table(table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Platform::Id)
                                .integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(Platform::OsName).string_len(25).not_null())
                        .col(ColumnDef::new(Platform::Platform).string_len(100).not_null())
                        .col(
                            ColumnDef::new(Platform::Architecture)
                                .string_len(25)
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name(index)
                        .table(table)
                        .col(Platform::OsName)
                        .col(Platform::Platform)
                        .col(Platform::Architecture)
                        .unique()
                        .to_owned(),
                )
                .await?;
        }

        manager
            .create_table(
                Table::create()
                    .table(Machine::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Machine::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Machine::Name).string_len(100).not_null())
                    .col(ColumnDef::new(Machine::FirstTimestamp).big_integer().not_null())
                    .col(ColumnDef::new(Machine::LastTimestamp).big_integer().not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("uq_machine_name")
                    .table(Machine::Table)
                    .col(Machine::Name)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(JobGroup::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(JobGroup::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(JobGroup::Name).string_len(100).not_null())
                    .col(
                        ColumnDef::new(JobGroup::Symbol)
                            .string_len(25)
                            .not_null()
                            .default("?"),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("uq_job_group_name_symbol")
                    .table(JobGroup::Table)
                    .col(JobGroup::Name)
                    .col(JobGroup::Symbol)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(JobType::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(JobType::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(JobType::JobGroupId).integer().not_null())
                    .col(ColumnDef::new(JobType::Name).string_len(100).not_null())
                    .col(
                        ColumnDef::new(JobType::Symbol)
                            .string_len(25)
                            .not_null()
                            .default("?"),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_job_type_job_group_id")
                            .from(JobType::Table, JobType::JobGroupId)
                            .to(JobGroup::Table, JobGroup::Id),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("uq_job_type_group_name_symbol")
                    .table(JobType::Table)
                    .col(JobType::JobGroupId)
                    .col(JobType::Name)
                    .col(JobType::Symbol)
                    .unique()
                    .to_owned(),
            )
            .await?;

        for (table, index) in [
            (Named::Option, "uq_option_name"),
            (Named::Product, "uq_product_name"),
        ] {
            manager
                .create_table(
                    Table::create()
                        .table(table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Named::Id)
                                .integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(Named::Name).string_len(100).not_null())
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name(index)
                        .table(table)
                        .col(Named::Name)
                        .unique()
                        .to_owned(),
                )
                .await?;
        }

        manager
            .create_table(
                Table::create()
                    .table(OptionCollection::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(OptionCollection::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(OptionCollection::OptionCollectionHash)
                            .string_len(40)
                            .not_null(),
                    )
                    .col(ColumnDef::new(OptionCollection::OptionId).integer().not_null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_option_collection_option_id")
                            .from(OptionCollection::Table, OptionCollection::OptionId)
                            .to(Named::Option, Named::Id),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("uq_option_collection_hash_option")
                    .table(OptionCollection::Table)
                    .col(OptionCollection::OptionCollectionHash)
                    .col(OptionCollection::OptionId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(OptionCollection::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Named::Product).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Named::Option).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(JobType::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(JobGroup::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Machine::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Platform::MachinePlatform).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Platform::BuildPlatform).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(RepositoryVersion::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Repository::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Repository {
    Table,
    Id,
    Name,
    DvcsType,
    Url,
    Branch,
    ActiveStatus,
}

#[derive(DeriveIden)]
enum RepositoryVersion {
    Table,
    Id,
    RepositoryId,
    Version,
    VersionTimestamp,
}

#[derive(DeriveIden, Clone, Copy)]
enum Platform {
    BuildPlatform,
    MachinePlatform,
    Id,
    OsName,
    Platform,
    Architecture,
}

#[derive(DeriveIden)]
enum Machine {
    Table,
    Id,
    Name,
    FirstTimestamp,
    LastTimestamp,
}

#[derive(DeriveIden)]
enum JobGroup {
    Table,
    Id,
    Name,
    Symbol,
}

#[derive(DeriveIden)]
enum JobType {
    Table,
    Id,
    JobGroupId,
    Name,
    Symbol,
}

#[derive(DeriveIden, Clone, Copy)]
enum Named {
    Option,
    Product,
    Id,
    Name,
}

#[derive(DeriveIden)]
enum OptionCollection {
    Table,
    Id,
    OptionCollectionHash,
    OptionId,
}
