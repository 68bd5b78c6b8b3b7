//! Database migrations for the Treeherder ingestion store.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2026_09_01_100000_create_reference_tables;
mod m2026_09_01_100100_create_jobs;
mod m2026_09_01_100200_create_job_logs;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2026_09_01_100000_create_reference_tables::Migration),
            Box::new(m2026_09_01_100100_create_jobs::Migration),
            Box::new(m2026_09_01_100200_create_job_logs::Migration),
        ]
    }
}
