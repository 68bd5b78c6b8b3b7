//! Test utilities for database testing.
//!
//! In-memory SQLite databases with every migration applied, plus fixtures
//! for the rows the ingestion core expects to exist out-of-band.

use std::sync::Arc;

use anyhow::Result;
use migration::{Migrator, MigratorTrait};
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, Statement, Value};

/// Sets up an in-memory SQLite database with all migrations applied.
///
/// The pool is limited to one connection so batch transactions never race
/// a second connection for the table lock.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let mut opt = ConnectOptions::new("sqlite::memory:");
    opt.max_connections(1).sqlx_logging(false);
    let db = Database::connect(opt).await?;

    Migrator::up(&db, None).await?;

    db.execute(Statement::from_string(
        db.get_database_backend(),
        "PRAGMA foreign_keys = ON".to_string(),
    ))
    .await?;

    Ok(db)
}

/// Sets up an in-memory SQLite database and returns it wrapped in an Arc.
#[allow(dead_code)]
pub async fn setup_test_db_arc() -> Result<Arc<DatabaseConnection>> {
    let db = setup_test_db().await?;
    Ok(Arc::new(db))
}

/// Inserts an active repository row and returns its id.
#[allow(dead_code)]
pub async fn insert_repository(
    db: &DatabaseConnection,
    name: &str,
    dvcs_type: &str,
    url: &str,
) -> Result<i32> {
    let backend = db.get_database_backend();
    db.execute(Statement::from_sql_and_values(
        backend,
        "INSERT INTO repository (name, dvcs_type, url, branch, active_status) VALUES (?, ?, ?, NULL, 'active')",
        vec![
            Value::String(Some(Box::new(name.to_string()))),
            Value::String(Some(Box::new(dvcs_type.to_string()))),
            Value::String(Some(Box::new(url.to_string()))),
        ],
    ))
    .await?;

    let row = db
        .query_one(Statement::from_sql_and_values(
            backend,
            "SELECT id FROM repository WHERE name = ?",
            vec![Value::String(Some(Box::new(name.to_string())))],
        ))
        .await?
        .ok_or_else(|| anyhow::anyhow!("repository {name} missing after insert"))?;

    Ok(row.try_get::<i32>("", "id")?)
}
