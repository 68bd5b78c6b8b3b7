//! # Error Handling
//!
//! Store-level error classification shared by the persistence layer and the
//! pipeline. Database failures are sorted into retryable and fatal classes so
//! the pipeline can render them into a message disposition without inspecting
//! driver internals.

use sea_orm::{DbErr, RuntimeErr};
use thiserror::Error;

/// Postgres SQLSTATE codes that indicate a transient conflict.
const PG_RETRYABLE_CODES: &[&str] = &["40001", "40P01", "55P03"];

/// SQLite primary/extended result codes for `SQLITE_BUSY` and `SQLITE_LOCKED`.
const SQLITE_RETRYABLE_CODES: &[&str] = &["5", "6", "261", "262", "517"];

/// Errors returned by a [`crate::store::JobStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// The operation may succeed if retried later (connection loss, lock
    /// contention, pool exhaustion, timeouts).
    #[error("retryable store error during {context}: {message}")]
    Retryable { context: String, message: String },

    /// The operation will not succeed on retry.
    #[error("fatal store error during {context}: {message}")]
    Fatal { context: String, message: String },
}

impl StoreError {
    /// Classify a SeaORM error raised while performing `context`.
    pub fn from_db(context: impl Into<String>, err: DbErr) -> Self {
        let context = context.into();
        let message = err.to_string();
        if is_retryable(&err) {
            StoreError::Retryable { context, message }
        } else {
            StoreError::Fatal { context, message }
        }
    }

    pub fn timeout(context: impl Into<String>, after_ms: u64) -> Self {
        StoreError::Retryable {
            context: context.into(),
            message: format!("timed out after {after_ms}ms"),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Retryable { .. })
    }
}

/// Returns true when `error` is a transient database failure.
pub fn is_retryable(error: &DbErr) -> bool {
    match error {
        DbErr::Conn(_) | DbErr::ConnectionAcquire(_) => true,
        DbErr::Query(RuntimeErr::SqlxError(sqlx_err))
        | DbErr::Exec(RuntimeErr::SqlxError(sqlx_err)) => match sqlx_err {
            sea_orm::sqlx::Error::PoolTimedOut
            | sea_orm::sqlx::Error::PoolClosed
            | sea_orm::sqlx::Error::Io(_) => true,
            other => other
                .as_database_error()
                .and_then(|db_error| db_error.code())
                .map(|code| {
                    let code = code.as_ref();
                    PG_RETRYABLE_CODES.contains(&code) || SQLITE_RETRYABLE_CODES.contains(&code)
                })
                .unwrap_or(false),
        },
        _ => false,
    }
}

/// Returns true when `error` is a unique-constraint violation.
pub fn is_unique_violation(error: &DbErr) -> bool {
    const PG_UNIQUE: &str = "23505";
    const SQLITE_DUPLICATE_CODES: &[&str] = &["1555", "2067"];

    let runtime_err = match error {
        DbErr::Query(RuntimeErr::SqlxError(sqlx_err))
        | DbErr::Exec(RuntimeErr::SqlxError(sqlx_err)) => sqlx_err,
        _ => return false,
    };

    let Some(db_error) = runtime_err.as_database_error() else {
        return false;
    };

    if db_error.is_unique_violation() {
        return true;
    }

    db_error
        .code()
        .map(|code| {
            let code = code.as_ref();
            code == PG_UNIQUE || SQLITE_DUPLICATE_CODES.contains(&code)
        })
        .unwrap_or(false)
}
