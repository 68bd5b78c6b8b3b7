//! SeaORM-backed [`JobStore`].
//!
//! Reference rows are interned with `INSERT .. ON CONFLICT DO NOTHING`
//! followed by a reload of the natural key, so concurrent writers converge on
//! a single row per key. Job upserts guard the state ordinal in the `WHERE`
//! clause; a stale message can never move a row backwards even if two
//! processes race on the same guid.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DatabaseTransaction, DbErr,
    EntityTrait, Insert, IntoActiveModel, QueryFilter, QueryOrder, Set, TransactionTrait,
    UpdateMany,
};
use tracing::{debug, instrument, warn};

use crate::error::{StoreError, is_unique_violation};
use crate::models::{
    build_platform, job, job_group, job_log, job_type, machine, machine_platform, option,
    option_collection, product, repository, repository_version,
};
use crate::normalization::{JobResult, JobState, NormalizedJob};
use crate::store::{
    Batch, BatchOp, CommitSummary, JobStore, RefKey, RepositoryRecord, StoredState,
};

/// Relational [`JobStore`] over a SeaORM connection pool.
#[derive(Debug, Clone)]
pub struct SeaOrmJobStore {
    /// Database connection pool
    pub db: Arc<DatabaseConnection>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpsertOutcome {
    Inserted,
    Advanced,
    Refreshed,
    Stale,
}

impl SeaOrmJobStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    async fn get_or_create(&self, key: &RefKey) -> Result<i32, DbErr> {
        let db = self.db.as_ref();
        let now = Utc::now().timestamp();

        let found = match key {
            RefKey::BuildPlatform(p) => {
                let model = build_platform::ActiveModel {
                    os_name: Set(p.os_name.clone()),
                    platform: Set(p.platform.clone()),
                    architecture: Set(p.architecture.clone()),
                    ..Default::default()
                };
                insert_ignoring_conflict(
                    build_platform::Entity::insert(model).on_conflict(
                        OnConflict::columns([
                            build_platform::Column::OsName,
                            build_platform::Column::Platform,
                            build_platform::Column::Architecture,
                        ])
                        .do_nothing()
                        .to_owned(),
                    ),
                    db,
                )
                .await?;
                build_platform::Entity::find()
                    .filter(build_platform::Column::OsName.eq(p.os_name.as_str()))
                    .filter(build_platform::Column::Platform.eq(p.platform.as_str()))
                    .filter(build_platform::Column::Architecture.eq(p.architecture.as_str()))
                    .one(db)
                    .await?
                    .map(|m| m.id)
            }
            RefKey::MachinePlatform(p) => {
                let model = machine_platform::ActiveModel {
                    os_name: Set(p.os_name.clone()),
                    platform: Set(p.platform.clone()),
                    architecture: Set(p.architecture.clone()),
                    ..Default::default()
                };
                insert_ignoring_conflict(
                    machine_platform::Entity::insert(model).on_conflict(
                        OnConflict::columns([
                            machine_platform::Column::OsName,
                            machine_platform::Column::Platform,
                            machine_platform::Column::Architecture,
                        ])
                        .do_nothing()
                        .to_owned(),
                    ),
                    db,
                )
                .await?;
                machine_platform::Entity::find()
                    .filter(machine_platform::Column::OsName.eq(p.os_name.as_str()))
                    .filter(machine_platform::Column::Platform.eq(p.platform.as_str()))
                    .filter(machine_platform::Column::Architecture.eq(p.architecture.as_str()))
                    .one(db)
                    .await?
                    .map(|m| m.id)
            }
            RefKey::Machine { name } => {
                let model = machine::ActiveModel {
                    name: Set(name.clone()),
                    first_timestamp: Set(now),
                    last_timestamp: Set(now),
                    ..Default::default()
                };
                insert_ignoring_conflict(
                    machine::Entity::insert(model).on_conflict(
                        OnConflict::column(machine::Column::Name)
                            .do_nothing()
                            .to_owned(),
                    ),
                    db,
                )
                .await?;
                machine::Entity::find()
                    .filter(machine::Column::Name.eq(name.as_str()))
                    .one(db)
                    .await?
                    .map(|m| m.id)
            }
            RefKey::JobGroup { name, symbol } => {
                let model = job_group::ActiveModel {
                    name: Set(name.clone()),
                    symbol: Set(symbol.clone()),
                    ..Default::default()
                };
                insert_ignoring_conflict(
                    job_group::Entity::insert(model).on_conflict(
                        OnConflict::columns([job_group::Column::Name, job_group::Column::Symbol])
                            .do_nothing()
                            .to_owned(),
                    ),
                    db,
                )
                .await?;
                job_group::Entity::find()
                    .filter(job_group::Column::Name.eq(name.as_str()))
                    .filter(job_group::Column::Symbol.eq(symbol.as_str()))
                    .one(db)
                    .await?
                    .map(|m| m.id)
            }
            RefKey::JobType {
                job_group_id,
                name,
                symbol,
            } => {
                let model = job_type::ActiveModel {
                    job_group_id: Set(*job_group_id),
                    name: Set(name.clone()),
                    symbol: Set(symbol.clone()),
                    ..Default::default()
                };
                insert_ignoring_conflict(
                    job_type::Entity::insert(model).on_conflict(
                        OnConflict::columns([
                            job_type::Column::JobGroupId,
                            job_type::Column::Name,
                            job_type::Column::Symbol,
                        ])
                        .do_nothing()
                        .to_owned(),
                    ),
                    db,
                )
                .await?;
                job_type::Entity::find()
                    .filter(job_type::Column::JobGroupId.eq(*job_group_id))
                    .filter(job_type::Column::Name.eq(name.as_str()))
                    .filter(job_type::Column::Symbol.eq(symbol.as_str()))
                    .one(db)
                    .await?
                    .map(|m| m.id)
            }
            RefKey::Option { name } => {
                let model = option::ActiveModel {
                    name: Set(name.clone()),
                    ..Default::default()
                };
                insert_ignoring_conflict(
                    option::Entity::insert(model).on_conflict(
                        OnConflict::column(option::Column::Name)
                            .do_nothing()
                            .to_owned(),
                    ),
                    db,
                )
                .await?;
                option::Entity::find()
                    .filter(option::Column::Name.eq(name.as_str()))
                    .one(db)
                    .await?
                    .map(|m| m.id)
            }
            RefKey::OptionCollection { hash, option_id } => {
                let model = option_collection::ActiveModel {
                    option_collection_hash: Set(hash.clone()),
                    option_id: Set(*option_id),
                    ..Default::default()
                };
                insert_ignoring_conflict(
                    option_collection::Entity::insert(model).on_conflict(
                        OnConflict::columns([
                            option_collection::Column::OptionCollectionHash,
                            option_collection::Column::OptionId,
                        ])
                        .do_nothing()
                        .to_owned(),
                    ),
                    db,
                )
                .await?;
                option_collection::Entity::find()
                    .filter(option_collection::Column::OptionCollectionHash.eq(hash.as_str()))
                    .filter(option_collection::Column::OptionId.eq(*option_id))
                    .one(db)
                    .await?
                    .map(|m| m.id)
            }
            RefKey::Product { name } => {
                let model = product::ActiveModel {
                    name: Set(name.clone()),
                    ..Default::default()
                };
                insert_ignoring_conflict(
                    product::Entity::insert(model).on_conflict(
                        OnConflict::column(product::Column::Name)
                            .do_nothing()
                            .to_owned(),
                    ),
                    db,
                )
                .await?;
                product::Entity::find()
                    .filter(product::Column::Name.eq(name.as_str()))
                    .one(db)
                    .await?
                    .map(|m| m.id)
            }
        };

        found.ok_or_else(|| {
            DbErr::RecordNotFound(format!("{} row missing after insert", key.kind()))
        })
    }
}

/// Executes an insert whose conflicts are ignored. A unique violation that
/// slips past `ON CONFLICT` means another writer won the race; the caller's
/// reload picks up that row.
async fn insert_ignoring_conflict<A, C>(insert: Insert<A>, db: &C) -> Result<(), DbErr>
where
    A: ActiveModelTrait,
    <A::Entity as EntityTrait>::Model: IntoActiveModel<A>,
    C: ConnectionTrait,
{
    match insert.exec_without_returning(db).await {
        Ok(_) => Ok(()),
        Err(err) if is_unique_violation(&err) => {
            debug!(error = %err, "Reference row inserted concurrently");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

fn job_active_model(job: &NormalizedJob, now: DateTimeWithTimeZone) -> job::ActiveModel {
    job::ActiveModel {
        repository_id: Set(job.repository_id),
        job_guid: Set(job.job_guid.clone()),
        revision: Set(job.revision.clone()),
        build_platform_id: Set(job.build_platform_id),
        machine_platform_id: Set(job.machine_platform_id),
        machine_id: Set(job.machine_id),
        option_collection_hash: Set(job.option_collection_hash.clone()),
        job_type_id: Set(job.job_type_id),
        product_id: Set(job.product_id),
        who: Set(job.who.clone()),
        reason: Set(job.reason.clone()),
        tier: Set(job.tier),
        build_system_type: Set(job.build_system_type.clone()),
        state: Set(job.state.as_str().to_string()),
        state_ordinal: Set(job.state.ordinal()),
        result: Set(job.result.map(|r| r.as_str().to_string())),
        submit_timestamp: Set(job.submit_timestamp),
        start_timestamp: Set(job.start_timestamp),
        end_timestamp: Set(job.end_timestamp),
        coalesced_to_guid: Set(None),
        last_modified: Set(now),
        ..Default::default()
    }
}

/// Sets every column that may change without a state transition. Absent
/// timestamps never erase stored ones.
fn set_mutable_columns(
    update: UpdateMany<job::Entity>,
    job: &NormalizedJob,
    now: DateTimeWithTimeZone,
) -> UpdateMany<job::Entity> {
    let mut update = update
        .col_expr(job::Column::Revision, Expr::value(job.revision.clone()))
        .col_expr(job::Column::BuildPlatformId, Expr::value(job.build_platform_id))
        .col_expr(
            job::Column::MachinePlatformId,
            Expr::value(job.machine_platform_id),
        )
        .col_expr(job::Column::MachineId, Expr::value(job.machine_id))
        .col_expr(
            job::Column::OptionCollectionHash,
            Expr::value(job.option_collection_hash.clone()),
        )
        .col_expr(job::Column::JobTypeId, Expr::value(job.job_type_id))
        .col_expr(job::Column::ProductId, Expr::value(job.product_id))
        .col_expr(job::Column::Who, Expr::value(job.who.clone()))
        .col_expr(job::Column::Reason, Expr::value(job.reason.clone()))
        .col_expr(job::Column::Tier, Expr::value(job.tier))
        .col_expr(
            job::Column::BuildSystemType,
            Expr::value(job.build_system_type.clone()),
        )
        .col_expr(job::Column::LastModified, Expr::value(now));

    for (column, value) in [
        (job::Column::SubmitTimestamp, job.submit_timestamp),
        (job::Column::StartTimestamp, job.start_timestamp),
        (job::Column::EndTimestamp, job.end_timestamp),
    ] {
        if let Some(ts) = value {
            update = update.col_expr(column, Expr::value(ts));
        }
    }
    update
}

async fn upsert_job(
    txn: &DatabaseTransaction,
    job: &NormalizedJob,
    now: DateTimeWithTimeZone,
) -> Result<UpsertOutcome, DbErr> {
    let ordinal = job.state.ordinal();

    let inserted = job::Entity::insert(job_active_model(job, now))
        .on_conflict(
            OnConflict::columns([job::Column::RepositoryId, job::Column::JobGuid])
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(txn)
        .await?;
    if inserted > 0 {
        return Ok(UpsertOutcome::Inserted);
    }

    let advanced = set_mutable_columns(job::Entity::update_many(), job, now)
        .col_expr(job::Column::State, Expr::value(job.state.as_str()))
        .col_expr(job::Column::StateOrdinal, Expr::value(ordinal))
        .col_expr(
            job::Column::Result,
            Expr::value(job.result.map(|r| r.as_str().to_string())),
        )
        .filter(job::Column::RepositoryId.eq(job.repository_id))
        .filter(job::Column::JobGuid.eq(job.job_guid.as_str()))
        .filter(job::Column::StateOrdinal.lt(ordinal))
        .exec(txn)
        .await?
        .rows_affected;
    if advanced > 0 {
        return Ok(UpsertOutcome::Advanced);
    }

    // Same state: refresh mutable fields. A later `retry` keeps the stored result.
    let mut refresh = set_mutable_columns(job::Entity::update_many(), job, now);
    if let Some(result) = job.result.filter(|r| *r != JobResult::Retry) {
        refresh = refresh.col_expr(job::Column::Result, Expr::value(result.as_str()));
    }
    let refreshed = refresh
        .filter(job::Column::RepositoryId.eq(job.repository_id))
        .filter(job::Column::JobGuid.eq(job.job_guid.as_str()))
        .filter(job::Column::StateOrdinal.eq(ordinal))
        .exec(txn)
        .await?
        .rows_affected;
    if refreshed > 0 {
        Ok(UpsertOutcome::Refreshed)
    } else {
        Ok(UpsertOutcome::Stale)
    }
}

async fn attach_logs(txn: &DatabaseTransaction, job: &NormalizedJob) -> Result<(), DbErr> {
    if job.log_references.is_empty() {
        return Ok(());
    }

    let Some(row) = job::Entity::find()
        .filter(job::Column::RepositoryId.eq(job.repository_id))
        .filter(job::Column::JobGuid.eq(job.job_guid.as_str()))
        .one(txn)
        .await?
    else {
        return Err(DbErr::RecordNotFound(format!(
            "job {} missing after upsert",
            job.job_guid
        )));
    };

    let logs = job.log_references.iter().map(|log| job_log::ActiveModel {
        job_id: Set(row.id),
        name: Set(log.name.clone()),
        url: Set(log.url.clone()),
        parse_status: Set(log.parse_status.as_str().to_string()),
        ..Default::default()
    });

    job_log::Entity::insert_many(logs)
        .on_conflict(
            OnConflict::columns([job_log::Column::JobId, job_log::Column::Url])
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(txn)
        .await?;
    Ok(())
}

async fn advance_machine(txn: &DatabaseTransaction, job: &NormalizedJob) -> Result<(), DbErr> {
    let Some(ts) = job.latest_timestamp() else {
        return Ok(());
    };
    machine::Entity::update_many()
        .col_expr(machine::Column::LastTimestamp, Expr::value(ts))
        .filter(machine::Column::Id.eq(job.machine_id))
        .filter(machine::Column::LastTimestamp.lt(ts))
        .exec(txn)
        .await?;
    Ok(())
}

async fn apply_batch(
    txn: &DatabaseTransaction,
    batch: &Batch,
    now: DateTimeWithTimeZone,
) -> Result<CommitSummary, DbErr> {
    let mut summary = CommitSummary::default();

    for op in &batch.ops {
        match op {
            BatchOp::Upsert(job) => {
                let outcome = upsert_job(txn, job, now).await?;
                match outcome {
                    UpsertOutcome::Inserted => summary.inserted += 1,
                    UpsertOutcome::Advanced => summary.advanced += 1,
                    UpsertOutcome::Refreshed => summary.refreshed += 1,
                    UpsertOutcome::Stale => {
                        summary.stale += 1;
                        debug!(job_guid = %job.job_guid, state = %job.state, "Stale upsert ignored");
                        continue;
                    }
                }
                attach_logs(txn, job).await?;
                advance_machine(txn, job).await?;
            }
            BatchOp::MarkCoalesced {
                repository_id,
                by_guid,
                coalesced_guid,
            } => {
                summary.coalesced += job::Entity::update_many()
                    .col_expr(
                        job::Column::CoalescedToGuid,
                        Expr::value(Some(by_guid.clone())),
                    )
                    .col_expr(job::Column::LastModified, Expr::value(now))
                    .filter(job::Column::RepositoryId.eq(*repository_id))
                    .filter(job::Column::JobGuid.eq(coalesced_guid.as_str()))
                    .exec(txn)
                    .await?
                    .rows_affected;
            }
        }
    }

    Ok(summary)
}

#[async_trait]
impl JobStore for SeaOrmJobStore {
    #[instrument(skip(self), fields(kind = %key.kind()))]
    async fn resolve_ref(&self, key: &RefKey) -> Result<i32, StoreError> {
        self.get_or_create(key)
            .await
            .map_err(|err| StoreError::from_db(format!("resolve {}", key.kind()), err))
    }

    async fn load_states(
        &self,
        repository_id: i32,
        guids: &[String],
    ) -> Result<HashMap<String, StoredState>, StoreError> {
        if guids.is_empty() {
            return Ok(HashMap::new());
        }

        let rows = job::Entity::find()
            .filter(job::Column::RepositoryId.eq(repository_id))
            .filter(job::Column::JobGuid.is_in(guids.iter().map(String::as_str)))
            .all(self.db.as_ref())
            .await
            .map_err(|err| StoreError::from_db("load job states", err))?;

        let mut states = HashMap::with_capacity(rows.len());
        for row in rows {
            let Some(state) = JobState::parse(&row.state) else {
                warn!(job_guid = %row.job_guid, state = %row.state, "Unrecognised stored job state");
                continue;
            };
            let result = row.result.as_deref().and_then(JobResult::parse);
            states.insert(row.job_guid, StoredState { state, result });
        }
        Ok(states)
    }

    #[instrument(skip_all, fields(ops = batch.len()))]
    async fn commit(&self, batch: &Batch) -> Result<CommitSummary, StoreError> {
        if batch.is_empty() {
            return Ok(CommitSummary::default());
        }

        let now: DateTimeWithTimeZone = Utc::now().into();
        let txn = self
            .db
            .begin()
            .await
            .map_err(|err| StoreError::from_db("begin commit transaction", err))?;

        let summary = match apply_batch(&txn, batch, now).await {
            Ok(summary) => summary,
            Err(err) => {
                if let Err(rollback_err) = txn.rollback().await {
                    warn!(error = %rollback_err, "Failed to roll back job batch");
                }
                return Err(StoreError::from_db("apply job batch", err));
            }
        };

        txn.commit()
            .await
            .map_err(|err| StoreError::from_db("commit job batch", err))?;
        Ok(summary)
    }

    async fn list_repositories(&self) -> Result<Vec<RepositoryRecord>, StoreError> {
        let rows = repository::Entity::find()
            .order_by_asc(repository::Column::Name)
            .all(self.db.as_ref())
            .await
            .map_err(|err| StoreError::from_db("list repositories", err))?;

        Ok(rows
            .into_iter()
            .map(|row| RepositoryRecord {
                id: row.id,
                name: row.name,
                dvcs_type: row.dvcs_type,
                url: row.url,
                active_status: row.active_status,
            })
            .collect())
    }

    async fn record_repository_version(
        &self,
        repository_id: i32,
        version: &str,
        version_timestamp: i64,
    ) -> Result<(), StoreError> {
        let model = repository_version::ActiveModel {
            repository_id: Set(repository_id),
            version: Set(version.to_string()),
            version_timestamp: Set(version_timestamp),
            ..Default::default()
        };

        repository_version::Entity::insert(model)
            .on_conflict(
                OnConflict::columns([
                    repository_version::Column::RepositoryId,
                    repository_version::Column::Version,
                ])
                .update_column(repository_version::Column::VersionTimestamp)
                .to_owned(),
            )
            .exec_without_returning(self.db.as_ref())
            .await
            .map_err(|err| StoreError::from_db("record repository version", err))?;
        Ok(())
    }
}
