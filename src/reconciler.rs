//! # State Reconciler
//!
//! Applies normalized jobs against stored state. A job row only ever moves
//! forward through `pending → running → completed`; a message carrying an
//! older state than the stored one is acknowledged without effect.
//!
//! One [`Shard`] runs per repository. It accumulates jobs into batches of up
//! to `batch_max` items or `batch_ms` milliseconds, loads the current states of
//! the batch's guids, plans the mutations and commits them in one transaction.
//! Every delivery in the batch is settled with the batch's outcome.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::PipelineConfig;
use crate::error::StoreError;
use crate::normalization::NormalizedJob;
use crate::pipeline::{Disposition, Inflight, Settler};
use crate::store::{Batch, BatchOp, CommitSummary, JobStore, StoredState};

/// What the reconciler does with one incoming job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// No row yet.
    Insert,
    /// Stored state is older; move it forward and update mutable fields.
    Advance,
    /// Same state; refresh mutable fields and the result.
    Refresh,
    /// Stored state is newer; ignore.
    Stale,
}

impl Decision {
    pub const fn applies(self) -> bool {
        !matches!(self, Decision::Stale)
    }
}

pub fn decide(existing: Option<&StoredState>, incoming: &NormalizedJob) -> Decision {
    let Some(existing) = existing else {
        return Decision::Insert;
    };
    let stored = existing.state.ordinal();
    let next = incoming.state.ordinal();
    match stored.cmp(&next) {
        std::cmp::Ordering::Less => Decision::Advance,
        std::cmp::Ordering::Equal => Decision::Refresh,
        std::cmp::Ordering::Greater => Decision::Stale,
    }
}

/// Mutations for one batch plus the decision taken for each job, in input
/// order.
#[derive(Debug, Default)]
pub struct Plan {
    pub batch: Batch,
    pub decisions: Vec<Decision>,
}

impl Plan {
    pub fn stale(&self) -> usize {
        self.decisions.iter().filter(|d| !d.applies()).count()
    }
}

/// Plan the mutations for `jobs`, applied in order on top of `existing`.
/// Jobs for the same guid later in the batch see the state left by earlier
/// ones.
pub fn plan_batch<'a, I>(existing: &HashMap<String, StoredState>, jobs: I) -> Plan
where
    I: IntoIterator<Item = &'a NormalizedJob>,
{
    let mut current = existing.clone();
    let mut plan = Plan::default();

    for job in jobs {
        let decision = decide(current.get(&job.job_guid), job);
        plan.decisions.push(decision);

        match decision {
            Decision::Insert | Decision::Advance => {
                current.insert(
                    job.job_guid.clone(),
                    StoredState {
                        state: job.state,
                        result: job.result,
                    },
                );
            }
            Decision::Refresh => {}
            Decision::Stale => continue,
        }

        plan.batch.push(BatchOp::Upsert(job.clone()));
        for coalesced in &job.coalesced_guids {
            plan.batch.push(BatchOp::MarkCoalesced {
                repository_id: job.repository_id,
                by_guid: job.job_guid.clone(),
                coalesced_guid: coalesced.clone(),
            });
        }
    }

    plan
}

/// A normalized job waiting for its shard's next commit.
#[derive(Debug)]
pub struct ShardItem {
    pub job: NormalizedJob,
    pub inflight: Inflight,
}

#[derive(Debug, Clone, Copy)]
pub struct BatchSettings {
    pub batch_max: usize,
    pub batch_window: Duration,
    pub commit_timeout: Duration,
}

impl From<&PipelineConfig> for BatchSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            batch_max: config.batch_max.max(1),
            batch_window: Duration::from_millis(config.batch_ms),
            commit_timeout: Duration::from_millis(config.commit_timeout_ms),
        }
    }
}

/// Serial reconciler for one repository.
pub struct Shard {
    repository_id: i32,
    store: Arc<dyn JobStore>,
    settler: Arc<Settler>,
    settings: BatchSettings,
    /// Cancelled when a fatal store error halts the pipeline.
    halt: CancellationToken,
}

impl Shard {
    pub fn new(
        repository_id: i32,
        store: Arc<dyn JobStore>,
        settler: Arc<Settler>,
        settings: BatchSettings,
        halt: CancellationToken,
    ) -> Self {
        Self {
            repository_id,
            store,
            settler,
            settings,
            halt,
        }
    }

    /// Process items until the sender side closes, flushing what is left.
    pub async fn run(self, mut rx: mpsc::Receiver<ShardItem>) {
        debug!(repository_id = self.repository_id, "Reconciler shard started");
        while let Some(first) = rx.recv().await {
            let deadline = Instant::now() + self.settings.batch_window;
            let mut items = vec![first];

            while items.len() < self.settings.batch_max {
                match tokio::time::timeout_at(deadline, rx.recv()).await {
                    Ok(Some(item)) => items.push(item),
                    Ok(None) | Err(_) => break,
                }
            }

            self.flush(items).await;
        }
        debug!(repository_id = self.repository_id, "Reconciler shard stopped");
    }

    #[instrument(skip_all, fields(repository_id = self.repository_id, items = items.len()))]
    async fn flush(&self, items: Vec<ShardItem>) {
        histogram!("reconciler_batch_size").record(items.len() as f64);

        if self.halt.is_cancelled() {
            warn!("Pipeline halted; deferring batch without commit");
            self.settle_all(items, Disposition::Defer);
            return;
        }

        let started = Instant::now();
        let outcome = self.reconcile(&items).await;
        histogram!("job_store_commit_duration_ms").record(started.elapsed().as_secs_f64() * 1000.0);

        match outcome {
            Ok(summary) => {
                counter!("job_store_commits_total", "outcome" => "ok").increment(1);
                debug!(
                    inserted = summary.inserted,
                    advanced = summary.advanced,
                    refreshed = summary.refreshed,
                    stale = summary.stale,
                    coalesced = summary.coalesced,
                    "Batch committed"
                );
                self.settle_all(items, Disposition::Ack);
            }
            Err(err) if err.is_retryable() => {
                counter!("job_store_commits_total", "outcome" => "retryable").increment(1);
                warn!(error = %err, "Batch commit failed; deferring");
                self.settle_all(items, Disposition::Defer);
            }
            Err(err) => {
                counter!("job_store_commits_total", "outcome" => "fatal").increment(1);
                error!(error = %err, "Fatal store error; dead-lettering batch and halting pipeline");
                self.settle_all(items, Disposition::Dead);
                self.halt.cancel();
            }
        }
    }

    async fn reconcile(&self, items: &[ShardItem]) -> Result<CommitSummary, StoreError> {
        let mut seen = HashSet::new();
        let guids: Vec<String> = items
            .iter()
            .map(|item| item.job.job_guid.clone())
            .filter(|guid| seen.insert(guid.clone()))
            .collect();

        let after_ms = self.settings.commit_timeout.as_millis() as u64;
        tokio::time::timeout(self.settings.commit_timeout, async {
            let existing = self.store.load_states(self.repository_id, &guids).await?;
            let plan = plan_batch(&existing, items.iter().map(|item| &item.job));
            let stale = plan.stale() as u64;
            if stale > 0 {
                info!(stale, "Ignoring out-of-order job updates");
            }
            if plan.batch.is_empty() {
                return Ok(CommitSummary {
                    stale,
                    ..CommitSummary::default()
                });
            }

            let mut summary = self.store.commit(&plan.batch).await?;
            summary.stale += stale;
            Ok::<_, StoreError>(summary)
        })
        .await
        .map_err(|_| StoreError::timeout("commit", after_ms))?
    }

    fn settle_all(&self, items: Vec<ShardItem>, disposition: Disposition) {
        for item in items {
            self.settler.settle(item.inflight, disposition);
        }
    }
}
