//! # Ingestion Pipeline
//!
//! Connects the consumers to the reconciler:
//!
//! ```text
//! consumers ─► dispatcher (validate) ─► lanes (transform) ─► shards (reconcile + commit)
//! ```
//!
//! The dispatcher hashes `(project, job_guid)` onto a fixed set of worker
//! lanes and every lane forwards to the shard owning the job's repository, so
//! updates for one guid are handled in delivery order. Every delivery leaves
//! the pipeline as exactly one [`Disposition`].
//!
//! The pipeline runs until its input channel closes, then drains lanes and
//! flushes shards before returning.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use metrics::counter;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::normalization::{NormalizedJob, TransformError, Transformer};
use crate::reconciler::{BatchSettings, Shard, ShardItem};
use crate::refdata::ProjectCatalog;
use crate::store::JobStore;
use crate::validation::{ValidatedJob, Validator, Verdict};

pub mod disposition;
pub mod settle;

pub use disposition::{AckToken, Delivery, Disposition, RawMessage, Settlement};
pub use settle::{DeferLedger, Inflight, Settler};

/// Queue depth in front of every lane and shard.
const STAGE_CAPACITY: usize = 256;

struct LaneItem {
    validated: ValidatedJob,
    inflight: Inflight,
}

/// Shared pieces every stage needs.
#[derive(Clone)]
pub struct PipelineContext {
    pub validator: Arc<Validator>,
    pub catalog: Arc<ProjectCatalog>,
    pub transformer: Arc<Transformer>,
    pub store: Arc<dyn JobStore>,
    pub settler: Arc<Settler>,
}

pub struct Pipeline {
    context: PipelineContext,
    config: PipelineConfig,
    halt: CancellationToken,
}

impl Pipeline {
    /// `halt` is cancelled when a fatal store error stops ingestion.
    pub fn new(context: PipelineContext, config: PipelineConfig, halt: CancellationToken) -> Self {
        Self {
            context,
            config,
            halt,
        }
    }

    /// Process deliveries until `deliveries` closes.
    pub async fn run(self, mut deliveries: mpsc::Receiver<Delivery>) {
        let workers = self.config.workers.max(1);
        let router = Arc::new(ShardRouter::new(
            self.context.store.clone(),
            self.context.settler.clone(),
            BatchSettings::from(&self.config),
            self.halt.clone(),
        ));

        let mut lanes = Vec::with_capacity(workers);
        let mut lane_tasks = JoinSet::new();
        for lane in 0..workers {
            let (tx, rx) = mpsc::channel(STAGE_CAPACITY);
            lanes.push(tx);
            lane_tasks.spawn(run_lane(
                lane,
                rx,
                self.context.transformer.clone(),
                self.context.settler.clone(),
                router.clone(),
            ));
        }
        info!(workers, "Ingestion pipeline started");

        while let Some(delivery) = deliveries.recv().await {
            counter!("pulse_messages_received_total").increment(1);
            let Delivery { message, token } = delivery;
            let inflight = Inflight::new(token, &message.body);

            let Some((validated, inflight)) =
                self.classify(&message.body, message.delivery_tag, inflight).await
            else {
                continue;
            };

            let lane = lane_for(&validated, workers);
            if let Err(mpsc::error::SendError(item)) = lanes[lane]
                .send(LaneItem {
                    validated,
                    inflight,
                })
                .await
            {
                error!(lane, "Worker lane closed unexpectedly");
                self.context.settler.settle(item.inflight, Disposition::Defer);
            }
        }

        info!("Delivery channel closed; draining pipeline");
        drop(lanes);
        while let Some(joined) = lane_tasks.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "Worker lane panicked");
            }
        }
        router.shutdown().await;
        info!("Ingestion pipeline stopped");
    }

    /// Validate a body, settling it directly unless it was accepted.
    async fn classify(
        &self,
        body: &[u8],
        delivery_tag: u64,
        inflight: Inflight,
    ) -> Option<(ValidatedJob, Inflight)> {
        let mut verdict = self.context.validator.validate(body);

        if let Verdict::UnknownProject { project, .. } = &verdict {
            debug!(project = %project, "Unknown project; reloading catalog");
            match self.context.catalog.reload_if_stale().await {
                Ok(true) => verdict = self.context.validator.validate(body),
                Ok(false) => {}
                Err(err) => warn!(error = %err, "Failed to reload project catalog"),
            }
        }

        match verdict {
            Verdict::Accept(validated) => Some((validated, inflight)),
            Verdict::Drop(reason) => {
                counter!("pulse_messages_dropped_total", "reason" => reason.label()).increment(1);
                warn!(delivery_tag, reason = %reason, "Dropping malformed message");
                self.context.settler.settle(inflight, Disposition::Drop);
                None
            }
            Verdict::UnknownProject { project, job } => {
                info!(delivery_tag, project = %project, job_guid = %job.task_id, "Deferring job for unknown project");
                self.context.settler.settle(inflight, Disposition::Defer);
                None
            }
        }
    }
}

fn lane_for(validated: &ValidatedJob, lanes: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    validated.job.origin.project.hash(&mut hasher);
    validated.job.task_id.hash(&mut hasher);
    (hasher.finish() % lanes as u64) as usize
}

async fn run_lane(
    lane: usize,
    mut rx: mpsc::Receiver<LaneItem>,
    transformer: Arc<Transformer>,
    settler: Arc<Settler>,
    router: Arc<ShardRouter>,
) {
    debug!(lane, "Worker lane started");
    while let Some(LaneItem {
        validated,
        inflight,
    }) = rx.recv().await
    {
        let ValidatedJob { job, repository } = validated;
        match transformer.transform(&job, &repository).await {
            Ok(normalized) => router.route(normalized, inflight).await,
            Err(err) => {
                let disposition = transform_disposition(&err);
                warn!(
                    lane,
                    project = %repository.name,
                    job_guid = %job.task_id,
                    error = %err,
                    disposition = %disposition,
                    "Failed to transform job"
                );
                settler.settle(inflight, disposition);
            }
        }
    }
    debug!(lane, "Worker lane stopped");
}

/// Render a transform failure into a disposition.
pub fn transform_disposition(err: &TransformError) -> Disposition {
    match err {
        TransformError::Resolve(resolve) if resolve.is_transient() => Disposition::Defer,
        TransformError::Resolve(_) => Disposition::Dead,
        TransformError::InvalidTimestamp { .. } | TransformError::UnsupportedState { .. } => {
            Disposition::Drop
        }
    }
}

/// Lazily spawned reconciler shard per repository.
struct ShardRouter {
    store: Arc<dyn JobStore>,
    settler: Arc<Settler>,
    settings: BatchSettings,
    halt: CancellationToken,
    state: Mutex<RouterState>,
}

#[derive(Default)]
struct RouterState {
    shards: HashMap<i32, mpsc::Sender<ShardItem>>,
    tasks: JoinSet<()>,
}

impl ShardRouter {
    fn new(
        store: Arc<dyn JobStore>,
        settler: Arc<Settler>,
        settings: BatchSettings,
        halt: CancellationToken,
    ) -> Self {
        Self {
            store,
            settler,
            settings,
            halt,
            state: Mutex::new(RouterState::default()),
        }
    }

    async fn sender_for(&self, repository_id: i32) -> mpsc::Sender<ShardItem> {
        let mut state = self.state.lock().await;
        if let Some(tx) = state.shards.get(&repository_id) {
            return tx.clone();
        }

        let (tx, rx) = mpsc::channel(STAGE_CAPACITY);
        let shard = Shard::new(
            repository_id,
            self.store.clone(),
            self.settler.clone(),
            self.settings,
            self.halt.clone(),
        );
        state.tasks.spawn(shard.run(rx));
        state.shards.insert(repository_id, tx.clone());
        debug!(repository_id, "Spawned reconciler shard");
        tx
    }

    async fn route(&self, job: NormalizedJob, inflight: Inflight) {
        let tx = self.sender_for(job.repository_id).await;
        if let Err(mpsc::error::SendError(item)) = tx.send(ShardItem { job, inflight }).await {
            error!(
                repository_id = item.job.repository_id,
                "Reconciler shard closed unexpectedly"
            );
            self.settler.settle(item.inflight, Disposition::Defer);
        }
    }

    /// Close every shard and wait for the final flushes.
    async fn shutdown(&self) {
        let mut tasks = {
            let mut state = self.state.lock().await;
            state.shards.clear();
            std::mem::take(&mut state.tasks)
        };
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "Reconciler shard panicked");
            }
        }
    }
}
