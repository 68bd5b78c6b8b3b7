//! # Treeherder Pulse Ingestion Entry Point

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use sea_orm_migration::MigratorTrait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use treeherder_ingest::config::ConfigLoader;
use treeherder_ingest::migration::Migrator;
use treeherder_ingest::normalization::Transformer;
use treeherder_ingest::pipeline::{Pipeline, PipelineContext, Settler};
use treeherder_ingest::pulse::{ManagementApi, PulseConsumer};
use treeherder_ingest::refdata::{MilestoneFetcher, ProjectCatalog, ReferenceResolver};
use treeherder_ingest::repositories::SeaOrmJobStore;
use treeherder_ingest::store::JobStore;
use treeherder_ingest::validation::Validator;
use treeherder_ingest::{db, telemetry};

/// Depth of the channel between the consumers and the pipeline dispatcher.
const DELIVERY_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Parser)]
#[command(name = "treeherder-ingest", about = "Ingest CI job events from Pulse")]
struct Cli {
    /// Apply pending schema migrations before consuming.
    #[arg(long)]
    run_migrations: bool,

    /// Validate the configuration, print it with secrets masked, and exit.
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::new()
        .load()
        .context("loading configuration")?;

    if cli.check_config {
        println!("{}", config.redacted_json()?);
        return Ok(());
    }

    telemetry::init_tracing(&config)?;
    info!(profile = %config.profile, "Starting Pulse ingestion");

    let db = Arc::new(
        db::init_pool(&config)
            .await
            .context("initializing database connection pool")?,
    );
    if cli.run_migrations {
        Migrator::up(db.as_ref(), None)
            .await
            .context("running migrations")?;
        info!("Migrations applied");
    }
    db::health_check(&db).await?;

    let store: Arc<dyn JobStore> = Arc::new(SeaOrmJobStore::new(db.clone()));
    let pipeline_config = config.pipeline.clone();

    let catalog = Arc::new(ProjectCatalog::new(
        store.clone(),
        Duration::from_secs(pipeline_config.project_reload_seconds),
    ));
    let projects = catalog.reload().await.context("loading repositories")?;
    if projects == 0 {
        warn!("No repositories configured; every job will be deferred");
    }

    let resolver = Arc::new(ReferenceResolver::new(
        store.clone(),
        Duration::from_millis(pipeline_config.resolver_timeout_ms),
    ));
    let context = PipelineContext {
        validator: Arc::new(Validator::new(catalog.clone())?),
        catalog: catalog.clone(),
        transformer: Arc::new(Transformer::new(resolver)),
        store: store.clone(),
        settler: Arc::new(Settler::new(pipeline_config.max_defers)),
    };

    let shutdown = CancellationToken::new();

    let milestones = tokio::spawn(MilestoneFetcher::new(store.clone()).run(
        catalog.clone(),
        Duration::from_secs(pipeline_config.milestone_refresh_seconds),
        shutdown.clone(),
    ));

    let (delivery_tx, delivery_rx) = mpsc::channel(DELIVERY_CHANNEL_CAPACITY);
    let pipeline = tokio::spawn(
        Pipeline::new(context, pipeline_config.clone(), shutdown.clone()).run(delivery_rx),
    );

    let pulse_config = Arc::new(config.pulse.clone());
    let bindings = Arc::new(ManagementApi::from_config(&pulse_config)?);
    let mut consumers = PulseConsumer::new(
        pulse_config.clone(),
        bindings,
        Duration::from_millis(pipeline_config.defer_backoff_ms),
    );
    consumers.start(&shutdown, &pulse_config.sources, delivery_tx);

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(err) => error!(error = %err, "Failed to listen for shutdown signal"),
        }
        signal_token.cancel();
    });

    let failed_sources = consumers.wait().await;
    // Consumers may all end on their own (fatal errors); stop the rest too.
    shutdown.cancel();

    if let Err(err) = pipeline.await {
        error!(error = %err, "Pipeline task failed");
    }
    if let Err(err) = milestones.await {
        error!(error = %err, "Milestone task failed");
    }

    info!(failed_sources, "Pulse ingestion stopped");
    if failed_sources > 0 {
        anyhow::bail!("{failed_sources} source(s) stopped with errors");
    }
    Ok(())
}
