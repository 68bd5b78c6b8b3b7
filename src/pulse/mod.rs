//! # Pulse
//!
//! AMQP consumption from the Pulse message bus: one [`SourceConsumer`] task
//! per configured exchange, all feeding the same pipeline.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{PulseConfig, PulseSource};
use crate::pipeline::Delivery;

pub mod backoff;
pub mod bindings;
pub mod consumer;
pub mod routing;

pub use backoff::ReconnectPolicy;
pub use bindings::{Binding, BindingCatalog, ManagementApi};
pub use consumer::{
    Broker, BrokerSession, ConsumerError, DeliveryAcker, Inbound, LapinBroker, SourceConsumer,
    SourceState,
};

/// Supervisor for the per-source consumer tasks.
pub struct PulseConsumer {
    config: Arc<PulseConfig>,
    bindings: Arc<dyn BindingCatalog>,
    defer_backoff: Duration,
    shutdown: CancellationToken,
    tasks: JoinSet<(String, Result<(), ConsumerError>)>,
}

impl PulseConsumer {
    pub fn new(
        config: Arc<PulseConfig>,
        bindings: Arc<dyn BindingCatalog>,
        defer_backoff: Duration,
    ) -> Self {
        Self {
            config,
            bindings,
            defer_backoff,
            shutdown: CancellationToken::new(),
            tasks: JoinSet::new(),
        }
    }

    /// Begin consuming `sources`, forwarding deliveries to `pipeline`.
    /// Consumption stops when `ctx` or [`PulseConsumer::stop`] fires. The
    /// pipeline sees its input close once every source has drained.
    pub fn start(
        &mut self,
        ctx: &CancellationToken,
        sources: &[PulseSource],
        pipeline: mpsc::Sender<Delivery>,
    ) {
        self.shutdown = ctx.child_token();

        for source in sources {
            let mut consumer = SourceConsumer::new(
                self.config.clone(),
                source.clone(),
                self.bindings.clone(),
                self.defer_backoff,
                pipeline.clone(),
                self.shutdown.clone(),
            );
            let label = consumer.label().to_string();
            info!(source = %label, "Starting source consumer");
            self.tasks.spawn(async move {
                let result = consumer.run().await;
                (label, result)
            });
        }
    }

    /// Graceful shutdown: every source stops receiving, settles its in-flight
    /// deliveries and closes its channel.
    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        self.wait().await;
    }

    /// Wait for every source task to finish, returning how many ended with
    /// an error.
    pub async fn wait(&mut self) -> usize {
        let mut failed = 0;
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((source, Err(err))) => {
                    failed += 1;
                    error!(source = %source, error = %err, "Source consumer ended with error");
                }
                Err(err) => {
                    failed += 1;
                    error!(error = %err, "Source consumer task panicked");
                }
            }
        }
        failed
    }
}
