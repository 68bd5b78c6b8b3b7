//! # Pulse Source Consumer
//!
//! One task per configured source. The task owns its AMQP connection and
//! channel, declares the queue and bindings, forwards deliveries to the
//! pipeline and applies the settlements that come back.
//!
//! State machine: `Disconnected → Connecting → Ready → Draining → Closed`.
//! Broker errors return the source to `Disconnected` and reconnect after an
//! exponential backoff; unacknowledged deliveries are redelivered by the
//! broker. Cancelling the shutdown token drains the source: consumption
//! stops, pending settlements are applied and deferred messages are requeued
//! immediately before the channel is closed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use metrics::{counter, gauge};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::time::DelayQueue;
use tokio_util::time::delay_queue::Key;
use tracing::{debug, error, info, instrument, warn};

use super::backoff::ReconnectPolicy;
use super::bindings::{Binding, BindingCatalog, desired_bindings, stale_bindings};
use super::routing;
use crate::config::{PulseConfig, PulseSource};
use crate::pipeline::{AckToken, Delivery, Disposition, RawMessage, Settlement};

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("invalid broker configuration: {0}")]
    Config(String),
    #[error("failed to connect to broker: {0}")]
    Connect(#[source] lapin::Error),
    #[error("exchange '{exchange}' is not available: {source}")]
    ExchangeDeclare {
        exchange: String,
        #[source]
        source: lapin::Error,
    },
    #[error("failed to set up queue '{queue}': {source}")]
    QueueSetup {
        queue: String,
        #[source]
        source: lapin::Error,
    },
    #[error("channel error: {0}")]
    Channel(#[from] lapin::Error),
    #[error("consumer stream ended")]
    StreamClosed,
    #[error("gave up after {attempts} reconnect attempts")]
    ReconnectsExhausted { attempts: u32 },
}

impl ConsumerError {
    /// Errors that end the source instead of triggering a reconnect:
    /// a missing exchange and a broker refusing our credentials.
    pub fn is_fatal(&self) -> bool {
        match self {
            ConsumerError::Config(_) | ConsumerError::ReconnectsExhausted { .. } => true,
            ConsumerError::ExchangeDeclare { source, .. } => is_protocol_error(source),
            ConsumerError::Connect(source) => is_protocol_error(source),
            _ => false,
        }
    }
}

fn is_protocol_error(err: &lapin::Error) -> bool {
    matches!(err, lapin::Error::ProtocolError(_))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Disconnected,
    Connecting,
    Ready,
    Draining,
    Closed,
}

impl SourceState {
    pub const fn as_str(self) -> &'static str {
        match self {
            SourceState::Disconnected => "disconnected",
            SourceState::Connecting => "connecting",
            SourceState::Ready => "ready",
            SourceState::Draining => "draining",
            SourceState::Closed => "closed",
        }
    }

    /// Gauge value for `pulse_source_state`.
    pub const fn gauge_value(self) -> f64 {
        match self {
            SourceState::Disconnected => 0.0,
            SourceState::Connecting => 1.0,
            SourceState::Ready => 2.0,
            SourceState::Draining => 3.0,
            SourceState::Closed => 4.0,
        }
    }
}

/// Accepts deliveries whose `(exchange, routing_key)` is covered by a
/// configured binding of the queue. Anything else arrived through a stale
/// binding that has not been pruned yet.
#[derive(Debug, Clone)]
pub struct RoutingFilter {
    patterns: HashMap<String, Vec<String>>,
}

impl RoutingFilter {
    pub fn new(bindings: &HashSet<Binding>) -> Self {
        let mut patterns: HashMap<String, Vec<String>> = HashMap::new();
        for binding in bindings {
            patterns
                .entry(binding.exchange.clone())
                .or_default()
                .push(binding.routing_key.clone());
        }
        Self { patterns }
    }

    pub fn accepts(&self, exchange: &str, routing_key: &str) -> bool {
        self.patterns
            .get(exchange)
            .is_some_and(|patterns| routing::matches_any(patterns, routing_key))
    }
}

/// A delivery handed to the pipeline and not yet settled.
struct Pending<A> {
    acker: A,
    routing_key: String,
    body: Vec<u8>,
    deferred: Option<Key>,
}

/// Unsettled deliveries of the current channel generation.
struct PendingTable<A> {
    generation: u64,
    entries: HashMap<u64, Pending<A>>,
}

impl<A> PendingTable<A> {
    fn new() -> Self {
        Self {
            generation: 0,
            entries: HashMap::new(),
        }
    }

    /// Forget every delivery of the previous channel and start a new
    /// generation.
    fn reset(&mut self) -> u64 {
        self.generation += 1;
        self.entries.clear();
        self.generation
    }

    fn insert(&mut self, delivery_tag: u64, pending: Pending<A>) {
        self.entries.insert(delivery_tag, pending);
    }

    /// Entry matching `settlement`, unless it belongs to an earlier channel.
    fn get_mut(&mut self, settlement: &Settlement) -> Option<&mut Pending<A>> {
        if settlement.generation != self.generation {
            return None;
        }
        self.entries.get_mut(&settlement.delivery_tag)
    }

    fn remove(&mut self, delivery_tag: u64) -> Option<Pending<A>> {
        self.entries.remove(&delivery_tag)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Settles one delivery on the broker.
#[async_trait]
pub trait DeliveryAcker: Send + Sync + 'static {
    async fn ack(&self) -> Result<(), lapin::Error>;
    async fn nack(&self, requeue: bool) -> Result<(), lapin::Error>;
}

#[async_trait]
impl DeliveryAcker for Acker {
    async fn ack(&self) -> Result<(), lapin::Error> {
        Acker::ack(self, BasicAckOptions::default()).await
    }

    async fn nack(&self, requeue: bool) -> Result<(), lapin::Error> {
        Acker::nack(
            self,
            BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            },
        )
        .await
    }
}

/// A delivery as it comes off the broker.
pub struct Inbound<A> {
    pub exchange: String,
    pub routing_key: String,
    pub delivery_tag: u64,
    pub body: Vec<u8>,
    pub redelivered: bool,
    pub acker: A,
}

impl From<lapin::message::Delivery> for Inbound<Acker> {
    fn from(delivery: lapin::message::Delivery) -> Self {
        Self {
            exchange: delivery.exchange.as_str().to_string(),
            routing_key: delivery.routing_key.as_str().to_string(),
            delivery_tag: delivery.delivery_tag,
            body: delivery.data,
            redelivered: delivery.redelivered,
            acker: delivery.acker,
        }
    }
}

/// One consuming channel: the stream of deliveries plus the few broker
/// operations settlement and shutdown need.
#[async_trait]
pub trait BrokerSession: Send + Sized + 'static {
    type Acker: DeliveryAcker;

    /// Next delivery; `None` once the broker ends the consumer.
    async fn next_delivery(&mut self) -> Option<Result<Inbound<Self::Acker>, lapin::Error>>;

    /// Stop the broker from sending further deliveries.
    async fn cancel(&mut self) -> Result<(), lapin::Error>;

    async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), lapin::Error>;

    async fn close(self) -> Result<(), lapin::Error>;
}

/// Opens consuming sessions for one source.
#[async_trait]
pub trait Broker: Send + Sync {
    type Session: BrokerSession;

    async fn open(&self) -> Result<Self::Session, ConsumerError>;
}

type AckerOf<B> = <<B as Broker>::Session as BrokerSession>::Acker;

/// lapin session of one consumer generation.
pub struct LapinSession {
    connection: Connection,
    channel: Channel,
    consumer: lapin::Consumer,
    consumer_tag: String,
}

#[async_trait]
impl BrokerSession for LapinSession {
    type Acker = Acker;

    async fn next_delivery(&mut self) -> Option<Result<Inbound<Acker>, lapin::Error>> {
        self.consumer
            .next()
            .await
            .map(|next| next.map(Inbound::from))
    }

    async fn cancel(&mut self) -> Result<(), lapin::Error> {
        self.channel
            .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
            .await
    }

    async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), lapin::Error> {
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_delivery_mode(2),
            )
            .await
            .map(|_confirm| ())
    }

    async fn close(self) -> Result<(), lapin::Error> {
        self.channel.close(200, "shutdown").await?;
        self.connection.close(200, "shutdown").await
    }
}

/// Connects to Pulse, declares the source's queue and bindings and starts
/// consuming.
pub struct LapinBroker {
    config: Arc<PulseConfig>,
    source: PulseSource,
    queue: String,
    desired: HashSet<Binding>,
    bindings: Arc<dyn BindingCatalog>,
}

impl LapinBroker {
    pub fn new(
        config: Arc<PulseConfig>,
        source: PulseSource,
        bindings: Arc<dyn BindingCatalog>,
    ) -> Self {
        let queue = config.queue_name(&source);
        let desired = desired_bindings(&config, &queue);
        Self {
            config,
            source,
            queue,
            desired,
            bindings,
        }
    }

    /// Remove bindings the configuration no longer asks for. Best effort.
    async fn prune_bindings(&self, channel: &Channel) {
        let existing = match self.bindings.list_bindings(&self.queue).await {
            Ok(existing) => existing,
            Err(err) => {
                warn!(error = %err, "Could not list queue bindings; skipping prune");
                return;
            }
        };

        for stale in stale_bindings(&existing, &self.desired) {
            match channel
                .queue_unbind(
                    &self.queue,
                    &stale.exchange,
                    &stale.routing_key,
                    FieldTable::default(),
                )
                .await
            {
                Ok(()) => info!(
                    exchange = %stale.exchange,
                    routing_key = %stale.routing_key,
                    "Removed stale binding"
                ),
                Err(err) => warn!(
                    exchange = %stale.exchange,
                    routing_key = %stale.routing_key,
                    error = %err,
                    "Failed to remove stale binding"
                ),
            }
        }
    }
}

#[async_trait]
impl Broker for LapinBroker {
    type Session = LapinSession;

    async fn open(&self) -> Result<LapinSession, ConsumerError> {
        let uri = self
            .config
            .connection_uri()
            .map_err(|err| ConsumerError::Config(err.to_string()))?;
        let connection = Connection::connect(&uri, ConnectionProperties::default())
            .await
            .map_err(ConsumerError::Connect)?;
        let channel = connection.create_channel().await?;

        channel
            .exchange_declare(
                &self.source.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    passive: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|source| ConsumerError::ExchangeDeclare {
                exchange: self.source.exchange.clone(),
                source,
            })?;

        let queue_err = |source| ConsumerError::QueueSetup {
            queue: self.queue.clone(),
            source,
        };
        channel
            .queue_declare(
                &self.queue,
                QueueDeclareOptions {
                    durable: self.source.durable,
                    exclusive: false,
                    auto_delete: !self.source.durable,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(queue_err)?;

        for routing_key in &self.source.routing_keys {
            channel
                .queue_bind(
                    &self.queue,
                    &self.source.exchange,
                    routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(queue_err)?;
            debug!(exchange = %self.source.exchange, routing_key = %routing_key, "Bound queue");
        }

        self.prune_bindings(&channel).await;

        channel
            .basic_qos(prefetch_count(self.config.prefetch), BasicQosOptions::default())
            .await?;

        let consumer_tag = format!("treeherder-ingest-{}", self.source.app_label);
        let consumer = channel
            .basic_consume(
                &self.queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(LapinSession {
            connection,
            channel,
            consumer,
            consumer_tag,
        })
    }
}

pub struct SourceConsumer<B = LapinBroker> {
    label: Arc<str>,
    queue: String,
    broker: B,
    filter: RoutingFilter,
    policy: ReconnectPolicy,
    defer_backoff: Duration,
    dead_letter_exchange: Option<String>,
    pipeline: Option<mpsc::Sender<Delivery>>,
    settle_tx: mpsc::UnboundedSender<Settlement>,
    settle_rx: mpsc::UnboundedReceiver<Settlement>,
    shutdown: CancellationToken,
    state: SourceState,
}

impl SourceConsumer<LapinBroker> {
    pub fn new(
        config: Arc<PulseConfig>,
        source: PulseSource,
        bindings: Arc<dyn BindingCatalog>,
        defer_backoff: Duration,
        pipeline: mpsc::Sender<Delivery>,
        shutdown: CancellationToken,
    ) -> Self {
        let broker = LapinBroker::new(config.clone(), source.clone(), bindings);
        Self::with_broker(broker, &config, &source, defer_backoff, pipeline, shutdown)
    }
}

impl<B: Broker> SourceConsumer<B> {
    pub fn with_broker(
        broker: B,
        config: &PulseConfig,
        source: &PulseSource,
        defer_backoff: Duration,
        pipeline: mpsc::Sender<Delivery>,
        shutdown: CancellationToken,
    ) -> Self {
        let queue = config.queue_name(source);
        let filter = RoutingFilter::new(&desired_bindings(config, &queue));
        let (settle_tx, settle_rx) = mpsc::unbounded_channel();
        Self {
            label: Arc::from(format!("{}:{}", source.app_label, source.exchange)),
            queue,
            broker,
            filter,
            policy: ReconnectPolicy::from_config(config),
            defer_backoff,
            dead_letter_exchange: config.dead_letter_exchange.clone(),
            pipeline: Some(pipeline),
            settle_tx,
            settle_rx,
            shutdown,
            state: SourceState::Disconnected,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> SourceState {
        self.state
    }

    fn set_state(&mut self, state: SourceState) {
        if self.state != state {
            debug!(
                source = %self.label,
                from = self.state.as_str(),
                to = state.as_str(),
                "Source state change"
            );
        }
        self.state = state;
        gauge!("pulse_source_state", "source" => self.label.to_string()).set(state.gauge_value());
    }

    /// Consume until shutdown or a fatal error. The source is `Closed` when
    /// this returns.
    #[instrument(skip_all, fields(source = %self.label, queue = %self.queue))]
    pub async fn run(&mut self) -> Result<(), ConsumerError> {
        let mut pending: PendingTable<AckerOf<B>> = PendingTable::new();
        let mut failures: u32 = 0;

        let outcome = loop {
            if self.shutdown.is_cancelled() {
                break Ok(());
            }

            self.set_state(SourceState::Connecting);
            let result = match self.broker.open().await {
                Ok(session) => {
                    failures = 0;
                    let generation = pending.reset();
                    self.set_state(SourceState::Ready);
                    info!(generation, "Consuming");
                    self.consume(session, &mut pending, generation).await
                }
                Err(err) => Err(err),
            };

            match result {
                Ok(()) => break Ok(()),
                Err(err) if err.is_fatal() => {
                    error!(error = %err, "Source stopped");
                    break Err(err);
                }
                Err(err) => warn!(error = %err, "Broker session failed"),
            }

            self.set_state(SourceState::Disconnected);
            failures += 1;
            if self.policy.exhausted(failures) {
                let err = ConsumerError::ReconnectsExhausted { attempts: failures };
                error!(error = %err, "Source stopped");
                break Err(err);
            }

            let delay = self.policy.delay(failures - 1);
            counter!("pulse_reconnects_total", "source" => self.label.to_string()).increment(1);
            info!(attempt = failures, delay_ms = delay.as_millis() as u64, "Reconnecting");
            tokio::select! {
                _ = self.shutdown.cancelled() => break Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        };

        self.pipeline = None;
        self.set_state(SourceState::Closed);
        outcome
    }

    async fn consume(
        &mut self,
        mut session: B::Session,
        pending: &mut PendingTable<AckerOf<B>>,
        generation: u64,
    ) -> Result<(), ConsumerError> {
        let mut deferred: DelayQueue<u64> = DelayQueue::new();
        let mut draining = false;

        loop {
            if draining && pending.is_empty() {
                break;
            }

            tokio::select! {
                _ = self.shutdown.cancelled(), if !draining => {
                    draining = true;
                    self.begin_drain(&mut session, pending, &mut deferred).await?;
                }
                next = session.next_delivery(), if !draining => match next {
                    Some(Ok(inbound)) => self.on_delivery(inbound, pending, generation).await?,
                    Some(Err(err)) => return Err(ConsumerError::Channel(err)),
                    None => return Err(ConsumerError::StreamClosed),
                },
                Some(settlement) = self.settle_rx.recv() => {
                    self.apply(&mut session, settlement, pending, &mut deferred, draining).await?;
                }
                Some(expired) = deferred.next(), if !deferred.is_empty() => {
                    let tag = expired.into_inner();
                    if let Some(entry) = pending.remove(tag) {
                        entry.acker.nack(true).await?;
                        debug!(delivery_tag = tag, "Requeued deferred message");
                    }
                }
            }
        }

        info!("Drained; closing channel");
        session.close().await?;
        Ok(())
    }

    async fn begin_drain(
        &mut self,
        session: &mut B::Session,
        pending: &mut PendingTable<AckerOf<B>>,
        deferred: &mut DelayQueue<u64>,
    ) -> Result<(), ConsumerError> {
        self.set_state(SourceState::Draining);
        info!(in_flight = pending.len(), "Draining source");
        session.cancel().await?;
        self.pipeline = None;

        let waiting: Vec<(u64, Key)> = pending
            .entries
            .iter()
            .filter_map(|(tag, entry)| entry.deferred.map(|key| (*tag, key)))
            .collect();
        for (tag, key) in waiting {
            deferred.remove(&key);
            if let Some(entry) = pending.remove(tag) {
                entry.acker.nack(true).await?;
            }
        }
        Ok(())
    }

    async fn on_delivery(
        &mut self,
        inbound: Inbound<AckerOf<B>>,
        pending: &mut PendingTable<AckerOf<B>>,
        generation: u64,
    ) -> Result<(), ConsumerError> {
        let Inbound {
            exchange,
            routing_key,
            delivery_tag,
            body,
            redelivered,
            acker,
        } = inbound;

        if !self.filter.accepts(&exchange, &routing_key) {
            debug!(
                delivery_tag,
                exchange = %exchange,
                routing_key = %routing_key,
                "Discarding message from unconfigured binding"
            );
            counter!("pulse_messages_dropped_total", "reason" => "routing_key").increment(1);
            acker.ack().await?;
            return Ok(());
        }

        let Some(pipeline) = self.pipeline.clone() else {
            acker.nack(true).await?;
            return Ok(());
        };

        pending.insert(
            delivery_tag,
            Pending {
                acker,
                routing_key: routing_key.clone(),
                body: body.clone(),
                deferred: None,
            },
        );

        let message = RawMessage {
            exchange,
            routing_key,
            body,
            delivery_tag,
            redelivered,
        };
        let token = AckToken::new(
            self.label.clone(),
            delivery_tag,
            generation,
            self.settle_tx.clone(),
        );

        if pipeline.send(Delivery { message, token }).await.is_err() {
            warn!(delivery_tag, "Pipeline closed; requeueing");
            if let Some(entry) = pending.remove(delivery_tag) {
                entry.acker.nack(true).await?;
            }
        }
        Ok(())
    }

    async fn apply(
        &mut self,
        session: &mut B::Session,
        settlement: Settlement,
        pending: &mut PendingTable<AckerOf<B>>,
        deferred: &mut DelayQueue<u64>,
        draining: bool,
    ) -> Result<(), ConsumerError> {
        let tag = settlement.delivery_tag;
        let Some(entry) = pending.get_mut(&settlement) else {
            debug!(
                delivery_tag = tag,
                generation = settlement.generation,
                "Ignoring settlement for a delivery of an earlier channel"
            );
            return Ok(());
        };

        match settlement.disposition {
            Disposition::Defer if !draining => {
                entry.deferred = Some(deferred.insert(tag, self.defer_backoff));
            }
            Disposition::Defer => {
                if let Some(entry) = pending.remove(tag) {
                    entry.acker.nack(true).await?;
                }
            }
            Disposition::Ack | Disposition::Drop => {
                if let Some(entry) = pending.remove(tag) {
                    entry.acker.ack().await?;
                }
            }
            Disposition::Dead => {
                if let Some(entry) = pending.remove(tag) {
                    dead_letter(session, self.dead_letter_exchange.as_deref(), &entry).await;
                    entry.acker.nack(false).await?;
                }
            }
        }
        Ok(())
    }
}

/// Publish a dead message to the dead-letter exchange, when one is
/// configured. Failures are logged; the message is rejected either way.
async fn dead_letter<S: BrokerSession>(
    session: &mut S,
    exchange: Option<&str>,
    entry: &Pending<S::Acker>,
) {
    let Some(exchange) = exchange else {
        return;
    };
    match session
        .publish(exchange, &entry.routing_key, &entry.body)
        .await
    {
        Ok(()) => debug!(exchange, routing_key = %entry.routing_key, "Published dead letter"),
        Err(err) => warn!(exchange, error = %err, "Failed to publish dead letter"),
    }
}

fn prefetch_count(prefetch: u32) -> u16 {
    u16::try_from(prefetch).unwrap_or(u16::MAX)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::task::JoinHandle;

    use super::*;

    const JOBS: &str = "exchange/taskcluster-treeherder/v1/jobs";
    const DEAD: &str = "exchange/treeherder/dead";

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Ack { session: u32, tag: u64 },
        Nack { session: u32, tag: u64, requeue: bool },
        Publish { exchange: String, routing_key: String },
        Cancel,
        Close { session: u32 },
    }

    type CallLog = Arc<Mutex<Vec<Call>>>;

    struct RecordingAcker {
        session: u32,
        tag: u64,
        log: CallLog,
    }

    #[async_trait]
    impl DeliveryAcker for RecordingAcker {
        async fn ack(&self) -> Result<(), lapin::Error> {
            self.log.lock().unwrap().push(Call::Ack {
                session: self.session,
                tag: self.tag,
            });
            Ok(())
        }

        async fn nack(&self, requeue: bool) -> Result<(), lapin::Error> {
            self.log.lock().unwrap().push(Call::Nack {
                session: self.session,
                tag: self.tag,
                requeue,
            });
            Ok(())
        }
    }

    struct FakeSession {
        id: u32,
        deliveries: mpsc::UnboundedReceiver<(u64, String)>,
        log: CallLog,
    }

    #[async_trait]
    impl BrokerSession for FakeSession {
        type Acker = RecordingAcker;

        async fn next_delivery(&mut self) -> Option<Result<Inbound<RecordingAcker>, lapin::Error>> {
            let (tag, routing_key) = self.deliveries.recv().await?;
            Some(Ok(Inbound {
                exchange: JOBS.to_string(),
                routing_key,
                delivery_tag: tag,
                body: format!("{{\"tag\":{tag}}}").into_bytes(),
                redelivered: false,
                acker: RecordingAcker {
                    session: self.id,
                    tag,
                    log: self.log.clone(),
                },
            }))
        }

        async fn cancel(&mut self) -> Result<(), lapin::Error> {
            self.log.lock().unwrap().push(Call::Cancel);
            Ok(())
        }

        async fn publish(
            &mut self,
            exchange: &str,
            routing_key: &str,
            _body: &[u8],
        ) -> Result<(), lapin::Error> {
            self.log.lock().unwrap().push(Call::Publish {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            });
            Ok(())
        }

        async fn close(self) -> Result<(), lapin::Error> {
            self.log.lock().unwrap().push(Call::Close { session: self.id });
            Ok(())
        }
    }

    /// Hands out queued sessions; once they run out every attempt fails with
    /// a retryable connection error.
    struct FakeBroker {
        sessions: Mutex<VecDeque<Result<FakeSession, ConsumerError>>>,
        opened: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Broker for FakeBroker {
        type Session = FakeSession;

        async fn open(&self) -> Result<FakeSession, ConsumerError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            self.sessions
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(ConsumerError::Connect(lapin::Error::ChannelsLimitReached)))
        }
    }

    fn jobs_source() -> PulseSource {
        PulseSource {
            exchange: JOBS.to_string(),
            routing_keys: vec!["#.autoland.#".to_string()],
            app_label: "jobs".to_string(),
            durable: true,
        }
    }

    fn pulse_config() -> PulseConfig {
        PulseConfig {
            user: "th".to_string(),
            sources: vec![jobs_source()],
            dead_letter_exchange: Some(DEAD.to_string()),
            reconnect_backoff_initial_ms: 1,
            reconnect_backoff_cap_ms: 2,
            reconnect_max_attempts: 3,
            ..PulseConfig::default()
        }
    }

    fn autoland(tag: u64) -> (u64, String) {
        (tag, format!("tc-treeherder.v2.autoland.rev{tag}"))
    }

    struct Harness {
        feeds: Vec<mpsc::UnboundedSender<(u64, String)>>,
        pipeline_rx: mpsc::Receiver<Delivery>,
        log: CallLog,
        opened: Arc<AtomicU32>,
        shutdown: CancellationToken,
        handle: JoinHandle<(Result<(), ConsumerError>, SourceState)>,
    }

    impl Harness {
        fn start(sessions: u32, defer_backoff: Duration) -> Self {
            let mut queued = VecDeque::new();
            let mut feeds = Vec::new();
            let log = CallLog::default();
            for id in 1..=sessions {
                let (tx, rx) = mpsc::unbounded_channel();
                feeds.push(tx);
                queued.push_back(Ok(FakeSession {
                    id,
                    deliveries: rx,
                    log: log.clone(),
                }));
            }
            Self::with_sessions(queued, feeds, log, defer_backoff)
        }

        fn with_sessions(
            sessions: VecDeque<Result<FakeSession, ConsumerError>>,
            feeds: Vec<mpsc::UnboundedSender<(u64, String)>>,
            log: CallLog,
            defer_backoff: Duration,
        ) -> Self {
            let opened = Arc::new(AtomicU32::new(0));
            let broker = FakeBroker {
                sessions: Mutex::new(sessions),
                opened: opened.clone(),
            };
            let (pipeline_tx, pipeline_rx) = mpsc::channel(16);
            let shutdown = CancellationToken::new();
            let mut consumer = SourceConsumer::with_broker(
                broker,
                &pulse_config(),
                &jobs_source(),
                defer_backoff,
                pipeline_tx,
                shutdown.clone(),
            );
            let handle = tokio::spawn(async move {
                let result = consumer.run().await;
                (result, consumer.state())
            });
            Self {
                feeds,
                pipeline_rx,
                log,
                opened,
                shutdown,
                handle,
            }
        }

        fn deliver(&self, session: usize, delivery: (u64, String)) {
            self.feeds[session].send(delivery).unwrap();
        }

        async fn forwarded(&mut self) -> Delivery {
            tokio::time::timeout(Duration::from_secs(5), self.pipeline_rx.recv())
                .await
                .expect("delivery forwarded in time")
                .expect("pipeline open")
        }

        fn calls(&self) -> Vec<Call> {
            self.log.lock().unwrap().clone()
        }

        async fn wait_for(&self, call: Call) {
            tokio::time::timeout(Duration::from_secs(5), async {
                while !self.calls().contains(&call) {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
            })
            .await
            .unwrap_or_else(|_| panic!("{call:?} not recorded; saw {:?}", self.calls()));
        }

        async fn finish(self) -> (Result<(), ConsumerError>, SourceState, Vec<Call>) {
            self.shutdown.cancel();
            let (result, state) = tokio::time::timeout(Duration::from_secs(5), self.handle)
                .await
                .expect("source closes in time")
                .unwrap();
            let calls = self.log.lock().unwrap().clone();
            (result, state, calls)
        }
    }

    fn settlement(tag: u64, generation: u64) -> Settlement {
        Settlement {
            delivery_tag: tag,
            generation,
            disposition: Disposition::Ack,
        }
    }

    fn pending_entry() -> Pending<()> {
        Pending {
            acker: (),
            routing_key: "route".into(),
            body: b"{}".to_vec(),
            deferred: None,
        }
    }

    #[test]
    fn settlements_from_old_generations_are_ignored() {
        let mut table = PendingTable::new();
        let first = table.reset();
        table.insert(7, pending_entry());
        assert!(table.get_mut(&settlement(7, first)).is_some());

        let second = table.reset();
        assert_ne!(first, second);
        assert!(table.is_empty());

        table.insert(7, pending_entry());
        assert!(table.get_mut(&settlement(7, first)).is_none());
        assert!(table.get_mut(&settlement(7, second)).is_some());
        assert!(table.remove(7).is_some());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn routing_filter_matches_exchange_and_pattern() {
        let bindings = HashSet::from([
            Binding::new("exchange/taskcluster-treeherder/v1/jobs", "#.autoland.#"),
            Binding::new("exchange/taskcluster-treeherder/v1/jobs", "*.try"),
            Binding::new("exchange/github/v1/push", "#"),
        ]);
        let filter = RoutingFilter::new(&bindings);

        assert!(filter.accepts(
            "exchange/taskcluster-treeherder/v1/jobs",
            "tc-treeherder.v2.autoland.abc"
        ));
        assert!(filter.accepts("exchange/taskcluster-treeherder/v1/jobs", "primary.try"));
        assert!(!filter.accepts("exchange/taskcluster-treeherder/v1/jobs", "a.b.try"));
        assert!(filter.accepts("exchange/github/v1/push", "anything.at.all"));
        assert!(!filter.accepts("exchange/other", "tc-treeherder.v2.autoland.abc"));
    }

    #[test]
    fn fatal_errors_end_the_source() {
        assert!(ConsumerError::Config("bad uri".into()).is_fatal());
        assert!(ConsumerError::ReconnectsExhausted { attempts: 3 }.is_fatal());
        assert!(!ConsumerError::StreamClosed.is_fatal());
        assert!(!ConsumerError::Connect(lapin::Error::ChannelsLimitReached).is_fatal());
    }

    #[test]
    fn state_gauge_values_are_ordered() {
        let states = [
            SourceState::Disconnected,
            SourceState::Connecting,
            SourceState::Ready,
            SourceState::Draining,
            SourceState::Closed,
        ];
        assert!(states
            .windows(2)
            .all(|pair| pair[0].gauge_value() < pair[1].gauge_value()));
        assert_eq!(SourceState::Draining.as_str(), "draining");
    }

    #[tokio::test]
    async fn ack_and_drop_both_acknowledge() {
        let mut harness = Harness::start(1, Duration::from_secs(60));
        harness.deliver(0, autoland(1));
        harness.deliver(0, autoland(2));

        let first = harness.forwarded().await;
        let second = harness.forwarded().await;
        assert_eq!(first.message.delivery_tag, 1);
        assert_eq!(first.message.exchange, JOBS);
        first.token.settle(Disposition::Ack);
        second.token.settle(Disposition::Drop);
        harness.wait_for(Call::Ack { session: 1, tag: 1 }).await;
        harness.wait_for(Call::Ack { session: 1, tag: 2 }).await;

        let (result, state, calls) = harness.finish().await;
        assert!(result.is_ok());
        assert_eq!(state, SourceState::Closed);
        assert_eq!(calls.last(), Some(&Call::Close { session: 1 }));
        assert!(!calls.iter().any(|call| matches!(call, Call::Nack { .. })));
    }

    #[tokio::test]
    async fn deferred_delivery_is_requeued_after_backoff() {
        let mut harness = Harness::start(1, Duration::from_millis(30));
        harness.deliver(0, autoland(1));

        harness.forwarded().await.token.settle(Disposition::Defer);
        harness
            .wait_for(Call::Nack {
                session: 1,
                tag: 1,
                requeue: true,
            })
            .await;

        let (result, _, calls) = harness.finish().await;
        assert!(result.is_ok());
        assert!(!calls.contains(&Call::Ack { session: 1, tag: 1 }));
    }

    #[tokio::test]
    async fn dead_delivery_is_published_then_rejected() {
        let mut harness = Harness::start(1, Duration::from_secs(60));
        harness.deliver(0, autoland(4));

        harness.forwarded().await.token.settle(Disposition::Dead);
        let rejected = Call::Nack {
            session: 1,
            tag: 4,
            requeue: false,
        };
        harness.wait_for(rejected.clone()).await;

        let calls = harness.calls();
        let published = Call::Publish {
            exchange: DEAD.to_string(),
            routing_key: "tc-treeherder.v2.autoland.rev4".to_string(),
        };
        let publish_at = calls.iter().position(|call| *call == published);
        let reject_at = calls.iter().position(|call| *call == rejected);
        assert!(publish_at.is_some());
        assert!(publish_at < reject_at);
        assert!(harness.finish().await.0.is_ok());
    }

    #[tokio::test]
    async fn unconfigured_routing_key_is_acked_without_forwarding() {
        let mut harness = Harness::start(1, Duration::from_secs(60));
        harness.deliver(0, (9, "tc-treeherder.v2.try.rev9".to_string()));
        harness.deliver(0, autoland(10));

        let forwarded = harness.forwarded().await;
        assert_eq!(forwarded.message.delivery_tag, 10);
        harness.wait_for(Call::Ack { session: 1, tag: 9 }).await;
        forwarded.token.settle(Disposition::Ack);

        assert!(harness.finish().await.0.is_ok());
    }

    #[tokio::test]
    async fn shutdown_requeues_deferred_and_waits_for_in_flight() {
        let mut harness = Harness::start(1, Duration::from_secs(60));
        harness.deliver(0, autoland(1));
        harness.deliver(0, autoland(2));
        let deferred = harness.forwarded().await;
        let in_flight = harness.forwarded().await;
        deferred.token.settle(Disposition::Defer);

        harness.shutdown.cancel();
        harness.wait_for(Call::Cancel).await;
        harness
            .wait_for(Call::Nack {
                session: 1,
                tag: 1,
                requeue: true,
            })
            .await;
        // Still draining: the second delivery has not been settled.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!harness.handle.is_finished());
        assert!(!harness.calls().contains(&Call::Close { session: 1 }));
        assert!(harness.pipeline_rx.recv().await.is_none());

        in_flight.token.settle(Disposition::Ack);
        let (result, state, calls) = harness.finish().await;
        assert!(result.is_ok());
        assert_eq!(state, SourceState::Closed);
        assert_eq!(
            &calls[calls.len() - 2..],
            &[Call::Ack { session: 1, tag: 2 }, Call::Close { session: 1 }]
        );
    }

    #[tokio::test]
    async fn reconnect_discards_settlements_of_the_old_channel() {
        let mut harness = Harness::start(2, Duration::from_secs(60));
        harness.deliver(0, autoland(1));
        let stale = harness.forwarded().await;

        // The broker ends the first consumer; the source reconnects.
        harness.feeds.remove(0);
        tokio::time::timeout(Duration::from_secs(5), async {
            while harness.opened.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("reconnected");

        harness.deliver(0, autoland(1));
        let redelivered = harness.forwarded().await;
        stale.token.settle(Disposition::Ack);
        redelivered.token.settle(Disposition::Ack);
        harness.wait_for(Call::Ack { session: 2, tag: 1 }).await;

        let (result, state, calls) = harness.finish().await;
        assert!(result.is_ok());
        assert_eq!(state, SourceState::Closed);
        assert!(!calls.contains(&Call::Ack { session: 1, tag: 1 }));
        assert!(!calls.contains(&Call::Close { session: 1 }));
    }

    #[tokio::test]
    async fn source_gives_up_after_repeated_connect_failures() {
        let harness =
            Harness::with_sessions(VecDeque::new(), Vec::new(), CallLog::default(), Duration::ZERO);

        let (result, state) = tokio::time::timeout(Duration::from_secs(5), harness.handle)
            .await
            .expect("source stops in time")
            .unwrap();

        assert!(matches!(
            result,
            Err(ConsumerError::ReconnectsExhausted { attempts: 3 })
        ));
        assert_eq!(state, SourceState::Closed);
        assert_eq!(harness.opened.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_connect_error_stops_without_retry() {
        let harness = Harness::with_sessions(
            VecDeque::from([Err(ConsumerError::Config("bad uri".into()))]),
            Vec::new(),
            CallLog::default(),
            Duration::ZERO,
        );

        let (result, state) = tokio::time::timeout(Duration::from_secs(5), harness.handle)
            .await
            .expect("source stops in time")
            .unwrap();

        assert!(matches!(result, Err(ConsumerError::Config(_))));
        assert_eq!(state, SourceState::Closed);
        assert_eq!(harness.opened.load(Ordering::SeqCst), 1);
    }
}
