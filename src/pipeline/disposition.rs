//! Values exchanged between the consumers and the pipeline.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

/// Final outcome of a delivery, applied by the consumer that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disposition {
    /// Processed (or deliberately ignored); remove from the queue.
    Ack,
    /// Malformed; discard without requeue.
    Drop,
    /// Temporarily unprocessable; requeue after a backoff.
    Defer,
    /// Give up; reject without requeue, optionally dead-lettering.
    Dead,
}

impl Disposition {
    pub const fn as_str(self) -> &'static str {
        match self {
            Disposition::Ack => "ack",
            Disposition::Drop => "drop",
            Disposition::Defer => "defer",
            Disposition::Dead => "dead",
        }
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message as received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub delivery_tag: u64,
    pub redelivered: bool,
}

/// Settlement request routed back to the consumer owning the delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settlement {
    pub delivery_tag: u64,
    /// Channel generation the tag belongs to; tags from an earlier channel
    /// are meaningless after a reconnect.
    pub generation: u64,
    pub disposition: Disposition,
}

/// Handle used to settle exactly one delivery. Consumed on use.
#[derive(Debug)]
pub struct AckToken {
    source: Arc<str>,
    delivery_tag: u64,
    generation: u64,
    settle_tx: mpsc::UnboundedSender<Settlement>,
}

impl AckToken {
    pub fn new(
        source: Arc<str>,
        delivery_tag: u64,
        generation: u64,
        settle_tx: mpsc::UnboundedSender<Settlement>,
    ) -> Self {
        Self {
            source,
            delivery_tag,
            generation,
            settle_tx,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    pub fn settle(self, disposition: Disposition) {
        let settlement = Settlement {
            delivery_tag: self.delivery_tag,
            generation: self.generation,
            disposition,
        };
        if self.settle_tx.send(settlement).is_err() {
            // The broker redelivers once the channel is gone.
            debug!(
                source = %self.source,
                delivery_tag = self.delivery_tag,
                "Consumer gone; settlement discarded"
            );
        }
    }
}

/// A delivery handed from a consumer to the pipeline.
#[derive(Debug)]
pub struct Delivery {
    pub message: RawMessage,
    pub token: AckToken,
}
