//! Settlement of deliveries and the defer ledger.
//!
//! The broker does not count requeues, so the number of times a message body
//! has been deferred is tracked here. Once a body exceeds `max_defers` its
//! next defer is turned into a dead letter.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use metrics::counter;
use sha1::{Digest, Sha1};
use tracing::warn;

use super::disposition::{AckToken, Disposition};

/// Bodies tracked by the ledger before the least recently deferred is evicted.
const LEDGER_CAPACITY: usize = 65_536;

pub type BodyDigest = [u8; 20];

pub fn body_digest(body: &[u8]) -> BodyDigest {
    Sha1::digest(body).into()
}

/// A delivery travelling through the pipeline.
#[derive(Debug)]
pub struct Inflight {
    token: AckToken,
    digest: BodyDigest,
}

impl Inflight {
    pub fn new(token: AckToken, body: &[u8]) -> Self {
        Self {
            token,
            digest: body_digest(body),
        }
    }

    pub fn delivery_tag(&self) -> u64 {
        self.token.delivery_tag()
    }
}

pub struct DeferLedger {
    counts: Mutex<LruCache<BodyDigest, u32>>,
}

impl DeferLedger {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            counts: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Record one more defer and return the running total.
    pub fn bump(&self, digest: &BodyDigest) -> u32 {
        let mut counts = self.counts.lock().unwrap_or_else(|p| p.into_inner());
        let count = counts.get(digest).copied().unwrap_or(0) + 1;
        counts.put(*digest, count);
        count
    }

    pub fn forget(&self, digest: &BodyDigest) {
        self.counts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop(digest);
    }

    pub fn count(&self, digest: &BodyDigest) -> u32 {
        self.counts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .peek(digest)
            .copied()
            .unwrap_or(0)
    }
}

/// Applies the defer budget and hands the final disposition to the token.
pub struct Settler {
    ledger: DeferLedger,
    max_defers: u32,
}

impl Settler {
    pub fn new(max_defers: u32) -> Self {
        Self {
            ledger: DeferLedger::new(LEDGER_CAPACITY),
            max_defers,
        }
    }

    pub fn ledger(&self) -> &DeferLedger {
        &self.ledger
    }

    /// Settle `inflight`, returning the disposition actually applied.
    pub fn settle(&self, inflight: Inflight, disposition: Disposition) -> Disposition {
        let Inflight { token, digest } = inflight;

        let applied = match disposition {
            Disposition::Defer => {
                let defers = self.ledger.bump(&digest);
                if defers > self.max_defers {
                    warn!(
                        source = token.source(),
                        delivery_tag = token.delivery_tag(),
                        defers,
                        "Defer budget exhausted; dead-lettering message"
                    );
                    self.ledger.forget(&digest);
                    Disposition::Dead
                } else {
                    Disposition::Defer
                }
            }
            other => {
                self.ledger.forget(&digest);
                other
            }
        };

        counter!("pulse_messages_settled_total", "disposition" => applied.as_str()).increment(1);
        token.settle(applied);
        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::disposition::Settlement;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn inflight(tx: &mpsc::UnboundedSender<Settlement>, tag: u64, body: &[u8]) -> Inflight {
        Inflight::new(AckToken::new(Arc::from("jobs"), tag, 1, tx.clone()), body)
    }

    #[test]
    fn defer_turns_dead_after_budget() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let settler = Settler::new(2);

        assert_eq!(settler.settle(inflight(&tx, 1, b"m"), Disposition::Defer), Disposition::Defer);
        assert_eq!(settler.settle(inflight(&tx, 2, b"m"), Disposition::Defer), Disposition::Defer);
        assert_eq!(settler.settle(inflight(&tx, 3, b"m"), Disposition::Defer), Disposition::Dead);
        assert_eq!(settler.ledger().count(&body_digest(b"m")), 0);

        let applied: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|s| (s.delivery_tag, s.disposition))
            .collect();
        assert_eq!(
            applied,
            vec![
                (1, Disposition::Defer),
                (2, Disposition::Defer),
                (3, Disposition::Dead)
            ]
        );
    }

    #[test]
    fn ack_resets_defer_count() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let settler = Settler::new(1);

        settler.settle(inflight(&tx, 1, b"m"), Disposition::Defer);
        assert_eq!(settler.ledger().count(&body_digest(b"m")), 1);
        settler.settle(inflight(&tx, 2, b"m"), Disposition::Ack);
        assert_eq!(settler.ledger().count(&body_digest(b"m")), 0);
        assert_eq!(settler.settle(inflight(&tx, 3, b"m"), Disposition::Defer), Disposition::Defer);
    }

    #[test]
    fn ledger_evicts_least_recent() {
        let ledger = DeferLedger::new(2);
        ledger.bump(&body_digest(b"a"));
        ledger.bump(&body_digest(b"b"));
        ledger.bump(&body_digest(b"c"));
        assert_eq!(ledger.count(&body_digest(b"a")), 0);
        assert_eq!(ledger.count(&body_digest(b"c")), 1);
    }

    #[test]
    fn settling_after_consumer_is_gone_does_not_panic() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let settler = Settler::new(5);
        assert_eq!(settler.settle(inflight(&tx, 1, b"m"), Disposition::Ack), Disposition::Ack);
    }
}
