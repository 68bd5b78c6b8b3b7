//! # Reference Data
//!
//! Interning of reference entities (platforms, machines, job groups and
//! types, options, option collections, products) into stable integer ids.
//!
//! Lookups go through a process-local cache first. On a miss the caller takes
//! a striped per-key mutex, re-checks the cache, and asks the store to
//! get-or-create the row. Callers racing on the same key therefore issue a
//! single store round trip and all observe the same id.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use metrics::counter;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::error::StoreError;
use crate::normalization::option_collection_hash;
use crate::store::{JobStore, RefKey, RefKind};

pub mod catalog;
pub mod milestone;

pub use catalog::ProjectCatalog;
pub use milestone::MilestoneFetcher;

const LOCK_STRIPES: usize = 64;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{kind} lookup timed out after {after_ms}ms")]
    Timeout { kind: RefKind, after_ms: u64 },
}

impl ResolveError {
    /// Whether retrying the message later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ResolveError::Store(err) => err.is_retryable(),
            ResolveError::Timeout { .. } => true,
        }
    }
}

pub struct ReferenceResolver {
    store: Arc<dyn JobStore>,
    cache: RwLock<HashMap<RefKey, i32>>,
    stripes: Vec<Mutex<()>>,
    timeout: Duration,
}

impl ReferenceResolver {
    pub fn new(store: Arc<dyn JobStore>, timeout: Duration) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            timeout,
        }
    }

    pub fn cached(&self, key: &RefKey) -> Option<i32> {
        self.cache
            .read()
            .unwrap_or_else(|poison| poison.into_inner())
            .get(key)
            .copied()
    }

    pub fn cache_len(&self) -> usize {
        self.cache
            .read()
            .unwrap_or_else(|poison| poison.into_inner())
            .len()
    }

    /// Id of the row for `key`, creating it on first sight.
    #[instrument(skip(self), fields(kind = %key.kind()))]
    pub async fn resolve(&self, key: RefKey) -> Result<i32, ResolveError> {
        if let Some(id) = self.cached(&key) {
            return Ok(id);
        }

        let kind = key.kind();
        let after_ms = self.timeout.as_millis() as u64;
        tokio::time::timeout(self.timeout, self.resolve_uncached(key))
            .await
            .map_err(|_| ResolveError::Timeout { kind, after_ms })?
    }

    async fn resolve_uncached(&self, key: RefKey) -> Result<i32, ResolveError> {
        let _guard = self.stripes[stripe_for(&key)].lock().await;

        // Another caller may have filled the slot while we waited.
        if let Some(id) = self.cached(&key) {
            return Ok(id);
        }

        counter!("reference_cache_misses_total", "kind" => key.kind().as_str()).increment(1);
        let id = self.store.resolve_ref(&key).await?;
        debug!(id, "Reference resolved");

        self.cache
            .write()
            .unwrap_or_else(|poison| poison.into_inner())
            .insert(key, id);
        Ok(id)
    }

    /// Registers every option in `names` as a member of its collection and
    /// returns the collection hash.
    pub async fn resolve_option_collection<I, S>(&self, names: I) -> Result<String, ResolveError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names: BTreeSet<String> = names
            .into_iter()
            .map(|name| name.as_ref().to_string())
            .collect();
        let hash = option_collection_hash(&names);

        for name in names {
            let option_id = self.resolve(RefKey::Option { name }).await?;
            self.resolve(RefKey::OptionCollection {
                hash: hash.clone(),
                option_id,
            })
            .await?;
        }

        Ok(hash)
    }
}

fn stripe_for(key: &RefKey) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % LOCK_STRIPES as u64) as usize
}
