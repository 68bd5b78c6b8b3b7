//! # Job Store
//!
//! The persistence seam of the ingestion core. Everything downstream of the
//! pipeline talks to the relational store through [`JobStore`]; the SeaORM
//! implementation lives in [`crate::repositories::job_store`].

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::normalization::{JobResult, JobState, NormalizedJob};

/// Kinds of interned reference entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefKind {
    BuildPlatform,
    MachinePlatform,
    Machine,
    JobGroup,
    JobType,
    Option,
    OptionCollection,
    Product,
}

impl RefKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            RefKind::BuildPlatform => "build_platform",
            RefKind::MachinePlatform => "machine_platform",
            RefKind::Machine => "machine",
            RefKind::JobGroup => "job_group",
            RefKind::JobType => "job_type",
            RefKind::Option => "option",
            RefKind::OptionCollection => "option_collection",
            RefKind::Product => "product",
        }
    }
}

impl fmt::Display for RefKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `(os_name, platform, architecture)` triple shared by build and machine
/// platforms.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlatformKey {
    pub os_name: String,
    pub platform: String,
    pub architecture: String,
}

impl PlatformKey {
    pub fn unknown() -> Self {
        Self {
            os_name: "unknown".to_string(),
            platform: "unknown".to_string(),
            architecture: "unknown".to_string(),
        }
    }
}

/// Natural key of a reference entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RefKey {
    BuildPlatform(PlatformKey),
    MachinePlatform(PlatformKey),
    Machine { name: String },
    JobGroup { name: String, symbol: String },
    JobType { job_group_id: i32, name: String, symbol: String },
    Option { name: String },
    /// Membership of `option_id` in the collection identified by `hash`.
    OptionCollection { hash: String, option_id: i32 },
    Product { name: String },
}

impl RefKey {
    pub fn kind(&self) -> RefKind {
        match self {
            RefKey::BuildPlatform(_) => RefKind::BuildPlatform,
            RefKey::MachinePlatform(_) => RefKind::MachinePlatform,
            RefKey::Machine { .. } => RefKind::Machine,
            RefKey::JobGroup { .. } => RefKind::JobGroup,
            RefKey::JobType { .. } => RefKind::JobType,
            RefKey::Option { .. } => RefKind::Option,
            RefKey::OptionCollection { .. } => RefKind::OptionCollection,
            RefKey::Product { .. } => RefKind::Product,
        }
    }
}

/// Persisted state of a job as seen by the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredState {
    pub state: JobState,
    pub result: Option<JobResult>,
}

/// Repository row as exposed to the project catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryRecord {
    pub id: i32,
    pub name: String,
    pub dvcs_type: String,
    pub url: String,
    pub active_status: String,
}

/// One mutation inside a [`Batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Upsert(NormalizedJob),
    MarkCoalesced {
        repository_id: i32,
        by_guid: String,
        coalesced_guid: String,
    },
}

/// Ordered list of mutations applied in one transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    pub ops: Vec<BatchOp>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn push(&mut self, op: BatchOp) {
        self.ops.push(op);
    }
}

/// What a commit did, for logging and metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitSummary {
    pub inserted: u64,
    pub advanced: u64,
    pub refreshed: u64,
    /// Upserts rejected by the ordinal guard.
    pub stale: u64,
    pub coalesced: u64,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Get-or-create the reference row for `key`, returning its id.
    async fn resolve_ref(&self, key: &RefKey) -> Result<i32, StoreError>;

    /// Current states of `guids` within a repository. Absent guids are
    /// omitted from the map.
    async fn load_states(
        &self,
        repository_id: i32,
        guids: &[String],
    ) -> Result<HashMap<String, StoredState>, StoreError>;

    /// Apply every operation in `batch` in one transaction.
    async fn commit(&self, batch: &Batch) -> Result<CommitSummary, StoreError>;

    async fn list_repositories(&self) -> Result<Vec<RepositoryRecord>, StoreError>;

    async fn record_repository_version(
        &self,
        repository_id: i32,
        version: &str,
        version_timestamp: i64,
    ) -> Result<(), StoreError>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory [`JobStore`] for unit tests.

    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub(crate) struct MemoryStore {
        pub repositories: Mutex<Vec<RepositoryRecord>>,
        pub refs: Mutex<HashMap<RefKey, i32>>,
        pub jobs: Mutex<HashMap<(i32, String), StoredState>>,
        pub coalesced: Mutex<Vec<(String, String)>>,
        pub commits: Mutex<Vec<Batch>>,
        /// Errors returned by the next commits, in order.
        pub commit_failures: Mutex<VecDeque<StoreError>>,
        pub versions: Mutex<Vec<(i32, String)>>,
    }

    impl MemoryStore {
        pub(crate) fn with_repositories(names: &[&str]) -> Self {
            let store = Self::default();
            *store.repositories.lock().unwrap() = names
                .iter()
                .enumerate()
                .map(|(i, name)| repository(i as i32 + 1, name))
                .collect();
            store
        }

        pub(crate) fn add_repository(&self, name: &str) {
            let mut repos = self.repositories.lock().unwrap();
            let id = repos.len() as i32 + 1;
            repos.push(repository(id, name));
        }

        pub(crate) fn fail_next_commit(&self, err: StoreError) {
            self.commit_failures.lock().unwrap().push_back(err);
        }

        pub(crate) fn state_of(&self, repository_id: i32, guid: &str) -> Option<StoredState> {
            self.jobs
                .lock()
                .unwrap()
                .get(&(repository_id, guid.to_string()))
                .copied()
        }

        pub(crate) fn commit_count(&self) -> usize {
            self.commits.lock().unwrap().len()
        }
    }

    pub(crate) fn repository(id: i32, name: &str) -> RepositoryRecord {
        RepositoryRecord {
            id,
            name: name.to_string(),
            dvcs_type: "hg".to_string(),
            url: format!("https://hg.mozilla.org/{name}"),
            active_status: "active".to_string(),
        }
    }

    #[async_trait]
    impl JobStore for MemoryStore {
        async fn resolve_ref(&self, key: &RefKey) -> Result<i32, StoreError> {
            let mut refs = self.refs.lock().unwrap();
            let next = refs.len() as i32 + 1;
            Ok(*refs.entry(key.clone()).or_insert(next))
        }

        async fn load_states(
            &self,
            repository_id: i32,
            guids: &[String],
        ) -> Result<HashMap<String, StoredState>, StoreError> {
            let jobs = self.jobs.lock().unwrap();
            Ok(guids
                .iter()
                .filter_map(|guid| {
                    jobs.get(&(repository_id, guid.clone()))
                        .map(|state| (guid.clone(), *state))
                })
                .collect())
        }

        async fn commit(&self, batch: &Batch) -> Result<CommitSummary, StoreError> {
            if let Some(err) = self.commit_failures.lock().unwrap().pop_front() {
                return Err(err);
            }

            let mut summary = CommitSummary::default();
            let mut jobs = self.jobs.lock().unwrap();
            for op in &batch.ops {
                match op {
                    BatchOp::Upsert(job) => {
                        let key = (job.repository_id, job.job_guid.clone());
                        let incoming = StoredState {
                            state: job.state,
                            result: job.result,
                        };
                        match jobs.get(&key).copied() {
                            None => {
                                jobs.insert(key, incoming);
                                summary.inserted += 1;
                            }
                            Some(existing) if existing.state.ordinal() < job.state.ordinal() => {
                                jobs.insert(key, incoming);
                                summary.advanced += 1;
                            }
                            Some(existing) if existing.state == job.state => {
                                if let Some(result) =
                                    job.result.filter(|r| *r != JobResult::Retry)
                                {
                                    jobs.insert(
                                        key,
                                        StoredState {
                                            result: Some(result),
                                            ..existing
                                        },
                                    );
                                }
                                summary.refreshed += 1;
                            }
                            Some(_) => summary.stale += 1,
                        }
                    }
                    BatchOp::MarkCoalesced {
                        by_guid,
                        coalesced_guid,
                        ..
                    } => {
                        self.coalesced
                            .lock()
                            .unwrap()
                            .push((by_guid.clone(), coalesced_guid.clone()));
                        summary.coalesced += 1;
                    }
                }
            }
            self.commits.lock().unwrap().push(batch.clone());
            Ok(summary)
        }

        async fn list_repositories(&self) -> Result<Vec<RepositoryRecord>, StoreError> {
            Ok(self.repositories.lock().unwrap().clone())
        }

        async fn record_repository_version(
            &self,
            repository_id: i32,
            version: &str,
            _version_timestamp: i64,
        ) -> Result<(), StoreError> {
            self.versions
                .lock()
                .unwrap()
                .push((repository_id, version.to_string()));
            Ok(())
        }
    }
}
