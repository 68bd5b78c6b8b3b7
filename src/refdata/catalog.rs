//! Project catalog: the set of repositories messages may name in
//! `origin.project`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use metrics::gauge;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::store::{JobStore, RepositoryRecord};

/// In-memory view of the repository table, reloaded on demand at most once
/// per `min_reload_interval`.
pub struct ProjectCatalog {
    store: Arc<dyn JobStore>,
    projects: RwLock<HashMap<String, RepositoryRecord>>,
    last_reload: Mutex<Option<Instant>>,
    min_reload_interval: Duration,
}

impl ProjectCatalog {
    pub fn new(store: Arc<dyn JobStore>, min_reload_interval: Duration) -> Self {
        Self {
            store,
            projects: RwLock::new(HashMap::new()),
            last_reload: Mutex::new(None),
            min_reload_interval,
        }
    }

    pub fn lookup(&self, project: &str) -> Option<RepositoryRecord> {
        self.projects
            .read()
            .unwrap_or_else(|poison| poison.into_inner())
            .get(project)
            .cloned()
    }

    pub fn repositories(&self) -> Vec<RepositoryRecord> {
        let mut repos: Vec<_> = self
            .projects
            .read()
            .unwrap_or_else(|poison| poison.into_inner())
            .values()
            .cloned()
            .collect();
        repos.sort_by(|a, b| a.name.cmp(&b.name));
        repos
    }

    /// Reload unconditionally, returning the number of known projects.
    pub async fn reload(&self) -> Result<usize, StoreError> {
        let mut last_reload = self.last_reload.lock().await;
        self.reload_locked(&mut last_reload).await
    }

    /// Reload unless a reload happened within the minimum interval. Concurrent
    /// callers wait on the in-flight reload instead of issuing their own.
    /// Returns whether a reload took place.
    pub async fn reload_if_stale(&self) -> Result<bool, StoreError> {
        let mut last_reload = self.last_reload.lock().await;
        if let Some(at) = *last_reload
            && at.elapsed() < self.min_reload_interval
        {
            debug!("Project catalog reloaded recently; skipping");
            return Ok(false);
        }
        self.reload_locked(&mut last_reload).await?;
        Ok(true)
    }

    async fn reload_locked(&self, last_reload: &mut Option<Instant>) -> Result<usize, StoreError> {
        let repositories = self.store.list_repositories().await?;
        let loaded: HashMap<_, _> = repositories
            .into_iter()
            .map(|repo| (repo.name.clone(), repo))
            .collect();
        let count = loaded.len();

        *self
            .projects
            .write()
            .unwrap_or_else(|poison| poison.into_inner()) = loaded;
        *last_reload = Some(Instant::now());

        gauge!("project_catalog_size").set(count as f64);
        info!(projects = count, "Project catalog loaded");
        Ok(count)
    }
}
