//! Repository version tracking from `config/milestone.txt`.
//!
//! Best effort: a failed fetch is logged and retried on the next refresh,
//! and never blocks message processing.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::StoreError;
use crate::refdata::ProjectCatalog;
use crate::store::{JobStore, RepositoryRecord};

const MILESTONE_PATH: &str = "raw-file/default/config/milestone.txt";

#[derive(Debug, Error)]
pub enum MilestoneError {
    #[error("milestone request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("milestone request returned {status}")]
    Status { status: u16 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct MilestoneFetcher {
    client: reqwest::Client,
    store: Arc<dyn JobStore>,
}

impl MilestoneFetcher {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self { client, store }
    }

    pub fn milestone_url(repository: &RepositoryRecord) -> String {
        format!("{}/{}", repository.url.trim_end_matches('/'), MILESTONE_PATH)
    }

    /// Fetch and record the current version of an `hg` repository. Returns
    /// `None` for other version control systems or an empty file.
    #[instrument(skip(self, repository), fields(project = %repository.name))]
    pub async fn refresh(
        &self,
        repository: &RepositoryRecord,
    ) -> Result<Option<String>, MilestoneError> {
        if repository.dvcs_type != "hg" {
            return Ok(None);
        }

        let response = self
            .client
            .get(Self::milestone_url(repository))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(MilestoneError::Status {
                status: response.status().as_u16(),
            });
        }

        let body = response.text().await?;
        let Some(version) = last_line(&body) else {
            debug!("milestone.txt is empty");
            return Ok(None);
        };

        self.store
            .record_repository_version(repository.id, &version, Utc::now().timestamp())
            .await?;
        debug!(version = %version, "Recorded repository version");
        Ok(Some(version))
    }

    /// Refresh every repository, logging failures.
    pub async fn refresh_all(&self, repositories: &[RepositoryRecord]) -> usize {
        let mut recorded = 0;
        for repository in repositories {
            match self.refresh(repository).await {
                Ok(Some(_)) => recorded += 1,
                Ok(None) => {}
                Err(err) => {
                    counter!("milestone_fetch_failures_total").increment(1);
                    warn!(project = %repository.name, error = %err, "Failed to refresh repository version");
                }
            }
        }
        recorded
    }

    /// Refresh the catalog's repositories every `interval` until `shutdown`
    /// fires.
    pub async fn run(
        self,
        catalog: Arc<ProjectCatalog>,
        interval: Duration,
        shutdown: CancellationToken,
    ) {
        info!("Starting milestone refresher");
        loop {
            let recorded = self.refresh_all(&catalog.repositories()).await;
            debug!(recorded, "Milestone refresh completed");

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!("Milestone refresher stopped");
    }
}

/// Last non-empty line of `body`, trimmed.
fn last_line(body: &str) -> Option<String> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .map(str::to_string)
}
