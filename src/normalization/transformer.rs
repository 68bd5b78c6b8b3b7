//! Maps a validated [`PulseJob`] onto a [`NormalizedJob`].

use std::sync::Arc;

use chrono::DateTime;
use thiserror::Error;
use tracing::instrument;

use super::{JobKind, JobState, LogReference, NormalizedJob, ParseStatus, derive_result};
use crate::refdata::{ReferenceResolver, ResolveError};
use crate::store::{PlatformKey, RefKey, RepositoryRecord};
use crate::validation::{MachineInfo, PulseJob};

const UNKNOWN: &str = "unknown";
const UNKNOWN_GROUP_SYMBOL: &str = "?";
const DEFAULT_OPTION: &str = "opt";
const DEFAULT_TIER: i16 = 1;
const ERROR_SUMMARY_SUFFIX: &str = "_errorsummary.log";
const ERROR_SUMMARY_LOG_NAME: &str = "errorsummary_json";

#[derive(Debug, Error)]
pub enum TransformError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("{field} is not an ISO-8601 timestamp: {value}")]
    InvalidTimestamp { field: &'static str, value: String },
    #[error("state '{state}' has no canonical form")]
    UnsupportedState { state: String },
}

impl TransformError {
    /// Whether the message may succeed if redelivered later.
    pub fn is_transient(&self) -> bool {
        match self {
            TransformError::Resolve(err) => err.is_transient(),
            TransformError::InvalidTimestamp { .. } | TransformError::UnsupportedState { .. } => {
                false
            }
        }
    }
}

pub struct Transformer {
    resolver: Arc<ReferenceResolver>,
}

impl Transformer {
    pub fn new(resolver: Arc<ReferenceResolver>) -> Self {
        Self { resolver }
    }

    #[instrument(skip_all, fields(project = %repository.name, job_guid = %job.task_id))]
    pub async fn transform(
        &self,
        job: &PulseJob,
        repository: &RepositoryRecord,
    ) -> Result<NormalizedJob, TransformError> {
        let state = JobState::from_pulse(&job.state).ok_or_else(|| {
            TransformError::UnsupportedState {
                state: job.state.clone(),
            }
        })?;
        let result = (state == JobState::Completed).then(|| {
            let raw = job.result.as_deref().unwrap_or(&job.state);
            derive_result(JobKind::parse(&job.job_kind), raw, job.is_retried)
        });

        let submit_timestamp = parse_timestamp("timeScheduled", job.time_scheduled.as_deref())?;
        let start_timestamp = parse_timestamp("timeStarted", job.time_started.as_deref())?;
        let end_timestamp = parse_timestamp("timeCompleted", job.time_completed.as_deref())?;

        let build_machine = job.build_machine.as_ref().or(job.run_machine.as_ref());
        let run_machine = job.run_machine.as_ref().or(job.build_machine.as_ref());

        let build_platform_id = self
            .resolver
            .resolve(RefKey::BuildPlatform(platform_key(build_machine)))
            .await?;
        let machine_platform_id = self
            .resolver
            .resolve(RefKey::MachinePlatform(platform_key(run_machine)))
            .await?;
        let machine_id = self
            .resolver
            .resolve(RefKey::Machine {
                name: machine_name(job),
            })
            .await?;

        let labels: Vec<&str> = match job.labels.as_deref() {
            Some(labels) if !labels.is_empty() => labels.iter().map(String::as_str).collect(),
            _ => vec![DEFAULT_OPTION],
        };
        let option_collection_hash = self.resolver.resolve_option_collection(labels).await?;

        let product_id = self
            .resolver
            .resolve(RefKey::Product {
                name: job.product_name.clone().unwrap_or_else(|| UNKNOWN.into()),
            })
            .await?;

        let display = &job.display;
        let group_name = display.group_name.clone().unwrap_or_else(|| UNKNOWN.into());
        let group_symbol = display
            .group_symbol
            .clone()
            .unwrap_or_else(|| UNKNOWN_GROUP_SYMBOL.into());
        let name = display.job_name.clone().unwrap_or_else(|| UNKNOWN.into());
        let symbol = display.full_symbol();

        let job_group_id = self
            .resolver
            .resolve(RefKey::JobGroup {
                name: group_name.clone(),
                symbol: group_symbol.clone(),
            })
            .await?;
        let job_type_id = self
            .resolver
            .resolve(RefKey::JobType {
                job_group_id,
                name: name.clone(),
                symbol: symbol.clone(),
            })
            .await?;

        Ok(NormalizedJob {
            job_guid: job.task_id.clone(),
            project: repository.name.clone(),
            repository_id: repository.id,
            revision: job.origin.revision.clone(),
            name,
            symbol,
            group_name,
            group_symbol,
            state,
            result,
            submit_timestamp,
            start_timestamp,
            end_timestamp,
            build_platform_id,
            machine_platform_id,
            machine_id,
            option_collection_hash,
            product_id,
            job_type_id,
            log_references: log_references(job),
            coalesced_guids: job.coalesced.clone(),
            tier: job.tier.unwrap_or(DEFAULT_TIER),
            reason: job.reason.clone().unwrap_or_else(|| UNKNOWN.into()),
            who: job.owner.clone().unwrap_or_else(|| UNKNOWN.into()),
            build_system_type: job.build_system.clone(),
        })
    }
}

/// ISO-8601 with an offset written without a colon, e.g. `+0000`.
const ISO_8601_COMPACT_OFFSET: &str = "%Y-%m-%dT%H:%M:%S%.f%z";

/// Unix seconds of an ISO-8601 timestamp with zone.
pub fn parse_timestamp(
    field: &'static str,
    value: Option<&str>,
) -> Result<Option<i64>, TransformError> {
    value
        .map(|raw| {
            DateTime::parse_from_rfc3339(raw)
                .or_else(|_| DateTime::parse_from_str(raw, ISO_8601_COMPACT_OFFSET))
                .map(|ts| ts.timestamp())
                .map_err(|_| TransformError::InvalidTimestamp {
                    field,
                    value: raw.to_string(),
                })
        })
        .transpose()
}

fn platform_key(machine: Option<&MachineInfo>) -> PlatformKey {
    match machine {
        Some(m) => PlatformKey {
            os_name: m.os.clone(),
            platform: m.platform.clone(),
            architecture: m.architecture.clone(),
        },
        None => PlatformKey::unknown(),
    }
}

fn machine_name(job: &PulseJob) -> String {
    [job.run_machine.as_ref(), job.build_machine.as_ref()]
        .into_iter()
        .flatten()
        .find_map(|m| m.name.clone())
        .unwrap_or_else(|| UNKNOWN.into())
}

fn log_references(job: &PulseJob) -> Vec<LogReference> {
    let mut refs: Vec<LogReference> = job
        .logs
        .iter()
        .map(|log| LogReference {
            name: log.name.clone(),
            url: log.url.clone(),
            parse_status: if log.steps.is_some() {
                ParseStatus::Parsed
            } else {
                ParseStatus::Pending
            },
        })
        .collect();

    if let Some(info) = &job.job_info {
        refs.extend(
            info.links
                .iter()
                .filter(|link| link.link_text.ends_with(ERROR_SUMMARY_SUFFIX))
                .map(|link| LogReference {
                    name: ERROR_SUMMARY_LOG_NAME.to_string(),
                    url: link.url.clone(),
                    parse_status: ParseStatus::Pending,
                }),
        );
    }
    refs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalization::{JobResult, option_collection_hash};
    use crate::store::testing::{MemoryStore, repository};
    use crate::validation::tests::job_message;
    use serde_json::{Value, json};
    use std::time::Duration;

    fn transformer() -> (Arc<MemoryStore>, Transformer) {
        let store = Arc::new(MemoryStore::default());
        let resolver = Arc::new(ReferenceResolver::new(store.clone(), Duration::from_secs(5)));
        (store, Transformer::new(resolver))
    }

    fn pulse_job(value: Value) -> PulseJob {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn running_job_has_no_result() {
        let (_, transformer) = transformer();
        let mut message = job_message("autoland", "T1", "running");
        message["timeStarted"] = json!("2023-01-01T00:00:05Z");

        let job = transformer
            .transform(&pulse_job(message), &repository(1, "autoland"))
            .await
            .unwrap();

        assert_eq!(job.job_guid, "T1");
        assert_eq!(job.repository_id, 1);
        assert_eq!(job.state, JobState::Running);
        assert_eq!(job.result, None);
        assert_eq!(job.symbol, "M1");
        assert_eq!(job.submit_timestamp, Some(1_672_531_200));
        assert_eq!(job.start_timestamp, Some(1_672_531_205));
        assert_eq!(job.end_timestamp, None);
        assert_eq!(job.option_collection_hash, option_collection_hash(["e10s", "opt"]));
        assert_eq!(job.log_references.len(), 1);
        assert_eq!(job.log_references[0].parse_status, ParseStatus::Pending);
        assert_eq!(job.tier, 1);
        assert_eq!(job.who, "unknown");
    }

    #[tokio::test]
    async fn terminal_state_without_result_derives_from_state() {
        let (_, transformer) = transformer();
        let mut message = job_message("autoland", "T1", "fail");
        message["jobKind"] = json!("build");
        let job = transformer
            .transform(&pulse_job(message), &repository(1, "autoland"))
            .await
            .unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.result, Some(JobResult::Busted));
    }

    #[tokio::test]
    async fn explicit_result_and_retry() {
        let (_, transformer) = transformer();
        let mut message = job_message("autoland", "T1", "completed");
        message["result"] = json!("fail");
        let job = transformer
            .transform(&pulse_job(message.clone()), &repository(1, "autoland"))
            .await
            .unwrap();
        assert_eq!(job.result, Some(JobResult::TestFailed));

        message["isRetried"] = json!(true);
        let job = transformer
            .transform(&pulse_job(message), &repository(1, "autoland"))
            .await
            .unwrap();
        assert_eq!(job.result, Some(JobResult::Retry));
    }

    #[tokio::test]
    async fn missing_fields_fall_back_to_defaults() {
        let (store, transformer) = transformer();
        let message = json!({
            "version": 1,
            "taskId": "T2",
            "origin": {"kind": "hg.mozilla.org", "project": "autoland", "revision": "abc"},
            "buildSystem": "taskcluster",
            "display": {"jobSymbol": "B"},
            "state": "pending",
            "jobKind": "build"
        });
        let job = transformer
            .transform(&pulse_job(message), &repository(1, "autoland"))
            .await
            .unwrap();

        assert_eq!(job.name, "unknown");
        assert_eq!(job.group_name, "unknown");
        assert_eq!(job.group_symbol, "?");
        assert_eq!(job.reason, "unknown");
        assert_eq!(job.option_collection_hash, option_collection_hash(["opt"]));

        let refs = store.refs.lock().unwrap();
        assert_eq!(
            refs.get(&RefKey::BuildPlatform(PlatformKey::unknown())),
            Some(&job.build_platform_id)
        );
        assert_eq!(
            refs.get(&RefKey::Machine { name: "unknown".into() }),
            Some(&job.machine_id)
        );
        assert_eq!(
            refs.get(&RefKey::Product { name: "unknown".into() }),
            Some(&job.product_id)
        );
    }

    #[tokio::test]
    async fn single_machine_is_used_for_both_platforms() {
        let (store, transformer) = transformer();
        let mut message = job_message("autoland", "T1", "running");
        let machine = message["runMachine"].take();
        message.as_object_mut().unwrap().remove("runMachine");
        message["buildMachine"] = machine;

        let job = transformer
            .transform(&pulse_job(message), &repository(1, "autoland"))
            .await
            .unwrap();

        let expected = PlatformKey {
            os_name: "linux".into(),
            platform: "linux64".into(),
            architecture: "x86_64".into(),
        };
        let refs = store.refs.lock().unwrap();
        assert_eq!(
            refs.get(&RefKey::BuildPlatform(expected.clone())),
            Some(&job.build_platform_id)
        );
        assert_eq!(
            refs.get(&RefKey::MachinePlatform(expected)),
            Some(&job.machine_platform_id)
        );
        assert_eq!(
            refs.get(&RefKey::Machine { name: "i-0abc".into() }),
            Some(&job.machine_id)
        );
    }

    #[test]
    fn run_machine_name_wins() {
        let mut message = job_message("autoland", "T1", "running");
        message["buildMachine"] = json!({
            "name": "builder",
            "os": "linux",
            "platform": "linux64",
            "architecture": "x86_64"
        });
        assert_eq!(machine_name(&pulse_job(message.clone())), "i-0abc");

        message["runMachine"] = json!({
            "os": "linux",
            "platform": "linux64",
            "architecture": "x86_64"
        });
        assert_eq!(machine_name(&pulse_job(message)), "builder");
    }

    #[test]
    fn log_parse_status_and_error_summary() {
        let mut message = job_message("autoland", "T1", "completed");
        message["logs"] = json!([
            {"name": "live_backing_log", "url": "https://logs/1", "steps": []},
            {"name": "raw", "url": "https://logs/2"}
        ]);
        message["jobInfo"] = json!({
            "links": [
                {"url": "https://logs/3", "linkText": "wpt_errorsummary.log", "label": "artifact uploaded"},
                {"url": "https://logs/4", "linkText": "screenshot.png", "label": "artifact uploaded"}
            ]
        });

        let refs = log_references(&pulse_job(message));
        assert_eq!(
            refs,
            vec![
                LogReference {
                    name: "live_backing_log".into(),
                    url: "https://logs/1".into(),
                    parse_status: ParseStatus::Parsed,
                },
                LogReference {
                    name: "raw".into(),
                    url: "https://logs/2".into(),
                    parse_status: ParseStatus::Pending,
                },
                LogReference {
                    name: "errorsummary_json".into(),
                    url: "https://logs/3".into(),
                    parse_status: ParseStatus::Pending,
                },
            ]
        );
    }

    #[tokio::test]
    async fn invalid_timestamp_is_permanent() {
        let (_, transformer) = transformer();
        let mut message = job_message("autoland", "T1", "running");
        message["timeStarted"] = json!("yesterday");
        let err = transformer
            .transform(&pulse_job(message), &repository(1, "autoland"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransformError::InvalidTimestamp { field: "timeStarted", .. }
        ));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn transform_is_deterministic() {
        let (_, transformer) = transformer();
        let job = pulse_job(job_message("autoland", "T1", "success"));
        let repo = repository(1, "autoland");
        let first = transformer.transform(&job, &repo).await.unwrap();
        let second = transformer.transform(&job, &repo).await.unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn timestamps_honor_offsets() {
        assert_eq!(
            parse_timestamp("timeStarted", Some("2023-01-01T01:00:00+01:00")).unwrap(),
            Some(1_672_531_200)
        );
        assert_eq!(parse_timestamp("timeStarted", None).unwrap(), None);
    }

    #[test]
    fn timestamps_accept_offsets_without_colon() {
        assert_eq!(
            parse_timestamp("timeStarted", Some("2023-01-01T00:00:00+0000")).unwrap(),
            Some(1_672_531_200)
        );
        assert_eq!(
            parse_timestamp("timeCompleted", Some("2023-01-01T02:30:00.250+0100")).unwrap(),
            Some(1_672_536_600)
        );
    }

    #[tokio::test]
    async fn compact_offset_timestamps_are_transformed() {
        let (_, transformer) = transformer();
        let mut message = job_message("autoland", "T1", "running");
        message["timeStarted"] = json!("2023-01-01T00:01:00+0000");
        let job = transformer
            .transform(&pulse_job(message), &repository(1, "autoland"))
            .await
            .unwrap();
        assert_eq!(job.start_timestamp, Some(1_672_531_260));
    }
}
