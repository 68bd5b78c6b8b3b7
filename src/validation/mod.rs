//! # Message Validation
//!
//! Decodes raw Pulse bodies, checks them against the embedded job schema and
//! sorts them into accepted, dropped (malformed, never retried) and deferred
//! (temporarily unresolvable) messages.

use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::refdata::ProjectCatalog;
use crate::store::RepositoryRecord;

const PULSE_JOB_SCHEMA: &str = include_str!("../../schemas/pulse-job.json");

/// Only envelope version understood by this validator.
pub const SUPPORTED_VERSION: u64 = 1;

/// Maximum number of schema violations reported per message.
const MAX_REPORTED_ERRORS: usize = 3;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("embedded job schema is not valid JSON: {0}")]
    SchemaJson(#[from] serde_json::Error),
    #[error("embedded job schema does not compile: {0}")]
    SchemaCompile(String),
}

/// A job message after decoding and schema validation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PulseJob {
    pub version: u64,
    pub task_id: String,
    pub origin: Origin,
    pub build_system: String,
    pub display: JobDisplay,
    pub state: String,
    #[serde(default)]
    pub result: Option<String>,
    pub job_kind: String,
    #[serde(default)]
    pub time_scheduled: Option<String>,
    #[serde(default)]
    pub time_started: Option<String>,
    #[serde(default)]
    pub time_completed: Option<String>,
    #[serde(default)]
    pub build_machine: Option<MachineInfo>,
    #[serde(default)]
    pub run_machine: Option<MachineInfo>,
    #[serde(default)]
    pub labels: Option<Vec<String>>,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    #[serde(default)]
    pub is_retried: bool,
    #[serde(default)]
    pub coalesced: Vec<String>,
    #[serde(default)]
    pub tier: Option<i16>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub product_name: Option<String>,
    #[serde(default)]
    pub job_info: Option<JobInfo>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Origin {
    pub kind: String,
    pub project: String,
    pub revision: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDisplay {
    #[serde(default)]
    pub job_name: Option<String>,
    pub job_symbol: String,
    #[serde(default)]
    pub group_name: Option<String>,
    #[serde(default)]
    pub group_symbol: Option<String>,
    /// Integer or string on the wire.
    #[serde(default)]
    pub chunk_id: Option<Value>,
}

impl JobDisplay {
    /// `jobSymbol` followed by the chunk id, if any.
    pub fn full_symbol(&self) -> String {
        match &self.chunk_id {
            Some(Value::String(chunk)) => format!("{}{}", self.job_symbol, chunk),
            Some(Value::Number(chunk)) => format!("{}{}", self.job_symbol, chunk),
            _ => self.job_symbol.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MachineInfo {
    #[serde(default)]
    pub name: Option<String>,
    pub os: String,
    pub platform: String,
    pub architecture: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LogEntry {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub steps: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JobInfo {
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub links: Vec<JobInfoLink>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInfoLink {
    pub url: String,
    #[serde(default)]
    pub link_text: String,
    #[serde(default)]
    pub label: String,
}

/// Why a message is discarded without requeue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    NotJson(String),
    UnsupportedVersion(String),
    Schema(String),
    Unscheduled,
}

impl DropReason {
    /// Metric label.
    pub const fn label(&self) -> &'static str {
        match self {
            DropReason::NotJson(_) => "not_json",
            DropReason::UnsupportedVersion(_) => "unsupported_version",
            DropReason::Schema(_) => "schema",
            DropReason::Unscheduled => "unscheduled",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::NotJson(err) => write!(f, "body is not JSON: {err}"),
            DropReason::UnsupportedVersion(v) => write!(f, "unsupported message version {v}"),
            DropReason::Schema(err) => write!(f, "schema violation: {err}"),
            DropReason::Unscheduled => f.write_str("unscheduled jobs are not ingested"),
        }
    }
}

/// A message accepted for ingestion, with the repository it names.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedJob {
    pub job: PulseJob,
    pub repository: RepositoryRecord,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Accept(ValidatedJob),
    Drop(DropReason),
    /// The message names a project that is not (yet) known.
    UnknownProject { project: String, job: Box<PulseJob> },
}

pub struct Validator {
    schema: jsonschema::Validator,
    catalog: Arc<ProjectCatalog>,
}

impl Validator {
    pub fn new(catalog: Arc<ProjectCatalog>) -> Result<Self, ValidationError> {
        let schema_json: Value = serde_json::from_str(PULSE_JOB_SCHEMA)?;
        let schema = jsonschema::validator_for(&schema_json)
            .map_err(|err| ValidationError::SchemaCompile(err.to_string()))?;
        Ok(Self { schema, catalog })
    }

    pub fn validate(&self, body: &[u8]) -> Verdict {
        let value: Value = match serde_json::from_slice(body) {
            Ok(value) => value,
            Err(err) => return Verdict::Drop(DropReason::NotJson(err.to_string())),
        };

        match value.get("version") {
            Some(Value::Number(n)) if n.as_u64() == Some(SUPPORTED_VERSION) => {}
            Some(other) => {
                return Verdict::Drop(DropReason::UnsupportedVersion(other.to_string()));
            }
            None => return Verdict::Drop(DropReason::UnsupportedVersion("missing".into())),
        }

        let violations: Vec<String> = self
            .schema
            .iter_errors(&value)
            .take(MAX_REPORTED_ERRORS)
            .map(|err| format!("{} at '{}'", err, err.instance_path))
            .collect();
        if !violations.is_empty() {
            return Verdict::Drop(DropReason::Schema(violations.join("; ")));
        }

        let job: PulseJob = match serde_json::from_value(value) {
            Ok(job) => job,
            Err(err) => return Verdict::Drop(DropReason::Schema(err.to_string())),
        };

        if job.state == "unscheduled" {
            return Verdict::Drop(DropReason::Unscheduled);
        }

        match self.catalog.lookup(&job.origin.project) {
            Some(repository) => Verdict::Accept(ValidatedJob { job, repository }),
            None => Verdict::UnknownProject {
                project: job.origin.project.clone(),
                job: Box::new(job),
            },
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::testing::MemoryStore;
    use serde_json::json;
    use std::time::Duration;

    pub(crate) fn job_message(project: &str, guid: &str, state: &str) -> Value {
        json!({
            "version": 1,
            "taskId": guid,
            "origin": {"kind": "hg.mozilla.org", "project": project, "revision": "abcdef123456"},
            "buildSystem": "taskcluster",
            "display": {
                "jobName": "test-linux64/opt-mochitest-1",
                "jobSymbol": "M",
                "chunkId": 1,
                "groupName": "Mochitests",
                "groupSymbol": "M"
            },
            "state": state,
            "jobKind": "test",
            "timeScheduled": "2023-01-01T00:00:00Z",
            "runMachine": {
                "name": "i-0abc",
                "os": "linux",
                "platform": "linux64",
                "architecture": "x86_64"
            },
            "labels": ["opt", "e10s"],
            "logs": [{"name": "live_backing_log", "url": "https://logs.example.com/T1"}]
        })
    }

    async fn validator() -> Validator {
        let store = Arc::new(MemoryStore::with_repositories(&["autoland"]));
        let catalog = Arc::new(ProjectCatalog::new(store, Duration::ZERO));
        catalog.reload().await.unwrap();
        Validator::new(catalog).unwrap()
    }

    fn body(value: &Value) -> Vec<u8> {
        serde_json::to_vec(value).unwrap()
    }

    #[tokio::test]
    async fn accepts_well_formed_job() {
        let validator = validator().await;
        let verdict = validator.validate(&body(&job_message("autoland", "T1", "running")));
        let Verdict::Accept(accepted) = verdict else {
            panic!("expected accept, got {verdict:?}");
        };
        assert_eq!(accepted.repository.name, "autoland");
        assert_eq!(accepted.job.task_id, "T1");
        assert_eq!(accepted.job.display.full_symbol(), "M1");
        assert_eq!(
            accepted.job.labels.as_deref(),
            Some(&["opt".to_string(), "e10s".to_string()][..])
        );
    }

    #[tokio::test]
    async fn non_json_is_dropped() {
        let validator = validator().await;
        let verdict = validator.validate(b"not json {");
        assert!(matches!(verdict, Verdict::Drop(DropReason::NotJson(_))));
    }

    #[tokio::test]
    async fn wrong_version_is_dropped() {
        let validator = validator().await;
        let mut message = job_message("autoland", "T1", "running");
        message["version"] = json!(2);
        let verdict = validator.validate(&body(&message));
        assert!(matches!(verdict, Verdict::Drop(DropReason::UnsupportedVersion(_))));

        message.as_object_mut().unwrap().remove("version");
        let verdict = validator.validate(&body(&message));
        assert!(matches!(verdict, Verdict::Drop(DropReason::UnsupportedVersion(_))));
    }

    #[tokio::test]
    async fn schema_violations_are_dropped() {
        let validator = validator().await;

        let mut missing_task = job_message("autoland", "T1", "running");
        missing_task.as_object_mut().unwrap().remove("taskId");
        let verdict = validator.validate(&body(&missing_task));
        assert!(matches!(verdict, Verdict::Drop(DropReason::Schema(_))));

        let mut bad_state = job_message("autoland", "T1", "running");
        bad_state["state"] = json!("exploded");
        let Verdict::Drop(reason) = validator.validate(&body(&bad_state)) else {
            panic!("expected drop");
        };
        assert_eq!(reason.label(), "schema");

        let mut bad_machine = job_message("autoland", "T1", "running");
        bad_machine["runMachine"] = json!({"name": "m"});
        let verdict = validator.validate(&body(&bad_machine));
        assert!(matches!(verdict, Verdict::Drop(DropReason::Schema(_))));
    }

    #[tokio::test]
    async fn unscheduled_is_dropped() {
        let validator = validator().await;
        let verdict = validator.validate(&body(&job_message("autoland", "T1", "unscheduled")));
        assert_eq!(verdict, Verdict::Drop(DropReason::Unscheduled));
    }

    #[tokio::test]
    async fn unknown_project_is_reported() {
        let validator = validator().await;
        let verdict = validator.validate(&body(&job_message("mozilla-beta", "T1", "pending")));
        let Verdict::UnknownProject { project, job } = verdict else {
            panic!("expected unknown project");
        };
        assert_eq!(project, "mozilla-beta");
        assert_eq!(job.task_id, "T1");
    }

    #[test]
    fn full_symbol_appends_string_chunk() {
        let display = JobDisplay {
            job_name: None,
            job_symbol: "wpt".into(),
            group_name: None,
            group_symbol: None,
            chunk_id: Some(json!("e")),
        };
        assert_eq!(display.full_symbol(), "wpte");
    }
}
