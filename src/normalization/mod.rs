//! Job normalization: canonical job states and results, derived fields, and
//! the [`NormalizedJob`] record handed to the reconciler.

use std::collections::BTreeSet;
use std::fmt;

use sha1::{Digest, Sha1};

pub mod transformer;

pub use transformer::{TransformError, Transformer};

/// Canonical job state stored for every job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum JobState {
    Pending,
    Running,
    Completed,
}

impl JobState {
    pub const fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed => "completed",
        }
    }

    /// Ordinal used for forward-only transitions.
    pub const fn ordinal(self) -> i16 {
        match self {
            JobState::Pending => 1,
            JobState::Running => 2,
            JobState::Completed => 3,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(JobState::Pending),
            "running" => Some(JobState::Running),
            "completed" => Some(JobState::Completed),
            _ => None,
        }
    }

    /// Map a wire state onto the canonical state. `unscheduled` and unknown
    /// values have no canonical form.
    pub fn from_pulse(state: &str) -> Option<Self> {
        match pulse_state_ordinal(state)? {
            1 => Some(JobState::Pending),
            2 => Some(JobState::Running),
            3 => Some(JobState::Completed),
            _ => None,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordinal of a wire-level state. Terminal outcome states all collapse to
/// `completed`.
pub fn pulse_state_ordinal(state: &str) -> Option<i16> {
    match state {
        "unscheduled" => Some(0),
        "pending" => Some(1),
        "running" => Some(2),
        "completed" | "success" | "fail" | "exception" | "canceled" => Some(3),
        _ => None,
    }
}

/// Canonical job result, only defined for completed jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobResult {
    Success,
    TestFailed,
    Busted,
    Exception,
    UserCancel,
    Retry,
    Unknown,
}

impl JobResult {
    pub const fn as_str(self) -> &'static str {
        match self {
            JobResult::Success => "success",
            JobResult::TestFailed => "testfailed",
            JobResult::Busted => "busted",
            JobResult::Exception => "exception",
            JobResult::UserCancel => "usercancel",
            JobResult::Retry => "retry",
            JobResult::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(JobResult::Success),
            "testfailed" => Some(JobResult::TestFailed),
            "busted" => Some(JobResult::Busted),
            "exception" => Some(JobResult::Exception),
            "usercancel" => Some(JobResult::UserCancel),
            "retry" => Some(JobResult::Retry),
            "unknown" => Some(JobResult::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for JobResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `jobKind` of a Pulse job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Build,
    Test,
    Other,
}

impl JobKind {
    pub fn parse(value: &str) -> Self {
        match value {
            "build" => JobKind::Build,
            "test" => JobKind::Test,
            _ => JobKind::Other,
        }
    }
}

/// Derive the canonical result for a job entering `completed`.
///
/// `raw` is the message's `result` field, or the terminal `state` value when
/// the message carries no result.
pub fn derive_result(kind: JobKind, raw: &str, is_retried: bool) -> JobResult {
    if is_retried {
        return JobResult::Retry;
    }
    match (raw, kind) {
        ("success", _) => JobResult::Success,
        ("fail", JobKind::Build) => JobResult::Busted,
        ("fail", _) => JobResult::TestFailed,
        ("exception", _) => JobResult::Exception,
        ("canceled", _) => JobResult::UserCancel,
        _ => JobResult::Unknown,
    }
}

/// Hex SHA-1 over the sorted, de-duplicated option names concatenated with
/// no separator.
pub fn option_collection_hash<I, S>(names: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let sorted: BTreeSet<String> = names
        .into_iter()
        .map(|name| name.as_ref().to_string())
        .collect();
    let mut hasher = Sha1::new();
    for name in &sorted {
        hasher.update(name.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Log parse status recorded with each log reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    Pending,
    Parsed,
}

impl ParseStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            ParseStatus::Pending => "pending",
            ParseStatus::Parsed => "parsed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogReference {
    pub name: String,
    pub url: String,
    pub parse_status: ParseStatus,
}

/// A Pulse job after validation, derivation and reference resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedJob {
    pub job_guid: String,
    pub project: String,
    pub repository_id: i32,
    pub revision: String,
    pub name: String,
    pub symbol: String,
    pub group_name: String,
    pub group_symbol: String,
    pub state: JobState,
    /// `Some` iff `state == Completed`.
    pub result: Option<JobResult>,
    pub submit_timestamp: Option<i64>,
    pub start_timestamp: Option<i64>,
    pub end_timestamp: Option<i64>,
    pub build_platform_id: i32,
    pub machine_platform_id: i32,
    pub machine_id: i32,
    pub option_collection_hash: String,
    pub product_id: i32,
    pub job_type_id: i32,
    pub log_references: Vec<LogReference>,
    pub coalesced_guids: Vec<String>,
    pub tier: i16,
    pub reason: String,
    pub who: String,
    pub build_system_type: String,
}

impl NormalizedJob {
    /// Latest timestamp carried by the job, used to advance the machine's
    /// `last_timestamp`.
    pub fn latest_timestamp(&self) -> Option<i64> {
        [
            self.submit_timestamp,
            self.start_timestamp,
            self.end_timestamp,
        ]
        .into_iter()
        .flatten()
        .max()
    }
}
