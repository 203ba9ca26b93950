//! Background job state as reported by the service.

use std::fmt;
use std::str::FromStr;

use rollcheck_harness::{json, HarnessError, HarnessResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle state of a background job. Anything the harness does not
/// recognise is kept as `Unknown` so it can be reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Unknown,
    Stopped,
    Started,
    Indexing,
}

impl JobState {
    pub fn parse(raw: &str) -> JobState {
        match raw {
            "stopped" => JobState::Stopped,
            "started" => JobState::Started,
            "indexing" => JobState::Indexing,
            _ => JobState::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Unknown => "unknown",
            JobState::Stopped => "stopped",
            JobState::Started => "started",
            JobState::Indexing => "indexing",
        }
    }

    /// Read a `job_state` string at `path`. A missing or non-string value is
    /// a shape error.
    pub fn at(value: &Value, path: &str) -> HarnessResult<JobState> {
        json::require_str(value, path).map(JobState::parse)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match JobState::parse(&s.to_ascii_lowercase()) {
            JobState::Unknown if !s.eq_ignore_ascii_case("unknown") => Err(HarnessError::config(
                format!("unknown job state '{}' (expected stopped, started or indexing)", s),
            )),
            state => Ok(state),
        }
    }
}

/// A persistent task entry from the cluster state metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PersistentTaskRecord {
    pub id: String,
    pub state_field_name: String,
    pub state_value: JobState,
}

impl PersistentTaskRecord {
    /// Find task `id` in a `GET /_cluster/state/metadata` body and read its
    /// job state from `task.<task_type>.<state_field>.job_state`.
    ///
    /// `Ok(None)` when the task is not (yet) listed.
    pub fn find(
        cluster_state: &Value,
        task_type: &str,
        id: &str,
        state_field: &str,
    ) -> HarnessResult<Option<PersistentTaskRecord>> {
        let tasks = json::require(cluster_state, "metadata.persistent_tasks.tasks")?
            .as_array()
            .ok_or_else(|| HarnessError::fatal("metadata.persistent_tasks.tasks is not an array"))?;

        let Some(task) = tasks
            .iter()
            .find(|t| t.get("id").and_then(Value::as_str) == Some(id))
        else {
            return Ok(None);
        };

        let path = format!("task.{}.{}.job_state", task_type, state_field);
        let state_value = JobState::at(task, &path).map_err(|_| {
            HarnessError::fatal(format!(
                "expected field [{}] in persistent task {}: {}",
                path, id, task
            ))
        })?;
        Ok(Some(PersistentTaskRecord {
            id: id.to_string(),
            state_field_name: state_field.to_string(),
            state_value,
        }))
    }
}
