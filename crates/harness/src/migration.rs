//! Migration assistance: detect which resources need an upgrade and trigger
//! the upgrade idempotently.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use serde_json::Value;

use crate::client::{ServiceClient, ServiceRequest};
use crate::error::{HarnessError, HarnessResult};
use crate::json;

/// Detection query endpoint.
pub const ASSISTANCE_PATH: &str = "/_xpack/migration/assistance";
/// Prefix of the per-resource upgrade command.
pub const UPGRADE_PATH: &str = "/_xpack/migration/upgrade";

/// What kind of resource a [`ResourceRef`] names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Index,
}

impl ResourceKind {
    /// Key of the detection-response section listing this kind.
    fn section(&self) -> &'static str {
        match self {
            ResourceKind::Index => "indices",
        }
    }
}

/// Stable logical identifier of a migratable resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ResourceRef {
    pub name: String,
    pub kind: ResourceKind,
}

impl ResourceRef {
    pub fn index(name: impl Into<String>) -> Self {
        ResourceRef {
            name: name.into(),
            kind: ResourceKind::Index,
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ResourceKind::Index => write!(f, "index [{}]", self.name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    NotRequired,
    Required,
    InProgress,
    Completed,
}

impl MigrationStatus {
    /// Parse a detection `action_required` value.
    pub fn from_action(action: &str) -> Option<Self> {
        match action {
            "upgrade" | "reindex" => Some(MigrationStatus::Required),
            "in_progress" => Some(MigrationStatus::InProgress),
            "none" | "not_applicable" => Some(MigrationStatus::NotRequired),
            _ => None,
        }
    }

    pub fn needs_migration(&self) -> bool {
        *self == MigrationStatus::Required
    }

    /// True when the resource is already in the current format.
    pub fn is_current(&self) -> bool {
        matches!(self, MigrationStatus::NotRequired | MigrationStatus::Completed)
    }

    fn progress(&self) -> u8 {
        match self {
            MigrationStatus::Required => 0,
            MigrationStatus::InProgress => 1,
            MigrationStatus::NotRequired | MigrationStatus::Completed => 2,
        }
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MigrationStatus::NotRequired => "not required",
            MigrationStatus::Required => "required",
            MigrationStatus::InProgress => "in progress",
            MigrationStatus::Completed => "completed",
        };
        f.write_str(s)
    }
}

/// Queries the service for resources that still need migrating.
pub struct MigrationDetector<C> {
    client: C,
}

impl<C: ServiceClient> MigrationDetector<C> {
    pub fn new(client: C) -> Self {
        MigrationDetector { client }
    }

    /// Classify each requested resource with one detection query.
    ///
    /// A resource the service does not list is up to date and reported as
    /// [`MigrationStatus::Completed`].
    pub fn detect(
        &self,
        resources: &[ResourceRef],
    ) -> HarnessResult<BTreeMap<ResourceRef, MigrationStatus>> {
        let response = self.client.call(&ServiceRequest::get(ASSISTANCE_PATH))?;
        let body = response.success_json("migration assistance")?;
        tracing::debug!(response = %body, "migration assistance");

        let mut statuses = BTreeMap::new();
        for resource in resources {
            let section = json::require(&body, resource.kind.section())?
                .as_object()
                .ok_or_else(|| {
                    HarnessError::fatal(format!(
                        "migration assistance field '{}' is not an object",
                        resource.kind.section()
                    ))
                })?;
            let status = match section.get(&resource.name) {
                None => MigrationStatus::Completed,
                Some(entry) => parse_entry(resource, entry)?,
            };
            statuses.insert(resource.clone(), status);
        }
        Ok(statuses)
    }

    /// Status of a single resource.
    pub fn status_of(&self, resource: &ResourceRef) -> HarnessResult<MigrationStatus> {
        let statuses = self.detect(std::slice::from_ref(resource))?;
        Ok(statuses
            .get(resource)
            .copied()
            .unwrap_or(MigrationStatus::Completed))
    }
}

fn parse_entry(resource: &ResourceRef, entry: &Value) -> HarnessResult<MigrationStatus> {
    let action = json::require_str(entry, "action_required")?;
    MigrationStatus::from_action(action).ok_or_else(|| {
        HarnessError::fatal(format!(
            "unrecognized action_required '{}' for {}",
            action, resource
        ))
    })
}

/// Success outcomes of a migration command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MigrationOutcome {
    /// The command converted this many items.
    PerformedWork(u64),
    /// The resource was already current; nothing happened.
    NoOpAlreadyCurrent,
}

/// Issues migration commands. Safe to call on already migrated resources.
pub struct MigrationTrigger<C> {
    client: C,
}

impl<C: ServiceClient> MigrationTrigger<C> {
    pub fn new(client: C) -> Self {
        MigrationTrigger { client }
    }

    pub fn migrate(&self, resource: &ResourceRef) -> HarnessResult<MigrationOutcome> {
        let request = ServiceRequest::post(format!("{}/{}", UPGRADE_PATH, resource.name))
            .param("error_trace", "true");
        let response = self.client.call(&request)?;
        let failed = |message: String| HarnessError::MigrationFailed {
            resource: resource.to_string(),
            message,
        };

        if !response.is_success() {
            // Some versions refuse to upgrade an index that is already
            // current; confirm with a detection query before failing.
            let status = match MigrationDetector::new(&self.client).status_of(resource) {
                Ok(status) => status,
                Err(e) if e.aborts_run() => return Err(e),
                Err(e) => {
                    return Err(failed(format!(
                        "status {} and the follow-up detection failed ({}): {}",
                        response.status, e, response.body
                    )))
                }
            };
            if status.is_current() {
                tracing::info!(%resource, http_status = response.status, "already current");
                return Ok(MigrationOutcome::NoOpAlreadyCurrent);
            }
            return Err(failed(format!(
                "status {} (resource still {}): {}",
                response.status, status, response.body
            )));
        }

        let body = response
            .json()
            .map_err(|e| failed(format!("unreadable upgrade response: {}", e)))?;
        let timed_out = json::require_bool(&body, "timed_out")
            .map_err(|e| failed(e.to_string()))?;
        if timed_out {
            return Err(failed(format!("upgrade timed out: {}", body)));
        }
        let total = json::require_u64(&body, "total").map_err(|e| failed(e.to_string()))?;

        let outcome = if total == 0 {
            MigrationOutcome::NoOpAlreadyCurrent
        } else {
            MigrationOutcome::PerformedWork(total)
        };
        tracing::info!(%resource, ?outcome, "migration command finished");
        Ok(outcome)
    }
}

/// Tracks statuses observed during one post-upgrade run and rejects any
/// that move backwards.
#[derive(Debug, Default)]
pub struct MigrationLedger {
    observed: BTreeMap<ResourceRef, MigrationStatus>,
}

impl MigrationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, resource: &ResourceRef, status: MigrationStatus) -> HarnessResult<()> {
        if let Some(previous) = self.observed.get(resource) {
            if status.progress() < previous.progress() {
                return Err(HarnessError::fatal(format!(
                    "migration status of {} regressed from {} to {}",
                    resource, previous, status
                )));
            }
        }
        self.observed.insert(resource.clone(), status);
        Ok(())
    }

    pub fn record_all(&mut self, statuses: &BTreeMap<ResourceRef, MigrationStatus>) -> HarnessResult<()> {
        statuses
            .iter()
            .try_for_each(|(resource, status)| self.record(resource, *status))
    }

    pub fn status(&self, resource: &ResourceRef) -> Option<MigrationStatus> {
        self.observed.get(resource).copied()
    }
}
