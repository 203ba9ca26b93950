//! Version-gated behavior resolution.
//!
//! Every "if the old cluster is before/after X" decision lives in one
//! [`CapabilityTable`]. Resolution picks the newest entry whose `since`
//! version is at or below the queried version; a version below every entry
//! for a capability is [`HarnessError::UnsupportedCapability`].

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::{HarnessError, HarnessResult};
use crate::version::ServiceVersion;

/// A behavior whose shape depends on the service version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    /// Name of the state field inside persisted background-task records.
    PersistentTaskStateField,
    /// Parameters for a health query that waits for pending work to settle.
    HealthWaitParams,
    /// Long-running background jobs (rollup) exist at all.
    BackgroundJobs,
    /// Indices may carry more than one mapping type.
    MultiTypeIndices,
    /// The migration assistance / upgrade API exists.
    MigrationAssistance,
}

impl Capability {
    pub const ALL: [Capability; 5] = [
        Capability::PersistentTaskStateField,
        Capability::HealthWaitParams,
        Capability::BackgroundJobs,
        Capability::MultiTypeIndices,
        Capability::MigrationAssistance,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Capability::PersistentTaskStateField => "persistent-task-state-field",
            Capability::HealthWaitParams => "health-wait-params",
            Capability::BackgroundJobs => "background-jobs",
            Capability::MultiTypeIndices => "multi-type-indices",
            Capability::MigrationAssistance => "migration-assistance",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Capability {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Capability::ALL
            .into_iter()
            .find(|c| c.name() == s)
            .ok_or_else(|| {
                let known: Vec<&str> = Capability::ALL.iter().map(|c| c.name()).collect();
                HarnessError::config(format!(
                    "unknown capability '{}' (known: {})",
                    s,
                    known.join(", ")
                ))
            })
    }
}

/// What a capability looks like on a given version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BehaviorDescriptor {
    FieldName { name: String },
    QueryParams { params: Vec<(String, String)> },
    Supported,
    /// The capability existed on older versions and was removed here.
    Removed,
}

impl BehaviorDescriptor {
    pub fn field(name: &str) -> Self {
        BehaviorDescriptor::FieldName {
            name: name.to_string(),
        }
    }

    pub fn params(pairs: &[(&str, &str)]) -> Self {
        BehaviorDescriptor::QueryParams {
            params: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    pub fn field_name(&self) -> HarnessResult<&str> {
        match self {
            BehaviorDescriptor::FieldName { name } => Ok(name),
            other => Err(HarnessError::fatal(format!(
                "expected a field-name behavior, got {}",
                other
            ))),
        }
    }

    pub fn query_params(&self) -> HarnessResult<&[(String, String)]> {
        match self {
            BehaviorDescriptor::QueryParams { params } => Ok(params),
            other => Err(HarnessError::fatal(format!(
                "expected a query-params behavior, got {}",
                other
            ))),
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, BehaviorDescriptor::Removed)
    }
}

impl fmt::Display for BehaviorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BehaviorDescriptor::FieldName { name } => write!(f, "field '{}'", name),
            BehaviorDescriptor::QueryParams { params } => {
                let rendered: Vec<String> =
                    params.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                write!(f, "params [{}]", rendered.join(", "))
            }
            BehaviorDescriptor::Supported => write!(f, "supported"),
            BehaviorDescriptor::Removed => write!(f, "removed"),
        }
    }
}

/// One row of the table: from `since` onward, `capability` behaves as
/// `descriptor` (until a newer row for the same capability takes over).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapabilityEntry {
    pub capability: Capability,
    pub since: ServiceVersion,
    pub descriptor: BehaviorDescriptor,
}

/// Data-driven version gates.
#[derive(Debug, Clone, Default)]
pub struct CapabilityTable {
    entries: Vec<CapabilityEntry>,
}

impl CapabilityTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(
        mut self,
        capability: Capability,
        since: ServiceVersion,
        descriptor: BehaviorDescriptor,
    ) -> Self {
        self.entries.push(CapabilityEntry {
            capability,
            since,
            descriptor,
        });
        self
    }

    /// The gates known for the service this harness targets.
    pub fn standard() -> Self {
        let base_health = [
            ("wait_for_status", "yellow"),
            ("wait_for_no_relocating_shards", "true"),
        ];
        let full_health = [
            ("wait_for_status", "yellow"),
            ("wait_for_no_relocating_shards", "true"),
            ("wait_for_no_initializing_shards", "true"),
        ];

        CapabilityTable::new()
            // Persistent task state field was renamed in 6.4.0.
            .with_entry(
                Capability::PersistentTaskStateField,
                ServiceVersion::zero(),
                BehaviorDescriptor::field("status"),
            )
            .with_entry(
                Capability::PersistentTaskStateField,
                ServiceVersion::new(6, 4, 0),
                BehaviorDescriptor::field("state"),
            )
            .with_entry(
                Capability::HealthWaitParams,
                ServiceVersion::zero(),
                BehaviorDescriptor::params(&base_health),
            )
            .with_entry(
                Capability::HealthWaitParams,
                ServiceVersion::new(6, 2, 0),
                BehaviorDescriptor::params(&full_health),
            )
            .with_entry(
                Capability::BackgroundJobs,
                ServiceVersion::new(6, 3, 0),
                BehaviorDescriptor::Supported,
            )
            .with_entry(
                Capability::MultiTypeIndices,
                ServiceVersion::zero(),
                BehaviorDescriptor::Supported,
            )
            .with_entry(
                Capability::MultiTypeIndices,
                ServiceVersion::new(6, 0, 0).with_pre_release("alpha1"),
                BehaviorDescriptor::Removed,
            )
            .with_entry(
                Capability::MigrationAssistance,
                ServiceVersion::new(5, 6, 0),
                BehaviorDescriptor::Supported,
            )
    }

    pub fn entries(&self) -> &[CapabilityEntry] {
        &self.entries
    }

    /// The newest entry for `capability` whose `since` is at or below `version`.
    pub fn resolve_entry(
        &self,
        capability: Capability,
        version: &ServiceVersion,
    ) -> HarnessResult<&CapabilityEntry> {
        self.entries
            .iter()
            .filter(|e| e.capability == capability && e.since <= *version)
            .max_by(|a, b| a.since.cmp(&b.since))
            .ok_or_else(|| HarnessError::UnsupportedCapability {
                capability,
                version: version.clone(),
            })
    }

    pub fn resolve(
        &self,
        capability: Capability,
        version: &ServiceVersion,
    ) -> HarnessResult<&BehaviorDescriptor> {
        self.resolve_entry(capability, version).map(|e| &e.descriptor)
    }

    /// The newest behavior known for `capability`, i.e. what the upgraded
    /// cluster does.
    pub fn resolve_latest(&self, capability: Capability) -> HarnessResult<&BehaviorDescriptor> {
        self.entries
            .iter()
            .filter(|e| e.capability == capability)
            .max_by(|a, b| a.since.cmp(&b.since))
            .map(|e| &e.descriptor)
            .ok_or(HarnessError::UnsupportedCapability {
                capability,
                version: ServiceVersion::zero(),
            })
    }

    /// `Ok(true)` when the capability resolves to anything but
    /// [`BehaviorDescriptor::Removed`].
    pub fn is_supported(
        &self,
        capability: Capability,
        version: &ServiceVersion,
    ) -> HarnessResult<bool> {
        self.resolve(capability, version).map(|d| d.is_supported())
    }
}
