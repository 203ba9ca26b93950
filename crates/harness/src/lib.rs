//! Two-phase upgrade verification.
//!
//! Scenarios seed state against a cluster on the old version, the cluster
//! is restarted on the new version, and the same scenarios verify that the
//! state survived. This crate holds the pieces every scenario shares:
//!
//! - [`resolver`]: version-gated behavior lookup
//! - [`poller`]: bounded retry until an observed state converges
//! - [`migration`]: detection and triggering of upgrade migrations
//! - [`coordinator`]: phase routing and the run report

pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod health;
pub mod json;
pub mod migration;
pub mod poller;
pub mod resolver;
pub mod version;

#[cfg(test)]
mod test_support;

pub use client::{Method, ServiceClient, ServiceRequest, ServiceResponse};
pub use config::{HarnessConfig, Phase, ORIGIN_VERSION_ENV, PHASE_ENV};
pub use coordinator::{
    PhaseCoordinator, RunReport, Scenario, ScenarioContext, ScenarioOutcome, ScenarioStatus,
};
pub use error::{HarnessError, HarnessResult};
pub use migration::{
    MigrationDetector, MigrationLedger, MigrationOutcome, MigrationStatus, MigrationTrigger,
    ResourceKind, ResourceRef,
};
pub use poller::{await_convergence, Poll, Poller};
pub use resolver::{BehaviorDescriptor, Capability, CapabilityEntry, CapabilityTable};
pub use version::ServiceVersion;
