//! Phase coordination.
//!
//! The coordinator runs every applicable scenario, in declared order, for
//! the configured phase. A failing scenario is recorded and the run moves
//! on; an unreachable service aborts the rest of the run.
//!
//! ```ignore
//! let config = HarnessConfig::resolve(None, None)?;
//! let coordinator = PhaseCoordinator::new(config, &client);
//! let report = coordinator.run(&scenarios);
//! println!("{report}");
//! ```

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::client::{ServiceClient, ServiceRequest, ServiceResponse};
use crate::config::{HarnessConfig, Phase};
use crate::error::{HarnessError, HarnessResult};
use crate::health;
use crate::migration::{MigrationDetector, MigrationTrigger};
use crate::poller::Poller;
use crate::resolver::{BehaviorDescriptor, Capability, CapabilityTable};
use crate::version::ServiceVersion;

/// One upgrade verification flow, split into the half that runs against the
/// old cluster and the half that runs after the restart.
///
/// The halves run in separate processes: anything the post-upgrade half
/// needs must be re-derived from constants, never stored in `self`.
pub trait Scenario {
    /// Stable name, used for filtering and reporting.
    fn name(&self) -> &str;

    /// One-line summary for listings.
    fn description(&self) -> &str {
        ""
    }

    /// Whether the scenario applies to the originating version.
    /// `Ok(false)` and [`HarnessError::UnsupportedCapability`] both skip it.
    fn applies_to(&self, _ctx: &ScenarioContext<'_>) -> HarnessResult<bool> {
        Ok(true)
    }

    fn pre_upgrade(&self, ctx: &ScenarioContext<'_>) -> HarnessResult<()>;

    fn post_upgrade(&self, ctx: &ScenarioContext<'_>) -> HarnessResult<()>;
}

/// Collaborators handed to each scenario action.
pub struct ScenarioContext<'a> {
    client: &'a dyn ServiceClient,
    config: &'a HarnessConfig,
    capabilities: &'a CapabilityTable,
    detector: MigrationDetector<&'a dyn ServiceClient>,
    trigger: MigrationTrigger<&'a dyn ServiceClient>,
}

impl<'a> ScenarioContext<'a> {
    pub fn new(
        client: &'a dyn ServiceClient,
        config: &'a HarnessConfig,
        capabilities: &'a CapabilityTable,
    ) -> Self {
        ScenarioContext {
            client,
            config,
            capabilities,
            detector: MigrationDetector::new(client),
            trigger: MigrationTrigger::new(client),
        }
    }

    pub fn client(&self) -> &'a dyn ServiceClient {
        self.client
    }

    pub fn config(&self) -> &HarnessConfig {
        self.config
    }

    pub fn phase(&self) -> Phase {
        self.config.phase()
    }

    pub fn origin_version(&self) -> &ServiceVersion {
        self.config.origin_version()
    }

    pub fn capabilities(&self) -> &CapabilityTable {
        self.capabilities
    }

    pub fn detector(&self) -> &MigrationDetector<&'a dyn ServiceClient> {
        &self.detector
    }

    pub fn trigger(&self) -> &MigrationTrigger<&'a dyn ServiceClient> {
        &self.trigger
    }

    /// Behavior as gated by the originating version.
    pub fn resolve(&self, capability: Capability) -> HarnessResult<&BehaviorDescriptor> {
        self.capabilities
            .resolve(capability, self.config.origin_version())
    }

    /// Behavior of the cluster that is running right now: the originating
    /// version before the restart, the newest known version after it.
    pub fn resolve_running(&self, capability: Capability) -> HarnessResult<&BehaviorDescriptor> {
        match self.config.phase() {
            Phase::PreUpgrade => self.resolve(capability),
            Phase::PostUpgrade => self.capabilities.resolve_latest(capability),
        }
    }

    /// A poller with the given interval and timeout.
    pub fn poller(&self, label: &str, interval: Duration, timeout: Duration) -> Poller {
        Poller::new(interval, timeout).labelled(label)
    }

    pub fn call(&self, request: &ServiceRequest) -> HarnessResult<ServiceResponse> {
        tracing::debug!(%request, "calling service");
        let response = self.client.call(request)?;
        tracing::debug!(%request, status = response.status, "service answered");
        Ok(response)
    }

    /// Wait for `target` to reach yellow health with no pending shard work.
    pub fn wait_for_health(&self, target: Option<&str>) -> HarnessResult<()> {
        let params = self.resolve(Capability::HealthWaitParams)?.query_params()?;
        health::wait_for_health(self.client, target, params)
    }
}

/// Result of one scenario in one phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum ScenarioStatus {
    Passed,
    Failed(String),
    Skipped(String),
    /// Not reached because the run was aborted.
    NotRun,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioOutcome {
    pub name: String,
    #[serde(flatten)]
    pub status: ScenarioStatus,
    pub elapsed_ms: u64,
}

/// Aggregated outcome of a coordinator run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub phase: Phase,
    pub origin_version: ServiceVersion,
    pub outcomes: Vec<ScenarioOutcome>,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub not_run: usize,
    pub aborted: Option<String>,
}

impl RunReport {
    fn from_outcomes(
        config: &HarnessConfig,
        outcomes: Vec<ScenarioOutcome>,
        aborted: Option<String>,
    ) -> Self {
        let count = |pred: fn(&ScenarioStatus) -> bool| {
            outcomes.iter().filter(|o| pred(&o.status)).count()
        };
        RunReport {
            phase: config.phase(),
            origin_version: config.origin_version().clone(),
            passed: count(|s| matches!(s, ScenarioStatus::Passed)),
            failed: count(|s| matches!(s, ScenarioStatus::Failed(_))),
            skipped: count(|s| matches!(s, ScenarioStatus::Skipped(_))),
            not_run: count(|s| matches!(s, ScenarioStatus::NotRun)),
            outcomes,
            aborted,
        }
    }

    /// No failures and no abort.
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.aborted.is_none()
    }

    pub fn outcome(&self, name: &str) -> Option<&ScenarioOutcome> {
        self.outcomes.iter().find(|o| o.name == name)
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} run (origin {}): {} passed, {} failed, {} skipped",
            self.phase, self.origin_version, self.passed, self.failed, self.skipped
        )?;
        for o in &self.outcomes {
            match &o.status {
                ScenarioStatus::Passed => writeln!(f, "  PASS {} ({} ms)", o.name, o.elapsed_ms)?,
                ScenarioStatus::Failed(msg) => writeln!(f, "  FAIL {}: {}", o.name, msg)?,
                ScenarioStatus::Skipped(reason) => writeln!(f, "  SKIP {}: {}", o.name, reason)?,
                ScenarioStatus::NotRun => writeln!(f, "  NOT RUN {}", o.name)?,
            }
        }
        if let Some(reason) = &self.aborted {
            writeln!(f, "run aborted: {}", reason)?;
        }
        Ok(())
    }
}

/// Routes each scenario to the half matching the configured phase.
pub struct PhaseCoordinator<'a> {
    config: HarnessConfig,
    client: &'a dyn ServiceClient,
    capabilities: CapabilityTable,
}

impl<'a> PhaseCoordinator<'a> {
    pub fn new(config: HarnessConfig, client: &'a dyn ServiceClient) -> Self {
        PhaseCoordinator {
            config,
            client,
            capabilities: CapabilityTable::standard(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: CapabilityTable) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn context(&self) -> ScenarioContext<'_> {
        ScenarioContext::new(self.client, &self.config, &self.capabilities)
    }

    /// Run the scenarios sequentially in the given order.
    pub fn run(&self, scenarios: &[Box<dyn Scenario>]) -> RunReport {
        let ctx = self.context();
        let phase = self.config.phase();
        let mut outcomes = Vec::with_capacity(scenarios.len());
        let mut aborted: Option<String> = None;

        tracing::info!(
            %phase,
            origin = %self.config.origin_version(),
            scenarios = scenarios.len(),
            "starting run"
        );

        for scenario in scenarios {
            let name = scenario.name().to_string();
            if aborted.is_some() {
                outcomes.push(ScenarioOutcome {
                    name,
                    status: ScenarioStatus::NotRun,
                    elapsed_ms: 0,
                });
                continue;
            }

            let span = tracing::info_span!("scenario", name = %name, %phase);
            let _entered = span.enter();
            let started = Instant::now();

            let result = match scenario.applies_to(&ctx) {
                Ok(false) => Err(Skip(format!(
                    "not applicable to origin version {}",
                    self.config.origin_version()
                ))),
                Err(HarnessError::UnsupportedCapability {
                    capability,
                    version,
                }) => Err(Skip(format!("{} is not available on {}", capability, version))),
                Err(err) => Ok(Err(err)),
                Ok(true) => {
                    tracing::info!("running");
                    Ok(match phase {
                        Phase::PreUpgrade => scenario.pre_upgrade(&ctx),
                        Phase::PostUpgrade => scenario.post_upgrade(&ctx),
                    })
                }
            };

            let status = match result {
                Err(Skip(reason)) => {
                    tracing::info!(%reason, "skipped");
                    ScenarioStatus::Skipped(reason)
                }
                Ok(Ok(())) => {
                    tracing::info!("passed");
                    ScenarioStatus::Passed
                }
                Ok(Err(err)) => {
                    tracing::warn!(error = %err, "failed");
                    if err.aborts_run() {
                        aborted = Some(format!("{}: {}", name, err));
                    }
                    ScenarioStatus::Failed(err.to_string())
                }
            };

            outcomes.push(ScenarioOutcome {
                name,
                status,
                elapsed_ms: started.elapsed().as_millis() as u64,
            });
        }

        let report = RunReport::from_outcomes(&self.config, outcomes, aborted);
        tracing::info!(
            passed = report.passed,
            failed = report.failed,
            skipped = report.skipped,
            aborted = report.aborted.is_some(),
            "run finished"
        );
        report
    }
}

struct Skip(String);
