//! Full-restart upgrade scenarios.
//!
//! Each scenario seeds state in the pre-upgrade phase and checks it in the
//! post-upgrade phase. Resource names are constants so the second process
//! can find what the first one created.

use std::time::Duration;

use rollcheck_harness::Scenario;

mod checks;
pub mod incompatible_index;
pub mod job_persistence;
pub mod job_state;
pub mod security_store;
pub mod single_doc;
pub mod watcher;

pub use incompatible_index::IncompatibleIndexScenario;
pub use job_persistence::JobPersistenceScenario;
pub use job_state::{JobState, PersistentTaskRecord};
pub use security_store::SecurityStoreScenario;
pub use single_doc::SingleDocScenario;
pub use watcher::WatcherScenario;

/// Tunables for the scenarios that poll.
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioSettings {
    /// Job states that count as "running" once the job has converged.
    pub accepted_job_states: Vec<JobState>,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
}

impl Default for ScenarioSettings {
    fn default() -> Self {
        ScenarioSettings {
            accepted_job_states: vec![JobState::Started, JobState::Indexing],
            poll_interval: Duration::from_secs(1),
            poll_timeout: Duration::from_secs(30),
        }
    }
}

/// The standard suite, in run order.
pub fn standard_scenarios(settings: &ScenarioSettings) -> Vec<Box<dyn Scenario>> {
    vec![
        Box::new(SingleDocScenario),
        Box::new(SecurityStoreScenario),
        Box::new(WatcherScenario::new(settings.poll_interval, settings.poll_timeout)),
        Box::new(JobPersistenceScenario::new(settings.clone())),
        Box::new(IncompatibleIndexScenario),
    ]
}

/// Names of the standard suite, in run order.
pub fn scenario_names() -> Vec<String> {
    standard_scenarios(&ScenarioSettings::default())
        .iter()
        .map(|s| s.name().to_string())
        .collect()
}
