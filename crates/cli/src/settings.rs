//! Settings file for `rollcheck run`.
//!
//! Every key is optional; omitted keys fall back to the defaults below.
//!
//! # Example
//!
//! ```toml
//! [service]
//! url = "http://127.0.0.1:9200"
//! username = "test_user"
//! password = "x-pack-test-password"
//! timeout_secs = 90
//!
//! [job_persistence]
//! accepted_states = ["started", "indexing"]
//! poll_interval_ms = 1000
//! poll_timeout_secs = 30
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use rollcheck_scenarios::{JobState, ScenarioSettings};
use serde::{Deserialize, Serialize};

pub const DEFAULT_URL: &str = "http://127.0.0.1:9200";
pub const USERNAME_ENV: &str = "ROLLCHECK_USERNAME";
pub const PASSWORD_ENV: &str = "ROLLCHECK_PASSWORD";

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// The settings file could not be read.
    #[error("could not read '{}': {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The settings file is not valid TOML for this schema.
    #[error("could not parse '{}': {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// Parsed, but the values make no sense.
    #[error("invalid settings: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub service: ServiceSettings,
    pub job_persistence: JobPersistenceSettings,
}

/// `[service]`: where the cluster is and how to log in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceSettings {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Per-request timeout. Health waits block server side, so keep this
    /// comfortably above a minute.
    pub timeout_secs: u64,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        ServiceSettings {
            url: DEFAULT_URL.to_string(),
            username: Some("test_user".to_string()),
            password: Some("x-pack-test-password".to_string()),
            timeout_secs: 90,
        }
    }
}

/// `[job_persistence]`: polling of the background job scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobPersistenceSettings {
    pub accepted_states: Vec<JobState>,
    pub poll_interval_ms: u64,
    pub poll_timeout_secs: u64,
}

impl Default for JobPersistenceSettings {
    fn default() -> Self {
        let defaults = ScenarioSettings::default();
        JobPersistenceSettings {
            accepted_states: defaults.accepted_job_states,
            poll_interval_ms: defaults.poll_interval.as_millis() as u64,
            poll_timeout_secs: defaults.poll_timeout.as_secs(),
        }
    }
}

impl Settings {
    /// Load `path`, or the defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Settings, SettingsError> {
        let Some(path) = path else {
            return Ok(Settings::default());
        };
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Let credentials come from the environment instead of the file.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(username) = lookup(USERNAME_ENV) {
            self.service.username = Some(username);
        }
        if let Some(password) = lookup(PASSWORD_ENV) {
            self.service.password = Some(password);
        }
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if !self.service.url.starts_with("http://") && !self.service.url.starts_with("https://") {
            return Err(SettingsError::Invalid(format!(
                "service.url must be an http(s) URL, got '{}'",
                self.service.url
            )));
        }
        if self.service.timeout_secs == 0 {
            return Err(SettingsError::Invalid("service.timeout_secs must be positive".into()));
        }
        let job = &self.job_persistence;
        if job.accepted_states.is_empty() {
            return Err(SettingsError::Invalid(
                "job_persistence.accepted_states must not be empty".into(),
            ));
        }
        if job.accepted_states.contains(&JobState::Unknown) {
            return Err(SettingsError::Invalid(
                "job_persistence.accepted_states cannot accept 'unknown'".into(),
            ));
        }
        if job.poll_interval_ms == 0 || job.poll_timeout_secs == 0 {
            return Err(SettingsError::Invalid(
                "job_persistence poll interval and timeout must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn scenario_settings(&self) -> ScenarioSettings {
        ScenarioSettings {
            accepted_job_states: self.job_persistence.accepted_states.clone(),
            poll_interval: Duration::from_millis(self.job_persistence.poll_interval_ms),
            poll_timeout: Duration::from_secs(self.job_persistence.poll_timeout_secs),
        }
    }
}
