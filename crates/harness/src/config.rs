//! Process-boundary inputs: which half of the upgrade is running and which
//! version the cluster started on. Both are read once and never change.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::HarnessError;
use crate::version::ServiceVersion;

/// Environment variable holding the execution phase.
pub const PHASE_ENV: &str = "ROLLCHECK_PHASE";
/// Environment variable holding the originating cluster version.
pub const ORIGIN_VERSION_ENV: &str = "ROLLCHECK_ORIGIN_VERSION";

/// Which half of the restart scenario this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    /// Running against the old cluster, before the restart.
    PreUpgrade,
    /// Running against the cluster restarted on the new version.
    PostUpgrade,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::PreUpgrade => write!(f, "pre-upgrade"),
            Phase::PostUpgrade => write!(f, "post-upgrade"),
        }
    }
}

impl FromStr for Phase {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pre-upgrade" | "pre_upgrade" | "old" => Ok(Phase::PreUpgrade),
            "post-upgrade" | "post_upgrade" | "new" | "upgraded" => Ok(Phase::PostUpgrade),
            other => Err(HarnessError::config(format!(
                "unknown phase '{}' (expected pre-upgrade or post-upgrade)",
                other
            ))),
        }
    }
}

/// Immutable run configuration threaded through the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HarnessConfig {
    phase: Phase,
    origin_version: ServiceVersion,
}

impl HarnessConfig {
    pub fn new(phase: Phase, origin_version: ServiceVersion) -> Self {
        HarnessConfig {
            phase,
            origin_version,
        }
    }

    /// Build the configuration from explicit values, falling back to
    /// `ROLLCHECK_PHASE` / `ROLLCHECK_ORIGIN_VERSION` for anything missing.
    pub fn resolve(
        phase: Option<Phase>,
        origin_version: Option<ServiceVersion>,
    ) -> Result<Self, HarnessError> {
        Self::resolve_with(phase, origin_version, |key| std::env::var(key).ok())
    }

    /// Same as [`HarnessConfig::resolve`] with an injectable variable lookup.
    pub fn resolve_with<F>(
        phase: Option<Phase>,
        origin_version: Option<ServiceVersion>,
        lookup: F,
    ) -> Result<Self, HarnessError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let phase = match phase {
            Some(p) => p,
            None => lookup(PHASE_ENV)
                .ok_or_else(|| {
                    HarnessError::config(format!("phase not given and {} is not set", PHASE_ENV))
                })?
                .parse()?,
        };
        let origin_version = match origin_version {
            Some(v) => v,
            None => lookup(ORIGIN_VERSION_ENV)
                .ok_or_else(|| {
                    HarnessError::config(format!(
                        "origin version not given and {} is not set",
                        ORIGIN_VERSION_ENV
                    ))
                })?
                .parse()?,
        };
        Ok(HarnessConfig::new(phase, origin_version))
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn origin_version(&self) -> &ServiceVersion {
        &self.origin_version
    }

    pub fn is_pre_upgrade(&self) -> bool {
        self.phase == Phase::PreUpgrade
    }
}
