//! Originating service version.
//!
//! Versions are `MAJOR.MINOR.PATCH` with an optional pre-release qualifier
//! (`6.0.0-alpha1`) that sorts below the plain release. A trailing
//! `-SNAPSHOT` marker is accepted and ignored.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};

use crate::error::HarnessError;

/// Version of the cluster *before* the upgrade under test.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub pre_release: Option<String>,
}

impl ServiceVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        ServiceVersion {
            major,
            minor,
            patch,
            pre_release: None,
        }
    }

    pub fn with_pre_release(mut self, qualifier: &str) -> Self {
        self.pre_release = Some(qualifier.to_string());
        self
    }

    /// Lowest representable version, used as the floor of capability tables.
    pub const fn zero() -> Self {
        ServiceVersion::new(0, 0, 0)
    }

    pub fn on_or_after(&self, other: &ServiceVersion) -> bool {
        self >= other
    }

    pub fn before(&self, other: &ServiceVersion) -> bool {
        self < other
    }
}

impl Ord for ServiceVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| match (&self.pre_release, &other.pre_release) {
                (None, None) => Ordering::Equal,
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some(a), Some(b)) => compare_qualifiers(a, b),
            })
    }
}

/// Qualifiers compare identifier by identifier (`.`-separated). Inside an
/// identifier, digit runs compare as numbers and sort below letter runs, so
/// `alpha2 < alpha10 < beta1`.
fn compare_qualifiers(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return a.cmp(b),
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let ord = compare_runs(x, y);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

fn compare_runs(a: &str, b: &str) -> Ordering {
    let (left, right) = (runs(a), runs(b));
    for (x, y) in left.iter().zip(right.iter()) {
        let ord = match (x, y) {
            (Run::Number(x), Run::Number(y)) => x.cmp(y),
            (Run::Number(_), Run::Text(_)) => Ordering::Less,
            (Run::Text(_), Run::Number(_)) => Ordering::Greater,
            (Run::Text(x), Run::Text(y)) => x.cmp(y),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    left.len().cmp(&right.len())
}

enum Run<'a> {
    Number(u64),
    Text(&'a str),
}

fn runs(identifier: &str) -> Vec<Run<'_>> {
    let mut out = Vec::new();
    let mut start = 0;
    let bytes = identifier.as_bytes();
    while start < bytes.len() {
        let digits = bytes[start].is_ascii_digit();
        let end = bytes[start..]
            .iter()
            .position(|b| b.is_ascii_digit() != digits)
            .map_or(bytes.len(), |offset| start + offset);
        let run = &identifier[start..end];
        out.push(match run.parse::<u64>() {
            Ok(n) if digits => Run::Number(n),
            _ => Run::Text(run),
        });
        start = end;
    }
    out
}

impl PartialOrd for ServiceVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ServiceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.pre_release {
            write!(f, "-{}", pre)?;
        }
        Ok(())
    }
}

impl Serialize for ServiceVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl FromStr for ServiceVersion {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let trimmed = trimmed.strip_suffix("-SNAPSHOT").unwrap_or(trimmed);
        let (numbers, pre_release) = match trimmed.split_once('-') {
            Some((numbers, qualifier)) if !qualifier.is_empty() => {
                (numbers, Some(qualifier.to_string()))
            }
            Some(_) => {
                return Err(HarnessError::config(format!(
                    "invalid version '{}': empty qualifier",
                    s
                )))
            }
            None => (trimmed, None),
        };

        let parts: Vec<&str> = numbers.split('.').collect();
        if parts.len() != 3 {
            return Err(HarnessError::config(format!(
                "invalid version '{}': expected MAJOR.MINOR.PATCH",
                s
            )));
        }
        let component = |part: &str| {
            part.parse::<u32>().map_err(|_| {
                HarnessError::config(format!(
                    "invalid version '{}': '{}' is not a number",
                    s, part
                ))
            })
        };

        Ok(ServiceVersion {
            major: component(parts[0])?,
            minor: component(parts[1])?,
            patch: component(parts[2])?,
            pre_release,
        })
    }
}
