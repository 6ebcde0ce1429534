//! Shared types for the node-port-local agent: the port-range/endpoint/mapping
//! vocabulary used by every other `npl-*` crate.
#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use std::{fmt, str::FromStr};

/// A port on the node's IP that receives external traffic for a pod endpoint.
///
/// Newtype instead of a bare `u16` so that host ports and container ports
/// can't be swapped at a call site by accident.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct HostPort(pub u16);

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<u16> for HostPort {
    fn from(p: u16) -> Self {
        Self(p)
    }
}

/// A `(podIP, containerPort)` pair declared by a pod's containers: the unit
/// of demand the reconciler derives from pod state.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct PodEndpoint {
    pub pod_ip: String,
    pub pod_port: u16,
}

impl PodEndpoint {
    pub fn new(pod_ip: impl Into<String>, pod_port: u16) -> Self {
        Self {
            pod_ip: pod_ip.into(),
            pod_port,
        }
    }
}

/// Lifecycle state of a [`Mapping`].
///
/// `Active` iff the `RuleDriver` has confirmed the rule; `Pending` between
/// allocation and driver acknowledgement; `Failed` when the driver rejected
/// the install and the mapping is retained only for diagnostics.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MappingState {
    Pending,
    Active,
    Failed,
}

/// An entry in the port table: the correspondence between one host port and
/// one pod endpoint.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Mapping {
    pub host_port: HostPort,
    pub pod_ip: String,
    pub pod_port: u16,
    pub state: MappingState,
}

impl Mapping {
    pub fn endpoint(&self) -> PodEndpoint {
        PodEndpoint::new(self.pod_ip.clone(), self.pod_port)
    }

    /// The `<ip>:<port>` destination string used by the rule driver.
    pub fn destination(&self) -> String {
        format!("{}:{}", self.pod_ip, self.pod_port)
    }
}

/// The configured, inclusive `[start, end]` host-port range, parsed from the
/// `PORTS_RANGE` environment variable (format `"<start>-<end>"`).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("PORTS_RANGE must have the form \"<start>-<end>\", got {0:?}")]
    MalformedRange(String),
    #[error("PORTS_RANGE bounds must be valid u16 port numbers: {0:?}")]
    InvalidPort(String),
    #[error("PORTS_RANGE start ({start}) must be <= end ({end})")]
    InvertedRange { start: u16, end: u16 },
}

impl FromStr for PortRange {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| ConfigError::MalformedRange(s.to_string()))?;
        let start: u16 = start
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidPort(s.to_string()))?;
        let end: u16 = end
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidPort(s.to_string()))?;
        if start > end {
            return Err(ConfigError::InvertedRange { start, end });
        }
        Ok(Self { start, end })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_range() {
        let r: PortRange = "40000-40001".parse().unwrap();
        assert_eq!(r, PortRange { start: 40000, end: 40001 });
    }

    #[test]
    fn single_port_range_is_valid() {
        let r: PortRange = "40000-40000".parse().unwrap();
        assert_eq!(r.iter().collect::<Vec<_>>(), vec![40000]);
    }

    #[test]
    fn rejects_missing_dash() {
        assert!(matches!(
            "40000".parse::<PortRange>(),
            Err(ConfigError::MalformedRange(_))
        ));
    }

    #[test]
    fn rejects_non_numeric_bounds() {
        assert!(matches!(
            "a-b".parse::<PortRange>(),
            Err(ConfigError::InvalidPort(_))
        ));
    }

    #[test]
    fn rejects_inverted_range() {
        assert!(matches!(
            "40001-40000".parse::<PortRange>(),
            Err(ConfigError::InvertedRange { .. })
        ));
    }
}
