//! The NAT-rule backend contract (`RuleDriver`) and its two implementations:
//! an `iptables`-shelling driver for real deployments and an in-memory fake
//! for tests.
#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod fake;
mod iptables;

pub use fake::FakeRuleDriver;
pub use iptables::IptablesDriver;

use async_trait::async_trait;
use npl_core::HostPort;
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("rule driver initialization failed: {0}")]
    Init(String),
    #[error("failed to install rule for host port {host_port}: {reason}")]
    Install { host_port: HostPort, reason: String },
    #[error("failed to remove rule for host port {host_port}: {reason}")]
    Remove { host_port: HostPort, reason: String },
    #[error("failed to list rules: {0}")]
    List(String),
}

/// Abstract backend that installs, removes, enumerates, and reconciles a set
/// of DNAT rules of the form `(host-port) -> (pod-ip:container-port)`.
///
/// Implementations must not be assumed re-entrant: callers (the
/// [`npl_port_table`](https://docs.rs/npl-port-table) crate) are responsible
/// for serializing calls.
#[async_trait]
pub trait RuleDriver: Send + Sync {
    /// One-time setup: create auxiliary chains or hooks. Idempotent.
    async fn init(&self) -> Result<(), DriverError>;

    /// Idempotently add a rule redirecting `host_port` to `destination`
    /// (`"<ip>:<port>"`). Re-adding an identical rule must not duplicate it.
    async fn add_rule(&self, host_port: HostPort, destination: &str) -> Result<(), DriverError>;

    /// Remove a rule. Deleting an absent rule is reported but is not fatal;
    /// callers reconciling may treat it as success.
    async fn delete_rule(&self, host_port: HostPort, destination: &str)
        -> Result<(), DriverError>;

    /// Enumerate all rules currently installed in the managed chain.
    async fn list_rules(&self) -> Result<HashMap<HostPort, String>, DriverError>;

    /// Converge the chain toward `desired`, returning the subset that failed
    /// to install.
    async fn sync_state(
        &self,
        desired: &HashMap<HostPort, String>,
    ) -> Result<HashMap<HostPort, String>, DriverError> {
        let mut failed = HashMap::new();
        for (port, dest) in desired {
            if let Err(error) = self.add_rule(*port, dest).await {
                tracing::warn!(%error, host_port = %port, "failed to sync rule");
                failed.insert(*port, dest.clone());
            }
        }
        Ok(failed)
    }

    /// Tear down all auxiliary state installed by `init`. Used on shutdown;
    /// callers default to *not* invoking this so in-flight traffic survives
    /// an agent restart.
    async fn delete_all(&self) -> Result<(), DriverError>;
}
