use crate::DriverError;
use async_trait::async_trait;
use npl_core::HostPort;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;

/// In-memory `RuleDriver` for tests: no subprocess, just a map mirroring
/// exactly what `add_rule`/`delete_rule`/`list_rules` would observe against a
/// real chain.
#[derive(Default)]
pub struct FakeRuleDriver {
    rules: Mutex<HashMap<HostPort, String>>,
    /// Host ports that `add_rule` should fail for, to exercise the `Failed`
    /// mapping-state path.
    fail_on: Mutex<HashSet<HostPort>>,
}

impl FakeRuleDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `port` so the next `add_rule` call for it returns an error.
    pub async fn fail_next_add(&self, port: HostPort) {
        self.fail_on.lock().await.insert(port);
    }

    pub async fn installed_rules(&self) -> HashMap<HostPort, String> {
        self.rules.lock().await.clone()
    }
}

#[async_trait]
impl crate::RuleDriver for FakeRuleDriver {
    async fn init(&self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn add_rule(&self, host_port: HostPort, destination: &str) -> Result<(), DriverError> {
        if self.fail_on.lock().await.remove(&host_port) {
            return Err(DriverError::Install {
                host_port,
                reason: "injected failure".to_string(),
            });
        }
        self.rules
            .lock()
            .await
            .insert(host_port, destination.to_string());
        Ok(())
    }

    async fn delete_rule(
        &self,
        host_port: HostPort,
        _destination: &str,
    ) -> Result<(), DriverError> {
        self.rules.lock().await.remove(&host_port);
        Ok(())
    }

    async fn list_rules(&self) -> Result<HashMap<HostPort, String>, DriverError> {
        Ok(self.rules.lock().await.clone())
    }

    async fn delete_all(&self) -> Result<(), DriverError> {
        self.rules.lock().await.clear();
        Ok(())
    }
}
