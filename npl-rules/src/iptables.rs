use crate::DriverError;
use async_trait::async_trait;
use npl_core::HostPort;
use std::collections::HashMap;
use tokio::process::Command;
use tracing::trace;

const NAT_CHAIN: &str = "NODE-PORT-LOCAL";
const FILTER_CHAIN: &str = "NODE-PORT-LOCAL";

/// Drives the host's `iptables` binary via subprocess.
///
/// Manages a chain named [`NAT_CHAIN`] in the `nat` table with a jump from
/// `PREROUTING`, plus a same-named chain in the `filter` table hooked from
/// `FORWARD` and `INPUT` so redirected traffic is accepted.
#[derive(Clone, Debug)]
pub struct IptablesDriver {
    binary: String,
}

impl Default for IptablesDriver {
    fn default() -> Self {
        Self {
            binary: "iptables".to_string(),
        }
    }
}

impl IptablesDriver {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> std::io::Result<std::process::Output> {
        trace!(binary = %self.binary, ?args, "running iptables");
        Command::new(&self.binary).args(args).output().await
    }

    async fn exists(&self, args: &[&str]) -> bool {
        let mut check = vec!["-C"];
        check.extend_from_slice(args);
        matches!(self.run(&check).await, Ok(out) if out.status.success())
    }

    async fn ensure_chain(&self, table: &str, chain: &str) -> Result<(), DriverError> {
        let exists = matches!(
            self.run(&["-t", table, "-L", chain]).await,
            Ok(out) if out.status.success()
        );
        if !exists {
            let out = self
                .run(&["-t", table, "-N", chain])
                .await
                .map_err(|e| DriverError::Init(e.to_string()))?;
            if !out.status.success() {
                return Err(DriverError::Init(format!(
                    "failed to create chain {table}/{chain}: {}",
                    String::from_utf8_lossy(&out.stderr)
                )));
            }
        }
        Ok(())
    }

    async fn ensure_jump(&self, table: &str, args: &[&str]) -> Result<(), DriverError> {
        if self.exists_in(table, args).await {
            return Ok(());
        }
        let mut full = vec!["-t", table, "-A"];
        full.extend_from_slice(args);
        let out = self
            .run(&full)
            .await
            .map_err(|e| DriverError::Init(e.to_string()))?;
        if !out.status.success() {
            return Err(DriverError::Init(format!(
                "failed to install jump {args:?}: {}",
                String::from_utf8_lossy(&out.stderr)
            )));
        }
        Ok(())
    }

    async fn exists_in(&self, table: &str, args: &[&str]) -> bool {
        let mut full = vec!["-t", table];
        full.extend_from_slice(args);
        self.exists(&full).await
    }

    /// `iptables -t <table> -C <chain> <rule-spec>` — true iff the rule is
    /// already present.
    async fn rule_exists(&self, table: &str, chain: &str, rule: &[String]) -> bool {
        let mut check = vec!["-t", table, "-C", chain];
        check.extend(rule.iter().map(String::as_str));
        matches!(self.run(&check).await, Ok(out) if out.status.success())
    }

    fn dnat_rule_args(host_port: HostPort, destination: &str) -> Vec<String> {
        vec![
            "-p".into(),
            "tcp".into(),
            "-m".into(),
            "tcp".into(),
            "--dport".into(),
            host_port.to_string(),
            "-j".into(),
            "DNAT".into(),
            "--to-destination".into(),
            destination.into(),
        ]
    }
}

#[async_trait]
impl crate::RuleDriver for IptablesDriver {
    async fn init(&self) -> Result<(), DriverError> {
        self.ensure_chain("filter", FILTER_CHAIN).await?;
        self.ensure_chain("nat", NAT_CHAIN).await?;
        self.ensure_jump("filter", &["FORWARD", "-j", FILTER_CHAIN])
            .await?;
        self.ensure_jump("filter", &["INPUT", "-p", "tcp", "-j", FILTER_CHAIN])
            .await?;
        self.ensure_jump("nat", &["PREROUTING", "-p", "tcp", "-j", NAT_CHAIN])
            .await?;
        Ok(())
    }

    async fn add_rule(&self, host_port: HostPort, destination: &str) -> Result<(), DriverError> {
        let rule = Self::dnat_rule_args(host_port, destination);
        if self.rule_exists("nat", NAT_CHAIN, &rule).await {
            return Ok(());
        }
        let mut args = vec!["-t", "nat", "-A", NAT_CHAIN];
        args.extend(rule.iter().map(String::as_str));
        let out = self
            .run(&args)
            .await
            .map_err(|e| DriverError::Install {
                host_port,
                reason: e.to_string(),
            })?;
        if !out.status.success() {
            return Err(DriverError::Install {
                host_port,
                reason: String::from_utf8_lossy(&out.stderr).into_owned(),
            });
        }
        Ok(())
    }

    async fn delete_rule(
        &self,
        host_port: HostPort,
        destination: &str,
    ) -> Result<(), DriverError> {
        let rule = Self::dnat_rule_args(host_port, destination);
        let rule_refs: Vec<&str> = rule.iter().map(String::as_str).collect();
        let mut args = vec!["-t", "nat", "-D", NAT_CHAIN];
        args.extend(rule_refs);
        let out = self.run(&args).await.map_err(|e| DriverError::Remove {
            host_port,
            reason: e.to_string(),
        })?;
        if !out.status.success() {
            // Deleting an absent rule is reported, not fatal: the reconciler
            // treats this as success during reconcile.
            tracing::info!(
                %host_port,
                stderr = %String::from_utf8_lossy(&out.stderr),
                "iptables rule already absent"
            );
        }
        Ok(())
    }

    async fn list_rules(&self) -> Result<HashMap<HostPort, String>, DriverError> {
        let out = self
            .run(&["-t", "nat", "-S", NAT_CHAIN])
            .await
            .map_err(|e| DriverError::List(e.to_string()))?;
        if !out.status.success() {
            // Chain doesn't exist yet (first run): empty, not an error.
            return Ok(HashMap::new());
        }
        let text = String::from_utf8_lossy(&out.stdout);
        let mut rules = HashMap::new();
        for line in text.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let dport = fields
                .iter()
                .position(|f| *f == "--dport")
                .and_then(|i| fields.get(i + 1))
                .and_then(|s| s.parse::<u16>().ok());
            let dest = fields
                .iter()
                .position(|f| *f == "--to-destination")
                .and_then(|i| fields.get(i + 1));
            if let (Some(port), Some(dest)) = (dport, dest) {
                rules.insert(HostPort(port), dest.to_string());
            }
        }
        Ok(rules)
    }

    async fn delete_all(&self) -> Result<(), DriverError> {
        let _ = self
            .run(&[
                "-t", "nat", "-D", "PREROUTING", "-p", "tcp", "-j", NAT_CHAIN,
            ])
            .await;
        let _ = self
            .run(&["-t", "filter", "-D", "FORWARD", "-j", FILTER_CHAIN])
            .await;
        let _ = self
            .run(&[
                "-t", "filter", "-D", "INPUT", "-p", "tcp", "-j", FILTER_CHAIN,
            ])
            .await;
        let _ = self.run(&["-t", "nat", "-F", NAT_CHAIN]).await;
        let _ = self.run(&["-t", "nat", "-X", NAT_CHAIN]).await;
        let _ = self.run(&["-t", "filter", "-F", FILTER_CHAIN]).await;
        let _ = self.run(&["-t", "filter", "-X", FILTER_CHAIN]).await;
        Ok(())
    }
}
