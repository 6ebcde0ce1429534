//! Binary entrypoint: parses flags, builds the `kubert` runtime, and wires
//! the port table, rule driver, and pod reconciler together.
#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::Parser;
use npl_core::PortRange;
use npl_k8s_api::{watcher, Pod, Watch};
use npl_rules::IptablesDriver;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tracing::{info_span, Instrument};

#[tokio::main]
async fn main() -> Result<()> {
    Args::parse().run().await
}

#[derive(Debug, Parser)]
#[clap(
    name = "npl-agent",
    about = "Allocates per-pod host ports and installs DNAT rules for node-local pods"
)]
struct Args {
    /// Inclusive host-port range to allocate from, `"<start>-<end>"`.
    #[clap(long, env = "PORTS_RANGE")]
    ports_range: PortRange,

    /// This node's name, compared against each pod's `spec.nodeName`.
    #[clap(long, env = "HOSTNAME")]
    hostname: String,

    #[clap(long, default_value = "info,npl=debug", env = "NPL_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Name of the `iptables`-compatible binary used to drive NAT rules.
    #[clap(long, default_value = "iptables")]
    iptables_binary: String,

    /// Tear down all installed rules on shutdown instead of leaving them in
    /// place. Left-in-place is the default so in-flight connections survive
    /// an agent restart; `Populate` rebuilds the table on the next start.
    #[clap(long)]
    delete_rules_on_shutdown: bool,
}

impl Args {
    async fn run(self) -> Result<()> {
        let Self {
            ports_range,
            hostname,
            log_level,
            log_format,
            client,
            admin,
            iptables_binary,
            delete_rules_on_shutdown,
        } = self;

        let mut prom = Registry::default();
        let port_table_metrics = npl_port_table::PortTableMetrics::register(&mut prom);
        let reconcile_metrics = npl_index::ReconcileMetrics::register(&mut prom);

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let driver = IptablesDriver::new(iptables_binary);
        let port_table = Arc::new(
            npl_port_table::PortTable::new(ports_range, driver).with_metrics(port_table_metrics),
        );
        port_table
            .populate()
            .await
            .context("failed to populate port table from existing rules")?;

        let pods = runtime.watch_all::<Pod>(watcher::Config::default());
        let watch: Watch<Pod> = Watch::from(pods).instrument(info_span!("pods"));

        let (writeback_tx, writeback_rx) = tokio::sync::mpsc::unbounded_channel();
        let writeback = npl_index::Writeback::new(runtime.client());
        tokio::spawn(writeback.run(writeback_rx).instrument(info_span!("writeback")));

        let reconciler =
            npl_index::PodReconciler::new(port_table.clone(), hostname, writeback_tx, reconcile_metrics);
        tokio::spawn(reconciler.run(watch).instrument(info_span!("reconciler")));

        if runtime.run().await.is_err() {
            anyhow::bail!("aborted");
        }

        if delete_rules_on_shutdown {
            if let Err(error) = port_table.delete_all().await {
                tracing::warn!(%error, "failed to tear down rules on shutdown");
            }
        }

        Ok(())
    }
}
