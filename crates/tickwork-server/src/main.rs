use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tickwork_core::config::TickworkConfig;
use tickwork_executors::{ExecutorRegistry, ProcedureRegistry};
use tickwork_scheduler::{SchedulerRuntime, Store};
use tracing::info;

/// Run one tickwork scheduler instance against a shared SQLite store.
#[derive(Debug, Parser)]
#[command(name = "tickwork", version, about)]
struct Args {
    /// Path to the TOML config file (default: ~/.tickwork/tickwork.toml).
    #[arg(long)]
    config: Option<String>,

    /// Override `scheduler.namespace`.
    #[arg(long)]
    namespace: Option<String>,

    /// Override `scheduler.instance_name`.
    #[arg(long)]
    instance: Option<String>,

    /// Join the cluster without scanning or firing triggers.
    #[arg(long)]
    standby: bool,
}

impl Args {
    fn apply(&self, config: &mut TickworkConfig) {
        if let Some(ns) = &self.namespace {
            config.scheduler.namespace = ns.clone();
        }
        if let Some(name) = &self.instance {
            config.scheduler.instance_name = Some(name.clone());
        }
        if self.standby {
            config.scheduler.standby = true;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tickwork=info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = TickworkConfig::load(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;

    let db_path = config.database.path.clone();
    info!(path = %db_path, namespace = %config.scheduler.namespace, "opening SQLite database");
    let store = Arc::new(Store::open(
        &db_path,
        Duration::from_millis(config.database.busy_timeout_ms),
    )?);

    // Embedding applications register their procedures here; the stock
    // binary only ships the http, script and shell executors.
    let procedures = Arc::new(ProcedureRegistry::new());
    let registry = Arc::new(ExecutorRegistry::with_defaults(&config.executors, procedures));

    let handle = SchedulerRuntime::new(config, store, registry).start()?;
    info!(instance = %handle.instance_name(), "tickwork running, ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    handle.shutdown().await;
    info!("tickwork stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_config() {
        let args = Args::parse_from([
            "tickwork",
            "--namespace",
            "billing",
            "--instance",
            "node-7",
            "--standby",
        ]);
        let mut config = TickworkConfig::default();
        args.apply(&mut config);
        assert_eq!(config.scheduler.namespace, "billing");
        assert_eq!(config.instance_name().as_str(), "node-7");
        assert!(config.scheduler.standby);
    }

    #[test]
    fn absent_flags_keep_config() {
        let args = Args::parse_from(["tickwork"]);
        let mut config = TickworkConfig::default();
        args.apply(&mut config);
        assert_eq!(config.scheduler.namespace, "default");
        assert!(!config.scheduler.standby);
    }
}
