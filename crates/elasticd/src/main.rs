//! elasticd, the elastic scaler daemon.
//!
//! Runs the plan controller against the embedded state store and offers a
//! few operator commands for submitting and inspecting scale plans.
//!
//! # Usage
//!
//! ```text
//! elasticd run --data-dir /var/lib/elastic --config scaler.toml
//! elasticd submit --data-dir /var/lib/elastic ps-plan.json worker-plan.json
//! elasticd status --data-dir /var/lib/elastic --job mnist
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use elastic_core::{ScalePlan, ScalerConfig};
use elastic_reconcile::{PlanController, StoreCluster};
use elastic_state::{StateError, StateStore};

#[derive(Parser)]
#[command(name = "elasticd", about = "Elastic training scaler daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Reconcile scale plans until interrupted.
    Run {
        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/elastic")]
        data_dir: PathBuf,

        /// Scaler configuration (TOML). Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Seconds between controller passes, overriding the config.
        #[arg(long)]
        interval: Option<u64>,

        /// Report created pods ready immediately (no node agent).
        #[arg(long)]
        ready_on_create: bool,
    },

    /// Submit a scale plan. Several files are merged into one plan named
    /// after the first.
    Submit {
        #[arg(long, default_value = "/var/lib/elastic")]
        data_dir: PathBuf,

        /// Overwrite the spec of an existing plan with the same name.
        #[arg(long)]
        replace: bool,

        /// Plan files (JSON).
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Show one plan in full, or a summary of every plan.
    Status {
        #[arg(long, default_value = "/var/lib/elastic")]
        data_dir: PathBuf,

        /// Only list plans owned by this job.
        #[arg(long)]
        job: Option<String>,

        plan: Option<String>,
    },

    /// Print the effective configuration as TOML.
    Config {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info,elasticd=debug,elastic=debug")
            }),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            data_dir,
            config,
            interval,
            ready_on_create,
        } => run(data_dir, config, interval, ready_on_create).await,
        Command::Submit {
            data_dir,
            replace,
            files,
        } => submit(&data_dir, replace, &files),
        Command::Status {
            data_dir,
            job,
            plan,
        } => status(&data_dir, job.as_deref(), plan.as_deref()),
        Command::Config { config } => {
            print!("{}", load_config(config.as_deref())?.to_toml_string()?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<ScalerConfig> {
    match path {
        Some(path) => ScalerConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(ScalerConfig::default()),
    }
}

fn open_store(data_dir: &Path) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join("elastic.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");
    Ok(store)
}

async fn run(
    data_dir: PathBuf,
    config: Option<PathBuf>,
    interval: Option<u64>,
    ready_on_create: bool,
) -> anyhow::Result<()> {
    info!("elastic scaler daemon starting");

    let mut config = load_config(config.as_deref())?;
    if let Some(secs) = interval {
        config.reconciler.interval_secs = secs;
    }
    let interval = config.reconciler.interval();

    let store = open_store(&data_dir)?;
    let cluster = Arc::new(StoreCluster::new(store).with_ready_on_create(ready_on_create));
    let mut controller = PlanController::new(cluster, config);
    info!(
        interval_secs = interval.as_secs(),
        ready_on_create, "plan controller initialized"
    );

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let controller_handle = tokio::spawn(async move {
        controller.run(interval, shutdown_rx).await;
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c, shutting down");
    }
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    // In-flight pod operations finish before the controller returns.
    controller_handle.await?;

    info!("elastic scaler daemon stopped");
    Ok(())
}

/// Read and merge plan files. The first file names the plan.
fn load_plan(files: &[PathBuf]) -> anyhow::Result<ScalePlan> {
    let mut merged: Option<ScalePlan> = None;
    for path in files {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let plan: ScalePlan = serde_json::from_str(&raw)
            .with_context(|| format!("parsing {}", path.display()))?;

        match merged.as_mut() {
            None => merged = Some(plan),
            Some(base) => {
                let (ours, theirs) = (base.owner_job(), plan.owner_job());
                if !ours.is_empty() && !theirs.is_empty() && ours != theirs {
                    bail!(
                        "{} targets job {theirs}, but {} targets {ours}",
                        path.display(),
                        base.name()
                    );
                }
                base.spec.merge(plan.spec);
            }
        }
    }
    merged.context("no plan files given")
}

fn submit(data_dir: &Path, replace: bool, files: &[PathBuf]) -> anyhow::Result<()> {
    let plan = load_plan(files)?;
    if plan.name().is_empty() {
        bail!("plan has no metadata.name");
    }

    let store = open_store(data_dir)?;
    let stored = if replace {
        store.put_plan(&plan)?
    } else {
        match store.create_plan(&plan) {
            Ok(stored) => stored,
            Err(StateError::AlreadyExists(name)) => {
                bail!("plan {name} already exists (use --replace to update its spec)")
            }
            Err(e) => return Err(e.into()),
        }
    };

    println!(
        "✓ Submitted plan {} for job {} (generation {})",
        stored.name(),
        stored.owner_job(),
        stored.metadata.generation
    );
    Ok(())
}

fn status(data_dir: &Path, job: Option<&str>, plan: Option<&str>) -> anyhow::Result<()> {
    let store = open_store(data_dir)?;

    if let Some(name) = plan {
        let plan = store
            .get_plan(name)?
            .with_context(|| format!("plan {name} not found"))?;
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    let plans = match job {
        Some(job) => store.list_plans_for_job(job)?,
        None => store.list_plans()?,
    };
    if plans.is_empty() {
        println!("No plans.");
        return Ok(());
    }
    for plan in &plans {
        let status = &plan.status;
        let done = status.pods.values().filter(|p| p.state.is_terminal()).count();
        println!(
            "{:<32} {:<20} {:<10} {:>3}/{:<3} {}",
            plan.name(),
            plan.owner_job(),
            status.phase.to_string(),
            done,
            status.pods.len(),
            status.message.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use elastic_core::PlanPhase;

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn partial_plans_merge_into_first() {
        let dir = tempfile::tempdir().unwrap();
        let ps = write(
            dir.path(),
            "ps.json",
            r#"{"metadata": {"name": "scale-7"}, "spec": {"ownerJob": "mnist",
                "replicaResourceSpecs": {"ps": {"replicas": 2}}}}"#,
        );
        let workers = write(
            dir.path(),
            "workers.json",
            r#"{"metadata": {"name": "ignored"}, "spec": {"ownerJob": "mnist",
                "replicaResourceSpecs": {"worker": {"replicas": 4}},
                "psHosts": ["mnist-ps-0:2222"]}}"#,
        );

        let plan = load_plan(&[ps, workers]).unwrap();
        assert_eq!(plan.name(), "scale-7");
        assert_eq!(plan.spec.replica_resource_specs.len(), 2);
        assert_eq!(plan.spec.ps_hosts, vec!["mnist-ps-0:2222"]);
    }

    #[test]
    fn plans_for_different_jobs_do_not_merge() {
        let dir = tempfile::tempdir().unwrap();
        let a = write(
            dir.path(),
            "a.json",
            r#"{"metadata": {"name": "a"}, "spec": {"ownerJob": "mnist"}}"#,
        );
        let b = write(
            dir.path(),
            "b.json",
            r#"{"metadata": {"name": "b"}, "spec": {"ownerJob": "bert"}}"#,
        );
        assert!(load_plan(&[a, b]).is_err());
    }

    #[test]
    fn submit_refuses_duplicates_unless_replacing() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(
            dir.path(),
            "plan.json",
            r#"{"metadata": {"name": "p1"}, "spec": {"ownerJob": "mnist",
                "createPods": [{"id": 0, "type": "worker"}]}}"#,
        );
        let data = dir.path().join("data");

        submit(&data, false, std::slice::from_ref(&file)).unwrap();
        assert!(submit(&data, false, std::slice::from_ref(&file)).is_err());
        submit(&data, true, std::slice::from_ref(&file)).unwrap();

        let store = open_store(&data).unwrap();
        let plan = store.get_plan("p1").unwrap().unwrap();
        assert_eq!(plan.status.phase, PlanPhase::Pending);
        assert_eq!(plan.metadata.generation, 1);
        assert_eq!(plan.metadata.resource_version, 2);
    }
}
