use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use devbox::config::DevboxConfig;
use devbox::events::default_sink;
use devbox::fetch::{FetchTask, ResilientFetcher};
use devbox::layout::PersistentLayout;
use devbox::markers::{FsMarkerStore, MarkerStore};
use devbox::observability::init_tracing;
use devbox::pipeline::{Pipeline, PipelineBuilder, PipelineReport, PipelineRuntime};
use devbox::process::{CommandRunner, SystemRunner};
use devbox::session;
use devbox::stages::CommandStage;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::info;

const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "devbox", version, about = "Restart-safe sandbox provisioning and bring-up")]
struct Cli {
    /// Configuration file (defaults to $DEVBOX_CONFIG, then built-in defaults).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Persistent volume root; overrides the configuration.
    #[arg(long, global = true)]
    volume: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Runs every install stage whose marker is absent.
    Install,
    /// Runs a single install stage.
    Stage {
        name: String,
        /// Run even if the stage is already complete.
        #[arg(long)]
        force: bool,
    },
    /// Lists install stages and their completion time.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Removes a stage's marker so the next install runs it again.
    Reset { name: String },
    /// Prints the environment descriptor.
    Env {
        /// Print the resolved `KEY=VALUE` pairs instead of the descriptor file.
        #[arg(long)]
        resolved: bool,
    },
    /// Downloads a file with the resilient fetcher.
    Fetch {
        uri: String,
        destination: PathBuf,
        #[arg(long)]
        sha256: Option<String>,
    },
    /// Brings the session up and keeps it running until interrupted.
    Start,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = DevboxConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(volume) = cli.volume {
        config.volume_root = volume;
    }
    init_tracing(&config.logging.filter, config.logging.json);

    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner::new());
    match cli.command {
        Commands::Install => {
            let report = install_pipeline(&config, runner)?.run().await?;
            print_report(&report);
        }
        Commands::Stage { name, force } => {
            let report = install_pipeline(&config, runner)?
                .run_stage(&name, force)
                .await?;
            print_report(&report);
        }
        Commands::Status { json } => status(&config, json).await?,
        Commands::Reset { name } => reset(&config, &name).await?,
        Commands::Env { resolved } => env(&config, resolved).await?,
        Commands::Fetch {
            uri,
            destination,
            sha256,
        } => {
            let fetcher = ResilientFetcher::from_config(&config.fetch, runner);
            let mut task = FetchTask::new(uri, destination);
            if let Some(sha256) = sha256 {
                task = task.with_sha256(sha256);
            }
            let path = fetcher.fetch(&task).await?;
            println!("{}", path.display());
        }
        Commands::Start => start(&config, runner).await?,
    }
    Ok(())
}

fn install_pipeline(config: &DevboxConfig, runner: Arc<dyn CommandRunner>) -> Result<Pipeline> {
    if config.stages.is_empty() {
        bail!("no install stages are configured");
    }
    let runtime = PipelineRuntime::from_config(config, runner);
    let pipeline = PipelineBuilder::new("install")
        .stages(CommandStage::from_configs(&config.stages))?
        .build(runtime)?;
    Ok(pipeline)
}

fn print_report(report: &PipelineReport) {
    for record in &report.stages {
        println!(
            "{:<24} {:<5} {:>10.1} ms",
            record.name,
            record.status.as_str(),
            record.duration_ms
        );
    }
    println!(
        "{} executed, {} skipped in {:.1} ms",
        report.executed().len(),
        report.skipped().len(),
        report.duration_ms
    );
}

fn markers(config: &DevboxConfig) -> FsMarkerStore {
    FsMarkerStore::new(PersistentLayout::new(&config.volume_root).markers_dir().path())
}

async fn status(config: &DevboxConfig, as_json: bool) -> Result<()> {
    let store = markers(config);
    let mut rows = Vec::with_capacity(config.stages.len());
    for stage in &config.stages {
        let completed_at = store.completed_at(stage.marker_id()).await?;
        rows.push((stage.name.as_str(), stage.marker_id(), completed_at));
    }

    if as_json {
        let value: Vec<_> = rows
            .iter()
            .map(|(name, marker, completed_at)| {
                json!({"stage": name, "marker": marker, "completed_at": completed_at})
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    for (name, _, completed_at) in rows {
        match completed_at {
            Some(at) => println!("{name:<24} done     {}", at.to_rfc3339()),
            None => println!("{name:<24} pending"),
        }
    }
    Ok(())
}

async fn reset(config: &DevboxConfig, name: &str) -> Result<()> {
    let Some(stage) = config.stages.iter().find(|s| s.name == name) else {
        bail!("unknown stage '{name}'");
    };
    if markers(config).clear(stage.marker_id()).await? {
        println!("{name}: marker cleared, the next install runs it again");
    } else {
        println!("{name}: not complete, nothing to clear");
    }
    Ok(())
}

async fn env(config: &DevboxConfig, resolved: bool) -> Result<()> {
    let layout = PersistentLayout::new(&config.volume_root);
    let descriptor = devbox::environment::DescriptorFile::new(layout.descriptor_file().path())
        .load()
        .await?;
    if resolved {
        for (key, value) in descriptor.resolve_with_process_env().iter() {
            println!("{key}={value}");
        }
    } else {
        print!("{}", descriptor.render());
    }
    Ok(())
}

async fn start(config: &DevboxConfig, runner: Arc<dyn CommandRunner>) -> Result<()> {
    ensure_volume(&config.volume_root)?;
    let mut session = session::bring_up(config, runner, default_sink()).await?;

    for issue in session.issues() {
        eprintln!("{issue}");
    }
    info!("session up, press Ctrl-C or send SIGTERM to stop");

    let mut terminate = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let received = tokio::select! {
        received = shutdown_signal(&mut terminate) => received?,
        outcome = session.wait_watcher(Duration::MAX) => {
            info!(?outcome, "network watcher finished");
            shutdown_signal(&mut terminate).await?
        }
    };
    info!(signal = received, "tearing down session");

    let shutdown = session.teardown(TEARDOWN_TIMEOUT).await;
    if !shutdown.is_clean() {
        bail!(
            "teardown incomplete: failed {:?}, aborted {:?}",
            shutdown.failed,
            shutdown.aborted
        );
    }
    Ok(())
}

/// Waits for Ctrl-C or SIGTERM and names the one that arrived.
async fn shutdown_signal(terminate: &mut Signal) -> Result<&'static str> {
    tokio::select! {
        interrupted = tokio::signal::ctrl_c() => {
            interrupted.context("waiting for Ctrl-C")?;
            Ok("SIGINT")
        }
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

fn ensure_volume(root: &Path) -> Result<()> {
    std::fs::create_dir_all(root)
        .with_context(|| format!("creating volume root {}", root.display()))
}
