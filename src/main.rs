//! midwife - main entry point
//!
//! Thin CLI over the library: resolves configuration, builds the standard
//! catalog and hands over to the engine or the intervention commands.

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use midwife::checkpoint::Checkpoint;
use midwife::cli::{Cli, Commands};
use midwife::config::MidwifeConfig;
use midwife::engine::Engine;
use midwife::error::MidwifeError;
use midwife::intervention::{self, Intervention};
use midwife::notify::Notifier;
use midwife::process_guard::{self, ProcessGuard};
use midwife::stages::standard_catalog;
use midwife::store::CheckpointStore;

/// Logs go to stderr so the console notification mirror on stdout stays clean.
/// `RUST_LOG` overrides the default `info` level.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(filter)
        .init();
}

fn main() {
    init_logging();

    // Children must not outlive us if we are killed mid-stage
    if let Err(e) = process_guard::init_signal_handlers() {
        warn!("Failed to initialize signal handlers: {}", e);
    }
    debug!("Signal handlers initialized");

    let cli = Cli::parse_args();
    let code = match dispatch(cli) {
        Ok(()) => 0,
        Err(e) => {
            let code = e
                .downcast_ref::<MidwifeError>()
                .map(MidwifeError::exit_code)
                .unwrap_or(1);
            error!("{e:#}");
            eprintln!("✗ {e:#}");
            code
        }
    };
    std::process::exit(code);
}

fn dispatch(cli: Cli) -> Result<()> {
    let config = MidwifeConfig::resolve(cli.config.as_deref())?;
    let store = CheckpointStore::new(&config.checkpoint_path);
    debug!(checkpoint = %store.path().display(), "Configuration resolved");

    match cli.command {
        Commands::Run {
            fresh,
            from,
            no_notify,
        } => run_pipeline(config, store, fresh, from, no_notify),
        Commands::List => list_stages(&config, &store),
        Commands::Status { verify } => show_status(&config, store, verify),
        Commands::Reset => {
            store.clear()?;
            info!(path = %store.path().display(), "Checkpoint removed");
            println!("✓ Checkpoint removed; the next run starts from scratch");
            Ok(())
        }
        Commands::Intervene { action } => {
            let catalog = standard_catalog(&config)?;
            let action = Intervention::from(action);
            let checkpoint = intervention::apply(&store, &catalog.ids(), &action)?;
            println!(
                "✓ Applied '{}': pipeline now at '{}' ({}%)",
                action, checkpoint.stage, checkpoint.progress_percent
            );
            Ok(())
        }
    }
}

fn run_pipeline(
    config: MidwifeConfig,
    store: CheckpointStore,
    fresh: bool,
    from: Option<midwife::checkpoint::StageId>,
    no_notify: bool,
) -> Result<()> {
    if !nix::unistd::geteuid().is_root() {
        warn!("Not running as root; package and service stages will likely fail");
    }
    if fresh {
        store.clear()?;
        info!("Starting fresh, previous checkpoint discarded");
    }

    let catalog = standard_catalog(&config)?;
    let notifier = Notifier::from_settings(&config.notify, !no_notify);
    // Terminates any stage children still running if we bail out early
    let _guard = ProcessGuard::new();

    let engine = Engine::new(catalog, store, notifier).with_policy(config.escalation_policy());
    let report = engine.run(from)?;
    if report.pending.is_empty() {
        info!(
            executed = report.executed.len(),
            escalations = report.escalations,
            "Provisioning finished"
        );
    } else {
        warn!(
            executed = report.executed.len(),
            pending = ?report.pending,
            "Session ended with earlier stages still pending"
        );
    }
    Ok(())
}

fn list_stages(config: &MidwifeConfig, store: &CheckpointStore) -> Result<()> {
    let catalog = standard_catalog(config)?;
    let checkpoint = store.load();
    for (index, stage) in catalog.iter().enumerate() {
        let done = checkpoint
            .as_ref()
            .is_some_and(|cp| cp.is_completed(stage.id()));
        println!(
            "{:>2}. [{}] {:<13} {}",
            index + 1,
            if done { "x" } else { " " },
            stage.id().to_string(),
            stage.description()
        );
    }
    Ok(())
}

fn show_status(config: &MidwifeConfig, store: CheckpointStore, verify: bool) -> Result<()> {
    match store.load() {
        Some(checkpoint) => print_checkpoint(&checkpoint)?,
        None => println!("No checkpoint at {}", store.path().display()),
    }

    if verify {
        let catalog = standard_catalog(config)?;
        let engine = Engine::new(catalog, store, Notifier::console_only().without_console());
        println!();
        println!("Live verification:");
        for diagnosis in engine.diagnose() {
            println!(
                "  {} {:<13} completed={:<5} needs_work={:<5} {}",
                if diagnosis.verified { "✓" } else { "✗" },
                diagnosis.id.to_string(),
                diagnosis.completed,
                diagnosis.needs_work,
                diagnosis.description
            );
        }
    }
    Ok(())
}

fn print_checkpoint(cp: &Checkpoint) -> Result<()> {
    println!("Stage:      {}", cp.stage);
    println!("Progress:   {}%", cp.progress_percent);
    if let Some(task) = &cp.current_task {
        println!("Task:       {}", task);
    }
    let completed: Vec<String> = cp.completed_stages.iter().map(|s| s.to_string()).collect();
    println!("Completed:  {}", completed.join(", "));
    println!("Started:    {}", cp.started_at.to_rfc3339());
    println!("Updated:    {}", cp.updated_at.to_rfc3339());
    println!("Revision:   {}", cp.revision);

    if let Some(last) = cp.last_error() {
        println!(
            "Last error: [{}] {} ({}, {})",
            last.stage,
            last.message,
            if last.recoverable {
                "recoverable"
            } else {
                "needs manual repair"
            },
            last.timestamp.to_rfc3339()
        );
        if let Some(detail) = &last.detail {
            println!("            {}", detail);
        }
        println!("Errors:     {} recorded", cp.errors.len());
    }

    let facts =
        serde_json::to_string_pretty(&cp.config).context("Failed to render recorded facts")?;
    println!("Facts:      {}", facts);
    Ok(())
}
