mod compose;
mod terminal_output;

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use warden_config::{load_config, prepare, resolve_config_path, validate, ValidationReport};
use warden_logging::{init_logger, PluginEventLogger};

#[derive(Parser)]
#[command(name = "wardend")]
#[command(about = "Warden plugin host: loads, sandboxes, and monitors capability plugins")]
#[command(version)]
struct Cli {
    /// Config file (default: $WARDEN_CONFIG_DIR/config.yaml or ~/.warden/config.yaml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the plugin host and run until Ctrl-C
    Run,
    /// Sync repositories and print the available plugin descriptors
    Catalog {
        /// Print a table instead of JSON
        #[arg(long)]
        table: bool,
    },
    /// Validate the config file
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let path = resolve_config_path(cli.config.as_deref());

    match cli.command {
        Commands::Run => run(&path).await,
        Commands::Catalog { table } => catalog(&path, table).await,
        Commands::Check => check(&path).await,
    }
}

async fn run(path: &Path) -> Result<()> {
    let config = prepare(load_config(path).await?)?;

    let logging = config.logging();
    if let Some(dir) = &logging.dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create log directory {}", dir.display()))?;
    }
    init_logger(
        logging.dir.as_deref(),
        logging.level(),
        logging.json.unwrap_or(false),
    );

    let report = validate(&config);
    for warning in &report.warnings {
        warn!(path = %warning.path, message = %warning.message, "Config warning");
    }
    for problem in &report.errors {
        error!(path = %problem.path, message = %problem.message, "Config error");
    }
    if !report.is_valid() {
        bail!(
            "Config at {} has {} validation error(s)",
            path.display(),
            report.errors.len()
        );
    }

    info!(config = %path.display(), "Starting wardend");
    let manager = compose::build_manager(&config)?;

    let shutdown = CancellationToken::new();
    let event_logger = PluginEventLogger::spawn(manager.subscribe(), shutdown.clone());

    let started = manager.start().await;
    info!(
        descriptors = started.sync.descriptors,
        loaded = started.loaded.len(),
        failed = started.failed.len(),
        "Plugin host ready"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutdown requested");

    manager.stop().await;
    shutdown.cancel();
    if let Err(e) = event_logger.await {
        warn!(error = %e, "Event logger ended abnormally");
    }
    info!("wardend stopped");
    Ok(())
}

async fn catalog(path: &Path, table: bool) -> Result<()> {
    let config = warden_config::load_and_prepare(path).await?;
    let registry = compose::build_registry(&config)?;

    let report = registry.sync().await;
    for failure in &report.failures {
        terminal_output::note_warn(&format!(
            "repository '{}' unavailable: {}",
            failure.repository, failure.message
        ));
    }

    let descriptors = registry.list_available().await;
    if table {
        let rows: Vec<Vec<String>> = descriptors
            .iter()
            .map(|d| {
                let capabilities: Vec<&str> =
                    d.capabilities.iter().map(|c| c.name.as_str()).collect();
                vec![
                    d.id.clone(),
                    d.version.clone(),
                    d.entry.clone(),
                    capabilities.join(","),
                ]
            })
            .collect();
        print!(
            "{}",
            terminal_output::render_table(&["ID", "VERSION", "ENTRY", "CAPABILITIES"], &rows)
        );
    } else {
        println!("{}", serde_json::to_string_pretty(&descriptors)?);
    }
    Ok(())
}

async fn check(path: &Path) -> Result<()> {
    let config = prepare(load_config(path).await?)?;
    let report = validate(&config);
    print_report(path, &report);
    if !report.is_valid() {
        bail!("{} validation error(s)", report.errors.len());
    }
    Ok(())
}

fn print_report(path: &Path, report: &ValidationReport) {
    for warning in &report.warnings {
        terminal_output::note_warn(&format!("{}: {}", warning.path, warning.message));
    }
    for problem in &report.errors {
        terminal_output::note_error(&format!("{}: {}", problem.path, problem.message));
    }
    if report.is_valid() {
        terminal_output::note_success(&format!(
            "{} is valid ({} warning(s))",
            path.display(),
            report.warnings.len()
        ));
    }
}
