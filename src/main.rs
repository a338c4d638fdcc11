use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use tokio::task::LocalSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use kiln::config::Config;
use kiln::loader::{LoadContext, Loader, Supervisor, TaskStatus};
use kiln::registry::{CommandTree, ManifestFile};
use kiln::settings::FileSettings;
use kiln::LoadError;

/// Kiln - load extension modules and register their commands
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Directory to scan for extensions
    #[arg(long)]
    directory: Option<PathBuf>,

    /// File extension of extension modules
    #[arg(short, long)]
    extension: Option<String>,

    /// Skip pushing commands to the registry after loading
    #[arg(long)]
    no_sync: bool,

    /// Print the registered commands after loading
    #[arg(short, long)]
    list: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr so `--list` output stays clean
    let log_level = if args.debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };

    let filter = EnvFilter::builder()
        .with_default_directive(log_level.into())
        .from_env_lossy();

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global default subscriber")?;

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        Config::load_from_file(config_path)?
    } else {
        Config::load_default()?
    };

    if let Some(directory) = args.directory {
        config.loader.directory = directory;
    }
    if let Some(extension) = args.extension {
        config.loader.extension = extension;
    }
    if args.no_sync {
        config.loader.sync = false;
    }

    LocalSet::new().run_until(run(config, args.list)).await
}

async fn run(config: Config, list: bool) -> Result<()> {
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::task::spawn_local(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            interrupt.cancel();
        }
    });

    let settings = FileSettings::open(&config.settings.path)
        .with_context(|| format!("Failed to open settings {}", config.settings.path.display()))?;
    let registry = CommandTree::new(ManifestFile::new(&config.registry.manifest));
    let mut loader = Loader::new(registry, Arc::new(settings));

    let supervisor = Rc::new(Supervisor::new());
    let ctx = LoadContext::new()
        .with_scheduler(supervisor.clone())
        .with_params(config.loader.params.clone())
        .with_cancel(cancel.clone());

    let directory = &config.loader.directory;
    let extension = &config.loader.extension;
    let outcome = if config.loader.sync {
        loader
            .load_and_sync(directory, extension, &config.loader.scope(), &ctx)
            .await
    } else {
        loader
            .load(directory, extension, &ctx)
            .await
            .map_err(LoadError::from)
    };

    let report = match outcome {
        Ok(report) => report,
        Err(err) if err.is_cancelled() => {
            warn!("Extension load cancelled; nothing was synced");
            supervisor.abort_all();
            supervisor.join_all().await;
            return Ok(());
        }
        Err(err) => return Err(err).context("Extension load failed"),
    };

    if list {
        for entry in &report.registered {
            println!("{:<24} {}", entry.name, entry.description);
        }
    }

    if !report.is_clean() {
        warn!(
            failures = report.failures.len(),
            "Some extensions failed to load; see warnings above"
        );
    }

    info!(
        commands = loader.registry().len(),
        background = supervisor.pending(),
        "Kiln is running; press Ctrl-C to stop"
    );
    cancel.cancelled().await;

    supervisor.abort_all();
    let outcomes = supervisor.join_all().await;
    let completed = outcomes
        .iter()
        .filter(|o| o.status == TaskStatus::Completed)
        .count();
    info!(completed, total = outcomes.len(), "Shutdown complete");
    Ok(())
}
