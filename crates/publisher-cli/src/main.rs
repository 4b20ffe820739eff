use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use publisher::cdn::{DEFAULT_SURROGATE_KEY, discover_replication_keys, tag_surrogate_keys};
use publisher::config::Config;
use publisher::lock::{BucketLock, Lease, ObjectLock};
use publisher::pipeline;
use publisher::release::{Mark, Marker};
use publisher::storage::{ObjectStore, build_storage_backend};

/// Variable holding the log filter, e.g. `PUBLISHER_LOG=publisher_lock=debug`.
const LOG_ENV: &str = "PUBLISHER_LOG";

#[derive(Parser, Debug)]
#[command(name = "publisher", version)]
#[command(about = "Lease lock, release markers and CDN purge for package publishing jobs")]
struct Cli {
    /// Directory containing .publisher.toml
    #[arg(long, default_value = ".", global = true)]
    config_dir: PathBuf,

    /// Log at debug level unless PUBLISHER_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Take, give back or inspect the publish lease.
    Lock {
        #[command(subcommand)]
        action: LockAction,
    },
    /// Open, close or print release marks.
    Marker {
        #[command(subcommand)]
        action: MarkerAction,
    },
    /// Run a command while holding the lease, recording it in the marker log.
    Run {
        /// Command and arguments, e.g. `publisher run -- ./upload.sh`.
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Wait for metadata replication, then purge the CDN cache.
    Purge(PurgeArgs),
    /// Set the CDN surrogate key on metadata objects.
    TagSurrogate(TagArgs),
}

#[derive(Subcommand, Debug)]
enum LockAction {
    /// Wait for the lease and take it.
    Acquire,
    /// Give the lease back.
    Release,
    /// Print the current lease.
    Status,
}

#[derive(Subcommand, Debug)]
enum MarkerAction {
    /// Append an open mark for this run and print it.
    Start {
        /// Also write the mark here, for `marker end`.
        #[arg(long)]
        mark_file: Option<PathBuf>,
    },
    /// Close the mark written by `marker start`.
    End {
        #[arg(long)]
        mark_file: PathBuf,
    },
    /// Print the whole marker log.
    Show,
}

#[derive(Args, Debug)]
struct PurgeArgs {
    /// Purge without waiting for replication.
    #[arg(long)]
    skip_replication: bool,

    /// Keys to wait for instead of discovering repository metadata.
    #[arg(long, value_delimiter = ',', num_args = 1..)]
    keys: Vec<String>,

    /// Fail when replication or the purge fails instead of only warning.
    #[arg(long)]
    strict: bool,
}

#[derive(Args, Debug)]
struct TagArgs {
    /// Keys to tag instead of discovering repository metadata.
    #[arg(long, value_delimiter = ',', num_args = 1..)]
    keys: Vec<String>,

    #[arg(long, default_value = DEFAULT_SURROGATE_KEY)]
    surrogate_key: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = Config::load(&cli.config_dir)?;

    match cli.cmd {
        Commands::Lock { action } => run_lock(&config, action),
        Commands::Marker { action } => run_marker(&config, action),
        Commands::Run { command } => run_command(&config, &command),
        Commands::Purge(args) => run_purge(&config, args),
        Commands::TagSurrogate(args) => run_tag_surrogate(&config, args),
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[derive(Serialize)]
struct LockStatus<'a> {
    key: &'a str,
    owner: &'a str,
    disabled: bool,
    busy: bool,
    lease: Option<Lease>,
}

fn run_lock(config: &Config, action: LockAction) -> Result<()> {
    let lock_config = config.lock_config();
    if config.lock.disabled {
        info!(?action, "locking disabled, nothing to do");
        return print_json(&LockStatus {
            key: &lock_config.key,
            owner: &lock_config.owner,
            disabled: true,
            busy: false,
            lease: None,
        });
    }

    config.validate()?;
    let store = build_storage_backend(&config.lock_storage()).context("cannot open lock bucket")?;
    let lock = ObjectLock::new(store, lock_config.clone());

    match action {
        LockAction::Acquire => lock.lock().context("cannot acquire lock")?,
        LockAction::Release => lock.release().context("cannot release lock")?,
        LockAction::Status => {}
    }

    print_json(&LockStatus {
        key: &lock_config.key,
        owner: &lock_config.owner,
        disabled: false,
        busy: lock.is_busy(),
        lease: lock.current_lease()?,
    })
}

fn run_marker(config: &Config, action: MarkerAction) -> Result<()> {
    let marker = pipeline::build_marker(config)?;

    match action {
        MarkerAction::Start { mark_file } => {
            let mark = marker
                .start(config.release_info())
                .context("cannot start release mark")?;
            let json = serde_json::to_string_pretty(&mark)?;
            if let Some(path) = mark_file {
                fs::write(&path, &json)
                    .with_context(|| format!("failed to write mark file: {}", path.display()))?;
            }
            println!("{json}");
        }
        MarkerAction::End { mark_file } => {
            let mark = read_mark(&mark_file)?;
            marker.end(&mark).context("cannot end release mark")?;
            info!(app_name = %mark.app_name(), "release mark ended");
        }
        MarkerAction::Show => print_json(&marker.marks()?)?,
    }
    Ok(())
}

fn read_mark(path: &Path) -> Result<Mark> {
    let raw = fs::read(path)
        .with_context(|| format!("failed to read mark file: {}", path.display()))?;
    serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse mark file: {}", path.display()))
}

fn run_command(config: &Config, command: &[String]) -> Result<()> {
    let Some((program, args)) = command.split_first() else {
        bail!("missing command");
    };
    config.validate()?;
    let lock = pipeline::build_lock(config)?;
    let marker = pipeline::build_marker(config)?;

    pipeline::run_release(&*lock, &marker, config.release_info(), |mark| {
        info!(app_name = %mark.app_name(), program = %program, "running release command");
        let status = Command::new(program)
            .args(args)
            .status()
            .with_context(|| format!("failed to run {program}"))?;
        if !status.success() {
            bail!("{program} failed: {status}");
        }
        Ok(())
    })
}

fn metadata_keys(config: &Config, store: &dyn ObjectStore, explicit: Vec<String>) -> Result<Vec<String>> {
    if !explicit.is_empty() {
        return Ok(explicit);
    }
    discover_replication_keys(store, &config.fastly.layout)
        .context("cannot discover repository metadata keys")
}

fn run_purge(config: &Config, args: PurgeArgs) -> Result<()> {
    config.validate_purge()?;
    let store = build_storage_backend(&config.fastly_storage())
        .context("cannot open replicated bucket")?;
    let keys = if args.skip_replication {
        Vec::new()
    } else {
        metadata_keys(config, &*store, args.keys)?
    };
    let client = config.fastly_client()?;
    let target = config.purge_target();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    let cancel = CancellationToken::new();
    let outcome = runtime.block_on(async {
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                on_signal.cancel();
            }
        });
        pipeline::purge_after_replication(store, &keys, config.gate_config(), &client, &target, &cancel)
            .await
    });
    runtime.shutdown_timeout(Duration::from_secs(1));

    print_json(&outcome)?;
    if let Some(warning) = outcome.warning() {
        warn!("{warning}");
        if args.strict {
            bail!(warning);
        }
    }
    Ok(())
}

fn run_tag_surrogate(config: &Config, args: TagArgs) -> Result<()> {
    let store = build_storage_backend(&config.fastly_storage())
        .context("cannot open replicated bucket")?;
    let keys = metadata_keys(config, &*store, args.keys)?;

    let tagged = tag_surrogate_keys(&*store, &keys, &args.surrogate_key)
        .context("cannot set surrogate key")?;

    print_json(&serde_json::json!({
        "surrogate_key": args.surrogate_key,
        "tagged": tagged,
    }))
}
