mod config;
mod lock;
mod signals;

use clap::Parser;
use config::{ConfigError, LogConfig, Overrides, WatcherConfig};
use lock::{LockError, LockGuard, LockState};
use signals::{ShutdownSignal, SignalWaiter};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

/// Single-instance guard: take an exclusive lock on a well-known file and
/// hold it until SIGINT or SIGTERM arrives.
#[derive(Parser, Debug)]
#[command(name = "watcher", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "watcher.toml")]
    config: PathBuf,

    /// Lock file path (overrides config)
    #[arg(short, long)]
    lock_file: Option<PathBuf>,

    /// Resolve config and print the settings, don't lock
    #[arg(long)]
    dry_run: bool,

    /// Report whether the lock is currently held and exit
    #[arg(long)]
    status: bool,

    /// Debug logging (lock and lifecycle transitions)
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long)]
    quiet: bool,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        let log_level = if self.verbose {
            Some("debug".to_string())
        } else if self.quiet {
            Some("warn".to_string())
        } else {
            None
        };
        Overrides {
            lock_file: self.lock_file.clone(),
            log_level,
        }
    }
}

/// Anything that stops the watcher before it reaches the signal wait.
#[derive(Debug)]
enum StartupError {
    Config(ConfigError),
    Lock(LockError),
    Signals(std::io::Error),
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartupError::Config(e) => write!(f, "{e}"),
            StartupError::Lock(e) => write!(f, "{e}"),
            StartupError::Signals(e) => write!(f, "failed to register signal handlers: {e}"),
        }
    }
}

impl std::error::Error for StartupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StartupError::Config(e) => Some(e),
            StartupError::Lock(e) => Some(e),
            StartupError::Signals(e) => Some(e),
        }
    }
}

impl From<LockError> for StartupError {
    fn from(e: LockError) -> Self {
        StartupError::Lock(e)
    }
}

impl From<ConfigError> for StartupError {
    fn from(e: ConfigError) -> Self {
        StartupError::Config(e)
    }
}

fn init_tracing(default_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let overrides = cli.overrides();

    // Logging has to be up before a config error can be reported, so the
    // level comes from whatever part of the config did load.
    let loaded = WatcherConfig::load(&cli.config);
    let level = overrides
        .log_level
        .clone()
        .or_else(|| loaded.as_ref().ok().map(|c| c.log.level.clone()))
        .unwrap_or_else(|| LogConfig::default().level);
    init_tracing(&level);
    tracing::debug!(?cli, "parsed CLI arguments");

    let mut config = match loaded {
        Ok(config) => config,
        Err(e) => return fatal(&cli.config, &StartupError::from(e)),
    };
    config.apply_overrides(&overrides);

    if cli.dry_run {
        println!("watcher v{}", env!("CARGO_PKG_VERSION"));
        println!("Config file: {}", cli.config.display());
        println!("Lock file: {}", config.lock.path.display());
        println!("Log level: {}", config.log.level);
        return ExitCode::SUCCESS;
    }

    if cli.status {
        return match LockGuard::probe(&config.lock.path) {
            Ok(state) => {
                println!("{state}");
                match state {
                    LockState::Free => ExitCode::SUCCESS,
                    LockState::Held => ExitCode::from(2),
                }
            }
            Err(e) => fatal(&config.lock.path, &StartupError::from(e)),
        };
    }

    match run(&config.lock.path).await {
        Ok(signal) => {
            tracing::info!(%signal, "lock released, exiting");
            ExitCode::SUCCESS
        }
        Err(e) => fatal(&config.lock.path, &e),
    }
}

/// Hold the lock at `lock_path` until a termination signal arrives.
///
/// The guard is dropped on every return path, so an early error never
/// leaves the lock behind.
async fn run(lock_path: &Path) -> Result<ShutdownSignal, StartupError> {
    tracing::debug!(state = "starting", "installing signal handlers");
    let waiter = SignalWaiter::install().map_err(StartupError::Signals)?;

    tracing::debug!(state = "locking", path = %lock_path.display(), "acquiring lock");
    let mut guard = LockGuard::acquire(lock_path)?;

    tracing::info!(
        state = "running",
        path = %guard.path().display(),
        pid = std::process::id(),
        "lock acquired, waiting for termination signal"
    );
    let signal = waiter.recv().await;

    tracing::debug!(
        state = "shutting_down",
        %signal,
        locked = guard.is_locked(),
        "releasing lock"
    );
    if let Err(e) = guard.unlock() {
        tracing::warn!(error = %e, "failed to release lock cleanly");
    }
    Ok(signal)
}

fn fatal(path: &Path, err: &StartupError) -> ExitCode {
    tracing::error!(path = %path.display(), error = %err, "fatal startup error");
    ExitCode::FAILURE
}
