//! tgd - throttle-guard service binary
//!
//! Runs the enforcement engine in the foreground and provides the operator
//! commands around it (one-shot status, policy cleanup, config check).

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tg_common::normalize_image_name;
use tg_config::{ConfigStore, CONFIG_FILENAME};
use tg_core::event_source::SnapshotEventSource;
use tg_core::exit_codes::ExitCode;
use tg_core::health::HealthSnapshot;
use tg_core::ledger::{LedgerError, PolicyLedger};
use tg_core::logging::{init_logging, LogConfig, LogFormat, LogLevel};
use tg_core::platform;
use tg_core::stop::{install_signal_handler, watch_lines, StopReason, StopSignal};
use tg_core::EngineContext;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Keep chosen applications out of OS power throttling
#[derive(Parser, Debug)]
#[command(name = "tgd")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    global: GlobalOpts,
}

/// Global options available to all commands
#[derive(Args, Debug)]
struct GlobalOpts {
    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    /// Log format (human, jsonl)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    /// Write logs to a rotating file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Args, Debug, Clone)]
struct BaseDirArgs {
    /// Service directory holding the config file and policy manifest
    #[arg(long, env = "TG_BASE_DIR")]
    base_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the engine in the foreground until Ctrl-C or a termination signal
    Run(RunArgs),

    /// One-shot status: which targets are running, which policies are recorded
    Health(BaseDirArgs),

    /// Reverse every policy recorded in the manifest
    RemovePolicies(BaseDirArgs),

    /// Validate the config file and print its targets
    CheckConfig(BaseDirArgs),

    /// Print version information
    Version,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    dir: BaseDirArgs,

    /// Process-table poll interval for start detection (ms)
    #[arg(long, default_value_t = 1000)]
    poll_ms: u64,

    /// Stop after this many seconds at most
    #[arg(long)]
    duration_secs: Option<u64>,

    /// Also stop when stdin closes or a `quit` line arrives
    #[arg(long)]
    stdin: bool,
}

fn main() {
    let cli = Cli::parse();

    let cli_level = if cli.global.quiet {
        Some(LogLevel::Error)
    } else {
        cli.global.log_level
    };
    let mut log_config =
        LogConfig::from_env(cli_level, cli.global.log_format).with_file(cli.global.log_file.clone());

    // The config file's [Logging] section applies when nothing stronger set
    // the level; it is read without creating the file.
    if let Commands::Run(args) = &cli.command {
        let path = resolve_base_dir(&args.dir).join(CONFIG_FILENAME);
        if let Ok(store) = ConfigStore::open(&path) {
            log_config = log_config.with_file_level(store.log_level(), store.log_enabled());
        }
    }
    let log_guard = match init_logging(&log_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("tgd: cannot open log file: {e}");
            std::process::exit(ExitCode::IoError.as_i32());
        }
    };

    let exit_code = match cli.command {
        Commands::Run(args) => run_engine(&args),
        Commands::Health(args) => run_health(&args),
        Commands::RemovePolicies(args) => run_remove_policies(&args),
        Commands::CheckConfig(args) => run_check_config(&args),
        Commands::Version => print_version(),
    };

    // process::exit skips destructors; flush the log file first
    drop(log_guard);
    std::process::exit(exit_code.as_i32());
}

/// `--base-dir`, else `TG_BASE_DIR`, else `<config dir>/throttle-guard`.
fn resolve_base_dir(args: &BaseDirArgs) -> PathBuf {
    args.base_dir.clone().unwrap_or_else(|| {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("throttle-guard")
    })
}

fn ensure_dir(dir: &Path) -> Result<(), ExitCode> {
    std::fs::create_dir_all(dir).map_err(|e| {
        error!(dir = %dir.display(), error = %e, "cannot create base directory");
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            ExitCode::PermissionError
        } else {
            ExitCode::IoError
        }
    })
}

fn print_json<T: Serialize>(value: &T) -> ExitCode {
    match serde_json::to_string_pretty(value) {
        Ok(text) => {
            println!("{text}");
            ExitCode::Clean
        }
        Err(e) => {
            error!(error = %e, "failed to serialize output");
            ExitCode::InternalError
        }
    }
}

fn print_version() -> ExitCode {
    let version_info = serde_json::json!({
        "tgd_version": env!("CARGO_PKG_VERSION"),
        "rust_version": env!("CARGO_PKG_RUST_VERSION"),
        "platform_supported": platform::is_supported(),
    });
    print_json(&version_info)
}

// ============================================================================
// run
// ============================================================================

#[derive(Debug, Serialize)]
struct RunReport {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    stopped_at: DateTime<Utc>,
    stop_reason: StopReason,
    policies_removed: usize,
    shutdown_warnings: u64,
    /// Health as of the moment just before shutdown.
    health: HealthSnapshot,
}

fn run_engine(args: &RunArgs) -> ExitCode {
    if !platform::is_supported() {
        error!("power-throttling controls are not available on this OS");
        return ExitCode::UnsupportedPlatform;
    }
    let base_dir = resolve_base_dir(&args.dir);
    if let Err(code) = ensure_dir(&base_dir) {
        return code;
    }

    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    info!(%run_id, base_dir = %base_dir.display(), "tgd starting");

    let (platform, policies) = platform::native();
    let mut engine = EngineContext::new(&base_dir, Arc::clone(&platform), policies);
    if let Err(e) = engine.init() {
        error!(error = %e, "engine init failed");
        return ExitCode::from(&tg_common::Error::from(e));
    }

    let source = Arc::new(SnapshotEventSource::new(
        platform,
        Arc::new(tg_core::SystemClock::new()),
        args.poll_ms.max(50),
    ));
    if let Err(e) = engine.start(source) {
        error!(error = %e, "engine start failed");
        return ExitCode::from(&tg_common::Error::from(e));
    }

    let stop_reason = wait_for_stop(args);

    let health = engine.health();
    let report = match engine.stop() {
        Ok(stop) => stop,
        Err(e) => {
            error!(error = %e, "engine stop failed");
            return ExitCode::InternalError;
        }
    };

    let code = if report.warnings > 0 {
        ExitCode::PartialFail
    } else {
        ExitCode::Clean
    };
    let printed = print_json(&RunReport {
        run_id,
        started_at,
        stopped_at: Utc::now(),
        stop_reason,
        policies_removed: report.policies_removed,
        shutdown_warnings: report.warnings,
        health,
    });
    if printed.is_success() {
        code
    } else {
        printed
    }
}

/// Block until a signal, the optional stdin watch, or `--duration-secs`.
fn wait_for_stop(args: &RunArgs) -> StopReason {
    let (handle, signal) = StopSignal::new();
    if let Err(e) = install_signal_handler(handle.clone()) {
        warn!(error = %e, "cannot install signal handler; Ctrl-C will not stop cleanly");
    }
    if args.stdin {
        info!("running; press Ctrl-C, close stdin or type 'quit' to stop");
        let stdin_handle = handle.clone();
        let spawned = std::thread::Builder::new()
            .name("tg-stdin".into())
            .spawn(move || watch_lines(std::io::stdin().lock(), &stdin_handle));
        if let Err(e) = spawned {
            warn!(error = %e, "cannot start stdin watch");
        }
    } else {
        info!("running; press Ctrl-C to stop");
    }
    // The signal handler keeps its own clone; this one must not hold the
    // channel open on its behalf.
    drop(handle);
    signal.wait(args.duration_secs.map(Duration::from_secs))
}

// ============================================================================
// health
// ============================================================================

#[derive(Debug, Serialize)]
struct TargetStatus {
    name: String,
    enabled: bool,
    running_pids: Vec<u32>,
    policy_recorded: bool,
}

#[derive(Debug, Serialize)]
struct StatusReport {
    base_dir: PathBuf,
    platform_supported: bool,
    snapshot_error: Option<String>,
    targets: Vec<TargetStatus>,
    /// Manifest entries, including ones for images no longer configured.
    recorded_policies: Vec<String>,
}

fn run_health(args: &BaseDirArgs) -> ExitCode {
    let base_dir = resolve_base_dir(args);
    let store = match ConfigStore::open(&base_dir.join(CONFIG_FILENAME)) {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "cannot read config");
            return ExitCode::ConfigError;
        }
    };

    let (platform, policies) = platform::native();
    let ledger = PolicyLedger::open(&base_dir, policies);
    let (processes, snapshot_error) = match platform.snapshot() {
        Ok(list) => (list, None),
        Err(e) => (Vec::new(), Some(e.to_string())),
    };

    let targets = store
        .targets()
        .iter()
        .map(|t| {
            let name = normalize_image_name(&t.name);
            let running_pids = processes
                .iter()
                .filter(|p| normalize_image_name(&p.image) == name)
                .map(|p| p.pid.0)
                .collect();
            TargetStatus {
                policy_recorded: ledger.is_applied(&name),
                name: t.name.clone(),
                enabled: t.enabled,
                running_pids,
            }
        })
        .collect();

    print_json(&StatusReport {
        base_dir,
        platform_supported: platform::is_supported(),
        snapshot_error,
        targets,
        recorded_policies: ledger.list(),
    })
}

// ============================================================================
// remove-policies
// ============================================================================

fn run_remove_policies(args: &BaseDirArgs) -> ExitCode {
    let base_dir = resolve_base_dir(args);
    let (_, policies) = platform::native();
    let mut ledger = PolicyLedger::open(&base_dir, policies);

    match ledger.remove_all() {
        Ok(removed) => print_json(&serde_json::json!({
            "removed": removed,
            "remaining": 0,
        })),
        Err(LedgerError::Incomplete { failed, total }) => {
            warn!(failed, total, "some policies could not be removed");
            print_json(&serde_json::json!({
                "removed": total - failed,
                "remaining": failed,
            }));
            ExitCode::PartialFail
        }
        Err(e) => {
            error!(error = %e, "policy removal failed");
            ExitCode::IoError
        }
    }
}

// ============================================================================
// check-config
// ============================================================================

fn run_check_config(args: &BaseDirArgs) -> ExitCode {
    let path = resolve_base_dir(args).join(CONFIG_FILENAME);
    match ConfigStore::open(&path) {
        Ok(store) => print_json(&serde_json::json!({
            "path": store.path(),
            "valid": true,
            "log_level": store.log_level(),
            "log_enabled": store.log_enabled(),
            "targets": store.targets(),
        })),
        Err(e) => {
            error!(path = %path.display(), error = %e, "config check failed");
            print_json(&serde_json::json!({
                "path": path,
                "valid": false,
                "error": e.to_string(),
                "code": e.code(),
            }));
            ExitCode::ConfigError
        }
    }
}
