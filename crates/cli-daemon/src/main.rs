//! CLI entry point for the forpost stream relay
//!
//! Every long-running service and every periodic job is a subcommand, so each
//! runs as its own process under the service manager.

use clap::{Args, Parser, Subcommand};
use forpost_stream::config::quote_value;
use forpost_stream::frequency::format_frequency;
use forpost_stream::instance_lock::DEFAULT_RUN_DIR;
use forpost_stream::logging::DEFAULT_LOG_DIR;
use forpost_stream::release::read_current_version;
use forpost_stream::startup::check_ffmpeg_available;
use forpost_stream::status_server::run_system_metrics_updater;
use forpost_stream::{
    check_updates, init_logging, log_path, new_shared_status, pid_file, reconcile, run_once,
    run_startup_checks, run_status_server, set_dynamic_text, CacheFile, Channel, ChannelPaths,
    ConfigStore, ConfiguredSource, Detector, DynamicProducer, FixedDelay, FrequencyProducer,
    FrequencySource, InstanceLock, LinuxProbe, OverlayProducers, RelayLauncher, ReleaseClient,
    StreamLauncher, Supervisor, SystemEffects, Systemctl, WatchdogSettings, STATUS_PORT,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

/// RTSP to RTMP relay supervisor
#[derive(Parser, Debug)]
#[command(name = "forpost-stream")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    dirs: Dirs,

    #[command(subcommand)]
    command: Command,
}

/// Filesystem locations shared by all subcommands
#[derive(Args, Debug, Clone)]
struct Dirs {
    /// Directory holding stream.conf.template and stream.conf
    #[arg(long, global = true, default_value = "/etc/forpost")]
    config_dir: PathBuf,

    /// Directory for subsystem log files
    #[arg(long, global = true, default_value = DEFAULT_LOG_DIR)]
    log_dir: PathBuf,

    /// Directory for persisted state (snapshot, release cache, counters)
    #[arg(long, global = true, default_value = "/var/lib/forpost")]
    state_dir: PathBuf,

    /// Directory for PID lock files
    #[arg(long, global = true, default_value = DEFAULT_RUN_DIR)]
    run_dir: PathBuf,

    /// Directory holding the overlay channel files
    #[arg(long, global = true, default_value = "/tmp")]
    channel_dir: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Supervise the RTSP to RTMP encoder
    Stream {
        /// Skip the ffmpeg and strace checks. For testing only.
        #[arg(long)]
        skip_checks: bool,

        /// Loopback port of the status endpoint
        #[arg(long, default_value_t = STATUS_PORT)]
        status_port: u16,
    },

    /// Supervise the loopback UDP relay
    Relay,

    /// Run the overlay producers, or change the dynamic text
    Overlay {
        #[command(subcommand)]
        action: Option<OverlayAction>,
    },

    /// Classify the receiver as locked (0), scanning (1) or unknown (2)
    ScanState {
        /// Transitions needed to report scanning (default: start threshold)
        #[arg(long)]
        threshold: Option<usize>,
    },

    /// Print one frequency reading
    Frequency,

    /// Audit the running stream once and restart it on anomalies
    Watchdog,

    /// Apply the side effects of configuration changes
    Reconcile,

    /// Compare the installed version with the release channel
    CheckUpdates {
        #[arg(long, default_value = "stable")]
        channel: Channel,

        /// Ignore the cached release list
        #[arg(long)]
        force: bool,

        /// File holding the installed version
        #[arg(long, default_value = "/opt/forpost/VERSION")]
        version_file: PathBuf,
    },

    /// Read or change the operator configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum OverlayAction {
    /// Replace the dynamic overlay text
    SetText { text: String },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Write KEY=VALUE into the overrides file
    Set { key: String, value: String },
    /// Print the effective configuration
    Show,
}

/// Resolves on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown requested");
}

fn acquire_lock(dirs: &Dirs, name: &str) -> Option<InstanceLock> {
    match InstanceLock::acquire(&pid_file(&dirs.run_dir, name)) {
        Ok(lock) => Some(lock),
        Err(e) => {
            error!(error = %e, "Cannot acquire instance lock");
            None
        }
    }
}

async fn run_stream(dirs: &Dirs, skip_checks: bool, status_port: u16) -> ExitCode {
    let log = log_path(&dirs.log_dir, "stream");
    init_logging(Some(&log));
    let store = ConfigStore::in_dir(&dirs.config_dir);

    if skip_checks {
        warn!("Skipping startup checks (--skip-checks)");
    } else {
        // An invalid configuration is reported by the supervisor loop instead
        let cfg = store.load().unwrap_or_default();
        if let Err(e) = run_startup_checks(&cfg) {
            error!(error = %e, "Startup checks failed");
            return ExitCode::FAILURE;
        }
    }

    let Some(_lock) = acquire_lock(dirs, "stream") else {
        return ExitCode::FAILURE;
    };

    let status = new_shared_status("stream");
    tokio::spawn(run_system_metrics_updater(status.clone(), Duration::from_secs(5)));
    let server_status = status.clone();
    tokio::spawn(async move {
        if let Err(e) = run_status_server(server_status, status_port).await {
            warn!(error = %e, "Status endpoint unavailable");
        }
    });

    let launcher = StreamLauncher {
        store,
        paths: ChannelPaths::in_dir(&dirs.channel_dir),
    };
    info!(config_dir = %dirs.config_dir.display(), "Stream supervisor starting");
    Supervisor::new(launcher, FixedDelay::default(), status)
        .with_log(&log)
        .run(shutdown_signal())
        .await;
    ExitCode::SUCCESS
}

async fn run_relay(dirs: &Dirs) -> ExitCode {
    let log = log_path(&dirs.log_dir, "relay");
    init_logging(Some(&log));

    if let Err(e) = check_ffmpeg_available() {
        error!(error = %e, "Startup checks failed");
        return ExitCode::FAILURE;
    }
    let Some(_lock) = acquire_lock(dirs, "relay") else {
        return ExitCode::FAILURE;
    };

    let launcher = RelayLauncher {
        store: ConfigStore::in_dir(&dirs.config_dir),
    };
    info!("Relay supervisor starting");
    Supervisor::new(launcher, FixedDelay::default(), new_shared_status("relay"))
        .with_log(&log)
        .run(shutdown_signal())
        .await;
    ExitCode::SUCCESS
}

async fn run_overlay(dirs: &Dirs, action: Option<OverlayAction>) -> ExitCode {
    let paths = ChannelPaths::in_dir(&dirs.channel_dir);
    let cfg = match ConfigStore::in_dir(&dirs.config_dir).load() {
        Ok(cfg) => cfg,
        Err(e) => {
            init_logging(None);
            error!(error = %e, "Cannot load configuration");
            return ExitCode::FAILURE;
        }
    };
    let mut source = ConfiguredSource::from_config(&cfg.frequency);

    if let Some(OverlayAction::SetText { text }) = action {
        init_logging(None);
        let current = source.read().await.ok();
        return match set_dynamic_text(&paths, &text, current) {
            Ok(()) => {
                info!(%text, ?current, "Dynamic overlay text set");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!(error = %e, "Cannot write dynamic overlay");
                ExitCode::FAILURE
            }
        };
    }

    init_logging(Some(&log_path(&dirs.log_dir, "overlay")));
    let show_frequency = cfg.overlay.show_frequency;
    let dynamic_enabled = cfg.overlay.dynamic_enabled;
    info!(show_frequency, dynamic_enabled, "Overlay producers starting");

    let mut producers = OverlayProducers::new(source);
    if show_frequency {
        producers = producers.with_frequency(FrequencyProducer::new(&paths));
    }
    if dynamic_enabled {
        producers = producers.with_dynamic(DynamicProducer::new(
            &paths,
            cfg.overlay.change_threshold,
            Duration::from_secs(cfg.overlay.dwell_secs),
        ));
    }
    let producers = async {
        if producers.is_empty() {
            // Nothing enabled: stay up so the unit does not flap
            std::future::pending::<()>().await;
        }
        producers.run().await
    };

    tokio::select! {
        _ = producers => {}
        _ = shutdown_signal() => {}
    }
    ExitCode::SUCCESS
}

async fn run_scan_state(dirs: &Dirs, threshold: Option<usize>) -> ExitCode {
    init_logging(None);
    let cfg = match ConfigStore::in_dir(&dirs.config_dir).load() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "Cannot load configuration");
            println!("unknown");
            return ExitCode::from(2);
        }
    };
    let threshold = threshold.unwrap_or(cfg.scan.threshold_start);
    let mut source = ConfiguredSource::from_config(&cfg.frequency);
    let state = Detector::with_threshold(&cfg.scan, threshold)
        .detect(&mut source)
        .await;
    println!("{}", state.as_str());
    ExitCode::from(state.exit_code())
}

async fn run_frequency(dirs: &Dirs) -> ExitCode {
    init_logging(None);
    let cfg = match ConfigStore::in_dir(&dirs.config_dir).load() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "Cannot load configuration");
            return ExitCode::FAILURE;
        }
    };
    match ConfiguredSource::from_config(&cfg.frequency).read().await {
        Ok(value) => {
            println!("{}", format_frequency(value));
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "No frequency reading");
            ExitCode::FAILURE
        }
    }
}

async fn run_watchdog(dirs: &Dirs) -> ExitCode {
    init_logging(Some(&log_path(&dirs.log_dir, "watchdog")));
    let cfg = match ConfigStore::in_dir(&dirs.config_dir).load() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "Cannot load configuration");
            return ExitCode::FAILURE;
        }
    };

    let settings = WatchdogSettings::from_config(&cfg, &dirs.state_dir);
    let mut probe = LinuxProbe::new(
        log_path(&dirs.log_dir, "stream"),
        settings.log_tail_lines,
        &cfg.service.network_interface,
    )
    .with_log_offset_state(dirs.state_dir.join("stream_log_offset"));
    match run_once(&Systemctl, &mut probe, &settings).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Watchdog restart failed");
            ExitCode::FAILURE
        }
    }
}

async fn run_reconcile(dirs: &Dirs) -> ExitCode {
    init_logging(Some(&log_path(&dirs.log_dir, "reconcile")));
    let store = ConfigStore::in_dir(&dirs.config_dir);
    let snapshot = dirs.state_dir.join("config_snapshot.toml");
    let mut effects = SystemEffects::new(Systemctl);

    match reconcile(&store, &snapshot, &mut effects).await {
        Ok(report) if report.failed.is_empty() => ExitCode::SUCCESS,
        Ok(report) => {
            for (group, detail) in &report.failed {
                error!(?group, %detail, "Effect failed");
            }
            ExitCode::FAILURE
        }
        Err(e) => {
            error!(error = %e, "Reconciliation failed");
            ExitCode::FAILURE
        }
    }
}

async fn run_check_updates(dirs: &Dirs, channel: Channel, force: bool, version_file: PathBuf) -> ExitCode {
    init_logging(None);
    let repo = match ConfigStore::in_dir(&dirs.config_dir).load() {
        Ok(cfg) => cfg.service.update_repo,
        Err(e) => {
            error!(error = %e, "Cannot load configuration");
            return ExitCode::FAILURE;
        }
    };
    let client = match ReleaseClient::new() {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "Cannot build HTTP client");
            return ExitCode::FAILURE;
        }
    };
    let cache = CacheFile::new(dirs.state_dir.join("releases.json"));
    let current = read_current_version(&version_file);

    let check = match check_updates(&client, &cache, &repo, &current, channel, force).await {
        Ok(check) => check,
        Err(e) => {
            error!(error = %e, %repo, "Release check failed");
            return ExitCode::FAILURE;
        }
    };
    match serde_json::to_string_pretty(&check) {
        Ok(json) => {
            println!("{}", json);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Cannot serialize release check");
            ExitCode::FAILURE
        }
    }
}

fn run_config(dirs: &Dirs, action: ConfigAction) -> ExitCode {
    init_logging(None);
    let store = ConfigStore::in_dir(&dirs.config_dir);
    let result = match action {
        ConfigAction::Set { key, value } => store.set(&key, &value).map(|()| {
            info!(%key, %value, path = %store.overrides_path.display(), "Configuration updated");
        }),
        ConfigAction::Show => store.load_effective().map(|map| {
            for (key, value) in map {
                println!("{}={}", key, quote_value(&value));
            }
        }),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Configuration error");
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let Cli { dirs, command } = Cli::parse();
    let dirs = &dirs;

    match command {
        Command::Stream {
            skip_checks,
            status_port,
        } => run_stream(dirs, skip_checks, status_port).await,
        Command::Relay => run_relay(dirs).await,
        Command::Overlay { action } => run_overlay(dirs, action).await,
        Command::ScanState { threshold } => run_scan_state(dirs, threshold).await,
        Command::Frequency => run_frequency(dirs).await,
        Command::Watchdog => run_watchdog(dirs).await,
        Command::Reconcile => run_reconcile(dirs).await,
        Command::CheckUpdates {
            channel,
            force,
            version_file,
        } => run_check_updates(dirs, channel, force, version_file).await,
        Command::Config { action } => run_config(dirs, action),
    }
}
