//! Health watchdog
//!
//! One-shot audit run from a timer. Checks are evaluated in a fixed order and
//! the first one that matches decides the outcome; later checks (notably the
//! slow CPU sampling) are not run at all.

pub mod probe;

pub use probe::{
    count_decode_errors, load_carrier_changes, parse_close_wait, store_carrier_changes,
    LinkStatus, LinuxProbe, SystemProbe,
};

use crate::config::StreamConfig;
use crate::services::{restart_pipeline, ServiceError, ServiceManager, STREAM_UNIT};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Watchdog thresholds and locations
#[derive(Debug, Clone, PartialEq)]
pub struct WatchdogSettings {
    pub log_tail_lines: usize,
    /// Decode errors tolerated in the log window
    pub decode_error_threshold: usize,
    pub carrier_state: PathBuf,
    pub rtmp_port: u16,
    pub relay_enabled: bool,
    /// Below this the encoder counts as idle
    pub cpu_min_percent: f32,
    pub cpu_samples: usize,
    pub cpu_interval: Duration,
}

impl WatchdogSettings {
    pub fn from_config(cfg: &StreamConfig, state_dir: &Path) -> Self {
        Self {
            log_tail_lines: 200,
            decode_error_threshold: 30,
            carrier_state: state_dir.join("carrier_changes"),
            rtmp_port: cfg.rtmp_port(),
            relay_enabled: cfg.relay.enabled,
            cpu_min_percent: 1.0,
            cpu_samples: 3,
            cpu_interval: Duration::from_secs(10),
        }
    }

    /// Total time the encoder must stay idle to count as stalled
    pub fn cpu_dwell(&self) -> Duration {
        self.cpu_interval * self.cpu_samples as u32
    }
}

/// Outcome of one audit
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Disabled,
    Inactive,
    EncoderMissing { main_pid: Option<u32> },
    DecodeErrors { count: usize },
    LinkDown,
    LinkFlapped { previous: u64, current: u64 },
    CloseWait { sockets: Vec<String> },
    Stalled { samples: Vec<f32> },
    Healthy { samples: Vec<f32> },
}

impl Verdict {
    pub fn needs_restart(&self) -> bool {
        matches!(
            self,
            Verdict::DecodeErrors { .. }
                | Verdict::LinkDown
                | Verdict::LinkFlapped { .. }
                | Verdict::CloseWait { .. }
                | Verdict::Stalled { .. }
        )
    }
}

/// Link down, or the carrier counter moved since the last run
///
/// The counter is persisted on every run where it can be read; the first run
/// only records a baseline.
fn check_link(link: Option<LinkStatus>, state_file: &Path) -> Option<Verdict> {
    let link = link?;

    let mut verdict = None;
    if let Some(current) = link.carrier_changes {
        if let Some(previous) = load_carrier_changes(state_file) {
            if current > previous {
                verdict = Some(Verdict::LinkFlapped { previous, current });
            }
        }
        if let Err(e) = store_carrier_changes(state_file, current) {
            warn!(path = %state_file.display(), error = %e, "Cannot persist carrier counter");
        }
    }

    if !link.up {
        return Some(Verdict::LinkDown);
    }
    verdict
}

/// Run the checks in order and return the first match
pub async fn evaluate<M, P>(services: &M, probe: &mut P, settings: &WatchdogSettings) -> Verdict
where
    M: ServiceManager,
    P: SystemProbe,
{
    if !services.is_enabled(STREAM_UNIT).await {
        return Verdict::Disabled;
    }
    if !services.is_active(STREAM_UNIT).await {
        return Verdict::Inactive;
    }

    let main_pid = services.main_pid(STREAM_UNIT).await;
    let encoder = match main_pid.and_then(|pid| probe.encoder_pid(pid)) {
        Some(pid) => pid,
        None => return Verdict::EncoderMissing { main_pid },
    };

    let count = probe.decode_errors();
    if count > settings.decode_error_threshold {
        return Verdict::DecodeErrors { count };
    }

    if let Some(verdict) = check_link(probe.link_status(), &settings.carrier_state) {
        return verdict;
    }

    let sockets = probe.close_wait_sockets(settings.rtmp_port).await;
    if !sockets.is_empty() {
        return Verdict::CloseWait { sockets };
    }

    let samples = probe
        .cpu_samples(encoder, settings.cpu_samples, settings.cpu_interval)
        .await;
    let stalled = samples.len() == settings.cpu_samples
        && !samples.is_empty()
        && samples.iter().all(|cpu| *cpu < settings.cpu_min_percent);
    if stalled {
        Verdict::Stalled { samples }
    } else {
        Verdict::Healthy { samples }
    }
}

/// One watchdog run: evaluate, log, and act
pub async fn run_once<M, P>(
    services: &M,
    probe: &mut P,
    settings: &WatchdogSettings,
) -> Result<Verdict, ServiceError>
where
    M: ServiceManager,
    P: SystemProbe,
{
    let verdict = evaluate(services, probe, settings).await;

    match &verdict {
        Verdict::Disabled => info!("Stream service disabled, nothing to check"),
        Verdict::Inactive => warn!("Stream service enabled but not active"),
        Verdict::EncoderMissing { main_pid } => {
            warn!(?main_pid, "Supervisor running without an encoder child")
        }
        Verdict::DecodeErrors { count } => warn!(
            count,
            threshold = settings.decode_error_threshold,
            "Decode errors over threshold, restarting"
        ),
        Verdict::LinkDown => warn!("Network link down, restarting"),
        Verdict::LinkFlapped { previous, current } => {
            warn!(previous, current, "Network link flapped, restarting")
        }
        Verdict::CloseWait { sockets } => {
            for socket in sockets {
                warn!(%socket, "CLOSE-WAIT socket to RTMP server");
            }
            warn!(count = sockets.len(), "Half-closed RTMP connection, restarting");
        }
        Verdict::Stalled { samples } => warn!(
            ?samples,
            dwell_secs = settings.cpu_dwell().as_secs(),
            "Encoder idle, restarting"
        ),
        Verdict::Healthy { samples } => info!(?samples, "Stream healthy"),
    }

    if verdict.needs_restart() {
        restart_pipeline(services, settings.relay_enabled).await?;
        probe.mark_restarted();
    }
    Ok(verdict)
}
