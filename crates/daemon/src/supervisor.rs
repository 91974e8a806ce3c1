//! Supervisor loop shared by the stream and the relay
//!
//! Each iteration reloads and re-validates the configuration, starts the
//! child, waits for it to exit, records the exit code and asks the restart
//! policy how long to wait before the next start. A configuration error is
//! logged and retried with the same delay, so fixing the config file is
//! enough to bring the stream back.
//!
//! In locked-only mode the stream is gated on the scan-state detector: it is
//! only started while the receiver is not scanning and is killed as soon as a
//! periodic check reports scanning.

use crate::config::{ConfigError, ConfigStore, StreamMode};
use crate::encode::{build_relay_command, build_stream_command, RelayParams, StreamParams};
use crate::frequency::{ConfiguredSource, FrequencySource};
use crate::logging::{open_append, rotate_if_needed, ROTATE_KEEP_BYTES, ROTATE_THRESHOLD_BYTES};
use crate::overlay::ChannelPaths;
use crate::process::SupervisedProcess;
use crate::restart::RestartPolicy;
use crate::scan_state::{Detector, ScanState};
use crate::status::{unix_ms_now, ChildState, SharedStatus, SupervisorStatus};
use crate::transport::resolve_transport;
use std::future::Future;
use std::path::PathBuf;
use std::time::{Duration, UNIX_EPOCH};
use tokio::process::Command;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

/// A run at least this long resets the consecutive failure count
pub const HEALTHY_RUN: Duration = Duration::from_secs(30);

/// How often the log size is checked while a child runs
pub const ROTATE_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Size-based rotation of the child log
#[derive(Debug, Clone, Copy)]
pub struct Rotation {
    pub threshold: u64,
    pub keep: u64,
    pub check_every: Duration,
}

impl Default for Rotation {
    fn default() -> Self {
        Self {
            threshold: ROTATE_THRESHOLD_BYTES,
            keep: ROTATE_KEEP_BYTES,
            check_every: ROTATE_CHECK_INTERVAL,
        }
    }
}

/// Scan-state gate used in locked-only mode
pub struct ScanGate<S> {
    pub source: S,
    /// Check before starting the child
    pub start: Detector,
    /// Periodic check while the child runs
    pub active: Detector,
    pub poll_interval: Duration,
}

impl<S: FrequencySource> ScanGate<S> {
    /// Resolves once a periodic check reports scanning
    async fn watch(&mut self) -> ScanState {
        loop {
            tokio::time::sleep(self.poll_interval).await;
            let state = self.active.detect(&mut self.source).await;
            if state == ScanState::Scanning {
                return state;
            }
        }
    }

    /// Polls with the start threshold until streaming is allowed again
    async fn wait_for_lock(&mut self) -> ScanState {
        loop {
            tokio::time::sleep(self.poll_interval).await;
            let state = self.start.detect(&mut self.source).await;
            if state.allows_streaming() {
                return state;
            }
        }
    }
}

/// Everything needed for one child run
pub struct Prepared<S> {
    pub command: Command,
    pub gate: Option<ScanGate<S>>,
}

/// Produces the child command from fresh configuration each iteration
pub trait ChildLauncher {
    type Source: FrequencySource;

    fn prepare(&mut self) -> Result<Prepared<Self::Source>, ConfigError>;
}

/// The RTSP to RTMP encoder
pub struct StreamLauncher {
    pub store: ConfigStore,
    pub paths: ChannelPaths,
}

impl ChildLauncher for StreamLauncher {
    type Source = ConfiguredSource;

    fn prepare(&mut self) -> Result<Prepared<ConfiguredSource>, ConfigError> {
        let cfg = self.store.load()?;
        cfg.validate()?;

        let transport = resolve_transport(&cfg);
        let params = StreamParams::from_config(&cfg, transport, &self.paths);
        info!(
            input = ?params.input,
            copy_mode = params.is_copy_mode(),
            mode = ?cfg.stream_mode,
            "Prepared stream"
        );

        let gate = (cfg.stream_mode == StreamMode::LockedOnly).then(|| ScanGate {
            source: ConfiguredSource::from_config(&cfg.frequency),
            start: Detector::for_start(&cfg.scan),
            active: Detector::for_active(&cfg.scan),
            poll_interval: Duration::from_secs(cfg.scan.poll_interval_secs.max(1)),
        });

        Ok(Prepared {
            command: build_stream_command(&params),
            gate,
        })
    }
}

/// The loopback RTSP to MPEG-TS relay
pub struct RelayLauncher {
    pub store: ConfigStore,
}

impl ChildLauncher for RelayLauncher {
    type Source = ConfiguredSource;

    fn prepare(&mut self) -> Result<Prepared<ConfiguredSource>, ConfigError> {
        let cfg = self.store.load()?;
        if !cfg.relay.enabled {
            return Err(ConfigError::Invalid("USE_UDP_PROXY is disabled".to_string()));
        }
        if cfg.relay.port == 0 {
            return Err(ConfigError::Invalid("UDP_PROXY_PORT must be non-zero".to_string()));
        }

        let params = RelayParams {
            rtsp_url: cfg.rtsp_source_url(),
            transport: resolve_transport(&cfg),
            port: cfg.relay.port,
        };
        info!(rtsp = %params.rtsp_url, transport = %params.transport, port = params.port, "Prepared relay");

        Ok(Prepared {
            command: build_relay_command(&params),
            gate: None,
        })
    }
}

enum RunOutcome {
    Exited(std::io::Result<std::process::ExitStatus>),
    ScanningDetected,
}

/// Restart loop around one child
pub struct Supervisor<L, P> {
    launcher: L,
    policy: P,
    status: SharedStatus,
    log_path: Option<PathBuf>,
    rotation: Rotation,
    consecutive_failures: u32,
}

impl<L, P> Supervisor<L, P>
where
    L: ChildLauncher,
    P: RestartPolicy,
{
    pub fn new(launcher: L, policy: P, status: SharedStatus) -> Self {
        Self {
            launcher,
            policy,
            status,
            log_path: None,
            rotation: Rotation::default(),
            consecutive_failures: 0,
        }
    }

    /// Append child output to `path`, rotating it before each start and
    /// periodically while the child runs
    pub fn with_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    pub fn with_rotation(mut self, rotation: Rotation) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn status(&self) -> SharedStatus {
        self.status.clone()
    }

    /// Supervise until the policy gives up or `shutdown` resolves
    ///
    /// On shutdown the running child is killed before returning.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        let mut slot: Option<SupervisedProcess> = None;

        tokio::select! {
            _ = self.supervise(&mut slot) => {}
            _ = shutdown => {
                info!("Shutdown requested");
            }
        }

        if let Some(mut child) = slot.take() {
            info!(pid = ?child.pid, "Stopping child");
            child.kill().await;
            let code = child.last_exit_code;
            self.update(|s| s.last_exit_code = code).await;
        }
        self.update(|s| {
            s.state = ChildState::Stopped;
            s.pid = None;
        })
        .await;
    }

    async fn supervise(&mut self, slot: &mut Option<SupervisedProcess>) {
        loop {
            self.rotate_log();

            let mut prepared = match self.launcher.prepare() {
                Ok(prepared) => prepared,
                Err(e) => {
                    error!(error = %e, "Cannot start child");
                    let msg = e.to_string();
                    self.update(|s| {
                        s.state = ChildState::Misconfigured;
                        s.last_error = Some(msg);
                    })
                    .await;
                    self.consecutive_failures += 1;
                    if !self.pause().await {
                        return;
                    }
                    continue;
                }
            };

            if let Some(gate) = prepared.gate.as_mut() {
                let state = gate.start.detect(&mut gate.source).await;
                self.record_scan(state).await;
                if !state.allows_streaming() {
                    info!("Receiver is scanning, holding the stream");
                    self.update(|s| s.state = ChildState::WaitingForLock).await;
                    let state = gate.wait_for_lock().await;
                    self.record_scan(state).await;
                    info!(%state, "Receiver settled, starting the stream");
                }
            }

            let log = self.log_path.as_deref().and_then(|path| match open_append(path) {
                Ok(file) => Some(file),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Cannot open child log");
                    None
                }
            });

            let child = match SupervisedProcess::spawn(&mut prepared.command, log.as_ref()) {
                Ok(child) => child,
                Err(e) => {
                    error!(error = %e, "Failed to spawn child");
                    let msg = e.to_string();
                    self.update(|s| s.last_error = Some(msg)).await;
                    self.consecutive_failures += 1;
                    if !self.pause().await {
                        return;
                    }
                    continue;
                }
            };

            let pid = child.pid;
            let started_ms = child
                .started_at
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as i64)
                .unwrap_or_else(|_| unix_ms_now());
            info!(?pid, "Child started");
            self.update(|s| {
                s.state = ChildState::Running;
                s.pid = pid;
                s.started_at_unix_ms = Some(started_ms);
                s.last_error = None;
            })
            .await;

            let child = slot.insert(child);
            let every = self.rotation.check_every;
            let mut rotation = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            rotation.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let outcome = match prepared.gate.as_mut() {
                Some(gate) => {
                    let watch = gate.watch();
                    tokio::pin!(watch);
                    loop {
                        tokio::select! {
                            result = child.wait() => break RunOutcome::Exited(result),
                            _ = &mut watch => break RunOutcome::ScanningDetected,
                            _ = rotation.tick() => self.rotate_log(),
                        }
                    }
                }
                None => loop {
                    tokio::select! {
                        result = child.wait() => break RunOutcome::Exited(result),
                        _ = rotation.tick() => self.rotate_log(),
                    }
                },
            };

            match outcome {
                RunOutcome::ScanningDetected => {
                    warn!(?pid, "Receiver started scanning, stopping the stream");
                    child.kill().await;
                    let code = child.last_exit_code;
                    *slot = None;
                    self.update(|s| {
                        s.state = ChildState::WaitingForLock;
                        s.pid = None;
                        s.last_exit_code = code;
                        s.restarts += 1;
                        s.last_scan_state = Some(ScanState::Scanning.to_string());
                    })
                    .await;

                    if let Some(gate) = prepared.gate.as_mut() {
                        let state = gate.wait_for_lock().await;
                        self.record_scan(state).await;
                        info!(%state, "Receiver settled, restarting the stream");
                    }
                }
                RunOutcome::Exited(result) => {
                    let uptime = child.uptime();
                    let code = child.last_exit_code;
                    *slot = None;
                    match result {
                        Ok(_) => info!(?pid, exit_code = ?code, uptime_secs = uptime.as_secs(), "Child exited"),
                        Err(e) => error!(?pid, error = %e, "Failed waiting for child"),
                    }

                    if uptime >= HEALTHY_RUN {
                        self.consecutive_failures = 0;
                    }
                    self.consecutive_failures += 1;
                    let failures = self.consecutive_failures;
                    self.update(|s| {
                        s.state = ChildState::Restarting;
                        s.pid = None;
                        s.last_exit_code = code;
                        s.restarts += 1;
                        s.consecutive_failures = failures;
                    })
                    .await;

                    if !self.pause().await {
                        return;
                    }
                }
            }
        }
    }

    /// Sleep the policy delay; false when the policy gives up
    async fn pause(&mut self) -> bool {
        match self.policy.next_delay(self.consecutive_failures) {
            Some(delay) => {
                info!(delay_secs = delay.as_secs_f32(), "Restarting after delay");
                tokio::time::sleep(delay).await;
                true
            }
            None => {
                warn!(failures = self.consecutive_failures, "Restart policy gave up");
                false
            }
        }
    }

    fn rotate_log(&self) {
        if let Some(path) = &self.log_path {
            match rotate_if_needed(path, self.rotation.threshold, self.rotation.keep) {
                Ok(true) => info!(path = %path.display(), "Rotated log"),
                Ok(false) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Log rotation failed"),
            }
        }
    }

    async fn record_scan(&self, state: ScanState) {
        self.update(|s| s.last_scan_state = Some(state.to_string())).await;
    }

    async fn update(&self, f: impl FnOnce(&mut SupervisorStatus)) {
        let mut snapshot = self.status.write().await;
        f(&mut snapshot.supervisor);
        snapshot.timestamp_unix_ms = unix_ms_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan_state::tests::ScriptedSource;
    use crate::status::new_shared_status;
    use std::collections::VecDeque;
    use tempfile::TempDir;

    /// Gives up after a fixed number of delays
    struct StopAfter(u32);

    impl RestartPolicy for StopAfter {
        fn next_delay(&mut self, _consecutive_failures: u32) -> Option<Duration> {
            if self.0 == 0 {
                return None;
            }
            self.0 -= 1;
            Some(Duration::ZERO)
        }
    }

    /// Hands out scripted launches; an exhausted script reads as misconfigured
    struct ScriptedLauncher {
        launches: VecDeque<(Vec<&'static str>, Option<Vec<Option<f64>>>)>,
    }

    impl ChildLauncher for ScriptedLauncher {
        type Source = ScriptedSource;

        fn prepare(&mut self) -> Result<Prepared<ScriptedSource>, ConfigError> {
            let (argv, readings) = self
                .launches
                .pop_front()
                .ok_or_else(|| ConfigError::Invalid("RTMP_URL is empty".to_string()))?;
            let mut command = Command::new(argv[0]);
            command.args(&argv[1..]);
            let detector = Detector {
                samples: 2,
                delay: Duration::ZERO,
                threshold: 1,
            };
            Ok(Prepared {
                command,
                gate: readings.map(|r| ScanGate {
                    source: ScriptedSource::new(&r),
                    start: detector,
                    active: detector,
                    poll_interval: Duration::from_millis(10),
                }),
            })
        }
    }

    fn sh(script: &'static str) -> Vec<&'static str> {
        vec!["sh", "-c", script]
    }

    #[tokio::test]
    async fn test_restarts_after_every_exit() {
        let launcher = ScriptedLauncher {
            launches: vec![(sh("exit 0"), None), (sh("exit 1"), None), (sh("exit 2"), None)].into(),
        };
        let status = new_shared_status("stream");
        Supervisor::new(launcher, StopAfter(2), status.clone())
            .run(std::future::pending())
            .await;

        let snapshot = status.read().await;
        assert_eq!(snapshot.supervisor.restarts, 3);
        assert_eq!(snapshot.supervisor.last_exit_code, Some(2));
        assert_eq!(snapshot.supervisor.consecutive_failures, 3);
        assert_eq!(snapshot.supervisor.state, ChildState::Stopped);
    }

    #[tokio::test]
    async fn test_misconfiguration_is_retried_then_reported() {
        let launcher = ScriptedLauncher {
            launches: VecDeque::new(),
        };
        let status = new_shared_status("stream");
        Supervisor::new(launcher, StopAfter(3), status.clone())
            .run(std::future::pending())
            .await;

        let snapshot = status.read().await;
        assert_eq!(snapshot.supervisor.restarts, 0);
        assert!(snapshot.supervisor.pid.is_none());
        assert!(snapshot
            .supervisor
            .last_error
            .as_deref()
            .unwrap()
            .contains("RTMP_URL"));
    }

    #[tokio::test]
    async fn test_scanning_kills_child_and_waits_for_lock() {
        // start check locked, active check scanning, settle check locked
        let readings = vec![
            Some(5800.0),
            Some(5800.0),
            Some(5800.0),
            Some(5860.0),
            Some(5860.0),
            Some(5860.0),
        ];
        let launcher = ScriptedLauncher {
            launches: vec![(vec!["sleep", "30"], Some(readings))].into(),
        };
        let status = new_shared_status("stream");
        Supervisor::new(launcher, StopAfter(0), status.clone())
            .run(std::future::pending())
            .await;

        let snapshot = status.read().await;
        assert_eq!(snapshot.supervisor.restarts, 1);
        assert_eq!(snapshot.supervisor.last_exit_code, Some(137));
        assert_eq!(snapshot.supervisor.last_scan_state.as_deref(), Some("locked"));
    }

    #[tokio::test]
    async fn test_unknown_scan_state_fails_open() {
        // Failed readings classify as unknown, which must not hold the stream
        let launcher = ScriptedLauncher {
            launches: vec![(sh("exit 0"), Some(vec![None]))].into(),
        };
        let status = new_shared_status("stream");
        Supervisor::new(launcher, StopAfter(0), status.clone())
            .run(std::future::pending())
            .await;

        let snapshot = status.read().await;
        assert_eq!(snapshot.supervisor.restarts, 1);
        assert_eq!(snapshot.supervisor.last_scan_state.as_deref(), Some("unknown"));
    }

    #[tokio::test]
    async fn test_shutdown_kills_running_child() {
        let launcher = ScriptedLauncher {
            launches: vec![(vec!["sleep", "30"], None)].into(),
        };
        let status = new_shared_status("relay");
        Supervisor::new(launcher, StopAfter(0), status.clone())
            .run(tokio::time::sleep(Duration::from_millis(200)))
            .await;

        let snapshot = status.read().await;
        assert_eq!(snapshot.supervisor.state, ChildState::Stopped);
        assert_eq!(snapshot.supervisor.last_exit_code, Some(137));
        assert!(snapshot.supervisor.pid.is_none());
    }

    #[tokio::test]
    async fn test_child_output_appended_to_log() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("stream.log");
        let launcher = ScriptedLauncher {
            launches: vec![(sh("echo 'Connection refused' >&2; exit 1"), None)].into(),
        };
        Supervisor::new(launcher, StopAfter(0), new_shared_status("stream"))
            .with_log(&log)
            .run(std::future::pending())
            .await;

        assert!(std::fs::read_to_string(&log).unwrap().contains("Connection refused"));
    }

    #[tokio::test]
    async fn test_log_rotated_while_child_runs() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("stream.log");
        let launcher = ScriptedLauncher {
            launches: vec![(sh("head -c 4096 /dev/zero; exec sleep 30"), None)].into(),
        };
        Supervisor::new(launcher, StopAfter(0), new_shared_status("stream"))
            .with_log(&log)
            .with_rotation(Rotation {
                threshold: 1024,
                keep: 256,
                check_every: Duration::from_millis(50),
            })
            .run(tokio::time::sleep(Duration::from_millis(500)))
            .await;

        let previous = crate::logging::previous_generation(&log);
        assert_eq!(std::fs::metadata(&previous).unwrap().len(), 256);
        assert!(std::fs::metadata(&log).unwrap().len() < 1024);
    }

    #[test]
    fn test_relay_launcher_requires_relay_enabled() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::in_dir(dir.path());
        store.set("USE_UDP_PROXY", "false").unwrap();

        let mut launcher = RelayLauncher { store };
        assert!(matches!(launcher.prepare(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_stream_launcher_rejects_placeholder_url() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::in_dir(dir.path());
        store.set("RTMP_URL", "rtmp://a.example/live/__RTMP_URL__").unwrap();

        let mut launcher = StreamLauncher {
            store,
            paths: ChannelPaths::in_dir(dir.path()),
        };
        assert!(matches!(launcher.prepare(), Err(ConfigError::Invalid(_))));
    }
}
