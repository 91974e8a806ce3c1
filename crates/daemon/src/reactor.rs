//! Config-change reactor
//!
//! Compares the effective configuration against the snapshot written by the
//! previous pass and re-applies only the effect groups whose keys changed.
//! The snapshot is written at the end of every pass, even when an effect
//! failed, so a broken effect is not retried in a tight loop.

use crate::config::{ConfigError, ConfigSnapshot, ConfigStore, PowerConfig, StreamConfig};
use crate::services::{
    restart_pipeline, ServiceError, ServiceManager, RESTART_TIMER_UNIT, STREAM_UNIT,
};
use std::collections::BTreeSet;
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Drop-in directory of the restart timer
pub const DEFAULT_TIMER_DROPIN_DIR: &str = "/etc/systemd/system/forpost-stream-autorestart.timer.d";

/// Side effects tied to configuration keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EffectGroup {
    Power,
    Autostart,
    RestartTimer,
    Stream,
}

const STREAM_KEY_PREFIXES: &[&str] = &[
    "RTMP_",
    "RTSP_",
    "VIDEO_",
    "STREAM_",
    "OVERLAY_",
    "SHOW_FREQUENCY",
    "DYNAMIC_",
    "FONT_",
    "USE_UDP_PROXY",
    "UDP_PROXY_",
    "FREQUENCY_",
    "SERIAL_DEVICE",
    "SNIFF_",
    "SCAN_",
];

/// Effect group a key belongs to; `None` for keys with no runtime effect
pub fn group_of(key: &str) -> Option<EffectGroup> {
    if key.starts_with("POWER_SAVE_") || key == "NETWORK_INTERFACE" {
        Some(EffectGroup::Power)
    } else if key == "AUTOSTART_ENABLED" {
        Some(EffectGroup::Autostart)
    } else if key.starts_with("AUTO_RESTART_") {
        Some(EffectGroup::RestartTimer)
    } else if STREAM_KEY_PREFIXES.iter().any(|p| key.starts_with(p)) {
        Some(EffectGroup::Stream)
    } else {
        None
    }
}

/// Groups touched by a set of changed keys
pub fn affected_groups<'a>(changed: impl IntoIterator<Item = &'a String>) -> BTreeSet<EffectGroup> {
    changed.into_iter().filter_map(|key| group_of(key)).collect()
}

#[derive(Debug, Error)]
pub enum EffectError {
    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("{program} failed: {detail}")]
    Command { program: String, detail: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The effects a reconciliation pass can trigger
pub trait Effects {
    fn apply_power(
        &mut self,
        power: &PowerConfig,
        interface: &str,
    ) -> impl Future<Output = Result<(), EffectError>> + Send;

    fn apply_autostart(&mut self, enabled: bool) -> impl Future<Output = Result<(), EffectError>> + Send;

    fn apply_restart_timer(
        &mut self,
        enabled: bool,
        interval_hours: u32,
    ) -> impl Future<Output = Result<(), EffectError>> + Send;

    /// Restart the pipeline if it is running
    fn restart_stream(&mut self, relay_enabled: bool) -> impl Future<Output = Result<(), EffectError>> + Send;
}

/// Commands applying the power-saving settings
pub fn power_commands(power: &PowerConfig, interface: &str) -> Vec<Vec<String>> {
    let block = |off: bool| if off { "block" } else { "unblock" };
    let mut cmds = vec![
        vec!["rfkill".to_string(), block(power.wifi_off).to_string(), "wifi".to_string()],
        vec![
            "rfkill".to_string(),
            block(power.bluetooth_off).to_string(),
            "bluetooth".to_string(),
        ],
        vec![
            "vcgencmd".to_string(),
            "display_power".to_string(),
            if power.hdmi_off { "0" } else { "1" }.to_string(),
        ],
    ];

    let mut ethtool = vec!["ethtool".to_string(), "-s".to_string(), interface.to_string()];
    if power.eth_speed == "auto" {
        ethtool.extend(["autoneg".to_string(), "on".to_string()]);
    } else {
        ethtool.extend([
            "speed".to_string(),
            power.eth_speed.clone(),
            "duplex".to_string(),
            "full".to_string(),
            "autoneg".to_string(),
            power.eth_autoneg.clone(),
        ]);
    }
    cmds.push(ethtool);
    cmds
}

/// Drop-in overriding the restart timer period
pub fn timer_dropin(interval_hours: u32) -> String {
    format!(
        "[Timer]\nOnUnitActiveSec=\nOnUnitActiveSec={}h\n",
        interval_hours.max(1)
    )
}

/// Effects applied to the live system
pub struct SystemEffects<M> {
    pub services: M,
    pub timer_dropin_dir: PathBuf,
}

impl<M: ServiceManager> SystemEffects<M> {
    pub fn new(services: M) -> Self {
        Self {
            services,
            timer_dropin_dir: PathBuf::from(DEFAULT_TIMER_DROPIN_DIR),
        }
    }
}

async fn run_command(argv: &[String]) -> Result<(), EffectError> {
    let (program, args) = match argv.split_first() {
        Some(split) => split,
        None => return Ok(()),
    };
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| EffectError::Command {
            program: program.clone(),
            detail: e.to_string(),
        })?;
    if output.status.success() {
        debug!(?argv, "Command applied");
        Ok(())
    } else {
        Err(EffectError::Command {
            program: program.clone(),
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

impl<M: ServiceManager + Send> Effects for SystemEffects<M> {
    async fn apply_power(&mut self, power: &PowerConfig, interface: &str) -> Result<(), EffectError> {
        // Every setting is attempted; the first failure is reported
        let mut first_error = None;
        for argv in power_commands(power, interface) {
            if let Err(e) = run_command(&argv).await {
                warn!(error = %e, "Power setting not applied");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn apply_autostart(&mut self, enabled: bool) -> Result<(), EffectError> {
        if enabled {
            self.services.enable(STREAM_UNIT).await?;
        } else {
            self.services.disable(STREAM_UNIT).await?;
        }
        Ok(())
    }

    async fn apply_restart_timer(&mut self, enabled: bool, interval_hours: u32) -> Result<(), EffectError> {
        fs::create_dir_all(&self.timer_dropin_dir)?;
        fs::write(
            self.timer_dropin_dir.join("interval.conf"),
            timer_dropin(interval_hours),
        )?;
        self.services.daemon_reload().await?;

        if enabled {
            self.services.enable(RESTART_TIMER_UNIT).await?;
            self.services.restart(RESTART_TIMER_UNIT).await?;
        } else {
            self.services.disable(RESTART_TIMER_UNIT).await?;
            self.services.stop(RESTART_TIMER_UNIT).await?;
        }
        Ok(())
    }

    async fn restart_stream(&mut self, relay_enabled: bool) -> Result<(), EffectError> {
        if !self.services.is_active(STREAM_UNIT).await {
            info!("Stream not running, new settings apply on next start");
            return Ok(());
        }
        restart_pipeline(&self.services, relay_enabled).await?;
        Ok(())
    }
}

/// What one pass did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub first_run: bool,
    pub changed: BTreeSet<String>,
    pub applied: Vec<EffectGroup>,
    pub failed: Vec<(EffectGroup, String)>,
}

/// One reconciliation pass
///
/// Effect errors are logged and collected in the report; only failing to read
/// the configuration or to write the snapshot is an error.
pub async fn reconcile<E: Effects>(
    store: &ConfigStore,
    snapshot_path: &Path,
    effects: &mut E,
) -> Result<ReconcileReport, ConfigError> {
    let current = store.load_effective()?;
    let cfg = StreamConfig::from_map(&current);

    let previous = match ConfigSnapshot::load(snapshot_path) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!(path = %snapshot_path.display(), error = %e, "Unreadable snapshot, treating as first run");
            None
        }
    };

    let mut report = ReconcileReport::default();
    let groups = match &previous {
        None => {
            report.first_run = true;
            report.changed = current.keys().cloned().collect();
            // Autostart stays as installed and the stream was not started
            // from this configuration yet
            [EffectGroup::Power, EffectGroup::RestartTimer]
                .into_iter()
                .collect()
        }
        Some(snapshot) => {
            report.changed = snapshot.changed_keys(&current);
            affected_groups(&report.changed)
        }
    };

    info!(
        first_run = report.first_run,
        changed = ?report.changed,
        groups = ?groups,
        "Reconciling configuration"
    );

    for group in groups {
        let result = match group {
            EffectGroup::Power => {
                effects
                    .apply_power(&cfg.power, &cfg.service.network_interface)
                    .await
            }
            EffectGroup::Autostart => effects.apply_autostart(cfg.service.autostart).await,
            EffectGroup::RestartTimer => {
                effects
                    .apply_restart_timer(
                        cfg.service.auto_restart_enabled,
                        cfg.service.auto_restart_interval_hours,
                    )
                    .await
            }
            EffectGroup::Stream => effects.restart_stream(cfg.relay.enabled).await,
        };
        match result {
            Ok(()) => report.applied.push(group),
            Err(e) => {
                error!(?group, error = %e, "Effect failed");
                report.failed.push((group, e.to_string()));
            }
        }
    }

    ConfigSnapshot::new(current).save(snapshot_path)?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::tests::FakeServices;
    use tempfile::TempDir;

    /// Records which groups were applied; optionally fails one
    #[derive(Default)]
    struct FakeEffects {
        calls: Vec<String>,
        fail_power: bool,
    }

    impl Effects for FakeEffects {
        async fn apply_power(&mut self, power: &PowerConfig, interface: &str) -> Result<(), EffectError> {
            self.calls.push(format!("power wifi_off={} iface={}", power.wifi_off, interface));
            if self.fail_power {
                return Err(EffectError::Command {
                    program: "vcgencmd".to_string(),
                    detail: "not found".to_string(),
                });
            }
            Ok(())
        }

        async fn apply_autostart(&mut self, enabled: bool) -> Result<(), EffectError> {
            self.calls.push(format!("autostart {}", enabled));
            Ok(())
        }

        async fn apply_restart_timer(&mut self, enabled: bool, interval_hours: u32) -> Result<(), EffectError> {
            self.calls.push(format!("timer {} {}h", enabled, interval_hours));
            Ok(())
        }

        async fn restart_stream(&mut self, relay_enabled: bool) -> Result<(), EffectError> {
            self.calls.push(format!("stream relay={}", relay_enabled));
            Ok(())
        }
    }

    fn setup(overrides: &str) -> (TempDir, ConfigStore, PathBuf) {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::in_dir(dir.path());
        fs::write(&store.defaults_path, "VIDEO_FPS=15\nUSE_UDP_PROXY=true\n").unwrap();
        fs::write(&store.overrides_path, overrides).unwrap();
        let snapshot = dir.path().join("state").join("config_snapshot.toml");
        (dir, store, snapshot)
    }

    #[test]
    fn test_group_of() {
        assert_eq!(group_of("POWER_SAVE_WIFI"), Some(EffectGroup::Power));
        assert_eq!(group_of("AUTOSTART_ENABLED"), Some(EffectGroup::Autostart));
        assert_eq!(group_of("AUTO_RESTART_INTERVAL"), Some(EffectGroup::RestartTimer));
        assert_eq!(group_of("RTMP_URL"), Some(EffectGroup::Stream));
        assert_eq!(group_of("OVERLAY_TEXT"), Some(EffectGroup::Stream));
        assert_eq!(group_of("UDP_PROXY_PORT"), Some(EffectGroup::Stream));
        assert_eq!(group_of("UPDATE_REPO"), None);
    }

    #[tokio::test]
    async fn test_first_run_applies_power_and_timer_only() {
        let (_dir, store, snapshot) = setup("RTMP_URL=rtmp://a.example/live/key\n");
        let mut effects = FakeEffects::default();

        let report = reconcile(&store, &snapshot, &mut effects).await.unwrap();

        assert!(report.first_run);
        assert_eq!(report.applied, vec![EffectGroup::Power, EffectGroup::RestartTimer]);
        assert!(effects.calls.iter().all(|c| !c.starts_with("stream")));
        assert!(effects.calls.iter().all(|c| !c.starts_with("autostart")));
        assert!(effects.calls.iter().any(|c| c.starts_with("power")));
        assert!(effects.calls.iter().any(|c| c.starts_with("timer")));
        assert!(snapshot.exists());
    }

    #[tokio::test]
    async fn test_unchanged_config_applies_nothing() {
        let (_dir, store, snapshot) = setup("RTMP_URL=rtmp://a.example/live/key\n");
        reconcile(&store, &snapshot, &mut FakeEffects::default()).await.unwrap();

        let mut effects = FakeEffects::default();
        let report = reconcile(&store, &snapshot, &mut effects).await.unwrap();

        assert!(!report.first_run);
        assert!(report.changed.is_empty());
        assert!(effects.calls.is_empty());
    }

    #[tokio::test]
    async fn test_only_changed_groups_are_applied() {
        let (_dir, store, snapshot) = setup("RTMP_URL=rtmp://a.example/live/key\n");
        reconcile(&store, &snapshot, &mut FakeEffects::default()).await.unwrap();

        store.set("VIDEO_FPS", "25").unwrap();
        store.set("AUTO_RESTART_INTERVAL", "6").unwrap();

        let mut effects = FakeEffects::default();
        let report = reconcile(&store, &snapshot, &mut effects).await.unwrap();

        assert_eq!(
            report.applied,
            vec![EffectGroup::RestartTimer, EffectGroup::Stream]
        );
        assert_eq!(effects.calls, vec!["timer false 6h", "stream relay=true"]);
    }

    #[tokio::test]
    async fn test_removed_key_counts_as_change() {
        let (_dir, store, snapshot) =
            setup("RTMP_URL=rtmp://a.example/live/key\nPOWER_SAVE_WIFI=true\n");
        reconcile(&store, &snapshot, &mut FakeEffects::default()).await.unwrap();

        fs::write(&store.overrides_path, "RTMP_URL=rtmp://a.example/live/key\n").unwrap();
        let mut effects = FakeEffects::default();
        let report = reconcile(&store, &snapshot, &mut effects).await.unwrap();

        assert_eq!(report.applied, vec![EffectGroup::Power]);
        assert_eq!(effects.calls, vec!["power wifi_off=false iface=eth0"]);
    }

    #[tokio::test]
    async fn test_snapshot_written_even_when_effect_fails() {
        let (_dir, store, snapshot) = setup("POWER_SAVE_HDMI=true\n");
        let mut effects = FakeEffects {
            fail_power: true,
            ..FakeEffects::default()
        };

        let report = reconcile(&store, &snapshot, &mut effects).await.unwrap();

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, EffectGroup::Power);
        let saved = ConfigSnapshot::load(&snapshot).unwrap().unwrap();
        assert_eq!(saved.values.get("POWER_SAVE_HDMI").map(String::as_str), Some("true"));
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_treated_as_first_run() {
        let (_dir, store, snapshot) = setup("");
        fs::create_dir_all(snapshot.parent().unwrap()).unwrap();
        fs::write(&snapshot, "values = [not toml").unwrap();

        let mut effects = FakeEffects::default();
        let report = reconcile(&store, &snapshot, &mut effects).await.unwrap();
        assert!(report.first_run);
        assert!(!report.applied.contains(&EffectGroup::Stream));
    }

    #[test]
    fn test_power_commands() {
        let power = PowerConfig {
            wifi_off: true,
            bluetooth_off: false,
            hdmi_off: true,
            eth_speed: "100".to_string(),
            eth_autoneg: "off".to_string(),
        };
        let cmds = power_commands(&power, "eth0");
        assert_eq!(cmds[0], vec!["rfkill", "block", "wifi"]);
        assert_eq!(cmds[1], vec!["rfkill", "unblock", "bluetooth"]);
        assert_eq!(cmds[2], vec!["vcgencmd", "display_power", "0"]);
        assert_eq!(
            cmds[3],
            vec!["ethtool", "-s", "eth0", "speed", "100", "duplex", "full", "autoneg", "off"]
        );
    }

    #[test]
    fn test_power_commands_auto_speed() {
        let cmds = power_commands(&PowerConfig::default(), "end0");
        assert_eq!(cmds[3], vec!["ethtool", "-s", "end0", "autoneg", "on"]);
    }

    #[test]
    fn test_timer_dropin() {
        assert_eq!(
            timer_dropin(4),
            "[Timer]\nOnUnitActiveSec=\nOnUnitActiveSec=4h\n"
        );
        assert!(timer_dropin(0).contains("OnUnitActiveSec=1h"));
    }

    #[tokio::test]
    async fn test_system_timer_effect_writes_dropin_and_reloads() {
        let dir = TempDir::new().unwrap();
        let mut effects = SystemEffects {
            services: FakeServices::default(),
            timer_dropin_dir: dir.path().join("timer.d"),
        };

        effects.apply_restart_timer(true, 3).await.unwrap();

        let dropin = fs::read_to_string(dir.path().join("timer.d").join("interval.conf")).unwrap();
        assert!(dropin.contains("OnUnitActiveSec=3h"));
        assert_eq!(
            effects.services.calls(),
            vec![
                "daemon-reload",
                "enable forpost-stream-autorestart.timer",
                "restart forpost-stream-autorestart.timer",
            ]
        );
    }

    #[tokio::test]
    async fn test_system_stream_effect_only_when_active() {
        let mut idle = SystemEffects::new(FakeServices::default());
        idle.restart_stream(true).await.unwrap();
        assert!(idle.services.calls().is_empty());

        let mut running = SystemEffects::new(
            FakeServices::default().with_unit(STREAM_UNIT, true, true),
        );
        running.restart_stream(true).await.unwrap();
        assert_eq!(
            running.services.calls(),
            vec!["restart forpost-udp-proxy", "restart forpost-stream"]
        );
    }
}
