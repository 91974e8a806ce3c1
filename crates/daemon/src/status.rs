//! Supervisor status snapshot
//!
//! Provides the structs published by a running supervisor and served as JSON
//! on the loopback status endpoint.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::RwLock;

/// SoC temperature on the Raspberry Pi, in millidegrees Celsius
pub const THERMAL_ZONE: &str = "/sys/class/thermal/thermal_zone0/temp";

/// Lifecycle of the supervised child
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChildState {
    /// Supervisor started, child not launched yet
    #[default]
    Starting,
    Running,
    /// Waiting out the restart delay
    Restarting,
    /// Held back by the locked-only gate
    WaitingForLock,
    /// Configuration invalid, retrying
    Misconfigured,
    Stopped,
}

/// State of one supervised child
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SupervisorStatus {
    pub name: String,
    pub state: ChildState,
    pub pid: Option<u32>,
    pub started_at_unix_ms: Option<i64>,
    pub last_exit_code: Option<i32>,
    pub restarts: u64,
    pub consecutive_failures: u32,
    pub last_scan_state: Option<String>,
    pub last_error: Option<String>,
}

/// Resources held by the supervised ffmpeg
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ChildUsage {
    pub pid: u32,
    pub cpu_percent: f32,
    pub rss_bytes: u64,
}

/// Device load as seen next to the child
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub mem_usage_percent: f32,
    pub load_avg_1: f32,
    /// Absent off the Pi or when the thermal zone is unreadable
    pub soc_temp_celsius: Option<f32>,
    /// Absent while no child runs
    pub child: Option<ChildUsage>,
}

/// Complete snapshot served on `/status`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StatusSnapshot {
    pub timestamp_unix_ms: i64,
    pub version: String,
    pub supervisor: SupervisorStatus,
    pub system: SystemMetrics,
}

/// Shared status state for concurrent access
pub type SharedStatus = Arc<RwLock<StatusSnapshot>>;

/// Creates a new SharedStatus for the named supervisor
pub fn new_shared_status(name: &str) -> SharedStatus {
    Arc::new(RwLock::new(StatusSnapshot {
        version: env!("CARGO_PKG_VERSION").to_string(),
        supervisor: SupervisorStatus {
            name: name.to_string(),
            ..SupervisorStatus::default()
        },
        ..StatusSnapshot::default()
    }))
}

/// Samples device and child usage on every tick
///
/// CPU figures are deltas against the previous sample, so one sampler is kept
/// for the lifetime of the updater. The first sample reports zero CPU.
pub struct MetricsSampler {
    sys: System,
}

impl Default for MetricsSampler {
    fn default() -> Self {
        Self { sys: System::new() }
    }
}

impl MetricsSampler {
    pub fn sample(&mut self, child_pid: Option<u32>) -> SystemMetrics {
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();
        if let Some(pid) = child_pid {
            self.sys
                .refresh_processes(ProcessesToUpdate::Some(&[Pid::from_u32(pid)]));
        }

        let child = child_pid.and_then(|pid| {
            self.sys.process(Pid::from_u32(pid)).map(|p| ChildUsage {
                pid,
                cpu_percent: p.cpu_usage(),
                rss_bytes: p.memory(),
            })
        });

        SystemMetrics {
            cpu_usage_percent: self.sys.global_cpu_usage(),
            mem_usage_percent: percent(self.sys.used_memory(), self.sys.total_memory()),
            load_avg_1: System::load_average().one as f32,
            soc_temp_celsius: read_soc_temp(Path::new(THERMAL_ZONE)),
            child,
        }
    }
}

fn percent(used: u64, total: u64) -> f32 {
    if total == 0 {
        return 0.0;
    }
    (used as f64 / total as f64 * 100.0) as f32
}

/// Thermal zone reading in degrees Celsius
pub fn read_soc_temp(path: &Path) -> Option<f32> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|raw| parse_millidegrees(&raw))
}

fn parse_millidegrees(raw: &str) -> Option<f32> {
    raw.trim().parse::<i64>().ok().map(|m| m as f32 / 1000.0)
}

/// Current wall-clock time in milliseconds
pub fn unix_ms_now() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_state_serializes_snake_case() {
        let json = serde_json::to_string(&ChildState::WaitingForLock).unwrap();
        assert_eq!(json, "\"waiting_for_lock\"");
    }

    #[tokio::test]
    async fn test_new_shared_status_carries_name() {
        let status = new_shared_status("stream");
        let snapshot = status.read().await;
        assert_eq!(snapshot.supervisor.name, "stream");
        assert_eq!(snapshot.supervisor.state, ChildState::Starting);
        assert_eq!(snapshot.supervisor.restarts, 0);
        assert!(!snapshot.version.is_empty());
    }

    #[test]
    fn test_snapshot_json_roundtrip() {
        let snapshot = StatusSnapshot {
            timestamp_unix_ms: 1_760_000_000_000,
            version: "1.4.0".to_string(),
            supervisor: SupervisorStatus {
                name: "relay".to_string(),
                state: ChildState::Running,
                pid: Some(4242),
                started_at_unix_ms: Some(1_759_999_990_000),
                last_exit_code: Some(1),
                restarts: 3,
                consecutive_failures: 1,
                last_scan_state: Some("locked".to_string()),
                last_error: None,
            },
            system: SystemMetrics {
                cpu_usage_percent: 31.5,
                soc_temp_celsius: Some(52.1),
                child: Some(ChildUsage {
                    pid: 4242,
                    cpu_percent: 87.0,
                    rss_bytes: 48 << 20,
                }),
                ..SystemMetrics::default()
            },
        };
        let json = serde_json::to_string(&snapshot).unwrap();
        let back: StatusSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snapshot);
    }

    #[test]
    fn test_sampler_reports_child_usage() {
        let me = std::process::id();
        let mut sampler = MetricsSampler::default();
        sampler.sample(Some(me));
        let metrics = sampler.sample(Some(me));

        assert!(metrics.mem_usage_percent >= 0.0 && metrics.mem_usage_percent <= 100.0);
        let child = metrics.child.unwrap();
        assert_eq!(child.pid, me);
        assert!(child.rss_bytes > 0);
    }

    #[test]
    fn test_sampler_without_child() {
        let mut sampler = MetricsSampler::default();
        assert!(sampler.sample(None).child.is_none());
        // A pid that has already been reaped
        assert!(sampler.sample(Some(u32::MAX - 1)).child.is_none());
    }

    #[test]
    fn test_soc_temp() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("temp");
        std::fs::write(&path, "48312\n").unwrap();
        assert_eq!(read_soc_temp(&path), Some(48.312));

        std::fs::write(&path, "garbage").unwrap();
        assert_eq!(read_soc_temp(&path), None);
        assert_eq!(read_soc_temp(&dir.path().join("absent")), None);
    }

    #[test]
    fn test_percent_of_zero_total() {
        assert_eq!(percent(10, 0), 0.0);
        assert_eq!(percent(25, 100), 25.0);
    }

    #[test]
    fn test_unix_ms_now() {
        assert!(unix_ms_now() > 1_577_836_800_000);
    }
}
