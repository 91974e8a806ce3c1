//! Observations the watchdog makes about the host
//!
//! `SystemProbe` is the seam between the check order and the OS. The Linux
//! probe reads the stream log, sysfs link state, `ss` output and the process
//! table.

use crate::logging::tail_lines_since;
use crate::procs::{cpu_usage, find_descendant, list_processes};
use std::fs;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// ffmpeg messages that indicate a corrupted input stream
pub const DECODE_ERROR_PATTERNS: &[&str] = &[
    "error while decoding",
    "decode_slice_header error",
    "concealing",
    "non-existing pps",
    "no frame!",
    "missing picture in access unit",
    "invalid nal unit size",
    "corrupt decoded frame",
];

/// Link state of the uplink interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkStatus {
    pub up: bool,
    /// Kernel counter of carrier transitions since boot
    pub carrier_changes: Option<u64>,
}

pub trait SystemProbe {
    /// Encoder process under the supervisor's main PID
    fn encoder_pid(&mut self, main_pid: u32) -> Option<u32>;

    /// Decode-error lines in the trailing window of the stream log, counting
    /// only output written since the last restart
    fn decode_errors(&mut self) -> usize;

    /// Called after the watchdog restarted the pipeline
    fn mark_restarted(&mut self);

    /// `None` when the interface does not exist
    fn link_status(&mut self) -> Option<LinkStatus>;

    /// Half-closed connections towards the RTMP port
    fn close_wait_sockets(&mut self, port: u16) -> impl Future<Output = Vec<String>> + Send;

    /// CPU usage samples of `pid`, one per interval
    fn cpu_samples(
        &mut self,
        pid: u32,
        samples: usize,
        interval: Duration,
    ) -> impl Future<Output = Vec<f32>> + Send;
}

/// Count lines matching any decode error pattern (case-insensitive)
pub fn count_decode_errors<S: AsRef<str>>(lines: &[S]) -> usize {
    lines
        .iter()
        .filter(|line| {
            let lower = line.as_ref().to_lowercase();
            DECODE_ERROR_PATTERNS.iter().any(|p| lower.contains(p))
        })
        .count()
}

/// Port part of `addr:port`, including bracketed IPv6 forms
fn port_of(addr: &str) -> Option<u16> {
    addr.rsplit_once(':').and_then(|(_, port)| port.parse().ok())
}

/// Sockets from `ss -tn state close-wait` whose peer is on `port`
///
/// With a state filter `ss` drops the State column, leaving
/// `Recv-Q Send-Q Local Peer [Process]`.
pub fn parse_close_wait(output: &str, port: u16) -> Vec<String> {
    output
        .lines()
        .filter(|line| !line.trim_start().starts_with("Recv-Q"))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let (local, peer) = match fields.as_slice() {
                [_, _, local, peer, ..] => (*local, *peer),
                _ => return None,
            };
            (port_of(peer) == Some(port)).then(|| format!("{} -> {}", local, peer))
        })
        .collect()
}

/// Probe backed by the live system
#[derive(Debug, Clone)]
pub struct LinuxProbe {
    pub stream_log: PathBuf,
    pub log_tail_lines: usize,
    pub interface: String,
    pub sysfs_net: PathBuf,
    /// Stream log length at the last watchdog restart
    pub log_offset_state: Option<PathBuf>,
}

impl LinuxProbe {
    pub fn new(stream_log: impl Into<PathBuf>, log_tail_lines: usize, interface: &str) -> Self {
        Self {
            stream_log: stream_log.into(),
            log_tail_lines,
            interface: interface.to_string(),
            sysfs_net: PathBuf::from("/sys/class/net"),
            log_offset_state: None,
        }
    }

    /// Persist the restart offset so the next run skips older output
    pub fn with_log_offset_state(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_offset_state = Some(path.into());
        self
    }

    fn log_offset(&self) -> u64 {
        self.log_offset_state
            .as_deref()
            .and_then(|path| fs::read_to_string(path).ok())
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0)
    }

    fn read_sysfs(&self, file: &str) -> io::Result<String> {
        fs::read_to_string(self.sysfs_net.join(&self.interface).join(file))
            .map(|s| s.trim().to_string())
    }
}

impl SystemProbe for LinuxProbe {
    fn encoder_pid(&mut self, main_pid: u32) -> Option<u32> {
        find_descendant(&list_processes(), main_pid, "ffmpeg").map(|p| p.pid)
    }

    fn decode_errors(&mut self) -> usize {
        match tail_lines_since(&self.stream_log, self.log_offset(), self.log_tail_lines) {
            Ok(lines) => count_decode_errors(&lines),
            Err(e) => {
                debug!(path = %self.stream_log.display(), error = %e, "Cannot read stream log");
                0
            }
        }
    }

    fn mark_restarted(&mut self) {
        let Some(state) = &self.log_offset_state else {
            return;
        };
        let len = fs::metadata(&self.stream_log).map(|m| m.len()).unwrap_or(0);
        let written = state
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|()| fs::write(state, format!("{}\n", len)));
        if let Err(e) = written {
            warn!(path = %state.display(), error = %e, "Cannot persist stream log offset");
        }
    }

    fn link_status(&mut self) -> Option<LinkStatus> {
        let operstate = self.read_sysfs("operstate").ok()?;
        let carrier_changes = self
            .read_sysfs("carrier_changes")
            .ok()
            .and_then(|s| s.parse().ok());
        Some(LinkStatus {
            up: operstate == "up",
            carrier_changes,
        })
    }

    async fn close_wait_sockets(&mut self, port: u16) -> Vec<String> {
        let output = Command::new("ss")
            .args(["-tn", "state", "close-wait"])
            .stdin(Stdio::null())
            .output()
            .await;
        match output {
            Ok(out) => parse_close_wait(&String::from_utf8_lossy(&out.stdout), port),
            Err(e) => {
                debug!(error = %e, "ss unavailable");
                Vec::new()
            }
        }
    }

    async fn cpu_samples(&mut self, pid: u32, samples: usize, interval: Duration) -> Vec<f32> {
        let mut out = Vec::with_capacity(samples);
        for _ in 0..samples {
            match cpu_usage(pid, interval).await {
                Some(usage) => out.push(usage),
                None => break,
            }
        }
        out
    }
}

/// Previous carrier counter, persisted between watchdog runs
pub fn load_carrier_changes(path: &Path) -> Option<u64> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

pub fn store_carrier_changes(path: &Path, value: u64) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, format!("{}\n", value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_count_decode_errors() {
        let lines = [
            "frame=  100 fps= 15 q=-1.0 size=    512kB",
            "[h264 @ 0x55] error while decoding MB 12 30, bytestream -5",
            "[h264 @ 0x55] concealing 400 DC, 400 AC, 400 MV errors in P frame",
            "[h264 @ 0x55] non-existing PPS 0 referenced",
            "Stream started",
        ];
        assert_eq!(count_decode_errors(&lines), 3);
        assert_eq!(count_decode_errors::<&str>(&[]), 0);
    }

    #[test]
    fn test_parse_close_wait_filters_by_peer_port() {
        let output = "\
Recv-Q Send-Q      Local Address:Port       Peer Address:Port Process
1      0         192.168.1.20:51234      203.0.113.7:1935
0      0         192.168.1.20:40022      203.0.113.9:443
0      0      [2001:db8::20]:51000   [2001:db8::7]:1935
";
        let sockets = parse_close_wait(output, 1935);
        assert_eq!(sockets.len(), 2);
        assert_eq!(sockets[0], "192.168.1.20:51234 -> 203.0.113.7:1935");
        assert!(parse_close_wait(output, 8080).is_empty());
    }

    #[test]
    fn test_parse_close_wait_ignores_local_port_match() {
        let output = "0 0 127.0.0.1:1935 127.0.0.1:50000\n";
        assert!(parse_close_wait(output, 1935).is_empty());
    }

    #[test]
    fn test_link_status_from_sysfs() {
        let dir = TempDir::new().unwrap();
        let iface = dir.path().join("eth0");
        fs::create_dir_all(&iface).unwrap();
        fs::write(iface.join("operstate"), "up\n").unwrap();
        fs::write(iface.join("carrier_changes"), "4\n").unwrap();

        let mut probe = LinuxProbe::new(dir.path().join("stream.log"), 100, "eth0");
        probe.sysfs_net = dir.path().to_path_buf();
        assert_eq!(
            probe.link_status(),
            Some(LinkStatus {
                up: true,
                carrier_changes: Some(4)
            })
        );

        probe.interface = "wlan9".to_string();
        assert_eq!(probe.link_status(), None);
    }

    #[test]
    fn test_decode_errors_from_log_tail() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("stream.log");
        fs::write(&log, "error while decoding\nok\nok\nerror while decoding\n").unwrap();

        let mut probe = LinuxProbe::new(&log, 2, "eth0");
        assert_eq!(probe.decode_errors(), 1);
        probe.log_tail_lines = 10;
        assert_eq!(probe.decode_errors(), 2);
    }

    #[test]
    fn test_decode_errors_ignore_output_before_restart() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("stream.log");
        let offset = dir.path().join("state").join("stream_log_offset");
        fs::write(&log, "[h264 @ 0x55] error while decoding MB 1 2\n".repeat(31)).unwrap();

        let mut probe = LinuxProbe::new(&log, 200, "eth0").with_log_offset_state(&offset);
        assert_eq!(probe.decode_errors(), 31);
        probe.mark_restarted();

        let mut healthy = fs::OpenOptions::new().append(true).open(&log).unwrap();
        for _ in 0..20 {
            writeln!(healthy, "frame=  100 fps= 15 q=-1.0 size=    512kB").unwrap();
        }

        // A later watchdog process reads the persisted offset
        let mut next_run = LinuxProbe::new(&log, 200, "eth0").with_log_offset_state(&offset);
        assert_eq!(next_run.decode_errors(), 0);

        writeln!(healthy, "[h264 @ 0x55] error while decoding MB 3 4").unwrap();
        assert_eq!(next_run.decode_errors(), 1);
    }

    #[test]
    fn test_carrier_state_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("carrier_changes");
        assert_eq!(load_carrier_changes(&path), None);
        store_carrier_changes(&path, 7).unwrap();
        assert_eq!(load_carrier_changes(&path), Some(7));
    }
}
