//! Frequency acquisition
//!
//! Two sources exist. The file source reads a value the receiver tooling
//! writes directly and is the supported path. The sniff source attaches
//! `strace` to the process that talks to the serial device and extracts the
//! frequency from its `read()` payloads; it is kept only for installations
//! whose tooling cannot write the value file.

use crate::config::{FrequencyConfig, FrequencySourceKind};
use crate::procs::{find_by_name, list_processes};
use fs2::FileExt;
use regex::Regex;
use std::fs::{File, OpenOptions};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

/// Lock serialising sniff attempts across processes
pub const SNIFF_LOCK_PATH: &str = "/tmp/forpost_frequency_sniff.lock";

/// How long strace stays attached per reading
const SNIFF_WINDOW: Duration = Duration::from_millis(1500);

/// Error type for frequency acquisition
#[derive(Debug, Error)]
pub enum FrequencyError {
    /// The source produced nothing that looks like a frequency
    #[error("No frequency value found")]
    NoValue,

    /// Another acquisition holds the single-flight lock
    #[error("Another frequency acquisition is already running")]
    Busy,

    /// The process to sniff is not running
    #[error("Process '{0}' is not running")]
    ProcessNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Anything that can produce a frequency reading
pub trait FrequencySource {
    fn read(&mut self) -> impl Future<Output = Result<f64, FrequencyError>> + Send;
}

fn number_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+(?:\.\d+)?").expect("valid regex"))
}

fn read_payload_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"read\(\d+,\s*"((?:[^"\\]|\\.)*)"(?:\.\.\.)?,\s*\d+\)\s*=\s*[1-9]"#)
            .expect("valid regex")
    })
}

fn escape_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\\(?:[0-7]{1,3}|x[0-9a-fA-F]{2}|.)").expect("valid regex"))
}

/// First number in a line of text
pub fn parse_frequency(text: &str) -> Option<f64> {
    number_regex()
        .find(text)
        .and_then(|m| m.as_str().parse().ok())
}

/// Last frequency carried by a successful `read()` in strace output
///
/// Escape sequences in the payload (`\r`, `\n`, octal bytes) are blanked out
/// first so their digits are not mistaken for a value. Numbers shorter than
/// three digits are ignored as protocol noise.
pub fn parse_strace_reads(output: &str) -> Option<f64> {
    read_payload_regex()
        .captures_iter(output)
        .filter_map(|caps| {
            let payload = escape_regex().replace_all(&caps[1], " ");
            number_regex()
                .find_iter(&payload)
                .filter(|m| m.as_str().split('.').next().map_or(0, str::len) >= 3)
                .last()
                .and_then(|m| m.as_str().parse::<f64>().ok())
        })
        .last()
}

/// Display form used on the overlay: `433.92 MHz`, `5800 MHz`
pub fn format_frequency(value: f64) -> String {
    let text = format!("{:.3}", value);
    let text = text.trim_end_matches('0').trim_end_matches('.');
    format!("{} MHz", text)
}

/// Reads the first line of a value file
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl FrequencySource for FileSource {
    async fn read(&mut self) -> Result<f64, FrequencyError> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        content
            .lines()
            .next()
            .and_then(parse_frequency)
            .ok_or(FrequencyError::NoValue)
    }
}

/// Exclusive non-blocking lock held for one acquisition
#[derive(Debug)]
pub struct SingleFlight {
    file: File,
}

impl SingleFlight {
    /// Take the lock or fail immediately with `Busy`
    pub fn acquire(path: &Path) -> Result<Self, FrequencyError> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        file.try_lock_exclusive()
            .map_err(|_| FrequencyError::Busy)?;
        Ok(Self { file })
    }
}

impl Drop for SingleFlight {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Legacy strace-based sniffer
#[derive(Debug, Clone)]
pub struct SniffSource {
    process: String,
    serial_device: String,
    lock_path: PathBuf,
    window: Duration,
}

impl SniffSource {
    pub fn new(process: impl Into<String>, serial_device: impl Into<String>) -> Self {
        Self {
            process: process.into(),
            serial_device: serial_device.into(),
            lock_path: PathBuf::from(SNIFF_LOCK_PATH),
            window: SNIFF_WINDOW,
        }
    }

    pub fn with_lock_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.lock_path = path.into();
        self
    }

    /// Arguments for attaching strace to `pid`
    pub fn strace_args(&self, pid: u32) -> Vec<String> {
        vec![
            "-p".to_string(),
            pid.to_string(),
            "-e".to_string(),
            "trace=read".to_string(),
            "-P".to_string(),
            self.serial_device.clone(),
            "-s".to_string(),
            "128".to_string(),
            "-qq".to_string(),
        ]
    }

    async fn capture(&self, pid: u32) -> Result<String, FrequencyError> {
        let mut child = Command::new("strace")
            .args(self.strace_args(pid))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut captured = String::new();
        if let Some(stderr) = child.stderr.take() {
            let mut lines = BufReader::new(stderr).lines();
            let collect = async {
                while let Ok(Some(line)) = lines.next_line().await {
                    captured.push_str(&line);
                    captured.push('\n');
                }
            };
            // Window elapsing is the normal way out
            let _ = tokio::time::timeout(self.window, collect).await;
        }

        // strace may already have exited when the target did
        if let Err(e) = child.kill().await {
            debug!(error = %e, "strace already gone");
        }
        Ok(captured)
    }
}

impl FrequencySource for SniffSource {
    async fn read(&mut self) -> Result<f64, FrequencyError> {
        let _guard = SingleFlight::acquire(&self.lock_path)?;

        let pid = find_by_name(&list_processes(), &self.process)
            .map(|p| p.pid)
            .ok_or_else(|| FrequencyError::ProcessNotFound(self.process.clone()))?;

        let output = self.capture(pid).await?;
        let value = parse_strace_reads(&output).ok_or(FrequencyError::NoValue)?;
        debug!(pid, value, "Sniffed frequency");
        Ok(value)
    }
}

/// Source selected from configuration
#[derive(Debug, Clone)]
pub enum ConfiguredSource {
    File(FileSource),
    Sniff(SniffSource),
}

impl ConfiguredSource {
    pub fn from_config(cfg: &FrequencyConfig) -> Self {
        match cfg.source {
            FrequencySourceKind::File => Self::File(FileSource::new(&cfg.file)),
            FrequencySourceKind::Sniff => Self::Sniff(SniffSource::new(
                cfg.sniff_process.clone(),
                cfg.serial_device.clone(),
            )),
        }
    }
}

impl FrequencySource for ConfiguredSource {
    async fn read(&mut self) -> Result<f64, FrequencyError> {
        match self {
            ConfiguredSource::File(src) => src.read().await,
            ConfiguredSource::Sniff(src) => src.read().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_frequency() {
        assert_eq!(parse_frequency("5800"), Some(5800.0));
        assert_eq!(parse_frequency("F=433.92 MHz"), Some(433.92));
        assert_eq!(parse_frequency("no value"), None);
        assert_eq!(parse_frequency(""), None);
    }

    #[test]
    fn test_parse_strace_reads_takes_last_read() {
        let output = r#"read(5, "FREQ:5740\r\n", 128) = 11
read(5, "", 128) = 0
read(5, "\330\1FREQ:5800\r\n", 128) = 13
"#;
        assert_eq!(parse_strace_reads(output), Some(5800.0));
    }

    #[test]
    fn test_parse_strace_reads_ignores_escape_digits() {
        let output = r#"read(5, "\330\377\12", 128) = 3"#;
        assert_eq!(parse_strace_reads(output), None);
    }

    #[test]
    fn test_parse_strace_reads_ignores_failed_reads() {
        let output = r#"read(5, "5800", 128) = -1 EAGAIN (Resource temporarily unavailable)"#;
        assert_eq!(parse_strace_reads(output), None);
    }

    #[test]
    fn test_format_frequency() {
        assert_eq!(format_frequency(5800.0), "5800 MHz");
        assert_eq!(format_frequency(433.92), "433.92 MHz");
        assert_eq!(format_frequency(1200.5), "1200.5 MHz");
    }

    #[test]
    fn test_strace_args_filter_serial_device() {
        let src = SniffSource::new("dzyga", "/dev/ttyUSB0");
        let args = src.strace_args(77);
        assert!(args.windows(2).any(|w| w[0] == "-p" && w[1] == "77"));
        assert!(args.windows(2).any(|w| w[0] == "-P" && w[1] == "/dev/ttyUSB0"));
        assert!(args.windows(2).any(|w| w[0] == "-e" && w[1] == "trace=read"));
    }

    #[test]
    fn test_single_flight_rejects_second_holder() {
        let dir = TempDir::new().unwrap();
        let lock = dir.path().join("sniff.lock");

        let first = SingleFlight::acquire(&lock).unwrap();
        assert!(matches!(SingleFlight::acquire(&lock), Err(FrequencyError::Busy)));

        drop(first);
        assert!(SingleFlight::acquire(&lock).is_ok());
    }

    #[tokio::test]
    async fn test_sniff_rejected_while_locked() {
        let dir = TempDir::new().unwrap();
        let lock = dir.path().join("sniff.lock");
        let _held = SingleFlight::acquire(&lock).unwrap();

        let mut src = SniffSource::new("no-such-process", "/dev/null").with_lock_path(&lock);
        assert!(matches!(src.read().await, Err(FrequencyError::Busy)));
    }

    #[tokio::test]
    async fn test_file_source() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("frequency");
        let mut src = FileSource::new(&path);

        assert!(matches!(src.read().await, Err(FrequencyError::Io(_))));

        std::fs::write(&path, "5865\n").unwrap();
        assert_eq!(src.read().await.unwrap(), 5865.0);

        std::fs::write(&path, "searching\n").unwrap();
        assert!(matches!(src.read().await, Err(FrequencyError::NoValue)));
    }
}
