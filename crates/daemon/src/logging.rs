//! Logging setup and log file rotation
//!
//! Every subcommand logs to stderr (captured by the journal) and appends
//! timestamped lines to its own file under the log directory. The stream log
//! also receives ffmpeg's stderr, so it is rotated by size before each start.

use chrono::Local;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::fmt::{format::Writer, time::FormatTime};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default log directory on the device
pub const DEFAULT_LOG_DIR: &str = "/var/log/forpost";

/// Rotate once the live log passes this size
pub const ROTATE_THRESHOLD_BYTES: u64 = 10 * 1024 * 1024;

/// Tail kept in the previous generation file
pub const ROTATE_KEEP_BYTES: u64 = 5 * 1024 * 1024;

/// Local-time timestamps, matching what operators see on the device clock
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%d %H:%M:%S"))
    }
}

/// Log file path for a subsystem (`stream`, `watchdog`, ...)
pub fn log_path(dir: &Path, subsystem: &str) -> PathBuf {
    dir.join(format!("{}.log", subsystem))
}

/// Open a log file for appending, creating parent directories
pub fn open_append(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Install the global subscriber
///
/// The filter comes from `RUST_LOG`, defaulting to `info`. When the log file
/// cannot be opened, logging continues on stderr only.
pub fn init_logging(log_file: Option<&Path>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_timer(LocalTimer)
        .with_target(false);

    let mut open_error = None;
    let file_layer = log_file.and_then(|path| match open_append(path) {
        Ok(file) => Some(
            fmt::layer()
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .with_timer(LocalTimer)
                .with_target(false),
        ),
        Err(e) => {
            open_error = Some((path.to_path_buf(), e));
            None
        }
    });

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init();

    if let Some((path, e)) = open_error {
        tracing::warn!(path = %path.display(), error = %e, "Cannot open log file, logging to stderr only");
    }
}

/// Size-based rotation keeping one trimmed previous generation
///
/// When `path` is larger than `threshold`, its last `keep` bytes are written
/// to `<path>.1` (replacing any older generation) and the live file is
/// truncated in place, so handles opened in append mode stay valid.
/// Returns whether a rotation happened.
pub fn rotate_if_needed(path: &Path, threshold: u64, keep: u64) -> io::Result<bool> {
    let size = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if size <= threshold {
        return Ok(false);
    }

    let mut live = OpenOptions::new().read(true).write(true).open(path)?;
    live.seek(SeekFrom::Start(size.saturating_sub(keep)))?;
    let mut tail = Vec::with_capacity(keep.min(size) as usize);
    live.read_to_end(&mut tail)?;

    let previous = previous_generation(path);
    let mut tmp = previous.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    {
        let mut out = File::create(&tmp)?;
        out.write_all(&tail)?;
    }
    fs::rename(&tmp, &previous)?;

    live.set_len(0)?;
    Ok(true)
}

/// Path of the single kept generation: `<path>.1`
pub fn previous_generation(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".1");
    PathBuf::from(name)
}

/// Last `lines` lines of a text file; a missing file reads as empty
pub fn tail_lines(path: &Path, lines: usize) -> io::Result<Vec<String>> {
    tail_lines_since(path, 0, lines)
}

/// Last `lines` lines written after byte `offset`
///
/// A file shorter than `offset` was truncated by rotation and is read whole.
pub fn tail_lines_since(path: &Path, offset: u64, lines: usize) -> io::Result<Vec<String>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let start = usize::try_from(offset)
        .ok()
        .filter(|o| *o <= bytes.len())
        .unwrap_or(0);
    let content = String::from_utf8_lossy(&bytes[start..]);
    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(lines);
    Ok(all[start..].iter().map(|s| s.to_string()).collect())
}
