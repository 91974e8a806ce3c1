//! Single-writer text slots read by the encoder's drawtext filters
//!
//! Each channel is a one-line file rewritten atomically (temp file then
//! rename), so `drawtext ... reload=1` never reads a half-written value.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Well-known channel files shared with the encoder and the web backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPaths {
    pub frequency: PathBuf,
    pub dynamic: PathBuf,
    pub scan_state: PathBuf,
    /// Reference frequency the dynamic text was set against
    pub dynamic_reference: PathBuf,
}

impl Default for ChannelPaths {
    fn default() -> Self {
        Self::in_dir(Path::new("/tmp"))
    }
}

impl ChannelPaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            frequency: dir.join("forpost_frequency.txt"),
            dynamic: dir.join("forpost_dynamic_overlay.txt"),
            scan_state: dir.join("forpost_scanning_state.txt"),
            dynamic_reference: dir.join("forpost_last_freq_dynamic.txt"),
        }
    }
}

/// A named overlay slot backed by a file
#[derive(Debug, Clone)]
pub struct OverlayChannel {
    name: &'static str,
    path: PathBuf,
}

impl OverlayChannel {
    pub fn new(name: &'static str, path: impl Into<PathBuf>) -> Self {
        Self {
            name,
            path: path.into(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Publish a value: one line, world readable and writable
    pub fn publish(&self, value: &str) -> io::Result<()> {
        let line = value.lines().next().unwrap_or_default();

        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, format!("{}\n", line))?;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o666))?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Current value, `None` if the channel was never written
    pub fn read(&self) -> io::Result<Option<String>> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(Some(content.trim_end_matches(['\n', '\r']).to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Create the file empty if absent so the drawtext filter can open it
    pub fn ensure_exists(&self) -> io::Result<()> {
        if self.path.exists() {
            return Ok(());
        }
        self.publish("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_publish_then_read() {
        let dir = TempDir::new().unwrap();
        let channel = OverlayChannel::new("frequency", dir.path().join("freq.txt"));
        assert_eq!(channel.read().unwrap(), None);

        channel.publish("5800 MHz").unwrap();
        assert_eq!(channel.read().unwrap().as_deref(), Some("5800 MHz"));
        assert!(!dir.path().join("freq.txt.tmp").exists());
    }

    #[test]
    fn test_publish_keeps_first_line_only() {
        let dir = TempDir::new().unwrap();
        let channel = OverlayChannel::new("dynamic", dir.path().join("dyn.txt"));
        channel.publish("first\nsecond").unwrap();
        assert_eq!(fs::read_to_string(channel.path()).unwrap(), "first\n");
    }

    #[test]
    fn test_publish_is_world_writable() {
        let dir = TempDir::new().unwrap();
        let channel = OverlayChannel::new("scan_state", dir.path().join("scan.txt"));
        channel.publish("stable").unwrap();
        let mode = fs::metadata(channel.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o666);
    }

    #[test]
    fn test_ensure_exists_does_not_clobber() {
        let dir = TempDir::new().unwrap();
        let channel = OverlayChannel::new("frequency", dir.path().join("freq.txt"));
        channel.ensure_exists().unwrap();
        assert_eq!(channel.read().unwrap().as_deref(), Some(""));

        channel.publish("433.9").unwrap();
        channel.ensure_exists().unwrap();
        assert_eq!(channel.read().unwrap().as_deref(), Some("433.9"));
    }

    #[test]
    fn test_default_paths_live_in_tmp() {
        let paths = ChannelPaths::default();
        assert_eq!(paths.frequency, PathBuf::from("/tmp/forpost_frequency.txt"));
        assert_eq!(paths.scan_state, PathBuf::from("/tmp/forpost_scanning_state.txt"));
    }
}
