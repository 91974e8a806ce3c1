//! Startup checks
//!
//! Preflight checks run once before a supervisor starts its loop:
//! - ffmpeg is installed, reports a parsable version and can draw overlays
//! - strace is installed when the sniff frequency source is selected
//! - the overlay font exists when an overlay is enabled

use crate::config::{FrequencySourceKind, StreamConfig};
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tracing::{info, warn};

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("FFmpeg not available: {0}")]
    FfmpegUnavailable(String),

    #[error("strace not available: {0}")]
    StraceUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What `ffmpeg -version` says about the installed build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FfmpegBuild {
    /// Version token as printed: `6.0`, `n7.1-3-gabc`, `5.1.4-0+deb12u1+rpt3`
    pub version: String,
    /// Absent for git snapshots such as `N-112233-gabc`
    pub major: Option<u32>,
    /// drawtext, used by every overlay, needs libfreetype
    pub freetype: bool,
}

pub fn parse_ffmpeg_build(output: &str) -> Option<FfmpegBuild> {
    let version = output
        .lines()
        .find_map(|line| line.trim().strip_prefix("ffmpeg version "))?
        .split_whitespace()
        .next()?
        .to_string();

    let numeric = version.strip_prefix('n').unwrap_or(&version);
    let major = numeric
        .split(|c: char| !c.is_ascii_digit())
        .next()
        .and_then(|digits| digits.parse().ok());

    let freetype = output
        .lines()
        .filter(|line| line.trim_start().starts_with("configuration:"))
        .any(|line| line.contains("--enable-libfreetype"));

    Some(FfmpegBuild {
        version,
        major,
        freetype,
    })
}

/// Verify ffmpeg runs and describe its build
pub fn check_ffmpeg_available() -> Result<FfmpegBuild, StartupError> {
    let output = Command::new("ffmpeg")
        .arg("-version")
        .output()
        .map_err(|e| {
            StartupError::FfmpegUnavailable(format!(
                "ffmpeg -version failed; is ffmpeg installed and in PATH? Error: {}",
                e
            ))
        })?;

    if !output.status.success() {
        return Err(StartupError::FfmpegUnavailable(
            "ffmpeg -version failed".to_string(),
        ));
    }

    let version_output = String::from_utf8_lossy(&output.stdout);
    parse_ffmpeg_build(&version_output).ok_or_else(|| {
        StartupError::FfmpegUnavailable(format!(
            "Unrecognised ffmpeg -version output: {}",
            version_output.lines().next().unwrap_or("(empty)")
        ))
    })
}

/// Overlays are drawn with drawtext, which a build without libfreetype lacks
pub fn drawtext_warning(cfg: &StreamConfig, build: &FfmpegBuild) -> Option<String> {
    (cfg.overlay.any_enabled() && !build.freetype).then(|| {
        format!(
            "ffmpeg {} was built without libfreetype, overlays will make the stream fail",
            build.version
        )
    })
}

/// Verify strace runs; only needed by the sniff frequency source
pub fn check_strace_available() -> Result<(), StartupError> {
    let output = Command::new("strace").arg("-V").output().map_err(|e| {
        StartupError::StraceUnavailable(format!(
            "strace -V failed; install strace or switch FREQUENCY_SOURCE to file. Error: {}",
            e
        ))
    })?;

    if !output.status.success() {
        return Err(StartupError::StraceUnavailable(
            "strace -V failed".to_string(),
        ));
    }
    Ok(())
}

/// Overlay font problems are not fatal: drawtext falls back to fontconfig
pub fn font_warning(cfg: &StreamConfig) -> Option<String> {
    if !cfg.overlay.any_enabled() || cfg.overlay.font_file.is_empty() {
        return None;
    }
    if Path::new(&cfg.overlay.font_file).exists() {
        None
    } else {
        Some(format!(
            "Overlay font {} not found, ffmpeg will use its default font",
            cfg.overlay.font_file
        ))
    }
}

/// Checks for the stream supervisor
pub fn run_startup_checks(cfg: &StreamConfig) -> Result<(), StartupError> {
    let build = check_ffmpeg_available()?;
    info!(version = %build.version, major = ?build.major, freetype = build.freetype, "FFmpeg available");
    if let Some(msg) = drawtext_warning(cfg, &build) {
        warn!("{}", msg);
    }

    if cfg.frequency.source == FrequencySourceKind::Sniff && cfg.overlay.show_frequency {
        check_strace_available()?;
    }

    if let Some(msg) = font_warning(cfg) {
        warn!("{}", msg);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::NamedTempFile;

    const PI_BUILD: &str = "ffmpeg version 5.1.4-0+deb12u1+rpt3 Copyright (c) 2000-2023 the FFmpeg developers
built with gcc 12 (Debian 12.2.0-14)
configuration: --prefix=/usr --enable-gpl --enable-libfreetype --enable-libx264 --enable-omx-rpi
libavutil      57. 28.100 / 57. 28.100";

    #[test]
    fn test_parse_distribution_build() {
        let build = parse_ffmpeg_build(PI_BUILD).unwrap();
        assert_eq!(build.version, "5.1.4-0+deb12u1+rpt3");
        assert_eq!(build.major, Some(5));
        assert!(build.freetype);
    }

    #[test]
    fn test_parse_minimal_build_without_freetype() {
        let build = parse_ffmpeg_build("ffmpeg version n7.1-3-gabc Copyright\nconfiguration: --disable-everything").unwrap();
        assert_eq!(build.major, Some(7));
        assert!(!build.freetype);
    }

    #[test]
    fn test_git_snapshot_has_no_major() {
        let build = parse_ffmpeg_build("ffmpeg version N-112233-gabcdef Copyright").unwrap();
        assert_eq!(build.version, "N-112233-gabcdef");
        assert_eq!(build.major, None);
    }

    #[test]
    fn test_parse_rejects_other_output() {
        assert!(parse_ffmpeg_build("not ffmpeg at all").is_none());
        assert!(parse_ffmpeg_build("").is_none());
        // Only the banner line counts
        assert!(parse_ffmpeg_build("libavutil built for ffmpeg version 6.0").is_none());
    }

    #[test]
    fn test_drawtext_warning_needs_overlay_and_missing_freetype() {
        let mut cfg = StreamConfig::default();
        let mut build = parse_ffmpeg_build(PI_BUILD).unwrap();
        build.freetype = false;
        assert!(drawtext_warning(&cfg, &build).is_none());

        cfg.overlay.static_enabled = true;
        cfg.overlay.text = "Gate".to_string();
        assert!(drawtext_warning(&cfg, &build).unwrap().contains("libfreetype"));

        build.freetype = true;
        assert!(drawtext_warning(&cfg, &build).is_none());
    }

    #[test]
    fn test_font_warning_only_when_overlay_enabled() {
        let mut cfg = StreamConfig::default();
        cfg.overlay.font_file = "/nonexistent/font.ttf".to_string();
        assert!(font_warning(&cfg).is_none());

        cfg.overlay.static_enabled = true;
        cfg.overlay.text = "Gate".to_string();
        assert!(font_warning(&cfg).is_some());

        let font = NamedTempFile::new().unwrap();
        cfg.overlay.font_file = font.path().display().to_string();
        assert!(font_warning(&cfg).is_none());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_parse_major_version(major in 1u32..20, minor in 0u32..10, n_prefix in any::<bool>()) {
            let prefix = if n_prefix { "n" } else { "" };
            let output = format!("ffmpeg version {}{}.{} Copyright", prefix, major, minor);
            prop_assert_eq!(parse_ffmpeg_build(&output).and_then(|b| b.major), Some(major));
        }
    }
}
