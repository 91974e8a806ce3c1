//! Core configuration structures and layered loading logic

use crate::keyvalue::{apply_updates, parse_key_values, ConfigMap};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Placeholder left in the template until the operator fills in a destination
pub const RTMP_PLACEHOLDER: &str = "__RTMP_URL__";

/// Prefix for environment variable overrides (`FORPOST_VIDEO_FPS=25`)
pub const ENV_PREFIX: &str = "FORPOST_";

/// Every key the typed configuration understands
pub const KNOWN_KEYS: &[&str] = &[
    "RTMP_URL",
    "RTSP_URL",
    "RTSP_PORT",
    "RTSP_PATH",
    "VIDEO_DEVICE",
    "RTSP_TRANSPORT",
    "RTSP_SERVER_PROCESS",
    "VIDEO_FPS",
    "VIDEO_CRF",
    "VIDEO_PRESET",
    "VIDEO_BITRATE",
    "STREAM_MODE",
    "OVERLAY_ENABLED",
    "OVERLAY_TEXT",
    "SHOW_FREQUENCY",
    "DYNAMIC_OVERLAY_ENABLED",
    "FONT_FILE",
    "FONT_SIZE",
    "DYNAMIC_CHANGE_THRESHOLD",
    "DYNAMIC_DWELL_SECS",
    "USE_UDP_PROXY",
    "UDP_PROXY_PORT",
    "FREQUENCY_SOURCE",
    "FREQUENCY_FILE",
    "SERIAL_DEVICE",
    "SNIFF_PROCESS",
    "SCAN_SAMPLES",
    "SCAN_SAMPLE_DELAY_MS",
    "SCAN_THRESHOLD_START",
    "SCAN_THRESHOLD_ACTIVE",
    "SCAN_POLL_INTERVAL",
    "NETWORK_INTERFACE",
    "AUTOSTART_ENABLED",
    "AUTO_RESTART_ENABLED",
    "AUTO_RESTART_INTERVAL",
    "POWER_SAVE_WIFI",
    "POWER_SAVE_BLUETOOTH",
    "POWER_SAVE_HDMI",
    "POWER_SAVE_ETH_SPEED",
    "POWER_SAVE_ETH_AUTONEG",
    "UPDATE_REPO",
];

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading or writing a config file
    Io(io::Error),
    /// Snapshot file could not be parsed
    Parse(toml::de::Error),
    /// Snapshot could not be serialized
    Serialize(toml::ser::Error),
    /// Configuration is not usable for streaming
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to access config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config snapshot: {}", e),
            ConfigError::Serialize(e) => write!(f, "Failed to serialize config snapshot: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<toml::ser::Error> for ConfigError {
    fn from(e: toml::ser::Error) -> Self {
        ConfigError::Serialize(e)
    }
}

/// RTSP transport selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    /// Inspect the running RTSP server to decide
    Auto,
    Tcp,
    Udp,
}

impl TransportMode {
    fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "tcp" => Some(Self::Tcp),
            "udp" => Some(Self::Udp),
            _ => None,
        }
    }
}

/// When the stream is allowed to run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
    /// Stream unconditionally
    Always,
    /// Stream only while the monitored frequency is locked
    LockedOnly,
}

impl StreamMode {
    fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "always" => Some(Self::Always),
            "locked_only" | "locked" => Some(Self::LockedOnly),
            _ => None,
        }
    }
}

/// Where frequency readings come from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FrequencySourceKind {
    /// Value file written directly by the upstream device tooling
    File,
    /// Legacy syscall sniffing of the process talking to the serial device
    Sniff,
}

impl FrequencySourceKind {
    fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "file" => Some(Self::File),
            "sniff" | "strace" => Some(Self::Sniff),
            _ => None,
        }
    }
}

/// Camera-side source settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceConfig {
    /// Explicit RTSP URL; derived from port and path when empty
    pub rtsp_url: String,
    pub rtsp_port: u16,
    pub rtsp_path: String,
    /// Capture device served by the local RTSP server
    pub video_device: String,
    pub transport: TransportMode,
    /// Process name of the local RTSP server, inspected in `auto` mode
    pub server_process: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            rtsp_url: String::new(),
            rtsp_port: 8554,
            rtsp_path: "video".to_string(),
            video_device: "/dev/video0".to_string(),
            transport: TransportMode::Auto,
            server_process: "mediamtx".to_string(),
        }
    }
}

/// Encoder settings used when a filter graph forces a re-encode
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncodingConfig {
    pub fps: u32,
    pub crf: u32,
    pub preset: String,
    pub bitrate: String,
}

impl Default for EncodingConfig {
    fn default() -> Self {
        Self {
            fps: 15,
            crf: 23,
            preset: "ultrafast".to_string(),
            bitrate: "1500k".to_string(),
        }
    }
}

/// Text overlay toggles and drawtext styling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OverlayConfig {
    /// Static text overlay
    pub static_enabled: bool,
    pub text: String,
    /// Frequency overlay
    pub show_frequency: bool,
    /// Free-form dynamic overlay
    pub dynamic_enabled: bool,
    pub font_file: String,
    pub font_size: u32,
    /// Frequency delta that counts as a retune
    pub change_threshold: f64,
    /// Seconds without a retune before the state returns to stable
    pub dwell_secs: u64,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            static_enabled: false,
            text: String::new(),
            show_frequency: false,
            dynamic_enabled: false,
            font_file: "/usr/share/fonts/truetype/dejavu/DejaVuSans-Bold.ttf".to_string(),
            font_size: 24,
            change_threshold: 5.0,
            dwell_secs: 5,
        }
    }
}

impl OverlayConfig {
    /// True when any overlay needs the filter graph
    pub fn any_enabled(&self) -> bool {
        self.static_enabled || self.show_frequency || self.dynamic_enabled
    }
}

/// Loopback UDP relay settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelayConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 5000,
        }
    }
}

/// Frequency acquisition settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FrequencyConfig {
    pub source: FrequencySourceKind,
    pub file: PathBuf,
    pub serial_device: String,
    /// Process whose serial reads are sniffed in `sniff` mode
    pub sniff_process: String,
}

impl Default for FrequencyConfig {
    fn default() -> Self {
        Self {
            source: FrequencySourceKind::File,
            file: PathBuf::from("/run/forpost/frequency"),
            serial_device: "/dev/ttyUSB0".to_string(),
            sniff_process: "dzyga".to_string(),
        }
    }
}

/// Scan-state sampling settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanConfig {
    pub samples: usize,
    pub sample_delay_ms: u64,
    /// Transition count that blocks a stream from starting
    pub threshold_start: usize,
    /// Transition count that stops a running stream
    pub threshold_active: usize,
    pub poll_interval_secs: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            samples: 5,
            sample_delay_ms: 400,
            threshold_start: 1,
            threshold_active: 3,
            poll_interval_secs: 10,
        }
    }
}

/// Power saving toggles
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PowerConfig {
    pub wifi_off: bool,
    pub bluetooth_off: bool,
    pub hdmi_off: bool,
    /// `auto`, `100` or `1000`
    pub eth_speed: String,
    /// `on` or `off`
    pub eth_autoneg: String,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            wifi_off: false,
            bluetooth_off: false,
            hdmi_off: false,
            eth_speed: "auto".to_string(),
            eth_autoneg: "on".to_string(),
        }
    }
}

/// Service registration and maintenance settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceConfig {
    pub autostart: bool,
    pub auto_restart_enabled: bool,
    /// Hours between scheduled restarts
    pub auto_restart_interval_hours: u32,
    pub network_interface: String,
    /// GitHub `owner/name` releases are checked against
    pub update_repo: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            autostart: false,
            auto_restart_enabled: false,
            auto_restart_interval_hours: 2,
            network_interface: "eth0".to_string(),
            update_repo: "forpost/forpost-stream".to_string(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamConfig {
    /// RTMP destination
    pub rtmp_url: String,
    pub stream_mode: StreamMode,
    pub source: SourceConfig,
    pub encoding: EncodingConfig,
    pub overlay: OverlayConfig,
    pub relay: RelayConfig,
    pub frequency: FrequencyConfig,
    pub scan: ScanConfig,
    pub power: PowerConfig,
    pub service: ServiceConfig,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            rtmp_url: String::new(),
            stream_mode: StreamMode::Always,
            source: SourceConfig::default(),
            encoding: EncodingConfig::default(),
            overlay: OverlayConfig::default(),
            relay: RelayConfig::default(),
            frequency: FrequencyConfig::default(),
            scan: ScanConfig::default(),
            power: PowerConfig::default(),
            service: ServiceConfig::default(),
        }
    }
}

/// Accept "true", "1", "yes", "on" as true; "false", "0", "no", "off" as false
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn set_parsed<T: std::str::FromStr>(slot: &mut T, val: &str) {
    if let Ok(parsed) = val.trim().parse::<T>() {
        *slot = parsed;
    }
}

fn set_bool(slot: &mut bool, val: &str) {
    if let Some(b) = parse_bool(val) {
        *slot = b;
    }
}

impl StreamConfig {
    /// Build the typed configuration from an effective key/value map
    ///
    /// Unknown keys are ignored; values that fail to parse keep their default.
    pub fn from_map(map: &ConfigMap) -> Self {
        let mut config = Self::default();
        for (key, value) in map {
            config.apply_value(key, value);
        }
        config
    }

    /// Apply a single `KEY=VALUE` assignment
    pub fn apply_value(&mut self, key: &str, val: &str) {
        match key {
            "RTMP_URL" => self.rtmp_url = val.trim().to_string(),
            "RTSP_URL" => self.source.rtsp_url = val.trim().to_string(),
            "RTSP_PORT" => set_parsed(&mut self.source.rtsp_port, val),
            "RTSP_PATH" => self.source.rtsp_path = val.trim().trim_matches('/').to_string(),
            "VIDEO_DEVICE" => self.source.video_device = val.trim().to_string(),
            "RTSP_TRANSPORT" => {
                if let Some(mode) = TransportMode::parse(val.trim()) {
                    self.source.transport = mode;
                }
            }
            "RTSP_SERVER_PROCESS" => self.source.server_process = val.trim().to_string(),
            "VIDEO_FPS" => set_parsed(&mut self.encoding.fps, val),
            "VIDEO_CRF" => set_parsed(&mut self.encoding.crf, val),
            "VIDEO_PRESET" => self.encoding.preset = val.trim().to_string(),
            "VIDEO_BITRATE" => self.encoding.bitrate = val.trim().to_string(),
            "STREAM_MODE" => {
                if let Some(mode) = StreamMode::parse(val.trim()) {
                    self.stream_mode = mode;
                }
            }
            "OVERLAY_ENABLED" => set_bool(&mut self.overlay.static_enabled, val),
            "OVERLAY_TEXT" => self.overlay.text = val.to_string(),
            "SHOW_FREQUENCY" => set_bool(&mut self.overlay.show_frequency, val),
            "DYNAMIC_OVERLAY_ENABLED" => set_bool(&mut self.overlay.dynamic_enabled, val),
            "FONT_FILE" => self.overlay.font_file = val.trim().to_string(),
            "FONT_SIZE" => set_parsed(&mut self.overlay.font_size, val),
            "DYNAMIC_CHANGE_THRESHOLD" => set_parsed(&mut self.overlay.change_threshold, val),
            "DYNAMIC_DWELL_SECS" => set_parsed(&mut self.overlay.dwell_secs, val),
            "USE_UDP_PROXY" => set_bool(&mut self.relay.enabled, val),
            "UDP_PROXY_PORT" => set_parsed(&mut self.relay.port, val),
            "FREQUENCY_SOURCE" => {
                if let Some(kind) = FrequencySourceKind::parse(val.trim()) {
                    self.frequency.source = kind;
                }
            }
            "FREQUENCY_FILE" => self.frequency.file = PathBuf::from(val.trim()),
            "SERIAL_DEVICE" => self.frequency.serial_device = val.trim().to_string(),
            "SNIFF_PROCESS" => self.frequency.sniff_process = val.trim().to_string(),
            "SCAN_SAMPLES" => set_parsed(&mut self.scan.samples, val),
            "SCAN_SAMPLE_DELAY_MS" => set_parsed(&mut self.scan.sample_delay_ms, val),
            "SCAN_THRESHOLD_START" => set_parsed(&mut self.scan.threshold_start, val),
            "SCAN_THRESHOLD_ACTIVE" => set_parsed(&mut self.scan.threshold_active, val),
            "SCAN_POLL_INTERVAL" => set_parsed(&mut self.scan.poll_interval_secs, val),
            "NETWORK_INTERFACE" => self.service.network_interface = val.trim().to_string(),
            "AUTOSTART_ENABLED" => set_bool(&mut self.service.autostart, val),
            "AUTO_RESTART_ENABLED" => set_bool(&mut self.service.auto_restart_enabled, val),
            "AUTO_RESTART_INTERVAL" => {
                set_parsed(&mut self.service.auto_restart_interval_hours, val)
            }
            "POWER_SAVE_WIFI" => set_bool(&mut self.power.wifi_off, val),
            "POWER_SAVE_BLUETOOTH" => set_bool(&mut self.power.bluetooth_off, val),
            "POWER_SAVE_HDMI" => set_bool(&mut self.power.hdmi_off, val),
            "POWER_SAVE_ETH_SPEED" => self.power.eth_speed = val.trim().to_lowercase(),
            "POWER_SAVE_ETH_AUTONEG" => self.power.eth_autoneg = val.trim().to_lowercase(),
            "UPDATE_REPO" => self.service.update_repo = val.trim().to_string(),
            _ => {}
        }
    }

    /// Keyframe interval: two seconds worth of frames
    pub fn gop(&self) -> u32 {
        self.encoding.fps.saturating_mul(2)
    }

    /// RTSP URL the relay or encoder pulls from
    pub fn rtsp_source_url(&self) -> String {
        if !self.source.rtsp_url.is_empty() {
            return self.source.rtsp_url.clone();
        }
        format!(
            "rtsp://127.0.0.1:{}/{}",
            self.source.rtsp_port, self.source.rtsp_path
        )
    }

    /// Check the settings the supervisor cannot stream without
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rtmp_url.is_empty() {
            return Err(ConfigError::Invalid("RTMP_URL is empty".to_string()));
        }
        if self.rtmp_url.contains(RTMP_PLACEHOLDER) {
            return Err(ConfigError::Invalid(format!(
                "RTMP_URL still contains the placeholder {}",
                RTMP_PLACEHOLDER
            )));
        }
        if self.source.video_device.is_empty() {
            return Err(ConfigError::Invalid("VIDEO_DEVICE is empty".to_string()));
        }
        if self.source.rtsp_port == 0 {
            return Err(ConfigError::Invalid("RTSP_PORT must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Port of the RTMP destination (1935 when the URL does not name one)
    pub fn rtmp_port(&self) -> u16 {
        let rest = self
            .rtmp_url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.rtmp_url);
        let authority = rest.split('/').next().unwrap_or_default();
        authority
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse().ok())
            .unwrap_or(1935)
    }
}

/// Apply `FORPOST_<KEY>` environment variables on top of a key/value map
pub fn apply_env_overrides(map: &mut ConfigMap) {
    for key in KNOWN_KEYS {
        if let Ok(val) = env::var(format!("{}{}", ENV_PREFIX, key)) {
            map.insert(key.to_string(), val);
        }
    }
}

/// Layered configuration on disk: defaults file + overrides file
#[derive(Debug, Clone)]
pub struct ConfigStore {
    /// Shipped defaults (`stream.conf.template`)
    pub defaults_path: PathBuf,
    /// Operator overrides (`stream.conf`)
    pub overrides_path: PathBuf,
}

impl ConfigStore {
    pub fn new(defaults_path: impl Into<PathBuf>, overrides_path: impl Into<PathBuf>) -> Self {
        Self {
            defaults_path: defaults_path.into(),
            overrides_path: overrides_path.into(),
        }
    }

    /// Store rooted at a config directory holding both files
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join("stream.conf.template"), dir.join("stream.conf"))
    }

    /// Merge defaults and overrides; a missing layer counts as empty
    pub fn load_layers(&self) -> Result<ConfigMap, ConfigError> {
        let mut map = read_layer(&self.defaults_path)?;
        map.extend(read_layer(&self.overrides_path)?);
        Ok(map)
    }

    /// Merged layers plus environment overrides
    pub fn load_effective(&self) -> Result<ConfigMap, ConfigError> {
        let mut map = self.load_layers()?;
        apply_env_overrides(&mut map);
        Ok(map)
    }

    /// Load the typed configuration
    pub fn load(&self) -> Result<StreamConfig, ConfigError> {
        Ok(StreamConfig::from_map(&self.load_effective()?))
    }

    /// Write a key into the overrides file, keeping its other lines intact
    pub fn set(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        let mut updates = ConfigMap::new();
        updates.insert(key.to_string(), value.to_string());
        self.set_many(&updates)
    }

    /// Write several keys into the overrides file in one rewrite
    pub fn set_many(&self, updates: &ConfigMap) -> Result<(), ConfigError> {
        let existing = match fs::read_to_string(&self.overrides_path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        if let Some(parent) = self.overrides_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.overrides_path, apply_updates(&existing, updates))?;
        Ok(())
    }
}

fn read_layer(path: &Path) -> Result<ConfigMap, ConfigError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(parse_key_values(&content)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(ConfigMap::new()),
        Err(e) => Err(e.into()),
    }
}
