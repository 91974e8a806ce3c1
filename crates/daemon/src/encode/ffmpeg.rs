//! Encoder invocation for the RTSP to RTMP stream
//!
//! Builds the ffmpeg argument list from configuration. Without overlays the
//! video is passed through untouched (`-c:v copy`); with overlays a drawtext
//! graph forces an x264 re-encode.

use crate::config::StreamConfig;
use crate::encode::filter::build_filter_graph;
use crate::encode::relay::relay_input_url;
use crate::overlay::ChannelPaths;
use crate::transport::RtspTransport;
use tokio::process::Command;

/// Where the encoder reads from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSource {
    /// Pull directly from the camera's RTSP server
    Rtsp { url: String, transport: RtspTransport },
    /// Read the loopback MPEG-TS relay
    Relay { port: u16 },
}

/// x264 settings used in encode mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeSettings {
    pub preset: String,
    pub crf: u32,
    pub bitrate: String,
    pub fps: u32,
    pub gop: u32,
}

/// Fully resolved parameters for one encoder run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamParams {
    pub input: InputSource,
    pub rtmp_url: String,
    /// `Some` selects encode mode
    pub filter_graph: Option<String>,
    pub encode: EncodeSettings,
}

impl StreamParams {
    pub fn from_config(cfg: &StreamConfig, transport: RtspTransport, paths: &ChannelPaths) -> Self {
        let input = if cfg.relay.enabled {
            InputSource::Relay {
                port: cfg.relay.port,
            }
        } else {
            InputSource::Rtsp {
                url: cfg.rtsp_source_url(),
                transport,
            }
        };

        Self {
            input,
            rtmp_url: cfg.rtmp_url.clone(),
            filter_graph: build_filter_graph(&cfg.overlay, paths),
            encode: EncodeSettings {
                preset: cfg.encoding.preset.clone(),
                crf: cfg.encoding.crf,
                bitrate: cfg.encoding.bitrate.clone(),
                fps: cfg.encoding.fps,
                gop: cfg.gop(),
            },
        }
    }

    /// True when the stream is passed through without re-encoding
    pub fn is_copy_mode(&self) -> bool {
        self.filter_graph.is_none()
    }
}

/// Argument list for the stream encoder
pub fn stream_args(params: &StreamParams) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-loglevel", "warning", "-nostdin"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    match &params.input {
        InputSource::Rtsp { url, transport } => {
            args.extend(["-rtsp_transport".to_string(), transport.to_string()]);
            args.extend(["-i".to_string(), url.clone()]);
        }
        InputSource::Relay { port } => {
            args.extend(["-fflags".to_string(), "nobuffer".to_string()]);
            args.extend(["-i".to_string(), relay_input_url(*port)]);
        }
    }

    match &params.filter_graph {
        None => {
            args.extend(["-c:v".to_string(), "copy".to_string()]);
        }
        Some(graph) => {
            let enc = &params.encode;
            args.extend(["-vf".to_string(), graph.clone()]);
            args.extend(
                [
                    "-c:v",
                    "libx264",
                    "-preset",
                    enc.preset.as_str(),
                    "-tune",
                    "zerolatency",
                    "-pix_fmt",
                    "yuv420p",
                ]
                .iter()
                .map(|s| s.to_string()),
            );
            args.extend(["-crf".to_string(), enc.crf.to_string()]);
            args.extend(["-maxrate".to_string(), enc.bitrate.clone()]);
            args.extend(["-bufsize".to_string(), enc.bitrate.clone()]);
            args.extend(["-r".to_string(), enc.fps.to_string()]);
            args.extend(["-g".to_string(), enc.gop.to_string()]);
        }
    }

    args.push("-an".to_string());
    args.extend(["-f".to_string(), "flv".to_string(), params.rtmp_url.clone()]);
    args
}

/// Build the encoder command; stdio wiring is left to the caller
pub fn build_stream_command(params: &StreamParams) -> Command {
    let mut cmd = Command::new("ffmpeg");
    cmd.args(stream_args(params));
    cmd
}
