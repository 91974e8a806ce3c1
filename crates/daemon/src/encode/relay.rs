//! Loopback UDP relay invocation
//!
//! A second ffmpeg copies the camera stream into MPEG-TS datagrams on
//! localhost. Both ends use small buffers so stale packets are dropped rather
//! than queued when the encoder falls behind.

use crate::transport::RtspTransport;
use tokio::process::Command;

/// Packet size carrying exactly seven TS packets
const TS_PACKET_SIZE: u32 = 1316;

/// Socket buffer on both sides of the loopback hop
const LOOPBACK_BUFFER_BYTES: u32 = 65536;

/// Receive FIFO, in 188-byte packets, on the consumer side
const CONSUMER_FIFO_PACKETS: u32 = 512;

/// URL the relay sends to
pub fn relay_output_url(port: u16) -> String {
    format!(
        "udp://127.0.0.1:{}?pkt_size={}&buffer_size={}",
        port, TS_PACKET_SIZE, LOOPBACK_BUFFER_BYTES
    )
}

/// URL the encoder reads from; overruns drop data instead of failing
pub fn relay_input_url(port: u16) -> String {
    format!(
        "udp://127.0.0.1:{}?fifo_size={}&overrun_nonfatal=1&buffer_size={}",
        port, CONSUMER_FIFO_PACKETS, LOOPBACK_BUFFER_BYTES
    )
}

/// Parameters for one relay run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayParams {
    pub rtsp_url: String,
    pub transport: RtspTransport,
    pub port: u16,
}

/// Argument list for the relay
pub fn relay_args(params: &RelayParams) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-loglevel", "warning", "-nostdin"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    args.extend(["-rtsp_transport".to_string(), params.transport.to_string()]);
    args.extend(["-i".to_string(), params.rtsp_url.clone()]);
    args.extend(
        ["-c", "copy", "-an", "-f", "mpegts", "-flush_packets", "1"]
            .iter()
            .map(|s| s.to_string()),
    );
    args.push(relay_output_url(params.port));
    args
}

pub fn build_relay_command(params: &RelayParams) -> Command {
    let mut cmd = Command::new("ffmpeg");
    cmd.args(relay_args(params));
    cmd
}
