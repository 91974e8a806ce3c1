//! Transport source probe
//!
//! Decides whether the RTSP pull should use TCP or UDP. An explicit setting
//! wins; in `auto` mode the running RTSP server's command line is inspected.

use crate::config::{StreamConfig, TransportMode};
use crate::procs::{find_by_name, list_processes, ProcessInfo};
use tracing::{debug, info};

/// Concrete RTSP transport passed to ffmpeg
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtspTransport {
    Tcp,
    Udp,
}

impl RtspTransport {
    pub fn as_str(&self) -> &'static str {
        match self {
            RtspTransport::Tcp => "tcp",
            RtspTransport::Udp => "udp",
        }
    }
}

impl std::fmt::Display for RtspTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a server command line: UDP only when the server was told so
pub fn transport_from_cmdline(args: &[String]) -> RtspTransport {
    let udp = args.iter().any(|arg| {
        let lower = arg.to_lowercase();
        lower == "-u" || lower == "--udp" || lower.contains("transport=udp") || lower == "udp"
    });
    if udp {
        RtspTransport::Udp
    } else {
        RtspTransport::Tcp
    }
}

/// Resolve the transport against an already captured process table
pub fn resolve_transport_with(cfg: &StreamConfig, procs: &[ProcessInfo]) -> RtspTransport {
    match cfg.source.transport {
        TransportMode::Tcp => RtspTransport::Tcp,
        TransportMode::Udp => RtspTransport::Udp,
        TransportMode::Auto => match find_by_name(procs, &cfg.source.server_process) {
            Some(server) => {
                let transport = transport_from_cmdline(&server.cmd);
                debug!(pid = server.pid, %transport, "Inspected RTSP server command line");
                transport
            }
            None => {
                info!(
                    server = %cfg.source.server_process,
                    "RTSP server process not found, defaulting to tcp"
                );
                RtspTransport::Tcp
            }
        },
    }
}

/// Resolve the transport for this run
pub fn resolve_transport(cfg: &StreamConfig) -> RtspTransport {
    if cfg.source.transport != TransportMode::Auto {
        return resolve_transport_with(cfg, &[]);
    }
    resolve_transport_with(cfg, &list_processes())
}
