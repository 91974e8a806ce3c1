//! Service manager access
//!
//! The watchdog and the reconciler act on systemd units. They go through the
//! `ServiceManager` trait so their decision logic can be tested with a fake.

use std::future::Future;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Stream supervisor unit
pub const STREAM_UNIT: &str = "forpost-stream";

/// Loopback relay unit
pub const RELAY_UNIT: &str = "forpost-udp-proxy";

/// Periodic restart timer
pub const RESTART_TIMER_UNIT: &str = "forpost-stream-autorestart.timer";

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("systemctl {action} {unit} failed: {detail}")]
    CommandFailed {
        action: String,
        unit: String,
        detail: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Operations on service units
pub trait ServiceManager: Sync {
    fn is_enabled(&self, unit: &str) -> impl Future<Output = bool> + Send;
    fn is_active(&self, unit: &str) -> impl Future<Output = bool> + Send;
    /// Main PID of an active unit
    fn main_pid(&self, unit: &str) -> impl Future<Output = Option<u32>> + Send;
    fn start(&self, unit: &str) -> impl Future<Output = Result<(), ServiceError>> + Send;
    fn stop(&self, unit: &str) -> impl Future<Output = Result<(), ServiceError>> + Send;
    fn restart(&self, unit: &str) -> impl Future<Output = Result<(), ServiceError>> + Send;
    fn enable(&self, unit: &str) -> impl Future<Output = Result<(), ServiceError>> + Send;
    fn disable(&self, unit: &str) -> impl Future<Output = Result<(), ServiceError>> + Send;
    fn daemon_reload(&self) -> impl Future<Output = Result<(), ServiceError>> + Send;
}

/// systemd through the `systemctl` binary
#[derive(Debug, Clone, Default)]
pub struct Systemctl;

impl Systemctl {
    async fn query(&self, args: &[&str]) -> Option<String> {
        let output = Command::new("systemctl")
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .ok()?;
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        debug!(?args, success = output.status.success(), %stdout, "systemctl query");
        output.status.success().then_some(stdout)
    }

    async fn action(&self, action: &str, unit: Option<&str>) -> Result<(), ServiceError> {
        let mut cmd = Command::new("systemctl");
        cmd.arg(action);
        if let Some(unit) = unit {
            cmd.arg(unit);
        }
        let output = cmd.stdin(Stdio::null()).output().await?;
        if output.status.success() {
            debug!(action, unit, "systemctl action done");
            Ok(())
        } else {
            Err(ServiceError::CommandFailed {
                action: action.to_string(),
                unit: unit.unwrap_or_default().to_string(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

/// `systemctl show -p MainPID --value` prints 0 for units without a process
pub fn parse_main_pid(output: &str) -> Option<u32> {
    output.trim().parse().ok().filter(|pid| *pid != 0)
}

/// `systemctl is-enabled` state that counts as enabled
///
/// `static`, `indirect`, `alias` and `generated` also exit 0 but do not
/// start the unit at boot.
pub fn parse_is_enabled(output: &str) -> bool {
    matches!(output.trim(), "enabled" | "enabled-runtime")
}

impl ServiceManager for Systemctl {
    async fn is_enabled(&self, unit: &str) -> bool {
        self.query(&["is-enabled", unit])
            .await
            .is_some_and(|out| parse_is_enabled(&out))
    }

    async fn is_active(&self, unit: &str) -> bool {
        self.query(&["is-active", unit]).await.is_some()
    }

    async fn main_pid(&self, unit: &str) -> Option<u32> {
        self.query(&["show", "-p", "MainPID", "--value", unit])
            .await
            .and_then(|out| parse_main_pid(&out))
    }

    async fn start(&self, unit: &str) -> Result<(), ServiceError> {
        self.action("start", Some(unit)).await
    }

    async fn stop(&self, unit: &str) -> Result<(), ServiceError> {
        self.action("stop", Some(unit)).await
    }

    async fn restart(&self, unit: &str) -> Result<(), ServiceError> {
        self.action("restart", Some(unit)).await
    }

    async fn enable(&self, unit: &str) -> Result<(), ServiceError> {
        self.action("enable", Some(unit)).await
    }

    async fn disable(&self, unit: &str) -> Result<(), ServiceError> {
        self.action("disable", Some(unit)).await
    }

    async fn daemon_reload(&self) -> Result<(), ServiceError> {
        self.action("daemon-reload", None).await
    }
}

/// Restart the relay first (if enabled) so stale buffered packets are gone
/// before the encoder reconnects, then the stream
pub async fn restart_pipeline<M: ServiceManager>(
    services: &M,
    relay_enabled: bool,
) -> Result<(), ServiceError> {
    if relay_enabled {
        services.restart(RELAY_UNIT).await?;
    }
    services.restart(STREAM_UNIT).await
}
