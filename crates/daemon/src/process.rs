//! Handle on one running child process

use std::fs::File;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant, SystemTime};
use tokio::process::{Child, Command};
use tracing::warn;

/// Running child owned by a supervisor
#[derive(Debug)]
pub struct SupervisedProcess {
    pub pid: Option<u32>,
    pub started_at: SystemTime,
    pub last_exit_code: Option<i32>,
    started: Instant,
    child: Child,
}

impl SupervisedProcess {
    /// Spawn `cmd` with stdin closed and stdout/stderr appended to `log`
    pub fn spawn(cmd: &mut Command, log: Option<&File>) -> io::Result<Self> {
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        match log {
            Some(file) => {
                cmd.stdout(file.try_clone()?);
                cmd.stderr(file.try_clone()?);
            }
            None => {
                cmd.stdout(Stdio::null());
                cmd.stderr(Stdio::inherit());
            }
        }

        let child = cmd.spawn()?;
        Ok(Self {
            pid: child.id(),
            started_at: SystemTime::now(),
            last_exit_code: None,
            started: Instant::now(),
            child,
        })
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Wait for exit and record the code
    ///
    /// A child killed by a signal has no exit code; it is recorded as
    /// `128 + signal` the way a shell reports it.
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        let status = self.child.wait().await?;
        self.last_exit_code = Some(exit_code_of(&status));
        Ok(status)
    }

    /// Kill the child and reap it
    ///
    /// A failed kill is logged and leaves `last_exit_code` untouched; the
    /// child is still killed on drop.
    pub async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            warn!(pid = ?self.pid, error = %e, "Failed to kill child");
            return;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => self.last_exit_code = Some(exit_code_of(&status)),
            Ok(None) => {}
            Err(e) => warn!(pid = ?self.pid, error = %e, "Failed to reap killed child"),
        }
    }
}

/// Shell-style exit code, including signal terminations
pub fn exit_code_of(status: &ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => -1,
    }
}
