//! Process table lookups backed by sysinfo
//!
//! Used by the transport probe, the watchdog and the legacy frequency sniffer
//! to find the processes they inspect.

use std::ffi::OsStr;
use std::time::Duration;
use sysinfo::{Pid, System};

/// A process table entry reduced to what the supervisors look at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub parent: Option<u32>,
    pub name: String,
    pub cmd: Vec<String>,
}

impl ProcessInfo {
    /// Matches on the executable name or on the first command line word
    pub fn matches(&self, name: &str) -> bool {
        if self.name == name {
            return true;
        }
        self.cmd
            .first()
            .and_then(|arg0| arg0.rsplit('/').next())
            .map(|base| base == name)
            .unwrap_or(false)
    }
}

fn lossy<S: AsRef<OsStr> + ?Sized>(s: &S) -> String {
    s.as_ref().to_string_lossy().into_owned()
}

/// Capture the current process table
pub fn list_processes() -> Vec<ProcessInfo> {
    let mut sys = System::new_all();
    sys.refresh_all();

    sys.processes()
        .values()
        .map(|p| ProcessInfo {
            pid: p.pid().as_u32(),
            parent: p.parent().map(|pp| pp.as_u32()),
            name: lossy(p.name()),
            cmd: p.cmd().iter().map(|arg| lossy(arg)).collect(),
        })
        .collect()
}

/// First process whose name matches
pub fn find_by_name<'a>(procs: &'a [ProcessInfo], name: &str) -> Option<&'a ProcessInfo> {
    procs.iter().find(|p| p.matches(name))
}

/// Descendants of `root` (any depth) whose name matches
pub fn find_descendant<'a>(
    procs: &'a [ProcessInfo],
    root: u32,
    name: &str,
) -> Option<&'a ProcessInfo> {
    let mut frontier = vec![root];
    while let Some(parent) = frontier.pop() {
        for p in procs.iter().filter(|p| p.parent == Some(parent)) {
            if p.matches(name) {
                return Some(p);
            }
            frontier.push(p.pid);
        }
    }
    None
}

/// CPU usage of `pid` in percent, measured over `window`
///
/// Returns `None` if the process disappears during the measurement.
pub async fn cpu_usage(pid: u32, window: Duration) -> Option<f32> {
    let pid = Pid::from_u32(pid);
    let mut sys = System::new_all();
    sys.refresh_all();
    tokio::time::sleep(window.max(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL)).await;
    sys.refresh_all();
    sys.process(pid).map(|p| p.cpu_usage())
}
