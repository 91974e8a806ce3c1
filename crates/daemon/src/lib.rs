//! forpost stream relay
//!
//! Supervises the ffmpeg processes that relay an RTSP camera to an RTMP
//! endpoint, produces overlay text, and runs the periodic watchdog and
//! configuration reconciler.

pub mod encode;
pub mod frequency;
pub mod instance_lock;
pub mod logging;
pub mod overlay;
pub mod process;
pub mod procs;
pub mod reactor;
pub mod release;
pub mod restart;
pub mod scan_state;
pub mod services;
pub mod startup;
pub mod status;
pub mod status_server;
pub mod supervisor;
pub mod transport;
pub mod watchdog;

pub use forpost_stream_config as config;
pub use forpost_stream_config::{ConfigStore, StreamConfig};
pub use frequency::{ConfiguredSource, FrequencyError, FrequencySource};
pub use instance_lock::{pid_file, InstanceLock, LockError};
pub use logging::{init_logging, log_path};
pub use overlay::{
    set_dynamic_text, ChannelPaths, DynamicProducer, FrequencyProducer, OverlayProducers,
};
pub use reactor::{reconcile, ReconcileReport, SystemEffects};
pub use release::{check_updates, CacheFile, Channel, ReleaseClient, ReleaseError, UpdateCheck};
pub use restart::{FixedDelay, RestartPolicy};
pub use scan_state::{Detector, ScanState};
pub use services::{ServiceError, ServiceManager, Systemctl};
pub use startup::{run_startup_checks, StartupError};
pub use status::{new_shared_status, MetricsSampler, ChildState, SharedStatus, StatusSnapshot};
pub use status_server::{create_status_router, run_status_server, ServerError, STATUS_PORT};
pub use supervisor::{ChildLauncher, RelayLauncher, StreamLauncher, Supervisor};
pub use watchdog::{run_once, LinuxProbe, Verdict, WatchdogSettings};
