//! Daemon control plane
//!
//! - `resource_monitor`: CPU / RAM / process probes
//! - `control`: pause decisions with cooldown hysteresis
//! - `control_file`: operator pause/resume through `control.json`
//! - `runner`: the periodic loop feeding discovery into the pipeline

pub mod control;
pub mod control_file;
pub mod resource_monitor;
pub mod runner;

pub use control::{Clock, DaemonControl, DaemonDecision, DaemonState, ManualClock, SystemClock};
pub use control_file::{ControlFile, DesiredState};
pub use resource_monitor::{ProcfsProbe, ResourceProbe, ResourceSample};
pub use runner::{recover_previous_run, DaemonRunner};
