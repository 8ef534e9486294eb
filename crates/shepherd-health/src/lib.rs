//! shepherd-health: liveness probing and self-healing for Shepherd.
//!
//! Detects dead worker instances and drives their cleanup:
//!
//! ```text
//! CleanupDriver (fixed interval, one task per pool)
//!   └── HealthMonitor (one per pool)
//!       ├── LivenessProbe (TCP connect, or DNS query for the resolver pool)
//!       ├── InstanceRegistry::remove on a failed probe
//!       └── app-hosting pool only:
//!           ApplicationDirectory::find_by_host → Rescheduler
//! ```
//!
//! A probe failure is the signal, not an error: the instance is removed.
//! Store failures and malformed addresses are logged where they occur and
//! abandon only the branch of work they belong to.

pub mod cleanup;
pub mod error;
pub mod monitor;
pub mod probe;

pub use cleanup::CleanupDriver;
pub use error::{MonitorError, MonitorResult};
pub use monitor::{HealthMonitor, Inspection, PoolReport};
pub use probe::{LivenessProbe, NetProbe, ProbeProtocol};
