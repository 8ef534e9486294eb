//! shepherd-scheduler: re-places applications orphaned by a dead instance.
//!
//! The [`Rescheduler`] turns a list of orphaned application records into
//! recreate calls on surviving instances of the hosting pool:
//!
//! ```text
//! Rescheduler
//!   ├── InstanceRegistry (least-loaded snapshot per plan)
//!   ├── plan_distribution (level-filling counts per candidate)
//!   ├── DispatchPool (bounded JoinSet of recreate calls)
//!   │     └── Provisioner (HTTP POST to the destination instance)
//!   └── ApplicationDirectory (point placed records at their new host)
//! ```

pub mod dispatch;
pub mod error;
pub mod provisioner;
pub mod rescheduler;

pub use dispatch::DispatchPool;
pub use error::{ProvisionError, SchedulerError, SchedulerResult};
pub use provisioner::{HttpProvisioner, Provisioner, RecreateRequest};
pub use rescheduler::{Placement, RescheduleReport, Rescheduler, Stranded};
