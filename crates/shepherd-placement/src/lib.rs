//! Shepherd redistribution planner.
//!
//! Decides how many orphaned applications each surviving instance should
//! receive. It does NOT talk to the registry or dispatch anything (that's
//! `shepherd-scheduler`). It takes a least-loaded snapshot and produces a
//! [`DistributionPlan`] the rescheduler walks.
//!
//! # Components
//!
//! - **`planner`**: Level-filling ("water-filling") distribution

pub mod planner;

pub use planner::{DistributionPlan, PlanEntry, PlanError, PlanResult, plan_distribution};
