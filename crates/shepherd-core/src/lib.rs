//! shepherd-core: configuration shared by every Shepherd crate.
//!
//! The daemon reads a single TOML file at startup into [`ShepherdConfig`]
//! and threads the relevant sections into the cleanup driver, the health
//! monitors and the rescheduler. Nothing here is global.

pub mod config;
pub mod duration;

pub use config::{
    CleanupConfig, ConfigError, ConfigResult, DispatchConfig, PoolConfig, PoolRole, ProbeConfig,
    ShepherdConfig, StoreConfig,
};
pub use duration::parse_duration;
