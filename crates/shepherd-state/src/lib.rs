//! shepherd-state: shared state consumed by the cleanup loop.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for the two collaborators the control loop talks to:
//!
//! - the **instance registry**: live instances per service pool, each with
//!   a load score, keyed `{pool}/{address}`
//! - the **application directory**: application records keyed
//!   `{owner}/{name}`, queryable by host, with malformed payloads moved to
//!   a quarantine table at read time
//!
//! The control loop only sees the [`InstanceRegistry`] and
//! [`ApplicationDirectory`] traits. `StateStore` is `Clone` + `Send` +
//! `Sync` (backed by `Arc<Database>`) and implements both.

pub mod error;
pub mod registry;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use registry::{ApplicationDirectory, BoxFuture, InstanceRegistry, with_deadline};
pub use store::StateStore;
pub use types::*;
