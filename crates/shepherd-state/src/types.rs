//! Domain types for the Shepherd state store.
//!
//! All types are serializable to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};

use crate::error::{StateError, StateResult};

/// Name of a service pool (e.g. the application-hosting pool).
pub type PoolName = String;

/// Network address of an instance, `host:port`.
pub type InstanceAddress = String;

// ── Instance ──────────────────────────────────────────────────────

/// A worker instance registered in a service pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceInstance {
    pub pool: PoolName,
    pub address: InstanceAddress,
    /// Load score maintained by the instance itself; lower is less loaded.
    pub score: u64,
    /// Unix timestamp (seconds) of registration.
    pub registered_at: u64,
}

impl ServiceInstance {
    /// Build the composite key for the instances table.
    pub fn table_key(&self) -> String {
        instance_key(&self.pool, &self.address)
    }
}

pub(crate) fn instance_key(pool: &str, address: &str) -> String {
    format!("{pool}/{address}")
}

/// Host component of a `host:port` (or `[v6]:port`) instance address.
///
/// Returns `None` unless the port is a valid `u16` and the host is non-empty.
pub fn host_of(address: &str) -> Option<&str> {
    let (host, port) = address.rsplit_once(':')?;
    port.parse::<u16>().ok()?;
    let host = match host.strip_prefix('[') {
        Some(v6) => v6.strip_suffix(']')?,
        None if host.contains(':') => return None,
        None => host,
    };
    (!host.is_empty()).then_some(host)
}

// ── Application ───────────────────────────────────────────────────

/// A deployed application and where it currently runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApplicationRecord {
    /// Unique within the owner's namespace.
    pub name: String,
    /// Source language, selects the provisioning pipeline.
    pub language: String,
    pub owner: String,
    /// Host component of the instance running the application.
    pub host: String,
    /// Opaque configuration sufficient to recreate the application elsewhere.
    #[serde(default)]
    pub config: serde_json::Value,
}

impl ApplicationRecord {
    /// Build the composite key for the applications table.
    pub fn table_key(&self) -> String {
        application_key(&self.owner, &self.name)
    }

    /// Reject records missing any field the rescheduler relies on.
    pub fn validate(&self) -> StateResult<()> {
        let required = [
            ("name", &self.name),
            ("language", &self.language),
            ("owner", &self.owner),
            ("host", &self.host),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(StateError::Invalid(format!(
                    "application `{}` has empty `{field}`",
                    self.table_key()
                )));
            }
        }
        Ok(())
    }
}

pub(crate) fn application_key(owner: &str, name: &str) -> String {
    format!("{owner}/{name}")
}
