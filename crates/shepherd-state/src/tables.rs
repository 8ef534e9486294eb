//! redb table definitions for the Shepherd state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Registered service instances keyed by `{pool}/{address}`.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// Application records keyed by `{owner}/{name}`.
pub const APPLICATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("applications");

/// Raw application payloads that failed validation, keyed like `APPLICATIONS`.
pub const QUARANTINE: TableDefinition<&str, &[u8]> = TableDefinition::new("quarantine");
