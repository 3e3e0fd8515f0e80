//! redb table definitions for the state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Every table maps a string key to a JSON document.
pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Scale plans keyed by plan name.
pub const SCALE_PLANS: JsonTable = TableDefinition::new("scale_plans");

/// Pod objects keyed by `{job}:{pod_name}`.
pub const PODS: JsonTable = TableDefinition::new("pods");

/// Service endpoints keyed by `{job}/{service}`.
pub const SERVICES: JsonTable = TableDefinition::new("services");

/// Published parameter-server hosts keyed by `{job}`.
pub const JOB_HOSTS: JsonTable = TableDefinition::new("job_hosts");
