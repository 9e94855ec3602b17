//! redb table definitions for the Kiln state store.
//!
//! Record tables use `&str` keys and `&[u8]` values (JSON-serialized types).

use redb::TableDefinition;

/// Store metadata (`schema_version`).
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Components keyed by component ID.
pub const COMPONENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("components");

/// Builds keyed by image tag.
pub const BUILDS: TableDefinition<&str, &[u8]> = TableDefinition::new("builds");

/// Executions keyed by container ID.
pub const EXECUTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("executions");

/// Last reserved build number, keyed by component ID.
pub const BUILD_SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("build_sequences");

/// Key in [`META`] holding the schema version.
pub const SCHEMA_VERSION_KEY: &str = "schema_version";
