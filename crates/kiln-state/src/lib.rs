//! kiln-state — embedded state store for Kiln.
//!
//! Backed by [redb](https://docs.rs/redb), records every registered
//! component, every build, and every execution.
//!
//! # Layout
//!
//! A state directory holds the database file, [`STATE_FILE_NAME`], created
//! by [`StateStore::init`] and opened by [`StateStore::open`], and a
//! [`LOCKS_DIR_NAME`] directory of per-component build lock files.
//!
//! All records are JSON-serialized into redb's `&[u8]` value columns.
//! Every write is a single redb write transaction: parent rows
//! (`Build.component_id`, `Execution.build_id`) are checked inside the
//! same transaction that inserts the child, so referential integrity
//! holds under concurrent writers.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` and can be shared across
//! async tasks. An on-disk store opens the database only for the length of
//! each operation, so several handles and processes can share one state
//! directory.

pub mod error;
pub mod locks;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use locks::{BuildGuard, BuildLocks, KeyGuard, KeyedLocks};
pub use store::{LOCKS_DIR_NAME, SCHEMA_VERSION, STATE_FILE_NAME, StateStore};
pub use types::*;
