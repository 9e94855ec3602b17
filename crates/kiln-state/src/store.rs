//! StateStore — redb-backed persistence for Kiln.
//!
//! Provides transactional inserts and typed reads over components, builds,
//! and executions. Rows are never updated or deleted. The store supports
//! both on-disk and in-memory backends (the latter for testing).
//!
//! An on-disk store holds no database handle between calls: every operation
//! opens `kiln.redb`, runs one transaction, and closes it again. redb locks
//! the file while it is open, so handles in other threads or processes
//! simply wait their turn instead of being locked out for the life of ours.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use redb::{Database, DatabaseError, ReadableDatabase, ReadableTable, TableDefinition, TableError};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::locks::BuildLocks;
use crate::tables::*;
use crate::types::*;

/// Name of the database file inside a state directory.
pub const STATE_FILE_NAME: &str = "kiln.redb";

/// Directory of per-component build lock files inside a state directory.
pub const LOCKS_DIR_NAME: &str = "locks";

/// Version written by [`StateStore::init`] and required by [`StateStore::open`].
pub const SCHEMA_VERSION: u64 = 1;

/// How long an operation waits for another holder to close the database.
const OPEN_TIMEOUT: Duration = Duration::from_secs(10);
const OPEN_RETRY_INTERVAL: Duration = Duration::from_millis(5);

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

enum Backend {
    /// Kept open for the life of the store.
    Memory(Database),
    /// Opened for the duration of each operation.
    File(PathBuf),
}

struct Inner {
    backend: Backend,
    build_locks: BuildLocks,
}

/// Thread-safe state store backed by redb. Clones share the backend and
/// the build lock table.
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<Inner>,
}

impl StateStore {
    /// Path of the database file for a state directory.
    pub fn db_path(dir: &Path) -> PathBuf {
        dir.join(STATE_FILE_NAME)
    }

    fn file_backed(dir: &Path) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend: Backend::File(Self::db_path(dir)),
                build_locks: BuildLocks::new(Some(dir.join(LOCKS_DIR_NAME))),
            }),
        }
    }

    /// Create a new state directory and its database.
    ///
    /// An absent directory is created; an existing empty directory is used.
    /// Fails with `AlreadyInitialized` if the directory already holds a
    /// state file, and with `NotEmpty` if it holds anything else. Existing
    /// files are never touched.
    pub fn init(dir: &Path) -> StateResult<Self> {
        let db_path = Self::db_path(dir);
        if db_path.exists() {
            return Err(StateError::AlreadyInitialized(dir.to_path_buf()));
        }

        let create_dir_err = |source| StateError::CreateDir {
            path: dir.to_path_buf(),
            source,
        };
        if dir.exists() {
            let mut entries = std::fs::read_dir(dir).map_err(create_dir_err)?;
            if entries.next().is_some() {
                return Err(StateError::NotEmpty(dir.to_path_buf()));
            }
        } else {
            std::fs::create_dir_all(dir).map_err(create_dir_err)?;
        }

        create_state_file(dir, &db_path, |path| {
            // redb initializes an empty file as a fresh database.
            let db = Database::create(path).map_err(map_err!(Open))?;
            write_schema(&db)
        })?;
        debug!(path = ?db_path, "state store initialized");
        Ok(Self::file_backed(dir))
    }

    /// Open the state store in an initialized state directory.
    ///
    /// Fails with `NotInitialized` if the state file is missing, is not a
    /// database, or carries a different schema version.
    pub fn open(dir: &Path) -> StateResult<Self> {
        let db_path = Self::db_path(dir);
        let not_initialized = |reason: String| StateError::NotInitialized {
            path: dir.to_path_buf(),
            reason,
        };
        if !db_path.is_file() {
            return Err(not_initialized(format!("{STATE_FILE_NAME} not found")));
        }

        let db = open_database(&db_path).map_err(|e| match e {
            DatabaseError::DatabaseAlreadyOpen => StateError::Open(e.to_string()),
            other => not_initialized(other.to_string()),
        })?;
        check_schema(&db).map_err(|e| match e {
            StateError::NotInitialized { reason, .. } => not_initialized(reason),
            other => other,
        })?;
        drop(db);
        debug!(path = ?db_path, "state store opened");
        Ok(Self::file_backed(dir))
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        write_schema(&db)?;
        debug!("in-memory state store opened");
        Ok(Self {
            inner: Arc::new(Inner {
                backend: Backend::Memory(db),
                build_locks: BuildLocks::new(None),
            }),
        })
    }

    /// Per-component locks that serialize builds. Shared by every clone of
    /// this store; on disk they also exclude other processes.
    pub fn build_locks(&self) -> &BuildLocks {
        &self.inner.build_locks
    }

    /// Run `f` against the database, opening it first if file-backed.
    fn with_db<T>(&self, f: impl FnOnce(&Database) -> StateResult<T>) -> StateResult<T> {
        match &self.inner.backend {
            Backend::Memory(db) => f(db),
            Backend::File(path) => {
                let db = open_database(path).map_err(map_err!(Open))?;
                f(&db)
            }
        }
    }

    // ── Components ─────────────────────────────────────────────────

    /// Insert a new component. Fails with `AlreadyExists` if the ID is taken;
    /// the stored row is left unchanged.
    pub fn insert_component(&self, component: &Component) -> StateResult<()> {
        let value = serde_json::to_vec(component).map_err(map_err!(Serialize))?;
        self.with_db(|db| {
            let txn = db.begin_write().map_err(map_err!(Transaction))?;
            {
                let mut table = txn.open_table(COMPONENTS).map_err(map_err!(Table))?;
                if table
                    .get(component.id.as_str())
                    .map_err(map_err!(Read))?
                    .is_some()
                {
                    return Err(StateError::AlreadyExists {
                        table: "components",
                        key: component.id.clone(),
                    });
                }
                table
                    .insert(component.id.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
            txn.commit().map_err(map_err!(Transaction))
        })?;
        debug!(component_id = %component.id, "component stored");
        Ok(())
    }

    pub fn get_component(&self, id: &str) -> StateResult<Option<Component>> {
        self.get_record(COMPONENTS, id)
    }

    /// List all components, ordered by ID.
    pub fn list_components(&self) -> StateResult<Vec<Component>> {
        self.list_records(COMPONENTS, |_: &Component| true)
    }

    // ── Builds ─────────────────────────────────────────────────────

    /// Reserve the next build number for a component.
    ///
    /// Committed on its own, so a number is never handed out twice even if
    /// the build that reserved it never produces a row.
    pub fn reserve_build_sequence(&self, component_id: &str) -> StateResult<u64> {
        let next = self.with_db(|db| {
            let txn = db.begin_write().map_err(map_err!(Transaction))?;
            let next;
            {
                let components = txn.open_table(COMPONENTS).map_err(map_err!(Table))?;
                if components
                    .get(component_id)
                    .map_err(map_err!(Read))?
                    .is_none()
                {
                    return Err(StateError::ForeignKey {
                        table: "build_sequences",
                        key: component_id.to_string(),
                        parent_table: "components",
                        parent_key: component_id.to_string(),
                    });
                }
                let mut sequences = txn.open_table(BUILD_SEQUENCES).map_err(map_err!(Table))?;
                let current = sequences
                    .get(component_id)
                    .map_err(map_err!(Read))?
                    .map(|v| v.value())
                    .unwrap_or(0);
                next = current + 1;
                sequences
                    .insert(component_id, next)
                    .map_err(map_err!(Write))?;
            }
            txn.commit().map_err(map_err!(Transaction))?;
            Ok(next)
        })?;
        debug!(%component_id, sequence = next, "build sequence reserved");
        Ok(next)
    }

    /// Insert a build. The referenced component must exist.
    pub fn insert_build(&self, build: &Build) -> StateResult<()> {
        let value = serde_json::to_vec(build).map_err(map_err!(Serialize))?;
        self.with_db(|db| {
            let txn = db.begin_write().map_err(map_err!(Transaction))?;
            {
                let components = txn.open_table(COMPONENTS).map_err(map_err!(Table))?;
                if components
                    .get(build.component_id.as_str())
                    .map_err(map_err!(Read))?
                    .is_none()
                {
                    return Err(StateError::ForeignKey {
                        table: "builds",
                        key: build.id.clone(),
                        parent_table: "components",
                        parent_key: build.component_id.clone(),
                    });
                }
                let mut builds = txn.open_table(BUILDS).map_err(map_err!(Table))?;
                if builds
                    .get(build.id.as_str())
                    .map_err(map_err!(Read))?
                    .is_some()
                {
                    return Err(StateError::AlreadyExists {
                        table: "builds",
                        key: build.id.clone(),
                    });
                }
                builds
                    .insert(build.id.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
            txn.commit().map_err(map_err!(Transaction))
        })?;
        debug!(build_id = %build.id, component_id = %build.component_id, "build stored");
        Ok(())
    }

    pub fn get_build(&self, id: &str) -> StateResult<Option<Build>> {
        self.get_record(BUILDS, id)
    }

    /// List builds, optionally for one component, ordered by component
    /// then build number.
    pub fn list_builds(&self, component_id: Option<&str>) -> StateResult<Vec<Build>> {
        let mut builds = self.list_records(BUILDS, |b: &Build| {
            component_id.is_none_or(|c| b.component_id == c)
        })?;
        builds.sort_by(|a, b| {
            a.component_id
                .cmp(&b.component_id)
                .then(a.sequence.cmp(&b.sequence))
        });
        Ok(builds)
    }

    /// The most recent recorded build of a component.
    pub fn latest_build(&self, component_id: &str) -> StateResult<Option<Build>> {
        Ok(self.list_builds(Some(component_id))?.pop())
    }

    // ── Executions ─────────────────────────────────────────────────

    /// Insert an execution. The referenced build must exist.
    pub fn insert_execution(&self, execution: &Execution) -> StateResult<()> {
        let value = serde_json::to_vec(execution).map_err(map_err!(Serialize))?;
        self.with_db(|db| {
            let txn = db.begin_write().map_err(map_err!(Transaction))?;
            {
                let builds = txn.open_table(BUILDS).map_err(map_err!(Table))?;
                if builds
                    .get(execution.build_id.as_str())
                    .map_err(map_err!(Read))?
                    .is_none()
                {
                    return Err(StateError::ForeignKey {
                        table: "executions",
                        key: execution.id.clone(),
                        parent_table: "builds",
                        parent_key: execution.build_id.clone(),
                    });
                }
                let mut executions = txn.open_table(EXECUTIONS).map_err(map_err!(Table))?;
                if executions
                    .get(execution.id.as_str())
                    .map_err(map_err!(Read))?
                    .is_some()
                {
                    return Err(StateError::AlreadyExists {
                        table: "executions",
                        key: execution.id.clone(),
                    });
                }
                executions
                    .insert(execution.id.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
            txn.commit().map_err(map_err!(Transaction))
        })?;
        debug!(execution_id = %execution.id, build_id = %execution.build_id, "execution stored");
        Ok(())
    }

    pub fn get_execution(&self, id: &str) -> StateResult<Option<Execution>> {
        self.get_record(EXECUTIONS, id)
    }

    /// List executions, optionally for one build, oldest first.
    pub fn list_executions(&self, build_id: Option<&str>) -> StateResult<Vec<Execution>> {
        let mut executions = self.list_records(EXECUTIONS, |e: &Execution| {
            build_id.is_none_or(|b| e.build_id == b)
        })?;
        executions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(executions)
    }

    // ── Internal helpers ────────────────────────────────────────────

    fn get_record<T: DeserializeOwned>(
        &self,
        def: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> StateResult<Option<T>> {
        self.with_db(|db| {
            let txn = db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(def).map_err(map_err!(Table))?;
            match table.get(key).map_err(map_err!(Read))? {
                Some(guard) => {
                    let record: T =
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                    Ok(Some(record))
                }
                None => Ok(None),
            }
        })
    }

    fn list_records<T: DeserializeOwned>(
        &self,
        def: TableDefinition<&str, &[u8]>,
        keep: impl Fn(&T) -> bool,
    ) -> StateResult<Vec<T>> {
        self.with_db(|db| {
            let txn = db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(def).map_err(map_err!(Table))?;
            let mut results = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (_, value) = entry.map_err(map_err!(Read))?;
                let record: T =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if keep(&record) {
                    results.push(record);
                }
            }
            Ok(results)
        })
    }
}

/// Open the database file, waiting while another handle has it open.
fn open_database(path: &Path) -> Result<Database, DatabaseError> {
    let deadline = Instant::now() + OPEN_TIMEOUT;
    loop {
        match Database::open(path) {
            Err(DatabaseError::DatabaseAlreadyOpen) if Instant::now() < deadline => {
                std::thread::sleep(OPEN_RETRY_INTERVAL);
            }
            result => return result,
        }
    }
}

/// Claim `db_path` and let `create` turn it into a database. The claimed
/// file is removed again if `create` fails, so the directory can be
/// initialized on a later attempt.
fn create_state_file(
    dir: &Path,
    db_path: &Path,
    create: impl FnOnce(&Path) -> StateResult<()>,
) -> StateResult<()> {
    // Claim the file atomically so two concurrent inits cannot both win.
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(db_path)
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::AlreadyExists => StateError::AlreadyInitialized(dir.to_path_buf()),
            _ => StateError::CreateDir {
                path: db_path.to_path_buf(),
                source: e,
            },
        })?;

    if let Err(e) = create(db_path) {
        if let Err(remove) = std::fs::remove_file(db_path) {
            warn!(path = ?db_path, error = %remove, "failed to remove partial state file");
        }
        return Err(e);
    }
    Ok(())
}

/// Create all tables and record the schema version.
fn write_schema(db: &Database) -> StateResult<()> {
    let txn = db.begin_write().map_err(map_err!(Transaction))?;
    {
        let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
        meta.insert(SCHEMA_VERSION_KEY, SCHEMA_VERSION)
            .map_err(map_err!(Write))?;
    }
    // Opening a table in a write transaction creates it if absent.
    txn.open_table(COMPONENTS).map_err(map_err!(Table))?;
    txn.open_table(BUILDS).map_err(map_err!(Table))?;
    txn.open_table(EXECUTIONS).map_err(map_err!(Table))?;
    txn.open_table(BUILD_SEQUENCES).map_err(map_err!(Table))?;
    txn.commit().map_err(map_err!(Transaction))?;
    Ok(())
}

/// Verify the schema without creating anything.
fn check_schema(db: &Database) -> StateResult<()> {
    let missing = |name: &str| StateError::NotInitialized {
        path: PathBuf::new(),
        reason: format!("table {name} missing"),
    };
    let txn = db.begin_read().map_err(map_err!(Transaction))?;

    let meta = match txn.open_table(META) {
        Ok(t) => t,
        Err(TableError::TableDoesNotExist(_)) => return Err(missing("meta")),
        Err(e) => return Err(StateError::Table(e.to_string())),
    };
    let version = meta
        .get(SCHEMA_VERSION_KEY)
        .map_err(map_err!(Read))?
        .map(|v| v.value());
    if version != Some(SCHEMA_VERSION) {
        return Err(StateError::NotInitialized {
            path: PathBuf::new(),
            reason: format!("schema version {version:?} does not match expected {SCHEMA_VERSION}"),
        });
    }

    for (name, exists) in [
        ("components", table_exists(&txn, COMPONENTS)?),
        ("builds", table_exists(&txn, BUILDS)?),
        ("executions", table_exists(&txn, EXECUTIONS)?),
        ("build_sequences", table_exists(&txn, BUILD_SEQUENCES)?),
    ] {
        if !exists {
            return Err(missing(name));
        }
    }
    Ok(())
}

fn table_exists<V: redb::Value + 'static>(
    txn: &redb::ReadTransaction,
    def: TableDefinition<&'static str, V>,
) -> StateResult<bool> {
    match txn.open_table(def) {
        Ok(_) => Ok(true),
        Err(TableError::TableDoesNotExist(_)) => Ok(false),
        Err(e) => Err(StateError::Table(e.to_string())),
    }
}
