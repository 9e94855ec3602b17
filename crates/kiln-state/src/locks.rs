//! Per-key mutual exclusion for builds.
//!
//! `KeyedLocks` hands out one async mutex per string key, created on first
//! use and dropped once nobody holds or waits for it. Holders of different
//! keys never contend.
//!
//! `BuildLocks` layers an exclusive lock file per key on top, so handles
//! opened separately on one state directory, in this process or another,
//! exclude each other too.

use std::collections::HashMap;
use std::fs::{File, OpenOptions, TryLockError};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::{StateError, StateResult};

/// How often a queued build checks whether another process released the
/// lock file.
const LOCK_FILE_POLL_INTERVAL: Duration = Duration::from_millis(50);

type Table = HashMap<String, Arc<AsyncMutex<()>>>;

/// A table of named locks. Clones share the table.
#[derive(Clone, Default)]
pub struct KeyedLocks {
    table: Arc<Mutex<Table>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the lock on `key`. Waiters are served in FIFO order.
    pub async fn lock(&self, key: &str) -> KeyGuard {
        let mutex = self.entry(key);
        let guard = mutex.lock_owned().await;
        KeyGuard {
            table: self.table.clone(),
            key: key.to_string(),
            guard: Some(guard),
        }
    }

    /// Take the lock on `key` only if nobody holds it.
    pub fn try_lock(&self, key: &str) -> Option<KeyGuard> {
        let mutex = self.entry(key);
        let guard = mutex.try_lock_owned().ok()?;
        Some(KeyGuard {
            table: self.table.clone(),
            key: key.to_string(),
            guard: Some(guard),
        })
    }

    /// Number of keys currently held or waited on.
    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }

    fn entry(&self, key: &str) -> Arc<AsyncMutex<()>> {
        self.table()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Holds the lock on one key until dropped.
pub struct KeyGuard {
    table: Arc<Mutex<Table>>,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        // Release before inspecting the table so our own reference is gone.
        drop(self.guard.take());
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        // Only the table's own reference left: no holder, no waiter.
        if table
            .get(&self.key)
            .is_some_and(|m| Arc::strong_count(m) == 1)
        {
            table.remove(&self.key);
        }
    }
}

/// Build locks of one state store: an in-process [`KeyedLocks`] table,
/// plus `<dir>/<key>.lock` files when the store lives on disk.
pub struct BuildLocks {
    keyed: KeyedLocks,
    dir: Option<PathBuf>,
}

impl BuildLocks {
    pub(crate) fn new(dir: Option<PathBuf>) -> Self {
        Self {
            keyed: KeyedLocks::new(),
            dir,
        }
    }

    /// Wait until no other build of `key` runs. In-process waiters queue in
    /// FIFO order; waiters in other processes poll the lock file.
    pub async fn lock(&self, key: &str) -> StateResult<BuildGuard> {
        let guard = self.keyed.lock(key).await;
        let file = match self.open_lock_file(key)? {
            Some((path, file)) => {
                loop {
                    match file.try_lock() {
                        Ok(()) => break,
                        Err(TryLockError::WouldBlock) => {
                            debug!(%key, "build lock held by another process");
                            tokio::time::sleep(LOCK_FILE_POLL_INTERVAL).await;
                        }
                        Err(TryLockError::Error(source)) => {
                            return Err(StateError::Lock { path, source });
                        }
                    }
                }
                Some(file)
            }
            None => None,
        };
        Ok(BuildGuard {
            _file: file,
            key: guard,
        })
    }

    /// Take the build lock of `key` only if nobody, here or elsewhere,
    /// holds it.
    pub fn try_lock(&self, key: &str) -> StateResult<Option<BuildGuard>> {
        let Some(guard) = self.keyed.try_lock(key) else {
            return Ok(None);
        };
        let file = match self.open_lock_file(key)? {
            Some((path, file)) => match file.try_lock() {
                Ok(()) => Some(file),
                Err(TryLockError::WouldBlock) => return Ok(None),
                Err(TryLockError::Error(source)) => {
                    return Err(StateError::Lock { path, source });
                }
            },
            None => None,
        };
        Ok(Some(BuildGuard {
            _file: file,
            key: guard,
        }))
    }

    fn open_lock_file(&self, key: &str) -> StateResult<Option<(PathBuf, File)>> {
        let Some(dir) = &self.dir else {
            return Ok(None);
        };
        std::fs::create_dir_all(dir).map_err(|source| StateError::Lock {
            path: dir.clone(),
            source,
        })?;
        let path = dir.join(format!("{key}.lock"));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|source| StateError::Lock {
                path: path.clone(),
                source,
            })?;
        Ok(Some((path, file)))
    }
}

/// Holds a build lock until dropped. Closing the file releases the
/// cross-process lock.
pub struct BuildGuard {
    _file: Option<File>,
    key: KeyGuard,
}

impl BuildGuard {
    pub fn key(&self) -> &str {
        self.key.key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn try_lock_conflicts_on_same_key_only() {
        let locks = KeyedLocks::new();
        let a = locks.try_lock("a").unwrap();
        assert!(locks.try_lock("a").is_none());
        let b = locks.try_lock("b").unwrap();
        assert_eq!(locks.len(), 2);

        drop(a);
        assert!(locks.try_lock("a").is_some());
        drop(b);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn table_entry_survives_while_waited_on() {
        let locks = KeyedLocks::new();
        let held = locks.lock("k").await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let guard = locks.lock("k").await;
                guard.key().to_string()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);
        assert_eq!(waiter.await.unwrap(), "k");
        assert!(locks.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn serializes_holders_of_one_key() {
        let locks = KeyedLocks::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            tasks.push(tokio::spawn(async move {
                let _guard = locks.lock("shared").await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn cancelled_waiter_does_not_wedge_the_key() {
        let locks = KeyedLocks::new();
        let held = locks.lock("k").await;

        let timed_out = tokio::time::timeout(Duration::from_millis(10), locks.lock("k")).await;
        assert!(timed_out.is_err());

        drop(held);
        assert!(locks.try_lock("k").is_some());
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn build_locks_in_memory_follow_the_keyed_table() {
        let locks = BuildLocks::new(None);
        let held = locks.try_lock("etl").unwrap().unwrap();
        assert_eq!(held.key(), "etl");
        assert!(locks.try_lock("etl").unwrap().is_none());
        assert!(locks.try_lock("report").unwrap().is_some());
        drop(held);
        assert!(locks.try_lock("etl").unwrap().is_some());
    }

    #[tokio::test]
    async fn build_lock_files_exclude_separate_tables() {
        let dir = tempfile::tempdir().unwrap();
        let ours = BuildLocks::new(Some(dir.path().join("locks")));
        let theirs = BuildLocks::new(Some(dir.path().join("locks")));

        let held = ours.lock("etl").await.unwrap();
        assert!(dir.path().join("locks/etl.lock").is_file());
        assert!(theirs.try_lock("etl").unwrap().is_none());
        assert!(theirs.try_lock("report").unwrap().is_some());

        let waiter = tokio::spawn(async move {
            let guard = theirs.lock("etl").await.unwrap();
            guard.key().to_string()
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());

        drop(held);
        let key = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(key, "etl");
    }
}
