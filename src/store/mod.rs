// src/store/mod.rs

//! Installation store
//!
//! Records which packages are installed under a root directory. The index
//! lives in `<root>/.stowage-db/index.json` and is guarded by a single
//! [`Lock`] on `<root>/.stowage-db/lock`, so any number of processes can
//! query the store while at most one modifies it.
//!
//! Every operation brackets itself in a read or write transaction on that
//! lock. Transactions nest, so operations may call each other freely: the
//! index is reloaded only when the outermost transaction takes the lock and
//! written back only when the lock is finally released, which for a write
//! nested in a read is the release of the enclosing read.

pub mod models;

pub use models::{INDEX_VERSION, Index, InstallRecord};

use crate::error::{Error, Result};
use crate::lock::{ActiveTransaction, Acquired, DEFAULT_TIMEOUT, Failure, Lock, LockTransaction};
use std::error::Error as StdError;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Directory under the store root holding the lock and the index
pub const DB_DIR: &str = ".stowage-db";

const LOCK_FILE: &str = "lock";
const INDEX_FILE: &str = "index.json";

/// Where the store lives and how long to wait for its lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub root: PathBuf,
    pub lock_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/stowage"),
            lock_timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl StoreConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }
}

/// Handle on an installation store
#[derive(Debug)]
pub struct Store {
    config: StoreConfig,
    lock: Lock,
    index_path: PathBuf,
    index: Mutex<Index>,
    /// In-memory index has changes not yet written back
    dirty: AtomicBool,
}

impl Store {
    /// Open the store under `config.root`, creating its database directory
    ///
    /// Nothing is read until the first transaction.
    pub fn open(config: StoreConfig) -> Result<Self> {
        let db_dir = config.root.join(DB_DIR);
        fs::create_dir_all(&db_dir)?;
        debug!("Opened store at: {}", db_dir.display());

        Ok(Self {
            lock: Lock::new(db_dir.join(LOCK_FILE)),
            index_path: db_dir.join(INDEX_FILE),
            index: Mutex::new(Index::default()),
            dirty: AtomicBool::new(false),
            config,
        })
    }

    /// Write an empty index if none exists yet
    ///
    /// Idempotent: an existing index is left as it is.
    pub fn init(&self) -> Result<()> {
        self.with_write(|| Ok(()))?;
        info!("Store initialized at {}", self.root().display());
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The lock guarding this store
    pub fn lock(&self) -> &Lock {
        &self.lock
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    /// Shared transaction that reloads the index when it takes the lock and
    /// writes back changes from nested writes before releasing
    pub fn read_transaction(&self) -> LockTransaction<'_> {
        LockTransaction::read(&self.lock)
            .timeout(self.config.lock_timeout)
            .on_first_acquire(move || {
                self.reload()?;
                Ok(Acquired::Nothing)
            })
            .on_last_release(move |failure| {
                self.settle(failure, false)?;
                Ok(false)
            })
    }

    /// Exclusive transaction that reloads the index when it takes the lock
    /// and writes it back before releasing, unless the block failed
    pub fn write_transaction(&self) -> LockTransaction<'_> {
        LockTransaction::write(&self.lock)
            .timeout(self.config.lock_timeout)
            .on_first_acquire(move || {
                self.reload()?;
                Ok(Acquired::Nothing)
            })
            .on_last_release(move |failure| {
                self.settle(failure, true)?;
                Ok(false)
            })
    }

    /// Record a new installation
    pub fn add(&self, record: InstallRecord) -> Result<()> {
        self.with_write(|| {
            if self.get(&record.name)?.is_some() {
                return Err(Error::AlreadyInstalled(record.name.clone()));
            }
            info!("Recording {} {} at {}", record.name, record.version, record.prefix.display());
            self.index().installs.insert(record.name.clone(), record);
            Ok(())
        })
    }

    /// Drop the record for `name`, returning it
    pub fn remove(&self, name: &str) -> Result<InstallRecord> {
        self.with_write(|| {
            let record = self
                .index()
                .installs
                .remove(name)
                .ok_or_else(|| Error::NotInstalled(name.to_string()))?;
            info!("Removed record for {}", name);
            Ok(record)
        })
    }

    pub fn get(&self, name: &str) -> Result<Option<InstallRecord>> {
        self.with_read(|| Ok(self.index().installs.get(name).cloned()))
    }

    /// Records whose name contains `pattern`
    pub fn query(&self, pattern: &str) -> Result<Vec<InstallRecord>> {
        self.with_read(|| Ok(self.index().matching(pattern)))
    }

    /// All records, in name order
    pub fn installed(&self) -> Result<Vec<InstallRecord>> {
        self.query("")
    }

    fn with_read<R>(&self, body: impl FnOnce() -> Result<R>) -> Result<R> {
        let (active, _) = self.read_transaction().enter()?;
        finish(active, body())
    }

    fn with_write<R>(&self, body: impl FnOnce() -> Result<R>) -> Result<R> {
        let (active, _) = self.write_transaction().enter()?;
        let outcome = body();
        if outcome.is_ok() {
            self.dirty.store(true, Ordering::SeqCst);
        }
        finish(active, outcome)
    }

    /// Write back pending changes as the lock is finally released
    ///
    /// A write nested in a read upgrades the lock but is not its last
    /// release, so the enclosing read settles its changes instead.
    /// Changes are discarded if the block failed.
    fn settle(&self, failure: Failure<'_>, always: bool) -> Result<()> {
        let dirty = self.dirty.swap(false, Ordering::SeqCst);
        match failure {
            None if dirty || always => self.persist(),
            None => Ok(()),
            Some(e) => {
                if dirty {
                    debug!("Discarding index changes after error: {}", e);
                }
                Ok(())
            }
        }
    }

    // Callers must not hold this guard across a nested operation.
    fn index(&self) -> MutexGuard<'_, Index> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reload(&self) -> Result<()> {
        let index = match fs::read_to_string(&self.index_path) {
            Ok(data) => Index::from_json(&data)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No index at {}, starting empty", self.index_path.display());
                Index::default()
            }
            Err(e) => return Err(e.into()),
        };
        debug!("Loaded {} install records", index.installs.len());
        *self.index() = index;
        self.dirty.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Replace the index file atomically with the in-memory index
    fn persist(&self) -> Result<()> {
        let dir = self.index_path.parent().unwrap_or(Path::new("."));
        let temp = NamedTempFile::new_in(dir)?;
        {
            let mut writer = BufWriter::new(temp.as_file());
            serde_json::to_writer_pretty(&mut writer, &*self.index())?;
            writer.flush()?;
        }
        temp.as_file().sync_all()?;
        temp.persist(&self.index_path).map_err(io::Error::from)?;
        debug!("Wrote index to {}", self.index_path.display());
        Ok(())
    }
}

/// Exit `active` with the outcome of its block
fn finish<R>(active: ActiveTransaction<'_>, outcome: Result<R>) -> Result<R> {
    let failure = outcome.as_ref().err().map(|e| e as &(dyn StdError + 'static));
    let exited = active.exit(failure);
    match (outcome, exited) {
        (Ok(value), Ok(_)) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(_)) => Err(e),
        (Err(e), Err(exit_err)) => {
            warn!("Transaction cleanup failed after error: {}", exit_err);
            Err(e)
        }
    }
}
