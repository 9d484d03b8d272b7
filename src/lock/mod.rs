// src/lock/mod.rs

//! Recursive cross-process file locks
//!
//! A [`Lock`] guards a byte range of a file with POSIX advisory record
//! locks, so any number of independent processes (possibly on different
//! nodes of a networked filesystem) can coordinate on it. Within one
//! process the lock is recursive: nested acquisitions through the same
//! instance are counted and collapse into a single OS-level lock that is
//! released only when every acquisition has been released again.
//!
//! Locks are taken with a non-blocking spin loop bounded by a timeout, since
//! blocking waits are unreliable on some distributed filesystems. Every
//! exclusive acquisition records the holder's pid and hostname in the lock
//! file for diagnosing stuck locks.
//!
//! Critical sections are usually bracketed with a
//! [`LockTransaction`](transaction::LockTransaction) rather than by calling
//! the acquire/release methods directly.

mod holder;
mod sys;
pub mod transaction;

pub use holder::Holder;
pub use transaction::{AcquireMode, Acquired, ActiveTransaction, Failure, LockTransaction, ScopedResource};

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Default time to wait for a lock before giving up
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// First pause between lock attempts
const INITIAL_BACKOFF: Duration = Duration::from_micros(10);

/// Upper bound for the pause between lock attempts
const MAX_BACKOFF: Duration = Duration::from_millis(1);

/// Errors raised while acquiring or releasing a [`Lock`]
#[derive(Error, Debug)]
pub enum LockError {
    /// The lock could not be obtained before the timeout expired
    #[error("{}", timeout_message(.path, .timeout, .holder))]
    Timeout {
        path: PathBuf,
        timeout: Duration,
        /// Last holder recorded in the lock file, if it could be read
        holder: Option<Holder>,
    },

    /// An exclusive lock was requested on a file opened read-only
    #[error("Can't take exclusive lock on read-only file: {}", .path.display())]
    Upgrade { path: PathBuf },

    /// Any other OS-level failure
    #[error("Lock I/O error: {0}")]
    Io(#[from] io::Error),
}

fn timeout_message(path: &Path, timeout: &Duration, holder: &Option<Holder>) -> String {
    let mut message = format!(
        "Timed out after {:?} waiting for lock on {}",
        timeout,
        path.display()
    );
    if let Some(holder) = holder {
        message.push_str(&format!(" (last held by pid {} on {})", holder.pid, holder.host));
    }
    message
}

/// Lock mode currently held through a [`Lock`] instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Unlocked,
    Shared,
    Exclusive,
}

impl LockMode {
    pub fn as_str(&self) -> &str {
        match self {
            LockMode::Unlocked => "unlocked",
            LockMode::Shared => "shared",
            LockMode::Exclusive => "exclusive",
        }
    }
}

/// Open lock file, kept only while some mode is held
#[derive(Debug)]
struct LockFile {
    file: File,
    writable: bool,
}

#[derive(Debug, Default)]
struct LockState {
    reads: usize,
    writes: usize,
    file: Option<LockFile>,
    owner: Option<Holder>,
    previous_owner: Option<Holder>,
}

impl LockState {
    fn is_held(&self) -> bool {
        self.reads > 0 || self.writes > 0
    }
}

/// A recursive reader/writer lock on a byte range of a file
///
/// Methods take `&self`; the recursion counters live behind a mutex so one
/// instance can be shared by a store and every nested transaction on it.
/// Recursion is tracked per instance: two `Lock` values on the same path
/// behave like two separate processes.
#[derive(Debug)]
pub struct Lock {
    path: PathBuf,
    start: u64,
    length: u64,
    state: Mutex<LockState>,
}

impl Lock {
    /// Create a lock covering the whole file at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_range(path, 0, 0)
    }

    /// Create a lock on `length` bytes starting `start` bytes into the file
    ///
    /// A `length` of zero extends the range to the end of the file. Locks on
    /// disjoint ranges of one file are independent of each other.
    pub fn with_range(path: impl Into<PathBuf>, start: u64, length: u64) -> Self {
        Self {
            path: path.into(),
            start,
            length,
            state: Mutex::new(LockState::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `(start, length)` of the locked byte range
    pub fn range(&self) -> (u64, u64) {
        (self.start, self.length)
    }

    /// Outstanding shared acquisitions through this instance
    pub fn reads(&self) -> usize {
        self.state().reads
    }

    /// Outstanding exclusive acquisitions through this instance
    pub fn writes(&self) -> usize {
        self.state().writes
    }

    pub fn held_mode(&self) -> LockMode {
        let state = self.state();
        if state.writes > 0 {
            LockMode::Exclusive
        } else if state.reads > 0 {
            LockMode::Shared
        } else {
            LockMode::Unlocked
        }
    }

    pub fn is_read_locked(&self) -> bool {
        self.reads() > 0
    }

    pub fn is_write_locked(&self) -> bool {
        self.writes() > 0
    }

    /// Holder recorded in the lock file at the last OS-level acquisition
    pub fn owner(&self) -> Option<Holder> {
        self.state().owner.clone()
    }

    /// Holder that was recorded before this instance last took the lock
    /// exclusively
    pub fn previous_owner(&self) -> Option<Holder> {
        self.state().previous_owner.clone()
    }

    /// Read the holder recorded in the lock file at `path` without locking
    ///
    /// Returns `None` if the file is missing, unreadable, or holds no valid
    /// identity.
    pub fn read_holder(path: impl AsRef<Path>) -> Option<Holder> {
        let mut file = File::open(path.as_ref()).ok()?;
        holder::read_holder(&mut file)
    }

    /// Acquire a recursive shared lock
    ///
    /// Returns `Ok(true)` if this call took the OS-level lock and `Ok(false)`
    /// if it only nested inside locks already held by this instance.
    pub fn acquire_read(&self, timeout: Duration) -> Result<bool, LockError> {
        let mut state = self.state();
        if state.reads == 0 && state.writes == 0 {
            debug!("READ LOCK: {} [Acquiring]", self);
            self.lock(&mut state, AcquireMode::Shared, timeout)?;
            debug!("READ LOCK: {} [Acquired]", self);
            state.reads += 1;
            Ok(true)
        } else {
            state.reads += 1;
            Ok(false)
        }
    }

    /// Acquire a recursive exclusive lock
    ///
    /// Upgrades the OS-level lock if only shared locks are held. Returns
    /// `Ok(true)` if this call took (or upgraded) the OS-level lock.
    pub fn acquire_write(&self, timeout: Duration) -> Result<bool, LockError> {
        let mut state = self.state();
        if state.writes == 0 {
            debug!("WRITE LOCK: {} [Acquiring]", self);
            self.lock(&mut state, AcquireMode::Exclusive, timeout)?;
            debug!("WRITE LOCK: {} [Acquired]", self);
            state.writes += 1;
            Ok(true)
        } else {
            state.writes += 1;
            Ok(false)
        }
    }

    /// Release one shared acquisition
    ///
    /// Returns `Ok(true)` if this released the OS-level lock.
    ///
    /// # Panics
    ///
    /// Panics if no shared acquisition is outstanding.
    pub fn release_read(&self) -> Result<bool, LockError> {
        let mut state = self.state();
        assert!(state.reads > 0, "release_read on {} with no read locks held", self);

        if state.reads == 1 && state.writes == 0 {
            self.unlock(&mut state)?;
            debug!("READ LOCK: {} [Released]", self);
            state.reads -= 1;
            Ok(true)
        } else {
            state.reads -= 1;
            Ok(false)
        }
    }

    /// Release one exclusive acquisition
    ///
    /// Returns `Ok(true)` if this released the OS-level lock. With shared
    /// acquisitions still outstanding the OS-level lock stays exclusive
    /// until the last of them is released; there is no downgrade.
    ///
    /// # Panics
    ///
    /// Panics if no exclusive acquisition is outstanding.
    pub fn release_write(&self) -> Result<bool, LockError> {
        let mut state = self.state();
        assert!(state.writes > 0, "release_write on {} with no write locks held", self);

        if state.writes == 1 && state.reads == 0 {
            self.unlock(&mut state)?;
            debug!("WRITE LOCK: {} [Released]", self);
            state.writes -= 1;
            Ok(true)
        } else {
            state.writes -= 1;
            Ok(false)
        }
    }

    /// Acquire in the given mode
    pub fn acquire(&self, mode: AcquireMode, timeout: Duration) -> Result<bool, LockError> {
        match mode {
            AcquireMode::Shared => self.acquire_read(timeout),
            AcquireMode::Exclusive => self.acquire_write(timeout),
        }
    }

    /// Release one acquisition of the given mode
    pub fn release(&self, mode: AcquireMode) -> Result<bool, LockError> {
        match mode {
            AcquireMode::Shared => self.release_read(),
            AcquireMode::Exclusive => self.release_write(),
        }
    }

    /// Whether releasing `mode` now would drop the OS-level lock
    pub(crate) fn is_last_hold(&self, mode: AcquireMode) -> bool {
        let state = self.state();
        match mode {
            AcquireMode::Shared => state.reads == 1 && state.writes == 0,
            AcquireMode::Exclusive => state.writes == 1 && state.reads == 0,
        }
    }

    fn state(&self) -> MutexGuard<'_, LockState> {
        // A panicking release assertion must not wedge the lock for good.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the OS-level lock in `mode`, opening the file if needed
    fn lock(&self, state: &mut LockState, mode: AcquireMode, timeout: Duration) -> Result<(), LockError> {
        let mut handle = match state.file.take() {
            Some(handle) => handle,
            None => self.open()?,
        };

        let result = self
            .spin(&mut handle, mode, timeout)
            .and_then(|()| self.record_holder(&mut handle, state, mode));

        // Keep the handle only while something is held; a failed first
        // acquisition closes it again.
        if result.is_ok() || state.is_held() {
            state.file = Some(handle);
        }
        result
    }

    fn spin(&self, handle: &mut LockFile, mode: AcquireMode, timeout: Duration) -> Result<(), LockError> {
        if mode == AcquireMode::Exclusive && !handle.writable {
            return Err(LockError::Upgrade {
                path: self.path.clone(),
            });
        }

        let started = Instant::now();
        let mut backoff = INITIAL_BACKOFF;
        loop {
            if sys::try_lock(&handle.file, mode, self.start, self.length)? {
                return Ok(());
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(LockError::Timeout {
                    path: self.path.clone(),
                    timeout,
                    holder: holder::read_holder(&mut handle.file),
                });
            }

            thread::sleep(backoff.min(timeout - elapsed));
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// Refresh holder data after the OS-level lock was granted
    fn record_holder(&self, handle: &mut LockFile, state: &mut LockState, mode: AcquireMode) -> Result<(), LockError> {
        if let Some(holder) = holder::read_holder(&mut handle.file) {
            state.owner = Some(holder);
        }
        if mode == AcquireMode::Shared {
            return Ok(());
        }

        let current = Holder::current();
        if let Err(e) = holder::write_holder(&mut handle.file, &current) {
            self.roll_back(handle, state);
            return Err(e.into());
        }
        state.previous_owner = state.owner.replace(current);
        Ok(())
    }

    /// Return the OS-level lock to what the counters say is held
    fn roll_back(&self, handle: &LockFile, state: &LockState) {
        let result = if state.reads > 0 {
            sys::try_lock(&handle.file, AcquireMode::Shared, self.start, self.length).map(|_| ())
        } else {
            sys::unlock(&handle.file, self.start, self.length)
        };
        if let Err(e) = result {
            warn!("Failed to roll back lock on {}: {}", self, e);
        }
    }

    fn unlock(&self, state: &mut LockState) -> Result<(), LockError> {
        let Some(handle) = state.file.take() else {
            return Ok(());
        };
        if let Err(e) = sys::unlock(&handle.file, self.start, self.length) {
            state.file = Some(handle);
            return Err(e.into());
        }
        // Dropping the handle closes the file.
        Ok(())
    }

    /// Open the lock file, preferring read-write so the lock can be upgraded
    fn open(&self) -> Result<LockFile, LockError> {
        self.ensure_parent_directory()?;

        let opened = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path);

        match opened {
            Ok(file) => Ok(LockFile {
                file,
                writable: true,
            }),
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied && self.path.exists() => {
                debug!(
                    "Lock file {} is not writable, opening read-only",
                    self.path.display()
                );
                Ok(LockFile {
                    file: File::open(&self.path)?,
                    writable: false,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn ensure_parent_directory(&self) -> io::Result<()> {
        let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) else {
            return Ok(());
        };

        match fs::create_dir_all(parent) {
            Ok(()) => Ok(()),
            // Another process created it first
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && parent.is_dir() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl fmt::Display for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}:{}]", self.path.display(), self.start, self.length)
    }
}
