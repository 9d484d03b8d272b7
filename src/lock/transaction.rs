// src/lock/transaction.rs

//! Scoped critical sections on a [`Lock`]
//!
//! A [`LockTransaction`] brackets a block of work with an acquire/release
//! pair in one [`AcquireMode`]. Transactions nest: only the outermost entry
//! on a lock runs the `on_first_acquire` callback and only the matching
//! outermost exit runs `on_last_release`, so a store can reload its data
//! once when the lock is first taken and persist it once before the lock is
//! dropped, however deeply its own methods call each other.
//!
//! ```no_run
//! use stowage::lock::{Acquired, Lock, LockTransaction};
//!
//! # fn main() -> stowage::Result<()> {
//! let lock = Lock::new("/tmp/stowage-demo/lock");
//! let value = LockTransaction::write(&lock)
//!     .on_first_acquire(|| Ok(Acquired::Value(42)))
//!     .on_last_release(|_failure| Ok(false))
//!     .run(|value| Ok::<_, stowage::Error>(value.unwrap_or_default() + 1))?;
//! assert_eq!(value, Some(43));
//! # Ok(())
//! # }
//! ```

use super::{DEFAULT_TIMEOUT, Lock};
use crate::error::{Error, Result};
use std::error::Error as StdError;
use std::time::Duration;
use tracing::{debug, warn};

/// Failure information handed to cleanup callbacks: the error that ended
/// the guarded block, if any.
pub type Failure<'e> = Option<&'e (dyn StdError + 'static)>;

/// Mode in which a transaction holds its lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireMode {
    Shared,
    Exclusive,
}

/// A resource with its own enter/exit bracket, entered after the lock is
/// taken and exited before it is released
pub trait ScopedResource {
    type Value;

    /// Enter the resource, producing the value bound for the block
    fn enter(&mut self) -> Result<Self::Value>;

    /// Leave the resource. Returning `true` asks to suppress `failure`.
    fn exit(&mut self, failure: Failure<'_>) -> Result<bool>;
}

/// What an `on_first_acquire` callback hands back to its transaction
pub enum Acquired<'a, T> {
    /// No value is bound for the block
    Nothing,
    /// Bind this value for the block
    Value(T),
    /// Enter this resource and bind the value it produces
    Scoped(Box<dyn ScopedResource<Value = T> + 'a>),
}

impl<'a, T> Acquired<'a, T> {
    pub fn scoped(resource: impl ScopedResource<Value = T> + 'a) -> Self {
        Acquired::Scoped(Box::new(resource))
    }
}

type SetupFn<'a, T> = Box<dyn FnOnce() -> Result<Acquired<'a, T>> + 'a>;
type TeardownFn<'a> = Box<dyn for<'e> FnOnce(Failure<'e>) -> Result<bool> + 'a>;

/// A not-yet-entered critical section on a [`Lock`]
///
/// `LockTransaction::read` and `LockTransaction::write` build the read and
/// write flavours. Entering consumes the transaction, so a transaction can
/// be entered at most once.
#[must_use = "a transaction does nothing until it is entered"]
pub struct LockTransaction<'a, T = ()> {
    lock: &'a Lock,
    mode: AcquireMode,
    timeout: Duration,
    on_first_acquire: Option<SetupFn<'a, T>>,
    on_last_release: Option<TeardownFn<'a>>,
}

impl<'a, T> LockTransaction<'a, T> {
    pub fn new(lock: &'a Lock, mode: AcquireMode) -> Self {
        Self {
            lock,
            mode,
            timeout: DEFAULT_TIMEOUT,
            on_first_acquire: None,
            on_last_release: None,
        }
    }

    /// Shared (read) transaction
    pub fn read(lock: &'a Lock) -> Self {
        Self::new(lock, AcquireMode::Shared)
    }

    /// Exclusive (write) transaction
    pub fn write(lock: &'a Lock) -> Self {
        Self::new(lock, AcquireMode::Exclusive)
    }

    /// How long to wait for the lock (default [`DEFAULT_TIMEOUT`])
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run `setup` when this transaction takes the lock for real
    pub fn on_first_acquire<F>(mut self, setup: F) -> Self
    where
        F: FnOnce() -> Result<Acquired<'a, T>> + 'a,
    {
        self.on_first_acquire = Some(Box::new(setup));
        self
    }

    /// Run `teardown` when this transaction releases the lock for real
    ///
    /// The callback receives the error that ended the block, if any, and
    /// returns whether that error should be suppressed. It runs while the
    /// lock is still held.
    pub fn on_last_release<F>(mut self, teardown: F) -> Self
    where
        F: for<'e> FnOnce(Failure<'e>) -> Result<bool> + 'a,
    {
        self.on_last_release = Some(Box::new(teardown));
        self
    }

    pub fn mode(&self) -> AcquireMode {
        self.mode
    }

    /// Acquire the lock and run the setup callback if this is the outermost
    /// entry
    ///
    /// Returns the active transaction together with the value bound for the
    /// block. Nested entries bind nothing. If the lock cannot be obtained
    /// the setup callback never runs; if setup fails, the lock is released
    /// again and the teardown callback is skipped.
    pub fn enter(self) -> Result<(ActiveTransaction<'a, T>, Option<T>)> {
        let outermost = self.lock.acquire(self.mode, self.timeout)?;

        let mut active = ActiveTransaction {
            lock: self.lock,
            mode: self.mode,
            nested: None,
            on_last_release: self.on_last_release,
            finished: false,
        };

        let setup = match self.on_first_acquire {
            Some(setup) if outermost => setup,
            _ => return Ok((active, None)),
        };

        match setup().and_then(|acquired| active.bind(acquired)) {
            Ok(value) => Ok((active, value)),
            Err(e) => {
                active.on_last_release = None;
                active.nested = None;
                if let Err(release_err) = active.release() {
                    warn!("Failed to release {} after setup error: {}", active.lock, release_err);
                }
                Err(e)
            }
        }
    }

    /// Enter, run `body` with the bound value, and exit
    ///
    /// An error from `body` is passed to the cleanup callbacks. Returns
    /// `Ok(None)` if a callback suppressed that error. When both `body` and
    /// the cleanup fail, the error from `body` is returned.
    pub fn run<R, E, F>(self, body: F) -> std::result::Result<Option<R>, E>
    where
        F: FnOnce(Option<T>) -> std::result::Result<R, E>,
        E: StdError + From<Error> + 'static,
    {
        let (active, bound) = self.enter()?;
        let outcome = body(bound);
        let failure = outcome.as_ref().err().map(|e| e as &(dyn StdError + 'static));

        match active.exit(failure) {
            Ok(suppress) => match outcome {
                Ok(value) => Ok(Some(value)),
                Err(_) if suppress => Ok(None),
                Err(e) => Err(e),
            },
            Err(exit_err) => match outcome {
                Ok(_) => Err(exit_err.into()),
                Err(e) => {
                    warn!("Transaction cleanup failed after error: {}", exit_err);
                    Err(e)
                }
            },
        }
    }
}

/// An entered critical section
///
/// Call [`exit`](Self::exit) when the block is done. Dropping an active
/// transaction without exiting it (an early return or a panic) still
/// releases the lock, but skips the nested resource and teardown callback
/// since the outcome of the block is unknown.
#[must_use = "an active transaction should be exited with its outcome"]
pub struct ActiveTransaction<'a, T = ()> {
    lock: &'a Lock,
    mode: AcquireMode,
    nested: Option<Box<dyn ScopedResource<Value = T> + 'a>>,
    on_last_release: Option<TeardownFn<'a>>,
    finished: bool,
}

impl<'a, T> ActiveTransaction<'a, T> {
    pub fn mode(&self) -> AcquireMode {
        self.mode
    }

    /// Leave the critical section
    ///
    /// On the outermost exit, the nested resource (if any) and then the
    /// teardown callback (if any) run with `failure` while the lock is still
    /// held; the lock is released afterwards even if they fail. Returns
    /// whether either of them asked to suppress `failure`. Nested exits only
    /// release and return `Ok(false)`.
    pub fn exit(mut self, failure: Failure<'_>) -> Result<bool> {
        let outermost = self.lock.is_last_hold(self.mode);
        let cleanup = if outermost {
            self.cleanup(failure)
        } else {
            Ok(false)
        };
        let released = self.release();

        match (cleanup, released) {
            (Ok(suppress), Ok(_)) => Ok(suppress),
            (Err(e), Ok(_)) | (Ok(_), Err(e)) => Err(e),
            (Err(e), Err(release_err)) => {
                warn!("Failed to release {}: {}", self.lock, release_err);
                Err(e)
            }
        }
    }

    fn bind(&mut self, acquired: Acquired<'a, T>) -> Result<Option<T>> {
        match acquired {
            Acquired::Nothing => Ok(None),
            Acquired::Value(value) => Ok(Some(value)),
            Acquired::Scoped(mut resource) => {
                let value = resource.enter()?;
                self.nested = Some(resource);
                Ok(Some(value))
            }
        }
    }

    fn cleanup(&mut self, failure: Failure<'_>) -> Result<bool> {
        let mut suppress = false;
        if let Some(mut nested) = self.nested.take() {
            suppress |= nested.exit(failure)?;
        }
        if let Some(teardown) = self.on_last_release.take() {
            suppress |= teardown(failure)?;
        }
        Ok(suppress)
    }

    fn release(&mut self) -> Result<bool> {
        self.finished = true;
        Ok(self.lock.release(self.mode)?)
    }
}

impl<T> Drop for ActiveTransaction<'_, T> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        debug!("Transaction on {} dropped without exit, releasing", self.lock);
        if let Err(e) = self.release() {
            warn!("Failed to release {} on drop: {}", self.lock, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::io;
    use std::rc::Rc;

    #[derive(Default)]
    struct Calls {
        entered: Cell<usize>,
        exited: Cell<usize>,
        saw_failure: Cell<bool>,
    }

    fn block_error() -> Error {
        Error::Io(io::Error::other("block failed"))
    }

    fn test_lock() -> (tempfile::TempDir, Lock) {
        let dir = tempfile::tempdir().unwrap();
        let lock = Lock::new(dir.path().join("lockfile"));
        (dir, lock)
    }

    fn tracked<'a>(lock: &'a Lock, mode: AcquireMode, calls: &'a Calls) -> LockTransaction<'a, ()> {
        LockTransaction::new(lock, mode)
            .on_first_acquire(move || {
                calls.entered.set(calls.entered.get() + 1);
                Ok(Acquired::Nothing)
            })
            .on_last_release(move |failure| {
                calls.exited.set(calls.exited.get() + 1);
                calls.saw_failure.set(failure.is_some());
                Ok(false)
            })
    }

    /// Records its enter/exit calls into shared counters
    struct Resource {
        calls: Rc<Calls>,
        suppress: bool,
    }

    impl ScopedResource for Resource {
        type Value = &'static str;

        fn enter(&mut self) -> Result<Self::Value> {
            self.calls.entered.set(self.calls.entered.get() + 1);
            Ok("entered")
        }

        fn exit(&mut self, failure: Failure<'_>) -> Result<bool> {
            self.calls.exited.set(self.calls.exited.get() + 1);
            self.calls.saw_failure.set(failure.is_some());
            Ok(self.suppress)
        }
    }

    #[test]
    fn test_callbacks_run_once_per_transaction() {
        let (_dir, lock) = test_lock();

        for mode in [AcquireMode::Shared, AcquireMode::Exclusive] {
            let calls = Calls::default();
            let result = tracked(&lock, mode, &calls).run(|_| Ok::<_, Error>(()));

            assert!(matches!(result, Ok(Some(()))));
            assert_eq!(calls.entered.get(), 1);
            assert_eq!(calls.exited.get(), 1);
            assert!(!calls.saw_failure.get());
            assert_eq!(lock.held_mode(), crate::lock::LockMode::Unlocked);
        }
    }

    #[test]
    fn test_nested_write_transactions_run_callbacks_once() {
        let (_dir, lock) = test_lock();
        let calls = Calls::default();

        let (outer, _) = tracked(&lock, AcquireMode::Exclusive, &calls).enter().unwrap();
        let (inner, _) = tracked(&lock, AcquireMode::Exclusive, &calls).enter().unwrap();
        assert_eq!(calls.entered.get(), 1);
        assert_eq!(lock.writes(), 2);

        assert!(!inner.exit(None).unwrap());
        assert_eq!(calls.exited.get(), 0);
        assert!(lock.is_write_locked());

        assert!(!outer.exit(None).unwrap());
        assert_eq!(calls.entered.get(), 1);
        assert_eq!(calls.exited.get(), 1);
        assert!(!lock.is_write_locked());
    }

    #[test]
    fn test_read_nested_in_write_skips_callbacks() {
        let (_dir, lock) = test_lock();
        let outer_calls = Calls::default();
        let inner_calls = Calls::default();

        tracked(&lock, AcquireMode::Exclusive, &outer_calls)
            .run(|_| {
                tracked(&lock, AcquireMode::Shared, &inner_calls).run(|_| Ok::<_, Error>(()))
            })
            .unwrap();

        assert_eq!(outer_calls.entered.get(), 1);
        assert_eq!(outer_calls.exited.get(), 1);
        assert_eq!(inner_calls.entered.get(), 0);
        assert_eq!(inner_calls.exited.get(), 0);
        assert_eq!((lock.reads(), lock.writes()), (0, 0));
    }

    #[test]
    fn test_block_error_reaches_teardown_and_propagates() {
        let (_dir, lock) = test_lock();

        for mode in [AcquireMode::Shared, AcquireMode::Exclusive] {
            let calls = Calls::default();
            let result: std::result::Result<Option<()>, Error> =
                tracked(&lock, mode, &calls).run(|_| Err(block_error()));

            assert!(matches!(result, Err(Error::Io(_))));
            assert_eq!(calls.exited.get(), 1);
            assert!(calls.saw_failure.get());
            assert_eq!(lock.held_mode(), crate::lock::LockMode::Unlocked);
        }
    }

    #[test]
    fn test_teardown_can_suppress_error() {
        let (_dir, lock) = test_lock();

        let result = LockTransaction::<()>::write(&lock)
            .on_last_release(|failure| Ok(failure.is_some()))
            .run(|_| Err::<(), _>(block_error()));

        assert!(matches!(result, Ok(None)));
    }

    #[test]
    fn test_setup_value_is_bound() {
        let (_dir, lock) = test_lock();

        let (active, value) = LockTransaction::read(&lock)
            .on_first_acquire(|| Ok(Acquired::Value(7)))
            .enter()
            .unwrap();
        assert_eq!(value, Some(7));

        // A nested entry binds nothing
        let (nested, nested_value) = LockTransaction::read(&lock)
            .on_first_acquire(|| Ok(Acquired::Value(8)))
            .enter()
            .unwrap();
        assert_eq!(nested_value, None);

        nested.exit(None).unwrap();
        active.exit(None).unwrap();
    }

    #[test]
    fn test_scoped_resource_is_entered_and_exited() {
        let (_dir, lock) = test_lock();
        let resource_calls = Rc::new(Calls::default());
        let teardown_calls = Calls::default();

        let setup_calls = Rc::clone(&resource_calls);
        let result = LockTransaction::write(&lock)
            .on_first_acquire(move || {
                Ok(Acquired::scoped(Resource {
                    calls: setup_calls,
                    suppress: false,
                }))
            })
            .on_last_release(|failure| {
                teardown_calls.exited.set(1);
                teardown_calls.saw_failure.set(failure.is_some());
                Ok(false)
            })
            .run(|value| Ok::<_, Error>(value));

        assert_eq!(result.unwrap(), Some(Some("entered")));
        assert_eq!(resource_calls.entered.get(), 1);
        assert_eq!(resource_calls.exited.get(), 1);
        assert!(!resource_calls.saw_failure.get());
        assert_eq!(teardown_calls.exited.get(), 1);
    }

    #[test]
    fn test_scoped_resource_without_teardown_sees_failure() {
        let (_dir, lock) = test_lock();
        let calls = Rc::new(Calls::default());

        let setup_calls = Rc::clone(&calls);
        let result = LockTransaction::read(&lock)
            .on_first_acquire(move || {
                Ok(Acquired::scoped(Resource {
                    calls: setup_calls,
                    suppress: false,
                }))
            })
            .run(|_| Err::<(), _>(block_error()));

        assert!(result.is_err());
        assert_eq!(calls.exited.get(), 1);
        assert!(calls.saw_failure.get());
    }

    #[test]
    fn test_scoped_resource_can_suppress_error() {
        let (_dir, lock) = test_lock();
        let calls = Rc::new(Calls::default());

        let setup_calls = Rc::clone(&calls);
        let result = LockTransaction::write(&lock)
            .on_first_acquire(move || {
                Ok(Acquired::scoped(Resource {
                    calls: setup_calls,
                    suppress: true,
                }))
            })
            .on_last_release(|_| Ok(false))
            .run(|_| Err::<(), _>(block_error()));

        assert!(matches!(result, Ok(None)));
    }

    #[test]
    fn test_setup_error_releases_lock_without_teardown() {
        let (_dir, lock) = test_lock();
        let teardown_ran = Cell::new(false);

        let result = LockTransaction::<()>::write(&lock)
            .on_first_acquire(|| Err(block_error()))
            .on_last_release(|_| {
                teardown_ran.set(true);
                Ok(false)
            })
            .enter();

        assert!(result.is_err());
        assert!(!teardown_ran.get());
        assert_eq!((lock.reads(), lock.writes()), (0, 0));
    }

    #[test]
    fn test_teardown_runs_while_lock_is_held() {
        let (_dir, lock) = test_lock();
        let held_during_teardown = Cell::new(false);

        LockTransaction::<()>::write(&lock)
            .on_last_release(|_| {
                held_during_teardown.set(lock.is_write_locked());
                Ok(false)
            })
            .run(|_| Ok::<_, Error>(()))
            .unwrap();

        assert!(held_during_teardown.get());
        assert!(!lock.is_write_locked());
    }

    #[test]
    fn test_teardown_error_still_releases() {
        let (_dir, lock) = test_lock();

        let result = LockTransaction::<()>::write(&lock)
            .on_last_release(|_| Err(block_error()))
            .run(|_| Ok::<_, Error>(()));

        assert!(result.is_err());
        assert_eq!(lock.held_mode(), crate::lock::LockMode::Unlocked);
    }

    #[test]
    fn test_drop_without_exit_releases_lock() {
        let (_dir, lock) = test_lock();
        let calls = Calls::default();

        {
            let (_active, _) = tracked(&lock, AcquireMode::Exclusive, &calls).enter().unwrap();
            assert!(lock.is_write_locked());
        }

        assert!(!lock.is_write_locked());
        assert_eq!(calls.entered.get(), 1);
        assert_eq!(calls.exited.get(), 0);
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn test_timeout_skips_setup() {
        let (dir, lock) = test_lock();
        let other = Lock::new(dir.path().join("lockfile"));
        other.acquire_write(DEFAULT_TIMEOUT).unwrap();

        let setup_ran = Cell::new(false);
        let result = LockTransaction::<()>::read(&lock)
            .timeout(Duration::from_millis(20))
            .on_first_acquire(|| {
                setup_ran.set(true);
                Ok(Acquired::Nothing)
            })
            .enter();

        assert!(matches!(
            result,
            Err(Error::Lock(crate::lock::LockError::Timeout { .. }))
        ));
        assert!(!setup_ran.get());
        other.release_write().unwrap();
    }
}
