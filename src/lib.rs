// src/lib.rs

//! Stowage
//!
//! Installation store for software trees shared between many processes and
//! hosts, built on cross-process advisory file locks.
//!
//! # Architecture
//!
//! - [`lock`]: recursive read/write byte-range locks on a file, with spin
//!   and timeout, upgrade, holder identity, and nestable transactions
//! - [`store`]: JSON index of installed packages guarded by one such lock
//! - No daemon: every process coordinates through the lock file alone

mod error;
pub mod lock;
pub mod store;

pub use error::{Error, Result};
pub use lock::{DEFAULT_TIMEOUT, Holder, Lock, LockError, LockMode, LockTransaction};
pub use store::{Store, StoreConfig};
