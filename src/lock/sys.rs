// src/lock/sys.rs

//! POSIX advisory record locks
//!
//! Thin wrappers over `fcntl` byte-range locks. On Linux the
//! open-file-description commands (`F_OFD_SETLK`) are used, so a lock belongs
//! to the open file rather than to the process: two handles on one file
//! inside a single process conflict exactly like two processes do, and
//! closing an unrelated handle never drops a lock. Other Unix systems fall
//! back to classic process-associated `F_SETLK` locks.

use super::AcquireMode;
use nix::errno::Errno;
use nix::fcntl::{FcntlArg, fcntl};
use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;

/// Attempt a non-blocking record lock on `[start, start + length)`.
///
/// A `length` of zero extends the range to the end of the file (and beyond),
/// so `(0, 0)` covers the whole file.
///
/// Returns `Ok(true)` when the lock was granted, `Ok(false)` when another
/// holder has a conflicting lock, and `Err` for every other failure.
pub(crate) fn try_lock(file: &File, mode: AcquireMode, start: u64, length: u64) -> io::Result<bool> {
    let lock_type = match mode {
        AcquireMode::Shared => libc::F_RDLCK,
        AcquireMode::Exclusive => libc::F_WRLCK,
    };
    set_lock(file, lock_type, start, length)
}

/// Release whatever record lock this handle holds on the range.
pub(crate) fn unlock(file: &File, start: u64, length: u64) -> io::Result<()> {
    set_lock(file, libc::F_UNLCK, start, length).map(|_| ())
}

#[allow(clippy::unnecessary_cast, clippy::cast_possible_truncation)]
fn set_lock<L: Into<i64>>(file: &File, lock_type: L, start: u64, length: u64) -> io::Result<bool> {
    let flock = libc::flock {
        l_type: lock_type.into() as libc::c_short,
        l_whence: libc::SEEK_SET as libc::c_short,
        l_start: to_offset(start)?,
        l_len: to_offset(length)?,
        l_pid: 0,
    };

    #[cfg(any(target_os = "linux", target_os = "android"))]
    let arg = FcntlArg::F_OFD_SETLK(&flock);
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let arg = FcntlArg::F_SETLK(&flock);

    match fcntl(file.as_raw_fd(), arg) {
        Ok(_) => Ok(true),
        // Both values mean "held by someone else", depending on the platform.
        Err(Errno::EAGAIN | Errno::EACCES) => Ok(false),
        Err(errno) => Err(errno.into()),
    }
}

fn to_offset(value: u64) -> io::Result<libc::off_t> {
    libc::off_t::try_from(value).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("lock offset {} does not fit in off_t", value),
        )
    })
}
