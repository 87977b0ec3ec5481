//! Thin wrappers over `fcntl(2)` record locking on a whole file.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;

fn whole_file(record_type: libc::c_short) -> libc::flock {
    // SAFETY: flock is a plain C struct; all-zero is a valid bit pattern.
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = record_type;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = 0;
    fl.l_len = 0;
    fl
}

fn would_block(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EACCES) | Some(libc::EAGAIN))
}

/// Try to take the lock without waiting.
///
/// Returns `Ok(false)` if another process holds a conflicting lock.
pub(super) fn try_lock(file: &File, record_type: libc::c_short) -> io::Result<bool> {
    let mut fl = whole_file(record_type);
    // SAFETY: the descriptor is owned by `file` and `fl` outlives the call.
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &mut fl) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if would_block(&err) { Ok(false) } else { Err(err) }
}

/// Take the lock, waiting as long as it takes.
pub(super) fn lock(file: &File, record_type: libc::c_short) -> io::Result<()> {
    loop {
        let mut fl = whole_file(record_type);
        // SAFETY: as in `try_lock`.
        let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLKW, &mut fl) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Drop any record lock this process holds on the file.
pub(super) fn unlock(file: &File) -> io::Result<()> {
    let mut fl = whole_file(libc::F_UNLCK as libc::c_short);
    // SAFETY: as in `try_lock`.
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &mut fl) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// PID of a process holding a lock that would conflict with `record_type`.
///
/// Locks held by the calling process never conflict and are not reported.
pub(super) fn conflicting_pid(file: &File, record_type: libc::c_short) -> io::Result<Option<u32>> {
    let mut fl = whole_file(record_type);
    // SAFETY: as in `try_lock`; F_GETLK writes the result back into `fl`.
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_GETLK, &mut fl) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    if fl.l_type == libc::F_UNLCK as libc::c_short {
        Ok(None)
    } else {
        Ok(Some(fl.l_pid as u32))
    }
}
