//! Advisory byte-range file locks.
//!
//! The store coordinates multiple reader processes and a single writer with
//! locks on a small region of the store file: one byte per snapshot for
//! readers (shared) plus one writer byte between them. Locks are advisory;
//! every opener of the same file must go through this module.

use std::fs::File;
use std::io;

use crate::error::{Result, StoreError};

/// Acquires a lock on `[start, start + len)`.
///
/// Returns `Ok(false)` only in non-blocking mode when the range is held by
/// another process.
pub fn lock_region(
    file: &File,
    start: u64,
    len: u64,
    exclusive: bool,
    blocking: bool,
) -> Result<bool> {
    imp::lock_region(file, start, len, exclusive, blocking).map_err(StoreError::from)
}

pub fn unlock_region(file: &File, start: u64, len: u64) -> Result<()> {
    imp::unlock_region(file, start, len).map_err(StoreError::from)
}

#[cfg(unix)]
mod imp {
    use super::*;
    use std::os::unix::io::AsRawFd;

    pub fn lock_region(
        file: &File,
        start: u64,
        len: u64,
        exclusive: bool,
        blocking: bool,
    ) -> io::Result<bool> {
        let fd = file.as_raw_fd();
        let mut flock = libc::flock {
            l_type: if exclusive {
                libc::F_WRLCK as _
            } else {
                libc::F_RDLCK as _
            },
            l_whence: libc::SEEK_SET as _,
            l_start: start as libc::off_t,
            l_len: len as libc::off_t,
            l_pid: 0,
        };
        let cmd = if blocking {
            libc::F_SETLKW
        } else {
            libc::F_SETLK
        };
        loop {
            let res = unsafe { libc::fcntl(fd, cmd, &mut flock) };
            if res == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) if blocking => continue,
                Some(libc::EAGAIN) | Some(libc::EACCES) if !blocking => return Ok(false),
                _ => return Err(err),
            }
        }
    }

    pub fn unlock_region(file: &File, start: u64, len: u64) -> io::Result<()> {
        let fd = file.as_raw_fd();
        let mut flock = libc::flock {
            l_type: libc::F_UNLCK as _,
            l_whence: libc::SEEK_SET as _,
            l_start: start as libc::off_t,
            l_len: len as libc::off_t,
            l_pid: 0,
        };
        let res = unsafe { libc::fcntl(fd, libc::F_SETLK, &mut flock) };
        if res == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

#[cfg(windows)]
mod imp {
    use super::*;
    use std::mem::zeroed;
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::ERROR_LOCK_VIOLATION;
    use windows_sys::Win32::Storage::FileSystem::{
        LockFileEx, UnlockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
    };
    use windows_sys::Win32::System::IO::OVERLAPPED;

    pub fn lock_region(
        file: &File,
        start: u64,
        len: u64,
        exclusive: bool,
        blocking: bool,
    ) -> io::Result<bool> {
        unsafe {
            let handle = file.as_raw_handle();
            let mut overlapped: OVERLAPPED = zeroed();
            overlapped.Anonymous.Anonymous.Offset = start as u32;
            overlapped.Anonymous.Anonymous.OffsetHigh = (start >> 32) as u32;
            let mut flags = 0;
            if exclusive {
                flags |= LOCKFILE_EXCLUSIVE_LOCK;
            }
            if !blocking {
                flags |= LOCKFILE_FAIL_IMMEDIATELY;
            }
            let low = len as u32;
            let high = (len >> 32) as u32;
            let res = LockFileEx(handle as isize, flags, 0, low, high, &mut overlapped);
            if res != 0 {
                Ok(true)
            } else {
                let err = io::Error::last_os_error();
                if !blocking && matches!(err.raw_os_error(), Some(code) if code as u32 == ERROR_LOCK_VIOLATION)
                {
                    Ok(false)
                } else {
                    Err(err)
                }
            }
        }
    }

    pub fn unlock_region(file: &File, start: u64, len: u64) -> io::Result<()> {
        unsafe {
            let handle = file.as_raw_handle();
            let mut overlapped: OVERLAPPED = zeroed();
            overlapped.Anonymous.Anonymous.Offset = start as u32;
            overlapped.Anonymous.Anonymous.OffsetHigh = (start >> 32) as u32;
            let low = len as u32;
            let high = (len >> 32) as u32;
            let res = UnlockFileEx(handle as isize, 0, low, high, &mut overlapped);
            if res != 0 {
                Ok(())
            } else {
                Err(io::Error::last_os_error())
            }
        }
    }
}
