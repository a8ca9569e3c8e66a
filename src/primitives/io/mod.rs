//! Positioned file I/O.
//!
//! All store writes go through these helpers; reads normally go through the
//! memory mapping and only fall back to the file for journal processing and
//! transaction bookkeeping.

use std::fs::File;
use std::io::{self, ErrorKind};

use crate::error::Result;

#[cfg(unix)]
pub fn read_exact_at(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    while !dst.is_empty() {
        let read = file.read_at(dst, off)?;
        if read == 0 {
            return Err(io::Error::new(
                ErrorKind::UnexpectedEof,
                "read_at reached EOF",
            ));
        }
        let (_, tail) = dst.split_at_mut(read);
        dst = tail;
        off += read as u64;
    }
    Ok(())
}

#[cfg(unix)]
pub fn write_all_at(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    while !src.is_empty() {
        let written = file.write_at(src, off)?;
        if written == 0 {
            return Err(io::Error::new(
                ErrorKind::WriteZero,
                "write_at wrote zero bytes",
            ));
        }
        src = &src[written..];
        off += written as u64;
    }
    Ok(())
}

#[cfg(windows)]
pub fn read_exact_at(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !dst.is_empty() {
        let read = file.seek_read(dst, off)?;
        if read == 0 {
            return Err(io::Error::new(
                ErrorKind::UnexpectedEof,
                "seek_read reached EOF",
            ));
        }
        let (_, tail) = dst.split_at_mut(read);
        dst = tail;
        off += read as u64;
    }
    Ok(())
}

#[cfg(windows)]
pub fn write_all_at(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !src.is_empty() {
        let written = file.seek_write(src, off)?;
        if written == 0 {
            return Err(io::Error::new(
                ErrorKind::WriteZero,
                "seek_write wrote zero bytes",
            ));
        }
        src = &src[written..];
        off += written as u64;
    }
    Ok(())
}

/// Releases the backing storage of a freed region where the platform allows
/// it (sparse files). The logical file contents are unchanged; this is purely
/// a space optimization, so failures are ignored.
pub fn deallocate(file: &File, off: u64, len: u64) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        let res = unsafe {
            libc::fallocate(
                file.as_raw_fd(),
                libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                off as libc::off_t,
                len as libc::off_t,
            )
        };
        let _ = res;
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (file, off, len);
    }
    Ok(())
}
