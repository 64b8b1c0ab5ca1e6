mod mmap;
mod pread;
mod stream;

pub use mmap::{FdMMapReader, FdMMapReaderOptions};
pub use pread::{FdReader, FdReaderOptions};
pub use stream::{FdStreamReader, FdStreamReaderOptions};

use std::ffi::CString;
use std::io;
use std::os::fd::RawFd;

use tracing::error;

use crate::errors::{Error, Result};

/// A file descriptor that is either owned or borrowed.
///
/// An owned descriptor is closed exactly once, on `close` or on drop,
/// whichever comes first. A borrowed descriptor is left untouched; the
/// borrower must keep it alive for the reader's lifetime.
#[derive(Debug)]
pub struct FdHandle {
    fd: RawFd,
    owned: bool,
}

impl FdHandle {
    pub fn owned(fd: RawFd) -> Self {
        FdHandle { fd, owned: true }
    }

    pub fn borrowed(fd: RawFd) -> Self {
        FdHandle { fd, owned: false }
    }

    /// The descriptor. -1 after an owned handle was closed.
    pub fn raw(&self) -> RawFd {
        self.fd
    }

    pub fn is_owning(&self) -> bool {
        self.owned
    }

    /// Gives up ownership without closing.
    pub fn release(&mut self) -> RawFd {
        self.owned = false;
        self.fd
    }

    /// Closes an owned descriptor, reporting the failure. Borrowed handles
    /// are untouched. Safe to call more than once.
    pub(crate) fn close(&mut self, target: &str) -> Result<()> {
        if !self.owned || self.fd < 0 {
            return Ok(());
        }
        let fd = self.fd;
        self.fd = -1;
        // EINTR on close is not retried: the descriptor state is unspecified
        // and retrying can close an unrelated descriptor.
        if unsafe { libc::close(fd) } < 0 {
            return Err(Error::last_os("close", target));
        }
        Ok(())
    }
}

impl Drop for FdHandle {
    fn drop(&mut self) {
        if self.owned && self.fd >= 0 {
            if unsafe { libc::close(self.fd) } < 0 {
                error!(
                    fd = self.fd,
                    "failed to close file descriptor: {}",
                    io::Error::last_os_error()
                );
            }
            self.fd = -1;
        }
    }
}

/// Diagnostic name for a reader built from a raw descriptor.
pub(crate) fn fd_filename(fd: RawFd) -> String {
    if fd == 0 {
        "/dev/stdin".to_string()
    } else {
        format!("/proc/self/fd/{fd}")
    }
}

pub(crate) fn validate_read_flags(flags: libc::c_int) -> Result<()> {
    let access = flags & libc::O_ACCMODE;
    if access != libc::O_RDONLY && access != libc::O_RDWR {
        return Err(Error::InvalidArgument(
            "open flags must include O_RDONLY or O_RDWR".to_string(),
        ));
    }
    Ok(())
}

/// Positions are u64 everywhere; the kernel takes off_t. Anything past
/// `i64::MAX` cannot reach a descriptor.
pub(crate) fn to_off_t(pos: u64) -> Result<libc::off_t> {
    libc::off_t::try_from(pos).map_err(|_| {
        Error::OutOfRange(format!("position {pos} exceeds the supported file offset range"))
    })
}

pub(crate) fn sys_open(filename: &str, flags: libc::c_int) -> Result<RawFd> {
    let path = CString::new(filename)
        .map_err(|_| Error::InvalidArgument("filename contains a NUL byte".to_string()))?;
    loop {
        let fd = unsafe { libc::open(path.as_ptr(), flags | libc::O_CLOEXEC) };
        if fd >= 0 {
            return Ok(fd);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        return Err(Error::io("open", filename, err));
    }
}

pub(crate) fn sys_read(fd: RawFd, buf: &mut [u8], target: &str) -> Result<usize> {
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        return Err(Error::io("read", target, err));
    }
}

pub(crate) fn sys_pread(fd: RawFd, buf: &mut [u8], offset: u64, target: &str) -> Result<usize> {
    let offset = to_off_t(offset)?;
    loop {
        let n = unsafe {
            libc::pread(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), offset)
        };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        return Err(Error::io("pread", target, err));
    }
}

pub(crate) fn sys_lseek(
    fd: RawFd,
    offset: libc::off_t,
    whence: libc::c_int,
    target: &str,
) -> Result<u64> {
    let position = unsafe { libc::lseek(fd, offset, whence) };
    if position < 0 {
        return Err(Error::last_os("lseek", target));
    }
    Ok(position as u64)
}

pub(crate) fn sys_fstat_size(fd: RawFd, target: &str) -> Result<u64> {
    let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
    if unsafe { libc::fstat(fd, stat.as_mut_ptr()) } < 0 {
        return Err(Error::last_os("fstat", target));
    }
    let stat = unsafe { stat.assume_init() };
    Ok(stat.st_size.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn borrowed_handles_never_close() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"x").unwrap();
        let fd = {
            use std::os::fd::AsRawFd;
            file.as_raw_fd()
        };
        let mut handle = FdHandle::borrowed(fd);
        assert!(!handle.is_owning());
        handle.close("test").unwrap();
        // the descriptor is still usable
        assert!(sys_fstat_size(fd, "test").is_ok());
    }

    #[test]
    fn owned_handles_close_exactly_once() {
        let file = tempfile::tempfile().unwrap();
        let fd = {
            use std::os::fd::IntoRawFd;
            file.into_raw_fd()
        };
        let mut handle = FdHandle::owned(fd);
        assert!(handle.is_owning());
        handle.close("test").unwrap();
        assert_eq!(handle.raw(), -1);
        handle.close("test").unwrap();
    }

    #[test]
    fn release_transfers_ownership() {
        let file = tempfile::tempfile().unwrap();
        let fd = {
            use std::os::fd::IntoRawFd;
            file.into_raw_fd()
        };
        let released = {
            let mut handle = FdHandle::owned(fd);
            handle.release()
        };
        // the drop above must not have closed it
        assert!(sys_fstat_size(released, "test").is_ok());
        unsafe { libc::close(released) };
    }

    #[test]
    fn read_flags_must_request_read_access() {
        assert!(validate_read_flags(libc::O_RDONLY).is_ok());
        assert!(validate_read_flags(libc::O_RDWR).is_ok());
        assert!(validate_read_flags(libc::O_WRONLY).is_err());
    }

    #[test]
    fn fd_placeholder_names() {
        assert_eq!(fd_filename(0), "/dev/stdin");
        assert_eq!(fd_filename(7), "/proc/self/fd/7");
    }
}
