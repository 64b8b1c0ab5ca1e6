use std::os::fd::RawFd;
use std::path::Path;

use tracing::{debug, error};

use crate::byte_reader::buffered::{BufferedReader, FetchRead, DEFAULT_BUFFER_SIZE};
use crate::byte_reader::{ByteReader, Position};
use crate::errors::{Error, Result};
use crate::fd_reader::{self, FdHandle};

/// Options for [`FdReader`].
#[derive(Debug, Clone)]
pub struct FdReaderOptions {
    /// How much data is buffered after each read from the descriptor.
    pub buffer_size: usize,
    /// When set, all reads are positional and the descriptor offset is never
    /// touched, so several readers can share one descriptor. When unset, the
    /// reader adopts the current descriptor offset at construction and
    /// writes its final position back on close.
    pub initial_pos: Option<Position>,
}

impl Default for FdReaderOptions {
    fn default() -> Self {
        FdReaderOptions {
            buffer_size: DEFAULT_BUFFER_SIZE,
            initial_pos: None,
        }
    }
}

pub(crate) struct PreadFd {
    fd: FdHandle,
    filename: String,
}

impl FetchRead for PreadFd {
    fn fetch(&mut self, dest: &mut [u8], min_length: usize, pos: u64) -> Result<(usize, bool)> {
        let mut read = 0usize;
        while read < min_length {
            let n = fd_reader::sys_pread(
                self.fd.raw(),
                &mut dest[read..],
                pos + read as u64,
                &self.filename,
            )?;
            if n == 0 {
                return Ok((read, true));
            }
            read += n;
        }
        Ok((read, false))
    }
}

/// A reader over a file descriptor, with random access.
///
/// Reads use `pread`, so interleaved readers with explicit initial positions
/// never disturb each other. The descriptor must support `pread`, `fstat`,
/// `lseek` (only without an explicit initial position), and `close` when
/// owned.
pub struct FdReader {
    inner: BufferedReader<PreadFd>,
    sync_pos: bool,
}

impl FdReader {
    /// Opens `filename` for reading. `flags` must include `O_RDONLY` or
    /// `O_RDWR`.
    pub fn open(
        filename: impl AsRef<Path>,
        flags: libc::c_int,
        options: FdReaderOptions,
    ) -> Result<Self> {
        fd_reader::validate_read_flags(flags)?;
        let name = filename.as_ref().to_string_lossy().into_owned();
        let fd = fd_reader::sys_open(&name, flags)?;
        Self::with_source(FdHandle::owned(fd), name, options)
    }

    /// Reads from an existing descriptor, owned or borrowed.
    pub fn from_handle(handle: FdHandle, options: FdReaderOptions) -> Result<Self> {
        if handle.raw() < 0 {
            return Err(Error::InvalidArgument(
                "negative file descriptor".to_string(),
            ));
        }
        let name = fd_reader::fd_filename(handle.raw());
        Self::with_source(handle, name, options)
    }

    fn with_source(fd: FdHandle, filename: String, options: FdReaderOptions) -> Result<Self> {
        if options.buffer_size == 0 {
            return Err(Error::InvalidArgument("zero buffer size".to_string()));
        }
        let (initial_pos, sync_pos) = match options.initial_pos {
            Some(pos) => (pos, false),
            None => (
                fd_reader::sys_lseek(fd.raw(), 0, libc::SEEK_CUR, &filename)?,
                true,
            ),
        };
        debug!(filename = %filename, pos = initial_pos, "opened fd reader");
        Ok(FdReader {
            inner: BufferedReader::new(PreadFd { fd, filename }, options.buffer_size, initial_pos),
            sync_pos,
        })
    }

    /// The name of the file being read, or the descriptor placeholder when
    /// built from a raw descriptor. Unchanged by close.
    pub fn filename(&self) -> &str {
        &self.inner.source.filename
    }

    /// The descriptor being read from; -1 once an owned descriptor was
    /// closed.
    pub fn fd(&self) -> RawFd {
        self.inner.source.fd.raw()
    }

    fn sync_descriptor_pos(&mut self) -> Result<()> {
        let pos = fd_reader::to_off_t(self.inner.pos())?;
        fd_reader::sys_lseek(self.fd(), pos, libc::SEEK_SET, &self.inner.source.filename)?;
        Ok(())
    }
}

impl Default for FdReader {
    /// An already-closed reader; its close is a no-op.
    fn default() -> Self {
        FdReader {
            inner: BufferedReader::closed(PreadFd {
                fd: FdHandle::borrowed(-1),
                filename: String::new(),
            }),
            sync_pos: false,
        }
    }
}

impl ByteReader for FdReader {
    fn pull(&mut self, min_length: usize) -> Result<bool> {
        self.inner.pull(min_length)
    }

    fn available(&self) -> &[u8] {
        self.inner.available()
    }

    fn consume(&mut self, amount: usize) {
        self.inner.consume(amount)
    }

    fn read(&mut self, dest: &mut [u8]) -> Result<usize> {
        self.inner.read(dest)
    }

    fn read_to_vec(&mut self, length: usize, dest: &mut Vec<u8>) -> Result<usize> {
        self.inner.read_to_vec(length, dest)
    }

    fn skip(&mut self, length: u64) -> Result<u64> {
        if length == 0 {
            return Ok(0);
        }
        self.inner.ensure_open()?;
        let size = sys_size(&mut self.inner)?;
        let pos = self.inner.pos();
        if size <= pos {
            return Ok(0);
        }
        let target = pos.saturating_add(length).min(size);
        self.inner.set_pos(target);
        Ok(target - pos)
    }

    fn pos(&self) -> Position {
        self.inner.pos()
    }

    fn supports_random_access(&self) -> bool {
        true
    }

    fn seek(&mut self, new_pos: Position) -> Result<()> {
        self.inner.ensure_open()?;
        // the buffer may already hold the target
        if self.inner.holds_pos(new_pos) {
            self.inner.set_pos(new_pos);
            return Ok(());
        }
        let size = sys_size(&mut self.inner)?;
        if new_pos > size {
            return Err(self.inner.fail(Error::OutOfRange(format!(
                "seek to {new_pos} beyond end of file ({size} bytes)"
            ))));
        }
        self.inner.set_pos(new_pos);
        Ok(())
    }

    fn size(&mut self) -> Result<Position> {
        self.inner.ensure_open()?;
        sys_size(&mut self.inner)
    }

    fn healthy(&self) -> bool {
        self.inner.healthy()
    }

    fn close(&mut self) -> Result<()> {
        if self.inner.is_closed() {
            return Ok(());
        }
        let mut first_error = None;
        if self.sync_pos && self.inner.is_open() {
            if let Err(error) = self.sync_descriptor_pos() {
                first_error = Some(error);
            }
        }
        let filename = self.inner.source.filename.clone();
        if let Err(error) = self.inner.source.fd.close(&filename) {
            first_error.get_or_insert(error);
        }
        self.inner.close_with(first_error)
    }
}

impl Drop for FdReader {
    fn drop(&mut self) {
        if self.sync_pos && self.inner.is_open() {
            if let Err(error) = self.sync_descriptor_pos() {
                error!(
                    filename = %self.inner.source.filename,
                    "failed to restore descriptor position: {error}"
                );
            }
        }
    }
}

fn sys_size(inner: &mut BufferedReader<PreadFd>) -> Result<u64> {
    match fd_reader::sys_fstat_size(inner.source.fd.raw(), &inner.source.filename) {
        Ok(size) => Ok(size),
        Err(error) => Err(inner.fail(error)),
    }
}
