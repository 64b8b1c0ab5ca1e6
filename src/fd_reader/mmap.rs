use std::os::fd::RawFd;
use std::path::Path;

use memmap2::{Mmap, MmapOptions};
use tracing::{debug, error};

use crate::byte_reader::{ByteReader, Position, SliceReader};
use crate::errors::{Error, Result};
use crate::fd_reader::{self, FdHandle};

/// Options for [`FdMMapReader`].
#[derive(Debug, Clone, Default)]
pub struct FdMMapReaderOptions {
    /// When set, reading starts here and the descriptor offset is never
    /// touched, so several readers can share one descriptor. When unset, the
    /// reader adopts the current descriptor offset at construction and
    /// writes its final position back on close.
    pub initial_pos: Option<Position>,
}

/// The mapping, releasable on close. Empty files have no mapping at all.
pub(crate) struct MapBacking(Option<Mmap>);

impl AsRef<[u8]> for MapBacking {
    fn as_ref(&self) -> &[u8] {
        match &self.0 {
            Some(map) => &map[..],
            None => &[],
        }
    }
}

/// A reader that maps the whole file into memory. It supports random access
/// and all reads after construction are views into the mapping.
///
/// The descriptor must support `fstat`, `mmap`, `lseek` (only without an
/// explicit initial position), and `close` when owned.
///
/// The file must not be mutated for as long as any byte view obtained from
/// `available` is alive; the mapping reflects such writes and the borrowed
/// slices would change underneath the caller.
pub struct FdMMapReader {
    slice: SliceReader<MapBacking>,
    fd: FdHandle,
    filename: String,
    sync_pos: bool,
}

impl FdMMapReader {
    /// Opens `filename` for reading. `flags` must include `O_RDONLY` or
    /// `O_RDWR`.
    pub fn open(
        filename: impl AsRef<Path>,
        flags: libc::c_int,
        options: FdMMapReaderOptions,
    ) -> Result<Self> {
        fd_reader::validate_read_flags(flags)?;
        let name = filename.as_ref().to_string_lossy().into_owned();
        let fd = fd_reader::sys_open(&name, flags)?;
        Self::with_source(FdHandle::owned(fd), name, options)
    }

    /// Reads from an existing descriptor, owned or borrowed.
    pub fn from_handle(handle: FdHandle, options: FdMMapReaderOptions) -> Result<Self> {
        if handle.raw() < 0 {
            return Err(Error::InvalidArgument(
                "negative file descriptor".to_string(),
            ));
        }
        let name = fd_reader::fd_filename(handle.raw());
        Self::with_source(handle, name, options)
    }

    fn with_source(fd: FdHandle, filename: String, options: FdMMapReaderOptions) -> Result<Self> {
        let size = fd_reader::sys_fstat_size(fd.raw(), &filename)?;
        let map = if size == 0 {
            None
        } else {
            let len = usize::try_from(size).map_err(|_| {
                Error::OutOfRange(format!("file of {size} bytes does not fit in memory"))
            })?;
            // Safety: mapped read-only; the type's contract forbids mutating
            // the file while borrowed views are alive.
            let map = unsafe { MmapOptions::new().len(len).map(fd.raw()) }
                .map_err(|err| Error::io("mmap", &filename, err))?;
            Some(map)
        };
        let (initial_pos, sync_pos) = match options.initial_pos {
            Some(pos) => (pos, false),
            None => (
                fd_reader::sys_lseek(fd.raw(), 0, libc::SEEK_CUR, &filename)?,
                true,
            ),
        };
        let mut slice = SliceReader::new(MapBacking(map));
        if initial_pos > 0 {
            slice.seek(initial_pos)?;
        }
        debug!(filename = %filename, size, pos = initial_pos, "opened fd mmap reader");
        Ok(FdMMapReader {
            slice,
            fd,
            filename,
            sync_pos,
        })
    }

    /// The name of the file being read, or the descriptor placeholder when
    /// built from a raw descriptor. Unchanged by close.
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// The descriptor being read from; -1 once an owned descriptor was
    /// closed.
    pub fn fd(&self) -> RawFd {
        self.fd.raw()
    }

    fn sync_descriptor_pos(&mut self) -> Result<()> {
        let pos = fd_reader::to_off_t(self.slice.pos())?;
        fd_reader::sys_lseek(self.fd.raw(), pos, libc::SEEK_SET, &self.filename)?;
        Ok(())
    }
}

impl Default for FdMMapReader {
    /// An already-closed reader; its close is a no-op.
    fn default() -> Self {
        FdMMapReader {
            slice: SliceReader::closed(MapBacking(None)),
            fd: FdHandle::borrowed(-1),
            filename: String::new(),
            sync_pos: false,
        }
    }
}

impl ByteReader for FdMMapReader {
    fn pull(&mut self, min_length: usize) -> Result<bool> {
        self.slice.pull(min_length)
    }

    fn available(&self) -> &[u8] {
        self.slice.available()
    }

    fn consume(&mut self, amount: usize) {
        self.slice.consume(amount)
    }

    fn read(&mut self, dest: &mut [u8]) -> Result<usize> {
        self.slice.read(dest)
    }

    fn read_to_vec(&mut self, length: usize, dest: &mut Vec<u8>) -> Result<usize> {
        self.slice.read_to_vec(length, dest)
    }

    fn skip(&mut self, length: u64) -> Result<u64> {
        self.slice.skip(length)
    }

    fn pos(&self) -> Position {
        self.slice.pos()
    }

    fn supports_random_access(&self) -> bool {
        true
    }

    fn seek(&mut self, new_pos: Position) -> Result<()> {
        self.slice.seek(new_pos)
    }

    fn size(&mut self) -> Result<Position> {
        self.slice.size()
    }

    fn healthy(&self) -> bool {
        self.slice.healthy()
    }

    fn close(&mut self) -> Result<()> {
        if self.slice.is_closed() {
            return Ok(());
        }
        let mut first_error = None;
        if self.sync_pos && self.slice.is_open() {
            if let Err(error) = self.sync_descriptor_pos() {
                first_error = Some(error);
            }
        }
        // an earlier failure wins over close-time problems
        if let Err(error) = self.slice.close() {
            first_error = Some(error);
        }
        self.slice.backing_mut().0.take();
        if let Err(error) = self.fd.close(&self.filename) {
            first_error.get_or_insert(error);
        }
        match first_error {
            None => Ok(()),
            Some(error) => Err(error),
        }
    }
}

impl Drop for FdMMapReader {
    fn drop(&mut self) {
        if self.sync_pos && self.slice.is_open() {
            if let Err(error) = self.sync_descriptor_pos() {
                error!(
                    filename = %self.filename,
                    "failed to restore descriptor position: {error}"
                );
            }
        }
    }
}
