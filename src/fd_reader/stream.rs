use std::os::fd::RawFd;
use std::path::Path;

use tracing::debug;

use crate::byte_reader::buffered::{BufferedReader, FetchRead, DEFAULT_BUFFER_SIZE};
use crate::byte_reader::{ByteReader, Position};
use crate::errors::{Error, Result};
use crate::fd_reader::{self, FdHandle};

/// Options for [`FdStreamReader`].
#[derive(Debug, Clone)]
pub struct FdStreamReaderOptions {
    /// How much data is buffered after each read from the descriptor.
    pub buffer_size: usize,
    /// The position reported before any byte is consumed. Required when
    /// wrapping an existing descriptor (it cannot be discovered without
    /// seeking); defaults to 0 when opening by filename.
    pub assumed_pos: Option<Position>,
}

impl Default for FdStreamReaderOptions {
    fn default() -> Self {
        FdStreamReaderOptions {
            buffer_size: DEFAULT_BUFFER_SIZE,
            assumed_pos: None,
        }
    }
}

pub(crate) struct StreamFd {
    fd: FdHandle,
    filename: String,
}

impl FetchRead for StreamFd {
    fn fetch(&mut self, dest: &mut [u8], min_length: usize, _pos: u64) -> Result<(usize, bool)> {
        let mut read = 0usize;
        while read < min_length {
            let n = fd_reader::sys_read(self.fd.raw(), &mut dest[read..], &self.filename)?;
            if n == 0 {
                return Ok((read, true));
            }
            read += n;
        }
        Ok((read, false))
    }
}

/// A reader over a file descriptor that need not support seeking, such as a
/// pipe or socket.
///
/// Reads use plain `read`, so the reader must have exclusive use of the
/// descriptor's position. There is no seek and no size. The reported
/// position counts bytes consumed since the assumed starting value.
///
/// Warning: buffering consumes ahead of the logical position. If the
/// descriptor is borrowed, do not resume reading from it directly after
/// dropping the reader.
pub struct FdStreamReader {
    inner: BufferedReader<StreamFd>,
}

impl FdStreamReader {
    /// Opens `filename` for reading. `flags` must include `O_RDONLY` or
    /// `O_RDWR`. A missing `assumed_pos` defaults to 0.
    pub fn open(
        filename: impl AsRef<Path>,
        flags: libc::c_int,
        options: FdStreamReaderOptions,
    ) -> Result<Self> {
        fd_reader::validate_read_flags(flags)?;
        let name = filename.as_ref().to_string_lossy().into_owned();
        let fd = fd_reader::sys_open(&name, flags)?;
        Self::with_source(
            FdHandle::owned(fd),
            name,
            options.buffer_size,
            options.assumed_pos.unwrap_or(0),
        )
    }

    /// Reads from an existing descriptor. `assumed_pos` is required.
    pub fn from_handle(handle: FdHandle, options: FdStreamReaderOptions) -> Result<Self> {
        if handle.raw() < 0 {
            return Err(Error::InvalidArgument(
                "negative file descriptor".to_string(),
            ));
        }
        let assumed_pos = options.assumed_pos.ok_or_else(|| {
            Error::InvalidArgument(
                "assumed position must be specified when wrapping an existing descriptor"
                    .to_string(),
            )
        })?;
        let name = fd_reader::fd_filename(handle.raw());
        Self::with_source(handle, name, options.buffer_size, assumed_pos)
    }

    fn with_source(
        fd: FdHandle,
        filename: String,
        buffer_size: usize,
        assumed_pos: Position,
    ) -> Result<Self> {
        if buffer_size == 0 {
            return Err(Error::InvalidArgument("zero buffer size".to_string()));
        }
        debug!(filename = %filename, pos = assumed_pos, "opened fd stream reader");
        Ok(FdStreamReader {
            inner: BufferedReader::new(StreamFd { fd, filename }, buffer_size, assumed_pos),
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
}

impl Default for FdStreamReader {
    /// An already-closed reader; its close is a no-op.
    fn default() -> Self {
        FdStreamReader {
            inner: BufferedReader::closed(StreamFd {
                fd: FdHandle::borrowed(-1),
                filename: String::new(),
            }),
        }
    }
}

impl ByteReader for FdStreamReader {
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
        self.inner.skip(length)
    }

    fn pos(&self) -> Position {
        self.inner.pos()
    }

    fn healthy(&self) -> bool {
        self.inner.healthy()
    }

    fn close(&mut self) -> Result<()> {
        if self.inner.is_closed() {
            return Ok(());
        }
        let filename = self.inner.source.filename.clone();
        let close_error = self.inner.source.fd.close(&filename).err();
        self.inner.close_with(close_error)
    }
}
