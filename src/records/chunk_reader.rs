use tracing::debug;

use crate::byte_reader::{ByteReader, Health};
use crate::errors::{Error, Result};
use crate::records::{
    block_begin, chunk_end, data_hash, is_possible_chunk_boundary, next_block_boundary,
    next_chunk_begin, remaining_in_block_header, BlockHeader, Chunk, ChunkHeader,
    BLOCK_HEADER_SIZE, CHUNK_HEADER_SIZE, DEFAULT_BLOCK_SIZE, MIN_BLOCK_SIZE,
};

/// Options for [`ChunkReader`].
#[derive(Debug, Clone)]
pub struct ChunkReaderOptions {
    /// Distance between block headers. Must be a power of two no smaller
    /// than [`MIN_BLOCK_SIZE`].
    pub block_size: u64,
}

impl Default for ChunkReaderOptions {
    fn default() -> Self {
        ChunkReaderOptions {
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

/// The byte range recovery discarded: `[begin, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkippedRegion {
    pub begin: u64,
    pub end: u64,
}

impl SkippedRegion {
    pub fn length(&self) -> u64 {
        self.end - self.begin
    }
}

/// How a later `recover` call should proceed after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Recoverable {
    No,
    /// A chunk is assumed to start at the position.
    HaveChunk(u64),
    /// Scan block headers from the position to find the next chunk.
    FindChunk(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WhichChunk {
    Containing,
    Before,
    After,
}

/// Decodes the chunk framing of a record file read through any
/// [`ByteReader`].
///
/// The file is a logical stream of chunks (header plus payload) with a
/// block header interleaved at every block boundary; the interleaved bytes
/// are not part of any chunk. `pos` is always a chunk boundary, and
/// `read_chunk`/`pull_chunk_header` return the chunk beginning there.
///
/// Failures caused by invalid file contents leave a recovery token behind;
/// `recover` skips the damage and resumes at the next chunk the block
/// headers locate. A clean end of file in the middle of a chunk is reported
/// as [`Error::Truncated`] without poisoning the reader, so reading can
/// resume if the file grows.
pub struct ChunkReader<R> {
    byte_reader: R,
    block_size: u64,
    /// Beginning of the current chunk. May trail `byte_reader.pos()` by the
    /// partial progress below, or lead it when recovery skipped past the
    /// end of the source.
    pos: u64,
    header_buf: Vec<u8>,
    header: Option<ChunkHeader>,
    data_buf: Vec<u8>,
    block_buf: Vec<u8>,
    truncated: bool,
    recoverable: Recoverable,
    health: Health,
}

impl<R: ByteReader> ChunkReader<R> {
    /// Reads chunks starting at the byte reader's current position, which
    /// must be a chunk boundary.
    pub fn new(byte_reader: R) -> Self {
        Self::build(byte_reader, DEFAULT_BLOCK_SIZE)
    }

    pub fn with_options(byte_reader: R, options: ChunkReaderOptions) -> Result<Self> {
        let block_size = options.block_size;
        if !block_size.is_power_of_two() || block_size < MIN_BLOCK_SIZE {
            return Err(Error::InvalidArgument(format!(
                "block size {block_size} must be a power of two of at least {MIN_BLOCK_SIZE}"
            )));
        }
        Ok(Self::build(byte_reader, block_size))
    }

    fn build(byte_reader: R, block_size: u64) -> Self {
        let pos = byte_reader.pos();
        ChunkReader {
            byte_reader,
            block_size,
            pos,
            header_buf: Vec::new(),
            header: None,
            data_buf: Vec::new(),
            block_buf: Vec::new(),
            truncated: false,
            recoverable: Recoverable::No,
            health: Health::open(),
        }
    }

    /// The current position, a chunk boundary. Unchanged by `close`.
    pub fn pos(&self) -> u64 {
        self.pos
    }

    pub fn healthy(&self) -> bool {
        self.health.healthy()
    }

    /// Whether a clean end of file was seen in the middle of a chunk. The
    /// source may still grow; `close` fails while this is set.
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Whether `seek`, the seek-to-chunk family, and `size` are supported.
    pub fn supports_random_access(&self) -> bool {
        self.byte_reader.supports_random_access()
    }

    pub fn into_byte_reader(self) -> R {
        self.byte_reader
    }

    /// Ensures the source begins like a record file: a readable first chunk
    /// header, or a clean end of file. Does not consume a chunk.
    pub fn check_file_format(&mut self) -> Result<()> {
        self.pull_chunk_header().map(|_| ())
    }

    /// Reads the next chunk. `Ok(None)` means the source cleanly ends at a
    /// chunk boundary.
    pub fn read_chunk(&mut self) -> Result<Option<Chunk>> {
        self.health.ensure_open()?;
        let header = match self.ensure_chunk_header()? {
            Some(header) => header,
            None => return Ok(None),
        };
        while (self.data_buf.len() as u64) < header.data_size {
            let byte_pos = self.byte_reader.pos();
            if remaining_in_block_header(byte_pos, self.block_size) > 0
                || !self.block_buf.is_empty()
            {
                self.read_block_header()?;
                continue;
            }
            let until_boundary = self.block_size - byte_pos % self.block_size;
            let remaining = header.data_size - self.data_buf.len() as u64;
            let n = remaining.min(until_boundary) as usize;
            let got = match self.byte_reader.read_to_vec(n, &mut self.data_buf) {
                Ok(got) => got,
                Err(error) => return Err(self.fail(error)),
            };
            if got < n {
                return Err(self.truncated_error("a chunk"));
            }
        }
        if data_hash(&self.data_buf) != header.data_hash {
            let end = self.byte_reader.pos();
            return Err(self.fail_recoverable(
                Error::DataLoss(format!("chunk at {} has a bad data hash", self.pos)),
                Recoverable::HaveChunk(end),
            ));
        }
        let data = std::mem::take(&mut self.data_buf);
        self.header = None;
        self.header_buf.clear();
        self.truncated = false;
        self.pos = self.byte_reader.pos();
        Ok(Some(Chunk { header, data }))
    }

    /// Makes the header of the chunk at `pos` available without reading its
    /// payload. The reference is valid until the next call that takes
    /// `&mut self`. `Ok(None)` means the source cleanly ends here.
    pub fn pull_chunk_header(&mut self) -> Result<Option<&ChunkHeader>> {
        self.health.ensure_open()?;
        if self.ensure_chunk_header()?.is_none() {
            return Ok(None);
        }
        self.truncated = false;
        Ok(self.header.as_ref())
    }

    /// Recovers from a failure caused by invalid file contents, or
    /// acknowledges a truncated file after a failed close.
    ///
    /// Returns the skipped byte range, or `Ok(None)` when nothing was
    /// skipped. Fails with `FailedPrecondition` when there is nothing to
    /// recover from.
    pub fn recover(&mut self) -> Result<Option<SkippedRegion>> {
        match self.recoverable {
            Recoverable::No => Err(Error::FailedPrecondition(
                "reader has nothing to recover from".to_string(),
            )),
            Recoverable::HaveChunk(new_pos) => {
                let old_pos = self.pos;
                self.recoverable = Recoverable::No;
                self.truncated = false;
                self.clear_progress();
                if self.health.is_closed() {
                    // the truncated file was acknowledged; the reader stays
                    // closed
                    return Ok(region_between(old_pos, new_pos));
                }
                self.health.reopen();
                self.pos = new_pos;
                if self.byte_reader.supports_random_access() && self.byte_reader.pos() != new_pos
                {
                    self.byte_reader
                        .seek(new_pos)
                        .map_err(|error| self.fail(error))?;
                }
                debug!(from = old_pos, to = new_pos, "recovered at a known chunk boundary");
                Ok(region_between(old_pos, new_pos))
            }
            Recoverable::FindChunk(from) => {
                let old_pos = self.pos;
                self.recoverable = Recoverable::No;
                self.truncated = false;
                self.clear_progress();
                self.health.reopen();
                let start = if self.byte_reader.supports_random_access() {
                    from
                } else {
                    // a stream cannot revisit the failed block header
                    from.max(self.byte_reader.pos())
                };
                let mut scan = next_block_boundary(start, self.block_size);
                loop {
                    if !self.advance_byte_to(scan)? {
                        self.pos = scan;
                        debug!(from = old_pos, to = scan, "recovery ran past the end of the source");
                        return Ok(region_between(old_pos, scan));
                    }
                    let mut bytes = [0u8; BLOCK_HEADER_SIZE as usize];
                    let n = self
                        .byte_reader
                        .read(&mut bytes)
                        .map_err(|error| self.fail(error))?;
                    if n < bytes.len() {
                        // keep the partial header so a resumed read stays
                        // aligned with the block layout
                        self.block_buf.extend_from_slice(&bytes[..n]);
                        self.pos = scan;
                        return Ok(region_between(old_pos, scan));
                    }
                    let header = match BlockHeader::decode(&bytes) {
                        Ok(header) => header,
                        Err(_) => {
                            scan += self.block_size;
                            continue;
                        }
                    };
                    let candidate = match scan.checked_add(header.next_chunk) {
                        Some(candidate)
                            if header.next_chunk >= BLOCK_HEADER_SIZE
                                && candidate % self.block_size >= BLOCK_HEADER_SIZE =>
                        {
                            candidate
                        }
                        _ => {
                            scan += self.block_size;
                            continue;
                        }
                    };
                    if !self.advance_byte_to(candidate)? {
                        self.pos = candidate;
                        debug!(
                            from = old_pos,
                            to = candidate,
                            "resynchronized past the end of the source"
                        );
                        return Ok(region_between(old_pos, candidate));
                    }
                    self.pos = candidate;
                    debug!(from = old_pos, to = candidate, "resynchronized after invalid data");
                    return Ok(region_between(old_pos, candidate));
                }
            }
        }
    }

    /// Seeks to `new_pos`, which the caller asserts is a chunk boundary.
    pub fn seek(&mut self, new_pos: u64) -> Result<()> {
        self.health.ensure_open()?;
        if !self.byte_reader.supports_random_access() {
            return Err(Error::FailedPrecondition(
                "seeking requires a random-access byte reader".to_string(),
            ));
        }
        if !is_possible_chunk_boundary(new_pos, self.block_size) {
            return Err(Error::InvalidArgument(format!(
                "{new_pos} cannot be a chunk boundary"
            )));
        }
        self.byte_reader
            .seek(new_pos)
            .map_err(|error| self.fail(error))?;
        self.clear_progress();
        self.truncated = false;
        self.pos = new_pos;
        Ok(())
    }

    /// Seeks to the chunk containing `new_pos`: when `new_pos` falls within
    /// the chunk's leading `num_records` positions (or exactly on its
    /// start), that chunk; otherwise the nearest chunk at or after
    /// `new_pos`.
    pub fn seek_to_chunk_containing(&mut self, new_pos: u64) -> Result<()> {
        self.seek_to_chunk(WhichChunk::Containing, new_pos)
    }

    /// Seeks to the nearest chunk boundary at or before `new_pos`.
    pub fn seek_to_chunk_before(&mut self, new_pos: u64) -> Result<()> {
        self.seek_to_chunk(WhichChunk::Before, new_pos)
    }

    /// Seeks to the nearest chunk boundary strictly after `new_pos`.
    pub fn seek_to_chunk_after(&mut self, new_pos: u64) -> Result<()> {
        self.seek_to_chunk(WhichChunk::After, new_pos)
    }

    /// Size of the underlying source.
    pub fn size(&mut self) -> Result<u64> {
        self.health.ensure_open()?;
        if !self.byte_reader.supports_random_access() {
            return Err(Error::FailedPrecondition(
                "size requires a random-access byte reader".to_string(),
            ));
        }
        match self.byte_reader.size() {
            Ok(size) => Ok(size),
            Err(error) => Err(self.fail(error)),
        }
    }

    /// Closes the byte reader as well. Fails when the source was truncated;
    /// `recover` then acknowledges the truncation. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if self.health.is_closed() {
            return Ok(());
        }
        // only a known chunk position survives into the closed state
        if matches!(self.recoverable, Recoverable::FindChunk(_)) {
            self.recoverable = Recoverable::No;
        }
        let byte_result = self.byte_reader.close();
        if self.truncated {
            self.recoverable = Recoverable::HaveChunk(self.pos);
            return self.health.close_with(Some(Error::Truncated(format!(
                "file ends inside the chunk at {}",
                self.pos
            ))));
        }
        self.health.close_with(byte_result.err())
    }

    /// True when part of the current chunk has been consumed.
    fn mid_chunk(&self) -> bool {
        !self.header_buf.is_empty() || !self.data_buf.is_empty()
    }

    fn clear_progress(&mut self) {
        self.header_buf.clear();
        self.header = None;
        self.data_buf.clear();
        self.block_buf.clear();
    }

    fn fail(&mut self, error: Error) -> Error {
        self.health.fail(error)
    }

    fn fail_recoverable(&mut self, error: Error, token: Recoverable) -> Error {
        self.recoverable = token;
        self.health.fail(error)
    }

    /// Does not latch: the source may grow and the partial progress kept in
    /// the buffers lets the next call resume.
    fn truncated_error(&mut self, what: &str) -> Error {
        self.truncated = true;
        Error::Truncated(format!("file ends inside {what} at {}", self.pos))
    }

    /// Makes the current chunk's header available. `Ok(None)` means the
    /// source cleanly ends at a chunk boundary.
    fn ensure_chunk_header(&mut self) -> Result<Option<ChunkHeader>> {
        if let Some(header) = self.header {
            return Ok(Some(header));
        }
        loop {
            let byte_pos = self.byte_reader.pos();
            // recovery may have skipped past the end of the source; catch
            // the byte reader up lazily so growth is picked up
            if !self.mid_chunk() && self.block_buf.is_empty() && byte_pos < self.pos {
                let want = self.pos - byte_pos;
                let skipped = match self.byte_reader.skip(want) {
                    Ok(skipped) => skipped,
                    Err(error) => return Err(self.fail(error)),
                };
                if skipped < want {
                    return Ok(None);
                }
                continue;
            }
            if remaining_in_block_header(byte_pos, self.block_size) > 0
                || !self.block_buf.is_empty()
            {
                if !self.mid_chunk() && self.block_buf.is_empty() {
                    // between chunks the file may end exactly here
                    match self.byte_reader.pull(1) {
                        Err(error) => return Err(self.fail(error)),
                        Ok(false) => return Ok(None),
                        Ok(true) => {}
                    }
                }
                self.read_block_header()?;
                continue;
            }
            let filled = self.header_buf.len();
            let until_boundary = self.block_size - byte_pos % self.block_size;
            let n = ((CHUNK_HEADER_SIZE as usize - filled) as u64).min(until_boundary) as usize;
            match self.byte_reader.pull(n) {
                Err(error) => return Err(self.fail(error)),
                Ok(false) => {
                    let available = self.byte_reader.available().len().min(n);
                    if available > 0 {
                        self.header_buf
                            .extend_from_slice(&self.byte_reader.available()[..available]);
                        self.byte_reader.consume(available);
                    }
                    if !self.mid_chunk() {
                        return Ok(None);
                    }
                    return Err(self.truncated_error("a chunk header"));
                }
                Ok(true) => {
                    self.header_buf
                        .extend_from_slice(&self.byte_reader.available()[..n]);
                    self.byte_reader.consume(n);
                }
            }
            if self.header_buf.len() == CHUNK_HEADER_SIZE as usize {
                let mut bytes = [0u8; CHUNK_HEADER_SIZE as usize];
                bytes.copy_from_slice(&self.header_buf);
                let header = match ChunkHeader::decode(&bytes) {
                    Ok(header) => header,
                    Err(error) => {
                        let at = self.byte_reader.pos();
                        return Err(self.fail_recoverable(error, Recoverable::FindChunk(at)));
                    }
                };
                // reject sizes the stream cannot hold before touching the
                // payload
                if let Err(error) = chunk_end(self.pos, &header, self.block_size) {
                    let at = self.byte_reader.pos();
                    return Err(self.fail_recoverable(error, Recoverable::FindChunk(at)));
                }
                self.header = Some(header);
                return Ok(Some(header));
            }
        }
    }

    /// Consumes the block header at the current byte position and validates
    /// it against the current chunk. Between chunks a valid header
    /// announces the next chunk right after itself and `pos` advances past
    /// the header.
    fn read_block_header(&mut self) -> Result<()> {
        let needed = BLOCK_HEADER_SIZE as usize - self.block_buf.len();
        match self.byte_reader.pull(needed) {
            Err(error) => return Err(self.fail(error)),
            Ok(false) => {
                let available = self.byte_reader.available().len().min(needed);
                if available > 0 {
                    self.block_buf
                        .extend_from_slice(&self.byte_reader.available()[..available]);
                    self.byte_reader.consume(available);
                }
                return Err(self.truncated_error("a block header"));
            }
            Ok(true) => {
                self.block_buf
                    .extend_from_slice(&self.byte_reader.available()[..needed]);
                self.byte_reader.consume(needed);
            }
        }
        let block = self.byte_reader.pos() - BLOCK_HEADER_SIZE;
        let mut bytes = [0u8; BLOCK_HEADER_SIZE as usize];
        bytes.copy_from_slice(&self.block_buf);
        self.block_buf.clear();
        let header = match BlockHeader::decode(&bytes) {
            Ok(header) => header,
            Err(error) => {
                return Err(self.fail_recoverable(error, Recoverable::FindChunk(block)))
            }
        };
        if self.mid_chunk() {
            if block.checked_sub(header.previous_chunk) != Some(self.pos) {
                return Err(self.fail_recoverable(
                    Error::DataLoss(format!(
                        "block header at {block} does not point back to the chunk at {}",
                        self.pos
                    )),
                    Recoverable::FindChunk(block),
                ));
            }
        } else {
            if header.next_chunk != BLOCK_HEADER_SIZE {
                return Err(self.fail_recoverable(
                    Error::DataLoss(format!(
                        "block header at {block} does not announce an adjacent chunk"
                    )),
                    Recoverable::FindChunk(block),
                ));
            }
            self.pos = block + BLOCK_HEADER_SIZE;
        }
        Ok(())
    }

    /// Moves the byte reader to `target`, seeking when possible and
    /// skipping forward otherwise. `Ok(false)` means the source ends first.
    fn advance_byte_to(&mut self, target: u64) -> Result<bool> {
        let byte_pos = self.byte_reader.pos();
        if target == byte_pos {
            return Ok(true);
        }
        if self.byte_reader.supports_random_access() {
            let size = match self.byte_reader.size() {
                Ok(size) => size,
                Err(error) => return Err(self.fail(error)),
            };
            if target > size {
                return Ok(false);
            }
            self.byte_reader
                .seek(target)
                .map_err(|error| self.fail(error))?;
            Ok(true)
        } else {
            if target < byte_pos {
                return Err(self.fail(Error::FailedPrecondition(format!(
                    "cannot move back to {target} on a stream"
                ))));
            }
            let want = target - byte_pos;
            let skipped = self
                .byte_reader
                .skip(want)
                .map_err(|error| self.fail(error))?;
            Ok(skipped == want)
        }
    }

    fn read_exact_plain(&mut self, dest: &mut [u8]) -> Result<bool> {
        let n = self
            .byte_reader
            .read(dest)
            .map_err(|error| self.fail(error))?;
        Ok(n == dest.len())
    }

    fn seek_to_chunk(&mut self, which: WhichChunk, target: u64) -> Result<()> {
        self.health.ensure_open()?;
        if !self.byte_reader.supports_random_access() {
            return Err(Error::FailedPrecondition(
                "seeking requires a random-access byte reader".to_string(),
            ));
        }
        self.clear_progress();
        self.truncated = false;
        let block = block_begin(target, self.block_size);
        let header = self.read_block_header_at(block)?;
        let candidate = if header.previous_chunk == 0 {
            block.checked_add(header.next_chunk)
        } else {
            block.checked_sub(header.previous_chunk)
        };
        let mut chunk = match candidate {
            Some(chunk) if chunk % self.block_size >= BLOCK_HEADER_SIZE => chunk,
            _ => {
                return Err(self.fail_recoverable(
                    Error::DataLoss(format!("block header at {block} points at no usable chunk")),
                    Recoverable::FindChunk(block),
                ))
            }
        };
        loop {
            if chunk > target {
                break;
            }
            if chunk == target && matches!(which, WhichChunk::Containing | WhichChunk::Before) {
                break;
            }
            let header = self.read_chunk_header_at(chunk)?;
            if matches!(which, WhichChunk::Containing) && target - chunk < header.num_records {
                break;
            }
            let end = match chunk_end(chunk, &header, self.block_size) {
                Ok(end) => end,
                Err(error) => {
                    let at = self.byte_reader.pos();
                    return Err(self.fail_recoverable(error, Recoverable::FindChunk(at)));
                }
            };
            let next = next_chunk_begin(end, self.block_size);
            if matches!(which, WhichChunk::Before) && next > target {
                break;
            }
            chunk = next;
        }
        self.byte_reader
            .seek(chunk)
            .map_err(|error| self.fail(error))?;
        self.pos = chunk;
        Ok(())
    }

    fn read_block_header_at(&mut self, block: u64) -> Result<BlockHeader> {
        self.byte_reader
            .seek(block)
            .map_err(|error| self.fail(error))?;
        let mut bytes = [0u8; BLOCK_HEADER_SIZE as usize];
        if !self.read_exact_plain(&mut bytes)? {
            return Err(self.fail(Error::OutOfRange(format!(
                "file ends inside the block header at {block}"
            ))));
        }
        BlockHeader::decode(&bytes)
            .map_err(|error| self.fail_recoverable(error, Recoverable::FindChunk(block)))
    }

    /// Reads the chunk header at `chunk_begin` for the seek family, walking
    /// any block headers interleaved into it.
    fn read_chunk_header_at(&mut self, chunk_begin: u64) -> Result<ChunkHeader> {
        self.byte_reader
            .seek(chunk_begin)
            .map_err(|error| self.fail(error))?;
        let mut bytes = [0u8; CHUNK_HEADER_SIZE as usize];
        let mut filled = 0usize;
        while filled < CHUNK_HEADER_SIZE as usize {
            let byte_pos = self.byte_reader.pos();
            if remaining_in_block_header(byte_pos, self.block_size) > 0 {
                let mut block_bytes = [0u8; BLOCK_HEADER_SIZE as usize];
                if !self.read_exact_plain(&mut block_bytes)? {
                    return Err(self.fail(Error::OutOfRange(format!(
                        "file ends inside the block header at {byte_pos}"
                    ))));
                }
                let header = BlockHeader::decode(&block_bytes).map_err(|error| {
                    self.fail_recoverable(error, Recoverable::FindChunk(byte_pos))
                })?;
                if byte_pos.checked_sub(header.previous_chunk) != Some(chunk_begin) {
                    return Err(self.fail_recoverable(
                        Error::DataLoss(format!(
                            "block header at {byte_pos} does not point back to the chunk at {chunk_begin}"
                        )),
                        Recoverable::FindChunk(byte_pos),
                    ));
                }
                continue;
            }
            let until_boundary = self.block_size - byte_pos % self.block_size;
            let n = ((CHUNK_HEADER_SIZE as usize - filled) as u64).min(until_boundary) as usize;
            if !self.read_exact_plain(&mut bytes[filled..filled + n])? {
                return Err(self.fail(Error::OutOfRange(format!(
                    "file ends inside the chunk header at {chunk_begin}"
                ))));
            }
            filled += n;
        }
        ChunkHeader::decode(&bytes).map_err(|error| {
            let at = self.byte_reader.pos();
            self.fail_recoverable(error, Recoverable::FindChunk(at))
        })
    }
}

fn region_between(begin: u64, end: u64) -> Option<SkippedRegion> {
    if end > begin {
        Some(SkippedRegion { begin, end })
    } else {
        None
    }
}
