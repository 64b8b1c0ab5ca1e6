use crate::byte_reader::Health;
use crate::errors::{Error, Result};

/// Buffered bytes kept after each fetch from the source.
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// The one primitive a buffered source implements. Only this talks to the
/// underlying descriptor.
pub(crate) trait FetchRead {
    /// Reads at least `min_length` bytes into `dest` (up to `dest.len()`),
    /// looping over partial reads. Positional sources read at absolute
    /// offset `pos`; sequential sources ignore it. Returns the byte count
    /// and whether the source ended before `min_length` was reached.
    fn fetch(&mut self, dest: &mut [u8], min_length: usize, pos: u64) -> Result<(usize, bool)>;
}

/// Buffer management shared by the descriptor-backed readers.
///
/// Keeps a window `[start, end)` of buffered bytes; `limit_pos` is the
/// source offset of `buf[end]`, so the logical position is
/// `limit_pos - (end - start)`. Requests of at least the buffer capacity
/// bypass the buffer and fetch straight into the caller's memory.
pub(crate) struct BufferedReader<S> {
    pub(crate) source: S,
    buf: Vec<u8>,
    buffer_size: usize,
    start: usize,
    end: usize,
    limit_pos: u64,
    health: Health,
}

impl<S: FetchRead> BufferedReader<S> {
    pub(crate) fn new(source: S, buffer_size: usize, initial_pos: u64) -> Self {
        BufferedReader {
            source,
            buf: vec![0; buffer_size],
            buffer_size,
            start: 0,
            end: 0,
            limit_pos: initial_pos,
            health: Health::open(),
        }
    }

    /// A reader that is already closed; used by `Default` constructors.
    pub(crate) fn closed(source: S) -> Self {
        BufferedReader {
            source,
            buf: Vec::new(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            start: 0,
            end: 0,
            limit_pos: 0,
            health: Health::closed(),
        }
    }

    pub(crate) fn pos(&self) -> u64 {
        self.limit_pos - (self.end - self.start) as u64
    }

    pub(crate) fn available(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    pub(crate) fn consume(&mut self, amount: usize) {
        debug_assert!(amount <= self.end - self.start);
        self.start += amount;
    }

    pub(crate) fn pull(&mut self, min_length: usize) -> Result<bool> {
        self.health.ensure_open()?;
        let have = self.end - self.start;
        if have >= min_length {
            return Ok(true);
        }
        // compact the window so the refill has the whole buffer to work with
        if self.start > 0 {
            self.buf.copy_within(self.start..self.end, 0);
            self.start = 0;
            self.end = have;
        }
        if self.buf.len() < min_length {
            self.buf.resize(min_length, 0);
        }
        let min_more = min_length - have;
        let limit_pos = self.limit_pos;
        match self.source.fetch(&mut self.buf[self.end..], min_more, limit_pos) {
            Ok((n, _eof)) => {
                self.end += n;
                self.limit_pos += n as u64;
                Ok(self.end - self.start >= min_length)
            }
            Err(error) => {
                self.invalidate_window();
                Err(self.health.fail(error))
            }
        }
    }

    pub(crate) fn read(&mut self, dest: &mut [u8]) -> Result<usize> {
        if dest.is_empty() {
            return Ok(0);
        }
        self.health.ensure_open()?;
        let mut copied = 0usize;
        while copied < dest.len() {
            let have = self.end - self.start;
            if have > 0 {
                let n = have.min(dest.len() - copied);
                dest[copied..copied + n].copy_from_slice(&self.buf[self.start..self.start + n]);
                self.start += n;
                copied += n;
                continue;
            }
            let remaining = dest.len() - copied;
            if remaining >= self.buffer_size {
                // the buffer would only add a copy; fetch straight into dest
                let limit_pos = self.limit_pos;
                let (n, eof) = match self.source.fetch(&mut dest[copied..], remaining, limit_pos)
                {
                    Ok(result) => result,
                    Err(error) => {
                        self.invalidate_window();
                        return Err(self.health.fail(error));
                    }
                };
                self.limit_pos += n as u64;
                copied += n;
                if eof {
                    break;
                }
            } else if !self.pull(remaining)? {
                // end of source: hand over whatever the window still holds
                let have = self.end - self.start;
                let n = have.min(dest.len() - copied);
                dest[copied..copied + n].copy_from_slice(&self.buf[self.start..self.start + n]);
                self.start += n;
                copied += n;
                break;
            }
        }
        Ok(copied)
    }

    pub(crate) fn read_to_vec(&mut self, length: usize, dest: &mut Vec<u8>) -> Result<usize> {
        let old_len = dest.len();
        dest.resize(old_len + length, 0);
        match self.read(&mut dest[old_len..]) {
            Ok(n) => {
                dest.truncate(old_len + n);
                Ok(n)
            }
            Err(error) => {
                dest.truncate(old_len);
                Err(error)
            }
        }
    }

    /// Skip by reading and discarding. Positional readers replace this with
    /// a seek.
    pub(crate) fn skip(&mut self, length: u64) -> Result<u64> {
        if length == 0 {
            return Ok(0);
        }
        self.health.ensure_open()?;
        let mut skipped = 0u64;
        while skipped < length {
            let have = (self.end - self.start) as u64;
            if have > 0 {
                let n = have.min(length - skipped);
                self.start += n as usize;
                skipped += n;
                continue;
            }
            let want = (length - skipped).min(self.buffer_size as u64) as usize;
            if !self.pull(want)? {
                let have = (self.end - self.start) as u64;
                let n = have.min(length - skipped);
                self.start += n as usize;
                skipped += n;
                break;
            }
        }
        Ok(skipped)
    }

    /// Whether `pos` lies within the bytes the buffer still holds
    /// (including already-consumed ones).
    pub(crate) fn holds_pos(&self, pos: u64) -> bool {
        pos >= self.limit_pos.saturating_sub(self.end as u64) && pos <= self.limit_pos
    }

    /// Repositions without I/O, reusing the buffer when `new_pos` falls
    /// inside the bytes it still holds (including already-consumed ones).
    pub(crate) fn set_pos(&mut self, new_pos: u64) {
        if self.holds_pos(new_pos) {
            self.start = self.end - (self.limit_pos - new_pos) as usize;
        } else {
            self.start = 0;
            self.end = 0;
            self.limit_pos = new_pos;
        }
    }

    fn invalidate_window(&mut self) {
        let pos = self.pos();
        self.start = 0;
        self.end = 0;
        self.limit_pos = pos;
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        self.health.ensure_open()
    }

    pub(crate) fn healthy(&self) -> bool {
        self.health.healthy()
    }

    pub(crate) fn is_open(&self) -> bool {
        self.health.is_open()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.health.is_closed()
    }

    pub(crate) fn fail(&mut self, error: Error) -> Error {
        self.health.fail(error)
    }

    pub(crate) fn close_with(&mut self, error: Option<Error>) -> Result<()> {
        self.health.close_with(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Positional in-memory source counting fetches, for checking the
    /// direct-read policy.
    struct VecSource {
        data: Vec<u8>,
        fetches: usize,
    }

    impl FetchRead for VecSource {
        fn fetch(&mut self, dest: &mut [u8], min_length: usize, pos: u64) -> Result<(usize, bool)> {
            self.fetches += 1;
            let pos = pos as usize;
            if pos >= self.data.len() {
                return Ok((0, true));
            }
            let n = dest.len().min(self.data.len() - pos);
            dest[..n].copy_from_slice(&self.data[pos..pos + n]);
            Ok((n, n < min_length))
        }
    }

    struct FailingSource;

    impl FetchRead for FailingSource {
        fn fetch(&mut self, _dest: &mut [u8], _min: usize, _pos: u64) -> Result<(usize, bool)> {
            Err(Error::Io {
                op: "pread",
                target: "test".to_string(),
                message: "boom".to_string(),
            })
        }
    }

    fn reader_over(data: Vec<u8>, buffer_size: usize) -> BufferedReader<VecSource> {
        BufferedReader::new(VecSource { data, fetches: 0 }, buffer_size, 0)
    }

    #[test]
    fn pull_and_consume_track_position() {
        let mut reader = reader_over((0..100u8).collect(), 16);
        assert!(reader.pull(4).unwrap());
        assert_eq!(&reader.available()[..4], &[0, 1, 2, 3]);
        reader.consume(4);
        assert_eq!(reader.pos(), 4);
        assert!(reader.pull(10).unwrap());
        assert_eq!(reader.available()[0], 4);
    }

    #[test]
    fn read_matches_source_bytes() {
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let mut reader = reader_over(data.clone(), 64);
        let mut out = vec![0u8; 1000];
        let mut filled = 0;
        for len in [1usize, 7, 64, 300, 628] {
            let n = reader.read(&mut out[filled..filled + len]).unwrap();
            assert_eq!(n, len);
            filled += len;
            assert_eq!(reader.pos(), filled as u64);
        }
        assert_eq!(out, data);
    }

    #[test]
    fn short_read_at_end_of_source() {
        let mut reader = reader_over(vec![1, 2, 3], 16);
        let mut dest = [0u8; 8];
        assert_eq!(reader.read(&mut dest).unwrap(), 3);
        assert_eq!(&dest[..3], &[1, 2, 3]);
        assert_eq!(reader.read(&mut dest).unwrap(), 0);
        assert!(reader.healthy());
    }

    #[test]
    fn zero_length_read_never_moves() {
        let mut reader = reader_over(vec![9; 10], 4);
        assert_eq!(reader.read(&mut []).unwrap(), 0);
        assert_eq!(reader.pos(), 0);
    }

    #[test]
    fn large_reads_bypass_the_buffer() {
        let data: Vec<u8> = (0..200u8).collect();
        let mut reader = reader_over(data.clone(), 8);
        let mut dest = vec![0u8; 200];
        assert_eq!(reader.read(&mut dest).unwrap(), 200);
        assert_eq!(dest, data);
        // one direct fetch, no per-buffer round trips
        assert_eq!(reader.source.fetches, 1);
    }

    #[test]
    fn pull_grows_past_the_configured_capacity() {
        let mut reader = reader_over((0..100u8).collect(), 8);
        assert!(reader.pull(50).unwrap());
        assert_eq!(reader.available().len(), 50);
    }

    #[test]
    fn skip_discards_without_copying_out() {
        let mut reader = reader_over((0..100u8).collect(), 16);
        assert_eq!(reader.skip(37).unwrap(), 37);
        assert_eq!(reader.pos(), 37);
        let mut byte = [0u8; 1];
        reader.read(&mut byte).unwrap();
        assert_eq!(byte[0], 37);
        // short skip at end of source
        assert_eq!(reader.skip(1000).unwrap(), 62);
        assert_eq!(reader.pos(), 100);
    }

    #[test]
    fn set_pos_reuses_the_window() {
        let mut reader = reader_over((0..100u8).collect(), 32);
        assert!(reader.pull(32).unwrap());
        reader.consume(10);
        reader.set_pos(2);
        assert_eq!(reader.pos(), 2);
        assert_eq!(reader.available()[0], 2);
        // outside the window: drop it
        reader.set_pos(90);
        assert_eq!(reader.pos(), 90);
        assert!(reader.available().is_empty());
    }

    #[test]
    fn failure_latches_and_freezes_the_position() {
        let mut reader = BufferedReader::new(FailingSource, 8, 5);
        let err = reader.pull(1).unwrap_err();
        assert!(matches!(err, Error::Io { op: "pread", .. }));
        assert!(!reader.healthy());
        assert_eq!(reader.pos(), 5);
        // the stored status comes back on every later call
        let again = reader.pull(1).unwrap_err();
        assert_eq!(again, err);
    }

    #[test]
    fn close_is_idempotent_and_keeps_the_position() {
        let mut reader = reader_over(vec![0; 10], 4);
        reader.skip(6).unwrap();
        assert!(reader.close_with(None).is_ok());
        assert_eq!(reader.pos(), 6);
        assert!(reader.close_with(None).is_ok());
        assert!(matches!(reader.pull(1), Err(Error::Closed)));
    }
}
