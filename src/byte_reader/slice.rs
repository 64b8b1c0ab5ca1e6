use crate::byte_reader::{ByteReader, Health, Position};
use crate::errors::{Error, Result};

/// A reader over an in-memory byte region.
///
/// The whole unread remainder is the window, so `available` hands out
/// zero-copy views into the backing store; their lifetime is tied to the
/// reader. Backs [`crate::FdMMapReader`] and is handy in tests.
pub struct SliceReader<B> {
    data: B,
    cursor: usize,
    health: Health,
}

impl<B: AsRef<[u8]>> SliceReader<B> {
    pub fn new(data: B) -> Self {
        SliceReader {
            data,
            cursor: 0,
            health: Health::open(),
        }
    }

    pub(crate) fn closed(data: B) -> Self {
        SliceReader {
            data,
            cursor: 0,
            health: Health::closed(),
        }
    }

    pub(crate) fn backing_mut(&mut self) -> &mut B {
        &mut self.data
    }

    pub(crate) fn is_open(&self) -> bool {
        self.health.is_open()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.health.is_closed()
    }

    fn rest(&self) -> &[u8] {
        let data = self.data.as_ref();
        &data[self.cursor.min(data.len())..]
    }
}

impl<B: AsRef<[u8]>> ByteReader for SliceReader<B> {
    fn pull(&mut self, min_length: usize) -> Result<bool> {
        self.health.ensure_open()?;
        Ok(self.rest().len() >= min_length)
    }

    fn available(&self) -> &[u8] {
        if self.health.is_open() {
            self.rest()
        } else {
            &[]
        }
    }

    fn consume(&mut self, amount: usize) {
        debug_assert!(amount <= self.rest().len());
        self.cursor += amount;
    }

    fn read(&mut self, dest: &mut [u8]) -> Result<usize> {
        if dest.is_empty() {
            return Ok(0);
        }
        self.health.ensure_open()?;
        let rest = self.rest();
        let n = rest.len().min(dest.len());
        dest[..n].copy_from_slice(&rest[..n]);
        self.cursor += n;
        Ok(n)
    }

    fn read_to_vec(&mut self, length: usize, dest: &mut Vec<u8>) -> Result<usize> {
        self.health.ensure_open()?;
        let rest = self.rest();
        let n = rest.len().min(length);
        dest.extend_from_slice(&rest[..n]);
        self.cursor += n;
        Ok(n)
    }

    fn skip(&mut self, length: u64) -> Result<u64> {
        if length == 0 {
            return Ok(0);
        }
        self.health.ensure_open()?;
        let n = (self.rest().len() as u64).min(length);
        self.cursor += n as usize;
        Ok(n)
    }

    fn pos(&self) -> Position {
        self.cursor as u64
    }

    fn supports_random_access(&self) -> bool {
        true
    }

    fn seek(&mut self, new_pos: Position) -> Result<()> {
        self.health.ensure_open()?;
        let len = self.data.as_ref().len() as u64;
        if new_pos > len {
            return Err(self.health.fail(Error::OutOfRange(format!(
                "seek to {new_pos} beyond end of source ({len} bytes)"
            ))));
        }
        self.cursor = new_pos as usize;
        Ok(())
    }

    fn size(&mut self) -> Result<Position> {
        self.health.ensure_open()?;
        Ok(self.data.as_ref().len() as u64)
    }

    fn healthy(&self) -> bool {
        self.health.healthy()
    }

    fn close(&mut self) -> Result<()> {
        self.health.close_with(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_and_views_walk_the_slice() {
        let mut reader = SliceReader::new(vec![10u8, 20, 30, 40, 50]);
        assert!(reader.pull(5).unwrap());
        assert!(!reader.pull(6).unwrap());
        assert_eq!(reader.available(), &[10, 20, 30, 40, 50]);
        reader.consume(2);
        let mut dest = [0u8; 2];
        assert_eq!(reader.read(&mut dest).unwrap(), 2);
        assert_eq!(dest, [30, 40]);
        assert_eq!(reader.pos(), 4);
        assert_eq!(reader.skip(10).unwrap(), 1);
        assert_eq!(reader.pos(), 5);
    }

    #[test]
    fn seek_within_and_to_end() {
        let mut reader = SliceReader::new(vec![0u8; 8]);
        assert!(reader.supports_random_access());
        assert_eq!(reader.size().unwrap(), 8);
        reader.seek(8).unwrap();
        assert!(!reader.pull(1).unwrap());
        assert!(reader.healthy());
        let err = reader.seek(9).unwrap_err();
        assert!(matches!(err, Error::OutOfRange(_)));
        assert!(!reader.healthy());
    }

    #[test]
    fn empty_backing_reports_end_immediately() {
        let mut reader = SliceReader::new(Vec::new());
        assert_eq!(reader.size().unwrap(), 0);
        assert!(!reader.pull(1).unwrap());
        assert!(reader.healthy());
        reader.close().unwrap();
        reader.close().unwrap();
    }

    #[test]
    fn close_freezes_position_and_blocks_reads() {
        let mut reader = SliceReader::new(vec![1u8, 2, 3]);
        reader.skip(2).unwrap();
        reader.close().unwrap();
        assert_eq!(reader.pos(), 2);
        assert!(reader.available().is_empty());
        assert!(matches!(reader.pull(1), Err(Error::Closed)));
    }
}
