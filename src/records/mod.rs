mod chunk_reader;

pub use chunk_reader::{ChunkReader, ChunkReaderOptions, SkippedRegion};

use xxhash_rust::xxh64::xxh64;

use crate::errors::{Error, Result};

/// Size of the header placed at every block boundary.
pub const BLOCK_HEADER_SIZE: u64 = 24;
/// Size of the header at the front of every chunk.
pub const CHUNK_HEADER_SIZE: u64 = 40;
/// Default distance between block headers.
pub const DEFAULT_BLOCK_SIZE: u64 = 64 * 1024;
/// Smallest allowed block size: a block header plus one chunk header.
pub const MIN_BLOCK_SIZE: u64 = 64;

// Each field class hashes with its own seed so a structure misread as
// another kind cannot validate by accident.
const BLOCK_HASH_SEED: u64 = 0x23d9_5c49_a63f_81e1;
const CHUNK_HASH_SEED: u64 = 0x9e3d_1b07_44ca_5d13;
const DATA_HASH_SEED: u64 = 0x6b85_2ec1_90d3_7f0b;

pub(crate) fn data_hash(data: &[u8]) -> u64 {
    xxh64(data, DATA_HASH_SEED)
}

fn read_u64_le(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}

/// The marker at each block boundary, recording the distance back to the
/// most recent chunk header and forward to the next one. It exists so a
/// reader can resynchronize at any block boundary without scanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Block begin minus the position of the most recent chunk header at or
    /// before it; 0 when no chunk precedes the block (block 0 only).
    pub previous_chunk: u64,
    /// Position of the next chunk header minus the block begin.
    pub next_chunk: u64,
}

impl BlockHeader {
    pub fn encode(&self) -> [u8; BLOCK_HEADER_SIZE as usize] {
        let mut bytes = [0u8; BLOCK_HEADER_SIZE as usize];
        bytes[0..8].copy_from_slice(&self.previous_chunk.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.next_chunk.to_le_bytes());
        let hash = xxh64(&bytes[0..16], BLOCK_HASH_SEED);
        bytes[16..24].copy_from_slice(&hash.to_le_bytes());
        bytes
    }

    pub fn decode(bytes: &[u8; BLOCK_HEADER_SIZE as usize]) -> Result<Self> {
        let stored = read_u64_le(bytes, 16);
        if xxh64(&bytes[0..16], BLOCK_HASH_SEED) != stored {
            return Err(Error::DataLoss("invalid block header hash".to_string()));
        }
        Ok(BlockHeader {
            previous_chunk: read_u64_le(bytes, 0),
            next_chunk: read_u64_le(bytes, 8),
        })
    }
}

/// The fixed framing record at the front of every chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Payload bytes following the header, block headers excluded.
    pub data_size: u64,
    pub num_records: u64,
    /// Payload size after decoding; equals `data_size` for unencoded
    /// payloads.
    pub decoded_data_size: u64,
    pub data_hash: u64,
}

impl ChunkHeader {
    /// A header describing `data` as an unencoded payload.
    pub fn new(data: &[u8], num_records: u64) -> Self {
        ChunkHeader {
            data_size: data.len() as u64,
            num_records,
            decoded_data_size: data.len() as u64,
            data_hash: data_hash(data),
        }
    }

    pub fn encode(&self) -> [u8; CHUNK_HEADER_SIZE as usize] {
        let mut bytes = [0u8; CHUNK_HEADER_SIZE as usize];
        bytes[0..8].copy_from_slice(&self.data_size.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.num_records.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.decoded_data_size.to_le_bytes());
        bytes[24..32].copy_from_slice(&self.data_hash.to_le_bytes());
        let hash = xxh64(&bytes[0..32], CHUNK_HASH_SEED);
        bytes[32..40].copy_from_slice(&hash.to_le_bytes());
        bytes
    }

    pub fn decode(bytes: &[u8; CHUNK_HEADER_SIZE as usize]) -> Result<Self> {
        let stored = read_u64_le(bytes, 32);
        if xxh64(&bytes[0..32], CHUNK_HASH_SEED) != stored {
            return Err(Error::DataLoss("invalid chunk header hash".to_string()));
        }
        let header = ChunkHeader {
            data_size: read_u64_le(bytes, 0),
            num_records: read_u64_le(bytes, 8),
            decoded_data_size: read_u64_le(bytes, 16),
            data_hash: read_u64_le(bytes, 24),
        };
        // the per-record index occupies a prefix of the payload
        if header.num_records > header.data_size {
            return Err(Error::DataLoss(format!(
                "chunk claims {} records in {} payload bytes",
                header.num_records, header.data_size
            )));
        }
        Ok(header)
    }
}

/// A decoded chunk: header plus payload, block headers already stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub header: ChunkHeader,
    pub data: Vec<u8>,
}

impl Chunk {
    pub fn new(data: Vec<u8>, num_records: u64) -> Self {
        Chunk {
            header: ChunkHeader::new(&data, num_records),
            data,
        }
    }
}

pub(crate) fn block_begin(pos: u64, block_size: u64) -> u64 {
    pos - pos % block_size
}

/// Bytes of block header still ahead when `pos` lies inside one; 0 past it.
pub(crate) fn remaining_in_block_header(pos: u64, block_size: u64) -> u64 {
    BLOCK_HEADER_SIZE.saturating_sub(pos % block_size)
}

/// Whether `pos` can be a chunk boundary: past a block's header region, or
/// exactly on a block boundary (a chunk ending there, with the next one
/// beginning past the interleaved header). Positions inside a block header
/// never qualify.
pub(crate) fn is_possible_chunk_boundary(pos: u64, block_size: u64) -> bool {
    pos % block_size == 0 || pos % block_size >= BLOCK_HEADER_SIZE
}

/// The block boundary at or after `pos`.
pub(crate) fn next_block_boundary(pos: u64, block_size: u64) -> u64 {
    if pos % block_size == 0 {
        pos
    } else {
        block_begin(pos, block_size) + block_size
    }
}

/// End position of the chunk starting at `begin`, counting the block
/// headers interleaved into it.
pub(crate) fn chunk_end(begin: u64, header: &ChunkHeader, block_size: u64) -> Result<u64> {
    debug_assert!(begin % block_size >= BLOCK_HEADER_SIZE);
    let impossible = || Error::DataLoss("impossible chunk size".to_string());
    let logical = CHUNK_HEADER_SIZE
        .checked_add(header.data_size)
        .ok_or_else(impossible)?;
    let until_boundary = block_size - begin % block_size;
    if logical <= until_boundary {
        return begin.checked_add(logical).ok_or_else(impossible);
    }
    let past_boundary = logical - until_boundary;
    let usable = block_size - BLOCK_HEADER_SIZE;
    let headers = 1 + (past_boundary - 1) / usable;
    begin
        .checked_add(logical)
        .and_then(|end| end.checked_add(headers.checked_mul(BLOCK_HEADER_SIZE)?))
        .ok_or_else(impossible)
}

/// Where the next chunk begins after one ending at `end`: past the block
/// header when `end` lands exactly on a boundary.
pub(crate) fn next_chunk_begin(end: u64, block_size: u64) -> u64 {
    if end % block_size == 0 {
        end + BLOCK_HEADER_SIZE
    } else {
        end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_header_roundtrip_and_hash_check() {
        let header = BlockHeader {
            previous_chunk: 40,
            next_chunk: 80,
        };
        let mut bytes = header.encode();
        assert_eq!(BlockHeader::decode(&bytes).unwrap(), header);
        bytes[3] ^= 0x01;
        assert!(BlockHeader::decode(&bytes).unwrap_err().is_data_loss());
    }

    #[test]
    fn chunk_header_roundtrip_and_hash_check() {
        let header = ChunkHeader::new(b"payload", 2);
        assert_eq!(header.data_size, 7);
        assert_eq!(header.decoded_data_size, 7);
        let mut bytes = header.encode();
        assert_eq!(ChunkHeader::decode(&bytes).unwrap(), header);
        bytes[0] ^= 0x01;
        assert!(ChunkHeader::decode(&bytes).unwrap_err().is_data_loss());
    }

    #[test]
    fn chunk_header_rejects_more_records_than_payload() {
        let mut header = ChunkHeader::new(b"ab", 2);
        header.num_records = 3;
        let bytes = header.encode();
        assert!(ChunkHeader::decode(&bytes).unwrap_err().is_data_loss());
    }

    #[test]
    fn boundary_math() {
        assert_eq!(block_begin(100, 64), 64);
        assert_eq!(remaining_in_block_header(64, 64), 24);
        assert_eq!(remaining_in_block_header(70, 64), 18);
        assert_eq!(remaining_in_block_header(88, 64), 0);
        assert!(is_possible_chunk_boundary(0, 64));
        assert!(is_possible_chunk_boundary(64, 64));
        assert!(!is_possible_chunk_boundary(70, 64));
        assert!(is_possible_chunk_boundary(88, 64));
        assert_eq!(next_block_boundary(64, 64), 64);
        assert_eq!(next_block_boundary(65, 64), 128);
    }

    #[test]
    fn chunk_end_counts_interleaved_headers() {
        // fits before the boundary
        let header = ChunkHeader::new(&[0u8; 0], 0);
        assert_eq!(chunk_end(24, &header, 64).unwrap(), 64);
        // crosses one boundary
        let header = ChunkHeader::new(&[0u8; 10], 0);
        assert_eq!(chunk_end(24, &header, 64).unwrap(), 24 + 50 + 24);
        // crosses two boundaries
        let header = ChunkHeader::new(&[0u8; 50], 0);
        assert_eq!(chunk_end(24, &header, 64).unwrap(), 24 + 90 + 48);
        // ends exactly at a boundary after crossing one
        let header = ChunkHeader::new(&[0u8; 40], 0);
        assert_eq!(chunk_end(24, &header, 64).unwrap(), 128);
    }

    #[test]
    fn next_chunk_steps_over_a_boundary_header() {
        assert_eq!(next_chunk_begin(100, 64), 100);
        assert_eq!(next_chunk_begin(128, 64), 152);
    }

    #[test]
    fn impossible_sizes_are_data_loss() {
        let mut header = ChunkHeader::new(b"", 0);
        header.data_size = u64::MAX - 8;
        assert!(chunk_end(24, &header, 64).unwrap_err().is_data_loss());
    }
}
