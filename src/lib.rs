//! Readers for a block-interleaved, chunked record file format.
//!
//! The format stores a logical stream of self-describing chunks (a fixed
//! header plus payload) and interleaves a small block header at every
//! fixed-size block boundary. The block headers record the distance to the
//! surrounding chunk boundaries, so a reader can land anywhere in a file
//! and resynchronize without scanning, and can skip corrupt regions.
//!
//! Three descriptor-backed byte readers feed the decoder:
//!
//! * [`FdReader`] reads with `pread` and supports random access; with an
//!   explicit initial position several readers can share one descriptor.
//! * [`FdStreamReader`] reads sequentially from descriptors that cannot
//!   seek, such as pipes.
//! * [`FdMMapReader`] maps the whole file and serves zero-copy views.
//!
//! All three implement [`ByteReader`]; [`ChunkReader`] decodes the chunk
//! framing on top of any of them.

mod byte_reader;
mod errors;
mod fd_reader;
mod records;

pub use byte_reader::buffered::DEFAULT_BUFFER_SIZE;
pub use byte_reader::{ByteReader, Position, SliceReader};
pub use errors::{Error, Result};
pub use fd_reader::{
    FdHandle, FdMMapReader, FdMMapReaderOptions, FdReader, FdReaderOptions, FdStreamReader,
    FdStreamReaderOptions,
};
pub use records::{
    BlockHeader, Chunk, ChunkHeader, ChunkReader, ChunkReaderOptions, SkippedRegion,
    BLOCK_HEADER_SIZE, CHUNK_HEADER_SIZE, DEFAULT_BLOCK_SIZE, MIN_BLOCK_SIZE,
};
