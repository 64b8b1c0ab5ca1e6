use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use tempfile::TempDir;

use recfile::{
    BlockHeader, ChunkHeader, ChunkReader, ChunkReaderOptions, FdMMapReader, FdMMapReaderOptions,
    FdReader, FdReaderOptions, BLOCK_HEADER_SIZE, CHUNK_HEADER_SIZE,
};

const BENCH_BLOCK_SIZE: u64 = 64 * 1024;

/// Serializes chunks into the framing format, interleaving a block header
/// at every boundary.
struct FileBuilder {
    bytes: Vec<u8>,
    last_chunk: Option<u64>,
}

impl FileBuilder {
    fn new() -> Self {
        FileBuilder {
            bytes: Vec::new(),
            last_chunk: None,
        }
    }

    fn block_header(&self, block: u64, next_begin: u64) -> [u8; BLOCK_HEADER_SIZE as usize] {
        let previous_chunk = match self.last_chunk {
            Some(chunk) => block - chunk,
            None => 0,
        };
        BlockHeader {
            previous_chunk,
            next_chunk: next_begin - block,
        }
        .encode()
    }

    fn chunk_end(begin: u64, logical: u64) -> u64 {
        let until_boundary = BENCH_BLOCK_SIZE - begin % BENCH_BLOCK_SIZE;
        if logical <= until_boundary {
            return begin + logical;
        }
        let past_boundary = logical - until_boundary;
        let usable = BENCH_BLOCK_SIZE - BLOCK_HEADER_SIZE;
        let headers = 1 + (past_boundary - 1) / usable;
        begin + logical + headers * BLOCK_HEADER_SIZE
    }

    fn add_chunk(&mut self, payload: &[u8], num_records: u64) {
        if self.bytes.len() as u64 % BENCH_BLOCK_SIZE == 0 {
            let block = self.bytes.len() as u64;
            let header = self.block_header(block, block + BLOCK_HEADER_SIZE);
            self.bytes.extend_from_slice(&header);
        }
        let begin = self.bytes.len() as u64;
        let logical = CHUNK_HEADER_SIZE + payload.len() as u64;
        let end = Self::chunk_end(begin, logical);
        let next_begin = if end % BENCH_BLOCK_SIZE == 0 {
            end + BLOCK_HEADER_SIZE
        } else {
            end
        };
        self.last_chunk = Some(begin);
        let chunk_header = ChunkHeader::new(payload, 1);
        let mut logical_bytes = Vec::with_capacity(logical as usize);
        logical_bytes.extend_from_slice(&chunk_header.encode());
        logical_bytes.extend_from_slice(payload);
        for byte in logical_bytes {
            if self.bytes.len() as u64 % BENCH_BLOCK_SIZE == 0 {
                let block = self.bytes.len() as u64;
                let header = self.block_header(block, next_begin);
                self.bytes.extend_from_slice(&header);
            }
            self.bytes.push(byte);
        }
    }
}

fn create_chunk_file(chunk_count: usize, payload_size: usize) -> (TempDir, PathBuf, u64) {
    let mut builder = FileBuilder::new();
    let payload: Vec<u8> = (0..payload_size).map(|i| (i % 251) as u8).collect();
    for _ in 0..chunk_count {
        builder.add_chunk(&payload, 1);
    }
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let path = temp_dir.path().join("bench.records");
    let mut file = File::create(&path).expect("failed to create bench file");
    file.write_all(&builder.bytes).expect("failed to write bench file");
    let total = (chunk_count * payload_size) as u64;
    (temp_dir, path, total)
}

fn read_all_chunks<R: recfile::ByteReader>(mut reader: ChunkReader<R>) -> usize {
    let mut count = 0;
    while let Some(chunk) = reader.read_chunk().unwrap() {
        black_box(&chunk.data);
        count += 1;
    }
    count
}

fn bench_sequential_chunks(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequential_chunks");

    let configs = vec![
        (1000, 256),    // many small chunks
        (200, 4096),    // medium chunks
        (20, 256 * 1024), // few chunks spanning many blocks
    ];

    for (chunk_count, payload_size) in configs {
        let (_temp_dir, path, total) = create_chunk_file(chunk_count, payload_size);
        group.throughput(Throughput::Bytes(total));

        group.bench_with_input(
            BenchmarkId::new("pread", format!("{chunk_count}x{payload_size}")),
            &path,
            |b, path| {
                b.iter(|| {
                    let byte_reader =
                        FdReader::open(path, libc::O_RDONLY, FdReaderOptions::default()).unwrap();
                    let reader = ChunkReader::with_options(
                        byte_reader,
                        ChunkReaderOptions {
                            block_size: BENCH_BLOCK_SIZE,
                        },
                    )
                    .unwrap();
                    assert_eq!(read_all_chunks(reader), chunk_count);
                })
            },
        );

        group.bench_with_input(
            BenchmarkId::new("mmap", format!("{chunk_count}x{payload_size}")),
            &path,
            |b, path| {
                b.iter(|| {
                    let byte_reader =
                        FdMMapReader::open(path, libc::O_RDONLY, FdMMapReaderOptions::default())
                            .unwrap();
                    let reader = ChunkReader::with_options(
                        byte_reader,
                        ChunkReaderOptions {
                            block_size: BENCH_BLOCK_SIZE,
                        },
                    )
                    .unwrap();
                    assert_eq!(read_all_chunks(reader), chunk_count);
                })
            },
        );
    }

    group.finish();
}

fn bench_seek_to_chunk(c: &mut Criterion) {
    let mut group = c.benchmark_group("seek_to_chunk");

    let chunk_count = 500;
    let payload_size = 4096;
    let (_temp_dir, path, _) = create_chunk_file(chunk_count, payload_size);

    let byte_reader = FdReader::open(&path, libc::O_RDONLY, FdReaderOptions::default()).unwrap();
    let mut reader = ChunkReader::with_options(
        byte_reader,
        ChunkReaderOptions {
            block_size: BENCH_BLOCK_SIZE,
        },
    )
    .unwrap();
    let size = reader.size().unwrap();

    // a deterministic scatter of seek targets over the first half of the
    // file, so every lookup resolves to a real chunk
    let targets: Vec<u64> = (0..100u64).map(|i| (i * 7919) % (size / 2)).collect();

    group.bench_function("containing_100_targets", |b| {
        b.iter(|| {
            for &target in &targets {
                reader.seek_to_chunk_containing(target).unwrap();
                black_box(reader.pos());
            }
        })
    });

    group.finish();
}

criterion_group!(benches, bench_sequential_chunks, bench_seek_to_chunk);
criterion_main!(benches);
