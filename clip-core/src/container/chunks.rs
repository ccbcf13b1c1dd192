use serde::{Deserialize, Serialize};

pub const DEFAULT_CHUNK_SIZE: u64 = 32 * 1024 * 1024;
pub const CHUNK_SUFFIX: &str = ".cblock";

/// Name of the i-th chunk file. Chunk i holds bytes `[i*S, (i+1)*S)` of
/// the concatenated data stream, where S is the archive's chunk size.
pub fn chunk_name(index: u64) -> String {
    format!("{index}{CHUNK_SUFFIX}")
}

/// Ordered chunk file names, serialized between header and index.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkList {
    pub chunks: Vec<String>,
}

impl ChunkList {
    pub fn push(&mut self, name: String) {
        self.chunks.push(name);
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// A contiguous piece of one chunk file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkPiece {
    /// Chunk index within the chunk list.
    pub index: u64,
    /// Byte offset within that chunk file.
    pub offset: u64,
    /// Bytes to read from that chunk file.
    pub len: u64,
}

/// Translates the absolute stream range `[start, end)` into pieces of the
/// fixed-size chunk files it spans. A single file's bytes may cross chunk
/// boundaries, so a range can map to more than one piece.
pub fn map_range(start: u64, end: u64, chunk_size: u64) -> Vec<ChunkPiece> {
    debug_assert!(chunk_size > 0);
    if end <= start {
        return Vec::new();
    }

    let start_chunk = start / chunk_size;
    let end_chunk = (end - 1) / chunk_size;

    let mut pieces = Vec::with_capacity((end_chunk - start_chunk + 1) as usize);
    let mut pos = start;
    for index in start_chunk..=end_chunk {
        let offset = pos % chunk_size;
        let len = (chunk_size - offset).min(end - pos);
        pieces.push(ChunkPiece { index, offset, len });
        pos += len;
    }
    pieces
}
