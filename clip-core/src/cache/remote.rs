use std::io::Read;

use crate::error::Result;

/// Chunk size used when streaming whole files into the remote cache.
pub const STREAM_CHUNK_SIZE: usize = 32 * 1024 * 1024;

/// Per-request options; currently a single routing-key field the
/// consumer's cache implementation may use for placement.
#[derive(Clone, Debug, Default)]
pub struct CacheOpts {
    pub routing_key: String,
}

/// Consumer-supplied remote content cache, keyed by content hash and
/// capable of byte-range reads.
pub trait ContentCache: Send + Sync {
    /// Fetches `length` bytes at `offset` for `key`. A missing key is
    /// `ClipError::NotFound`.
    fn get(&self, key: &str, offset: u64, length: u64, opts: &CacheOpts) -> Result<Vec<u8>>;

    /// Drains the chunk stream into the cache and returns the key the
    /// content was stored under.
    fn store(
        &self,
        chunks: &mut dyn Iterator<Item = std::io::Result<Vec<u8>>>,
        key: &str,
        opts: &CacheOpts,
    ) -> Result<String>;
}

/// Iterator yielding `STREAM_CHUNK_SIZE` pieces of a reader, for
/// `ContentCache::store`.
pub struct ChunkStream<R> {
    reader: R,
    done: bool,
}

impl<R: Read> ChunkStream<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            done: false,
        }
    }
}

impl<R: Read> Iterator for ChunkStream<R> {
    type Item = std::io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut chunk = vec![0u8; STREAM_CHUNK_SIZE];
        let mut filled = 0;
        while filled < chunk.len() {
            match self.reader.read(&mut chunk[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        if filled == 0 {
            self.done = true;
            return None;
        }
        if filled < chunk.len() {
            self.done = true;
            chunk.truncate(filled);
        }
        Some(Ok(chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_stream_yields_full_then_tail() {
        // Exercise the chunking logic with a small reader; chunk size is
        // fixed, so drive it with input smaller than one chunk.
        let data = vec![7u8; 100];
        let chunks: Vec<_> = ChunkStream::new(&data[..]).collect::<std::io::Result<_>>().unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0], data);
    }

    #[test]
    fn empty_reader_yields_nothing() {
        let chunks: Vec<_> = ChunkStream::new(&b""[..]).collect();
        assert!(chunks.is_empty());
    }
}
