use std::sync::Arc;

use tracing::{debug, warn};

use crate::cache::lru::CostLru;
use crate::cache::remote::{CacheOpts, ContentCache};
use crate::cache::singleflight::{Flight, SingleFlight};
use crate::container::chunks::{ChunkList, ChunkPiece, map_range};
use crate::error::{ClipError, Result};
use crate::index::ClipIndex;
use crate::node::ClipNode;
use crate::store::{ContentStore, local_ref, offset_to_u64};

/// Files below this size are pulled whole through the content cache and
/// kept in the local LRU; larger files are range-read only.
pub const DEFAULT_LARGE_FILE_THRESHOLD: u64 = 50 * 1024 * 1024;

pub const DEFAULT_CONTENT_CACHE_BUDGET: u64 = 256 * 1024 * 1024;
pub const DEFAULT_CHUNK_CACHE_BUDGET: u64 = 256 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct CdnStoreConfig {
    pub base_url: String,
    pub image_id: String,
    pub large_file_threshold: u64,
    pub content_cache_budget: u64,
    pub chunk_cache_budget: u64,
}

impl CdnStoreConfig {
    pub fn new(base_url: String, image_id: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            image_id,
            large_file_threshold: DEFAULT_LARGE_FILE_THRESHOLD,
            content_cache_budget: DEFAULT_CONTENT_CACHE_BUDGET,
            chunk_cache_budget: DEFAULT_CHUNK_CACHE_BUDGET,
        }
    }
}

/// V2 store fetching chunks over HTTP, with an in-memory content LRU, an
/// optional remote content cache in front of the origin, and a
/// single-flighted chunk LRU.
pub struct CdnChunkStore {
    index: Arc<ClipIndex>,
    chunk_names: Vec<String>,
    chunk_size: u64,
    cfg: CdnStoreConfig,
    http: reqwest::blocking::Client,
    content_lru: CostLru,
    chunk_lru: CostLru,
    content_cache: Option<Arc<dyn ContentCache>>,
    flights: SingleFlight,
}

impl CdnChunkStore {
    pub fn new(
        index: Arc<ClipIndex>,
        chunk_list: ChunkList,
        chunk_size: u64,
        cfg: CdnStoreConfig,
        content_cache: Option<Arc<dyn ContentCache>>,
    ) -> Result<Self> {
        if chunk_size == 0 {
            return Err(ClipError::Format("archive chunk size is zero".into()));
        }
        let http = reqwest::blocking::Client::builder()
            .build()
            .map_err(|e| ClipError::Io(std::io::Error::other(e)))?;
        Ok(Self {
            index,
            chunk_names: chunk_list.chunks,
            chunk_size,
            content_lru: CostLru::new(cfg.content_cache_budget),
            chunk_lru: CostLru::new(cfg.chunk_cache_budget),
            cfg,
            http,
            content_cache,
            flights: SingleFlight::new(),
        })
    }

    fn cache_opts(&self) -> CacheOpts {
        CacheOpts {
            routing_key: self.cfg.image_id.clone(),
        }
    }

    fn chunk_url(&self, name: &str) -> String {
        format!("{}/{}/chunks/{}", self.cfg.base_url, self.cfg.image_id, name)
    }

    /// Full chunk body, single-flighted per URL and kept in the chunk
    /// LRU. Waiters re-probe the LRU; an evicted entry just re-fetches.
    fn get_chunk(&self, name: &str) -> Result<Arc<Vec<u8>>> {
        let url = self.chunk_url(name);
        loop {
            if let Some(body) = self.chunk_lru.get(&url) {
                return Ok(body);
            }
            match self.flights.begin(&url) {
                Flight::Leader(_guard) => {
                    let body = Arc::new(self.fetch(&url, None)?);
                    self.chunk_lru.put(url.clone(), body.clone());
                    return Ok(body);
                }
                Flight::Waiter(signal) => signal.wait(),
            }
        }
    }

    /// One HTTP GET, optionally ranged. 200 and 206 are both accepted; a
    /// server that ignores the range returns the whole chunk and the
    /// caller slices.
    fn fetch(&self, url: &str, range: Option<(u64, u64)>) -> Result<Vec<u8>> {
        let mut req = self.http.get(url);
        if let Some((start, end)) = range {
            req = req.header(reqwest::header::RANGE, format!("bytes={start}-{end}"));
        }
        let resp = req
            .send()
            .map_err(|e| ClipError::Io(std::io::Error::other(e)))?;
        match resp.status().as_u16() {
            200 | 206 => {}
            404 => return Err(ClipError::NotFound(url.to_string())),
            status => {
                return Err(ClipError::Io(std::io::Error::other(format!(
                    "chunk fetch returned status {status} for {url}"
                ))));
            }
        }
        let ranged = resp.status().as_u16() == 206;
        let body = resp
            .bytes()
            .map_err(|e| ClipError::Io(std::io::Error::other(e)))?
            .to_vec();
        if let Some((start, end)) = range
            && !ranged
        {
            // Whole-chunk response to a range request.
            let start = start as usize;
            let end = (end as usize + 1).min(body.len());
            if start >= body.len() {
                return Ok(Vec::new());
            }
            return Ok(body[start..end].to_vec());
        }
        Ok(body)
    }

    /// Assembles `[start, start+len)` of the data stream from origin
    /// chunks into `buf`, returning the bytes filled.
    fn read_from_origin(&self, start: u64, buf: &mut [u8]) -> Result<usize> {
        let mut total = 0usize;
        for piece in map_range(start, start + buf.len() as u64, self.chunk_size) {
            let ChunkPiece { index, offset, len } = piece;
            let name = self.chunk_names.get(index as usize).ok_or_else(|| {
                ClipError::Invariant(format!("chunk index {index} out of range"))
            })?;

            let got = if self.cfg.chunk_cache_budget > 0 {
                let body = self.get_chunk(name)?;
                let begin = (offset as usize).min(body.len());
                let end = (offset + len).min(body.len() as u64) as usize;
                let piece_bytes = &body[begin..end];
                buf[total..total + piece_bytes.len()].copy_from_slice(piece_bytes);
                piece_bytes.len()
            } else {
                let bytes = self.fetch(&self.chunk_url(name), Some((offset, offset + len - 1)))?;
                let n = bytes.len().min(len as usize);
                buf[total..total + n].copy_from_slice(&bytes[..n]);
                n
            };

            total += got;
            if got < len as usize {
                warn!(chunk = name.as_str(), got, want = len, "short chunk from origin");
                break;
            }
        }
        Ok(total)
    }
}

impl ContentStore for CdnChunkStore {
    fn read(&self, node: &ClipNode, buf: &mut [u8], offset: i64) -> Result<usize> {
        let offset = offset_to_u64(offset)?;
        let (data_pos, data_len) = local_ref(node)?;
        if offset >= data_len || buf.is_empty() {
            return Ok(0);
        }
        let read_len = (buf.len() as u64).min(data_len - offset) as usize;
        let buf = &mut buf[..read_len];

        // Whole-file blobs memoized in the local LRU.
        if !node.content_hash.is_empty()
            && let Some(blob) = self.content_lru.get(&node.content_hash)
            && offset + read_len as u64 <= blob.len() as u64
        {
            let start = offset as usize;
            buf.copy_from_slice(&blob[start..start + read_len]);
            debug!(path = node.path.as_str(), "content lru hit");
            return Ok(read_len);
        }

        // Remote content cache fronting the origin stream.
        if let Some(cache) = &self.content_cache
            && !node.content_hash.is_empty()
        {
            if data_len < self.cfg.large_file_threshold {
                match cache.get(&node.content_hash, data_pos, data_len, &self.cache_opts()) {
                    Ok(blob) if blob.len() as u64 == data_len => {
                        let blob = Arc::new(blob);
                        self.content_lru
                            .put(node.content_hash.clone(), blob.clone());
                        let start = offset as usize;
                        buf.copy_from_slice(&blob[start..start + read_len]);
                        return Ok(read_len);
                    }
                    Ok(blob) => {
                        warn!(
                            path = node.path.as_str(),
                            got = blob.len(),
                            want = data_len,
                            "content cache returned wrong length"
                        );
                    }
                    Err(ClipError::NotFound(_)) => {}
                    Err(e) => warn!(path = node.path.as_str(), error = %e, "content cache get failed"),
                }
            } else {
                match cache.get(
                    &node.content_hash,
                    data_pos + offset,
                    read_len as u64,
                    &self.cache_opts(),
                ) {
                    Ok(bytes) if bytes.len() == read_len => {
                        buf.copy_from_slice(&bytes);
                        return Ok(read_len);
                    }
                    Ok(_) | Err(ClipError::NotFound(_)) => {}
                    Err(e) => warn!(path = node.path.as_str(), error = %e, "content cache get failed"),
                }
            }
        }

        self.read_from_origin(data_pos + offset, buf)
    }

    fn metadata(&self) -> Arc<ClipIndex> {
        self.index.clone()
    }

    fn cached_locally(&self) -> bool {
        false
    }
}
