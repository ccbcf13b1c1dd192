use std::collections::HashMap;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::thread;

use flate2::read::GzDecoder;
use tracing::{debug, info, warn};

use crate::cache::disk::DiskCache;
use crate::cache::remote::{CacheOpts, ChunkStream, ContentCache};
use crate::cache::singleflight::{Flight, SingleFlight};
use crate::container::storage::{GzipIndex, OciStorageInfo};
use crate::error::{ClipError, Result};
use crate::index::ClipIndex;
use crate::node::{ClipNode, RemoteRef};
use crate::oci::indexer::HashingReader;
use crate::oci::registry::LayerSource;
use crate::oci::zran::ResumedDecoder;
use crate::store::{ContentStore, offset_to_u64};

#[derive(Clone, Debug)]
pub struct OciStoreConfig {
    pub cache_dir: PathBuf,
    pub enable_checkpoints: bool,
    pub routing_key: String,
}

/// Lazy-read store over gzipped OCI layers.
///
/// Read path: disk cache, then remote content cache byte-range, then
/// (optionally) checkpoint-based partial decompression, then a
/// single-flighted full-layer decompression that fills the disk cache
/// and schedules a background upload to the remote cache.
pub struct OciClipStore {
    index: Arc<ClipIndex>,
    info: OciStorageInfo,
    source: Arc<dyn LayerSource>,
    disk: DiskCache,
    content_cache: Option<Arc<dyn ContentCache>>,
    flights: SingleFlight,
    /// Decompressed hashes computed at fill time for layers the archive
    /// metadata does not carry one for.
    computed: RwLock<HashMap<String, String>>,
    enable_checkpoints: bool,
    routing_key: String,
}

impl OciClipStore {
    pub fn new(
        index: Arc<ClipIndex>,
        info: OciStorageInfo,
        source: Arc<dyn LayerSource>,
        content_cache: Option<Arc<dyn ContentCache>>,
        cfg: &OciStoreConfig,
    ) -> Result<Self> {
        let disk = DiskCache::new(&cfg.cache_dir)?;
        Ok(Self {
            index,
            info,
            source,
            disk,
            content_cache,
            flights: SingleFlight::new(),
            computed: RwLock::new(HashMap::new()),
            enable_checkpoints: cfg.enable_checkpoints,
            routing_key: cfg.routing_key.clone(),
        })
    }

    fn cache_opts(&self) -> CacheOpts {
        CacheOpts {
            routing_key: self.routing_key.clone(),
        }
    }

    /// The layer's decompressed hash: archive metadata first, then any
    /// value computed by an earlier fill.
    fn decompressed_hash(&self, layer_digest: &str) -> Option<String> {
        if let Some(h) = self.info.decompressed_hash.get(layer_digest) {
            return Some(h.clone());
        }
        self.computed
            .read()
            .ok()
            .and_then(|m| m.get(layer_digest).cloned())
    }

    fn remote_ref<'n>(&self, node: &'n ClipNode) -> Result<&'n RemoteRef> {
        match &node.remote_ref {
            Some(r) => Ok(r),
            None if node.has_local_data() => Err(ClipError::Invariant(format!(
                "legacy data storage not supported in OCI mode ({})",
                node.path
            ))),
            None => Err(ClipError::Invariant(format!(
                "node {} has no data reference",
                node.path
            ))),
        }
    }

    /// Partial decompression from the nearest checkpoint at or below
    /// `u_start`; with no usable checkpoint the stream is decoded from
    /// its start and discarded up to the target.
    fn read_via_checkpoint(
        &self,
        rref: &RemoteRef,
        gzip_index: &GzipIndex,
        u_start: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        let blob = self.source.open_layer(&rref.layer_digest)?;
        let (mut reader, resumed_at): (Box<dyn Read>, u64) = match gzip_index.nearest(u_start) {
            Some(cp) => (
                Box::new(ResumedDecoder::new(blob, cp)?),
                cp.uncompressed_offset,
            ),
            None => (Box::new(GzDecoder::new(blob)), 0),
        };

        let skip = u_start - resumed_at;
        let skipped = io::copy(&mut (&mut reader).take(skip), &mut io::sink())?;
        if skipped != skip {
            return Err(ClipError::Decompress(format!(
                "layer {} ended {} bytes before read position",
                rref.layer_digest,
                skip - skipped
            )));
        }

        let mut total = 0usize;
        while total < buf.len() {
            let n = reader.read(&mut buf[total..])?;
            if n == 0 {
                return Err(ClipError::Decompress(format!(
                    "layer {} ended inside file range",
                    rref.layer_digest
                )));
            }
            total += n;
        }
        debug!(
            layer = rref.layer_digest.as_str(),
            u_start, resumed_at, "checkpoint read"
        );
        Ok(total)
    }

    /// Full-layer decompression into the disk cache. Returns the
    /// decompressed hash the file was stored under.
    fn decompress_layer(&self, layer_digest: &str) -> Result<String> {
        let blob = self.source.open_layer(layer_digest)?;
        let mut hashing = HashingReader::new(GzDecoder::new(blob));
        let mut tmp = self.disk.temp_file()?;
        let total = io::copy(&mut hashing, tmp.as_file_mut())
            .map_err(|e| ClipError::Decompress(format!("layer {layer_digest}: {e}")))?;
        let (hash, _, _) = hashing.finalize();

        if let Some(expected) = self.info.decompressed_hash.get(layer_digest)
            && *expected != hash
        {
            return Err(ClipError::Decompress(format!(
                "layer {layer_digest} decompressed to {hash}, index says {expected}"
            )));
        }

        self.disk.persist_temp(tmp, &hash)?;
        if let Ok(mut computed) = self.computed.write() {
            computed.insert(layer_digest.to_string(), hash.clone());
        }
        info!(layer = layer_digest, bytes = total, hash = hash.as_str(), "layer decompressed");

        self.spawn_background_upload(&hash);
        Ok(hash)
    }

    /// Fire-and-forget upload of the decompressed layer to the remote
    /// cache, streamed in 32 MiB chunks. Never blocks the read that
    /// triggered it; failures are logged and swallowed.
    fn spawn_background_upload(&self, hash: &str) {
        let Some(cache) = self.content_cache.clone() else {
            return;
        };
        let path = self.disk.path_for(hash);
        let key = hash.to_string();
        let opts = self.cache_opts();
        thread::spawn(move || {
            let file = match std::fs::File::open(&path) {
                Ok(f) => f,
                Err(e) => {
                    warn!(key = key.as_str(), error = %e, "background upload skipped");
                    return;
                }
            };
            let mut chunks = ChunkStream::new(file);
            match cache.store(&mut chunks, &key, &opts) {
                Ok(stored) => debug!(key = stored.as_str(), "layer uploaded to content cache"),
                Err(e) => warn!(key = key.as_str(), error = %e, "background upload failed"),
            }
        });
    }
}

impl ContentStore for OciClipStore {
    fn read(&self, node: &ClipNode, buf: &mut [u8], offset: i64) -> Result<usize> {
        let offset = offset_to_u64(offset)?;
        let rref = self.remote_ref(node)?;
        if offset >= rref.length || buf.is_empty() {
            return Ok(0);
        }
        let u_len = (buf.len() as u64).min(rref.length - offset) as usize;
        let u_start = rref.offset + offset;
        let buf = &mut buf[..u_len];

        // Bounded retries: a waiter whose leader failed re-enters and may
        // become the next leader.
        for _ in 0..3 {
            let hash = self.decompressed_hash(&rref.layer_digest);

            if let Some(hash) = &hash
                && let Some(n) = self.disk.read_at(hash, u_start, buf)?
            {
                return Ok(n);
            }

            if let Some(hash) = &hash
                && let Some(cache) = &self.content_cache
            {
                match cache.get(hash, u_start, u_len as u64, &self.cache_opts()) {
                    Ok(bytes) if bytes.len() == u_len => {
                        buf.copy_from_slice(&bytes);
                        debug!(path = node.path.as_str(), "content cache range hit");
                        return Ok(u_len);
                    }
                    Ok(bytes) => warn!(
                        path = node.path.as_str(),
                        got = bytes.len(),
                        want = u_len,
                        "content cache returned wrong length"
                    ),
                    Err(ClipError::NotFound(_)) => {}
                    Err(e) => {
                        warn!(path = node.path.as_str(), error = %e, "content cache get failed")
                    }
                }
            }

            if self.enable_checkpoints
                && let Some(gzip_index) = self.info.gzip_index.get(&rref.layer_digest)
                && !gzip_index.checkpoints.is_empty()
            {
                match self.read_via_checkpoint(rref, gzip_index, u_start, buf) {
                    Ok(n) => return Ok(n),
                    // Byte-granular checkpoints are not always usable;
                    // fall through to the full decompression.
                    Err(e) => warn!(
                        layer = rref.layer_digest.as_str(),
                        error = %e,
                        "checkpoint read failed, falling back"
                    ),
                }
            }

            match self.flights.begin(&rref.layer_digest) {
                Flight::Leader(guard) => {
                    // A previous leader may have landed the file between
                    // our probe and taking the flight.
                    if let Some(hash) = self.decompressed_hash(&rref.layer_digest)
                        && let Some(n) = self.disk.read_at(&hash, u_start, buf)?
                    {
                        return Ok(n);
                    }
                    let hash = self.decompress_layer(&rref.layer_digest)?;
                    drop(guard);
                    if let Some(n) = self.disk.read_at(&hash, u_start, buf)? {
                        return Ok(n);
                    }
                    return Err(ClipError::Io(std::io::Error::other(format!(
                        "layer {} missing from disk cache after fill",
                        rref.layer_digest
                    ))));
                }
                Flight::Waiter(signal) => {
                    // Re-probe the caches once the leader finishes.
                    signal.wait();
                }
            }
        }
        Err(ClipError::Io(std::io::Error::other(format!(
            "layer {} could not be materialized",
            rref.layer_digest
        ))))
    }

    fn metadata(&self) -> Arc<ClipIndex> {
        self.index.clone()
    }

    fn cached_locally(&self) -> bool {
        false
    }

    fn cleanup(&self) {
        self.disk.sweep_temp_files();
    }
}
