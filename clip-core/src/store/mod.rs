use std::path::Path;
use std::sync::Arc;

use crate::cache::remote::ContentCache;
use crate::container::archive::ClipArchive;
use crate::container::header::{STORAGE_TYPE_LOCAL, STORAGE_TYPE_OCI, STORAGE_TYPE_S3};
use crate::error::{ClipError, Result};
use crate::index::ClipIndex;
use crate::node::ClipNode;
use crate::oci::registry::RegistryClient;

pub mod cdn;
pub mod local;
pub mod oci;

/// Resolves `(node, offset, length)` to bytes, wherever they live.
pub trait ContentStore: Send + Sync {
    /// Copies up to `buf.len()` bytes of the file at `offset` into `buf`.
    /// Requests at or beyond EOF return 0; a negative offset is an error.
    fn read(&self, node: &ClipNode, buf: &mut [u8], offset: i64) -> Result<usize>;

    fn metadata(&self) -> Arc<ClipIndex>;

    /// True when every byte is already on local disk (plain V2 archives).
    fn cached_locally(&self) -> bool;

    fn cleanup(&self) {}
}

pub(crate) fn offset_to_u64(offset: i64) -> Result<u64> {
    if offset < 0 {
        return Err(ClipError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "negative read offset",
        )));
    }
    Ok(offset as u64)
}

/// Validates a V2 node's local ref and returns `(data_pos, data_len)`.
pub(crate) fn local_ref(node: &ClipNode) -> Result<(u64, u64)> {
    if node.remote_ref.is_some() {
        return Err(ClipError::Invariant(format!(
            "remote-ref node {} against a chunk store",
            node.path
        )));
    }
    if !node.has_local_data() {
        return Err(ClipError::Invariant(format!(
            "node {} has no data reference",
            node.path
        )));
    }
    Ok((node.data_pos as u64, node.data_len as u64))
}

/// Mount-time store configuration.
#[derive(Clone, Default)]
pub struct StoreOptions {
    /// Disk cache directory for OCI layer decompression.
    pub cache_dir: Option<std::path::PathBuf>,
    /// When set, V2 chunks are fetched from `<cdn_url>/<image_id>/chunks/`.
    pub cdn_url: Option<String>,
    pub image_id: Option<String>,
    /// Consumer-supplied remote content cache.
    pub content_cache: Option<Arc<dyn ContentCache>>,
    pub content_cache_budget: Option<u64>,
    pub chunk_cache_budget: Option<u64>,
    pub enable_checkpoints: bool,
}

/// Builds the store matching the archive's storage type.
///
/// `archive_path` is the path the archive was loaded from; a plain V2
/// archive's chunks live in `chunks/` next to it.
pub fn new_content_store(
    archive: &ClipArchive,
    archive_path: &Path,
    opts: &StoreOptions,
) -> Result<Arc<dyn ContentStore>> {
    match archive.storage_type() {
        STORAGE_TYPE_OCI => {
            let info = archive.oci_storage_info()?;
            let cache_dir = opts.cache_dir.clone().ok_or_else(|| {
                ClipError::Unsupported("OCI archives require a cache directory".into())
            })?;
            let client = RegistryClient::new(&info.registry, &info.repository)?;
            let store = oci::OciClipStore::new(
                archive.index.clone(),
                info,
                Arc::new(client),
                opts.content_cache.clone(),
                &oci::OciStoreConfig {
                    cache_dir,
                    enable_checkpoints: opts.enable_checkpoints,
                    routing_key: opts.image_id.clone().unwrap_or_default(),
                },
            )?;
            Ok(Arc::new(store))
        }
        STORAGE_TYPE_LOCAL | STORAGE_TYPE_S3 => {
            if let Some(cdn_url) = &opts.cdn_url {
                let image_id = opts.image_id.clone().ok_or_else(|| {
                    ClipError::Unsupported("CDN-backed mounts require an image id".into())
                })?;
                let mut cfg = cdn::CdnStoreConfig::new(cdn_url.clone(), image_id);
                if let Some(budget) = opts.content_cache_budget {
                    cfg.content_cache_budget = budget;
                }
                if let Some(budget) = opts.chunk_cache_budget {
                    cfg.chunk_cache_budget = budget;
                }
                let store = cdn::CdnChunkStore::new(
                    archive.index.clone(),
                    archive.chunk_list.clone(),
                    archive.header.chunk_size,
                    cfg,
                    opts.content_cache.clone(),
                )?;
                return Ok(Arc::new(store));
            }
            if archive.storage_type() == STORAGE_TYPE_S3 {
                return Err(ClipError::Unsupported(
                    "s3 archives need a CDN url to read from".into(),
                ));
            }
            let chunk_dir = archive_path
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join("chunks");
            let store = local::LocalChunkStore::new(
                archive.index.clone(),
                archive.chunk_list.clone(),
                archive.header.chunk_size,
                &chunk_dir,
            )?;
            Ok(Arc::new(store))
        }
        other => Err(ClipError::Format(format!(
            "unknown storage type {other:?}"
        ))),
    }
}
