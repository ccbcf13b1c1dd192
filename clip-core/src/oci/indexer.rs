use std::io::{self, Read};
use std::path::Path;

use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use tar::EntryType;
use tracing::{debug, info, warn};

use crate::container::archive::write_archive;
use crate::container::chunks::ChunkList;
use crate::container::header::{ArchiveHeader, STORAGE_TYPE_OCI};
use crate::container::storage::{GzipIndex, OciStorageInfo};
use crate::error::{ClipError, Result};
use crate::index::ClipIndex;
use crate::node::{ClipNode, NodeAttr, NodeKind, RemoteRef, Timespec};
use crate::oci::registry::{ImageRef, LayerSource, RegistryClient};
use crate::oci::zran::CheckpointingDecoder;
use crate::pack::walker::InodeGenerator;

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

#[derive(Clone, Debug, Default)]
pub struct IndexOptions {
    /// Distance between gzip checkpoints in MiB of uncompressed bytes;
    /// None disables checkpointing.
    pub checkpoint_interval_mib: Option<u64>,
}

/// What one applied layer contributed.
pub struct AppliedLayer {
    pub decompressed_hash: String,
    pub gzip_index: Option<GzipIndex>,
    pub entries: u64,
}

enum LayerDecoder<R: Read> {
    Plain(GzDecoder<R>),
    Checkpointed(CheckpointingDecoder<R>),
}

impl<R: Read> Read for LayerDecoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            LayerDecoder::Plain(r) => r.read(buf),
            LayerDecoder::Checkpointed(r) => r.read(buf),
        }
    }
}

/// Counts and hashes everything read through it; the result is the
/// layer's decompressed hash, the stable cross-image cache key.
pub(crate) struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
    count: u64,
}

impl<R: Read> HashingReader<R> {
    pub(crate) fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            count: 0,
        }
    }

    pub(crate) fn finalize(self) -> (String, u64, R) {
        (hex::encode(self.hasher.finalize()), self.count, self.inner)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.count += n as u64;
        Ok(n)
    }
}

/// Collapses a tar entry path to a clean absolute archive path.
/// Returns None for paths that escape the root or normalize to nothing.
fn clean_tar_path(raw: &Path) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    for comp in raw.components() {
        match comp {
            std::path::Component::Normal(c) => parts.push(c.to_str()?),
            std::path::Component::CurDir | std::path::Component::RootDir => {}
            std::path::Component::ParentDir | std::path::Component::Prefix(_) => return None,
        }
    }
    if parts.is_empty() {
        Some("/".to_string())
    } else {
        Some(format!("/{}", parts.join("/")))
    }
}

fn split_parent(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(0) => ("", &path[1..]),
        Some(i) => (&path[..i], &path[i + 1..]),
        None => ("", path),
    }
}

fn tar_attr(header: &tar::Header, kind: NodeKind, size: u64) -> NodeAttr {
    let perm = header.mode().unwrap_or(0o644) & 0o7777;
    let type_bits = match kind {
        NodeKind::Dir => libc::S_IFDIR,
        NodeKind::File => libc::S_IFREG,
        NodeKind::Symlink => libc::S_IFLNK,
    };
    let mtime = header.mtime().unwrap_or(0) as i64;
    NodeAttr {
        ino: 0,
        size,
        blocks: size.div_ceil(512),
        blksize: 4096,
        mode: type_bits | perm,
        nlink: 1,
        uid: header.uid().unwrap_or(0) as u32,
        gid: header.gid().unwrap_or(0) as u32,
        atime: Timespec::new(mtime, 0),
        mtime: Timespec::new(mtime, 0),
        ctime: Timespec::new(mtime, 0),
    }
}

/// Inserts a node, keeping the inode of any lower-layer entry it
/// replaces so overrides do not renumber the tree.
fn insert_node(index: &mut ClipIndex, inodes: &mut InodeGenerator, mut node: ClipNode) {
    node.attr.ino = match index.get(&node.path) {
        Some(existing) => existing.attr.ino,
        None => inodes.next(),
    };
    index.insert(node);
}

/// Applies one gzipped tar layer to the index: whiteouts first, then
/// layer-override inserts with `(layer_digest, u_offset, u_length)`
/// remote refs for regular files.
pub fn apply_layer(
    index: &mut ClipIndex,
    inodes: &mut InodeGenerator,
    layer_digest: &str,
    compressed: impl Read,
    opts: &IndexOptions,
) -> Result<AppliedLayer> {
    let decoder = match opts.checkpoint_interval_mib {
        Some(mib) => LayerDecoder::Checkpointed(CheckpointingDecoder::new(
            compressed,
            mib.max(1) * 1024 * 1024,
        )?),
        None => LayerDecoder::Plain(GzDecoder::new(compressed)),
    };
    let mut archive = tar::Archive::new(HashingReader::new(decoder));
    let mut entries = 0u64;

    for entry in archive.entries()? {
        let entry = entry.map_err(|e| ClipError::Decompress(format!("layer tar: {e}")))?;
        let Some(path) = clean_tar_path(&entry.path()?) else {
            warn!(layer = layer_digest, "skipping unnormalizable tar path");
            continue;
        };
        entries += 1;

        let (parent, base) = split_parent(&path);

        // Whiteouts are consumed before normal processing; the index
        // never contains a `.wh.*` entry.
        if base == OPAQUE_WHITEOUT {
            // Clears the directory's children only. At the root the
            // prefix "/" would also match the "/" node itself, which
            // must survive, so it is lifted out and restored.
            let root = if parent.is_empty() { index.delete("/") } else { None };
            let removed = index.delete_prefix(&format!("{parent}/"));
            if let Some(root) = root {
                index.insert(root);
            }
            debug!(parent, removed, "opaque whiteout");
            continue;
        }
        if let Some(victim) = base.strip_prefix(WHITEOUT_PREFIX) {
            if victim.is_empty() {
                warn!(path = path.as_str(), "whiteout with empty victim name ignored");
                continue;
            }
            let target = format!("{parent}/{victim}");
            index.delete(&target);
            index.delete_prefix(&format!("{target}/"));
            debug!(target = target.as_str(), "whiteout");
            continue;
        }

        let header = entry.header();
        match header.entry_type() {
            EntryType::Directory => {
                let node = ClipNode::new(path, NodeKind::Dir, tar_attr(header, NodeKind::Dir, 0));
                insert_node(index, inodes, node);
            }
            EntryType::Regular | EntryType::Continuous | EntryType::GNUSparse => {
                let size = entry.size();
                let mut node =
                    ClipNode::new(path, NodeKind::File, tar_attr(header, NodeKind::File, size));
                node.remote_ref = Some(RemoteRef {
                    layer_digest: layer_digest.to_string(),
                    offset: entry.raw_file_position(),
                    length: size,
                });
                insert_node(index, inodes, node);
            }
            EntryType::Symlink => {
                let target = header
                    .link_name()?
                    .map(|t| t.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let mut node =
                    ClipNode::new(path, NodeKind::Symlink, tar_attr(header, NodeKind::Symlink, 0));
                node.target = target;
                insert_node(index, inodes, node);
            }
            EntryType::Link => {
                // Hard link: point at the linked file's bytes.
                let Some(link) = header.link_name()? else {
                    warn!(path = path.as_str(), "hard link without target skipped");
                    continue;
                };
                let Some(target_path) = clean_tar_path(&link) else {
                    warn!(path = path.as_str(), "hard link with unnormalizable target skipped");
                    continue;
                };
                let Some(target) = index.get(&target_path).cloned() else {
                    warn!(path = path.as_str(), target = target_path.as_str(), "hard link target not in index");
                    continue;
                };
                let mut node = ClipNode::new(
                    path,
                    NodeKind::File,
                    tar_attr(header, NodeKind::File, target.attr.size),
                );
                node.remote_ref = target.remote_ref.clone();
                node.content_hash = target.content_hash.clone();
                insert_node(index, inodes, node);
            }
            other => {
                debug!(path = path.as_str(), ?other, "skipping unsupported tar entry type");
            }
        }
    }

    // The tar reader stops at the end-of-archive marker; drain the rest
    // so the decompressed hash covers the entire layer, matching the
    // file a full decompression produces.
    let mut hashing = archive.into_inner();
    io::copy(&mut hashing, &mut io::sink())?;

    let (decompressed_hash, total, decoder) = hashing.finalize();
    debug!(layer = layer_digest, bytes = total, entries, "applied layer");

    let gzip_index = match decoder {
        LayerDecoder::Checkpointed(d) => Some(d.into_index()),
        LayerDecoder::Plain(_) => None,
    };
    Ok(AppliedLayer {
        decompressed_hash,
        gzip_index,
        entries,
    })
}

/// Creates an index with a root directory node (ino 1).
pub fn new_root_index(inodes: &mut InodeGenerator) -> ClipIndex {
    let mut index = ClipIndex::new();
    let attr = NodeAttr {
        ino: inodes.next(),
        mode: libc::S_IFDIR | 0o755,
        nlink: 2,
        blksize: 4096,
        ..Default::default()
    };
    index.insert(ClipNode::new("/".to_string(), NodeKind::Dir, attr));
    index
}

/// Indexes a remote image: resolves its layers, applies them bottom to
/// top, and returns the index plus the storage info to embed.
pub fn index_image(image: &str, opts: &IndexOptions) -> Result<(ClipIndex, OciStorageInfo)> {
    let image_ref = ImageRef::parse(image)?;
    let client = RegistryClient::new(&image_ref.registry, &image_ref.repository)?;
    let layers = client.resolve_layers(&image_ref.reference)?;
    info!(image, layers = layers.len(), "indexing image");

    let mut inodes = InodeGenerator::new();
    let mut index = new_root_index(&mut inodes);
    let mut info = OciStorageInfo {
        registry: client.registry_url().to_string(),
        repository: image_ref.repository.clone(),
        reference: image_ref.reference.clone(),
        ..Default::default()
    };

    for layer in &layers {
        let blob = client.open_layer(&layer.digest)?;
        let applied = apply_layer(&mut index, &mut inodes, &layer.digest, blob, opts)?;
        info.layers.push(layer.digest.clone());
        info.decompressed_hash
            .insert(layer.digest.clone(), applied.decompressed_hash);
        if let Some(gzip_index) = applied.gzip_index {
            info.gzip_index.insert(layer.digest.clone(), gzip_index);
        }
    }
    Ok((index, info))
}

/// Indexes `image` and writes the metadata-only archive (header + index
/// + storage info; no data blocks) to `output`.
pub fn index_image_to_file(image: &str, output: &Path, opts: &IndexOptions) -> Result<()> {
    let (index, info) = index_image(image, opts)?;

    let mut storage_bytes = Vec::new();
    ciborium::ser::into_writer(&info, &mut storage_bytes)
        .map_err(|e| ClipError::Format(format!("oci storage info encode: {e}")))?;

    let header = ArchiveHeader::new(0, STORAGE_TYPE_OCI);
    let out = std::fs::File::create(output)?;
    write_archive(
        std::io::BufWriter::new(out),
        header,
        &ChunkList::default(),
        &index,
        Some(&storage_bytes),
    )?;
    info!(image, output = %output.display(), nodes = index.len(), "wrote oci archive");
    Ok(())
}
