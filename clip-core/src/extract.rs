use std::fs::{self, File};
use std::io::Write;
use std::os::unix::fs::{PermissionsExt, symlink};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use crate::container::archive::ClipArchive;
use crate::error::{ClipError, Result};
use crate::node::NodeKind;
use crate::store::ContentStore;
use crate::store::local::LocalChunkStore;

/// Resolves either an image directory or its `index.clip` to the index
/// file path.
pub fn resolve_index_path(archive: &Path) -> PathBuf {
    if archive.is_dir() {
        archive.join("index.clip")
    } else {
        archive.to_path_buf()
    }
}

fn safe_join(root: &Path, archive_path: &str) -> Result<PathBuf> {
    let rel = archive_path.trim_start_matches('/');
    if rel.split('/').any(|c| c == "..") {
        return Err(ClipError::Format(format!("unsafe path: {archive_path}")));
    }
    Ok(root.join(rel))
}

/// Recreates the archived tree under `dest`: directory structure, file
/// bytes, lower mode bits, and symlink targets.
pub fn extract(archive: &Path, dest: &Path) -> Result<()> {
    let index_path = resolve_index_path(archive);
    let loaded = ClipArchive::load(&index_path)?;
    let chunk_dir = index_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("chunks");
    let store = LocalChunkStore::new(
        loaded.index.clone(),
        loaded.chunk_list.clone(),
        loaded.header.chunk_size,
        &chunk_dir,
    )?;
    let index = Arc::clone(&loaded.index);

    fs::create_dir_all(dest)?;

    // Directories first so files always have a parent; directory modes
    // are applied afterwards in case a mode removes write permission.
    let mut dir_modes: Vec<(PathBuf, u32)> = Vec::new();
    for node in index.iter().filter(|n| n.is_dir()) {
        if node.path == "/" {
            continue;
        }
        let path = safe_join(dest, &node.path)?;
        fs::create_dir_all(&path)?;
        dir_modes.push((path, node.attr.mode & 0o777));
    }

    let mut buf = vec![0u8; 1 << 20];
    for node in index.iter() {
        match node.kind {
            NodeKind::Dir => {}
            NodeKind::Symlink => {
                let path = safe_join(dest, &node.path)?;
                symlink(&node.target, &path)?;
            }
            NodeKind::File => {
                let path = safe_join(dest, &node.path)?;
                let mut out = File::create(&path)?;
                let mut offset: i64 = 0;
                loop {
                    let n = store.read(node, &mut buf, offset)?;
                    if n == 0 {
                        break;
                    }
                    out.write_all(&buf[..n])?;
                    offset += n as i64;
                }
                if offset != node.data_len {
                    return Err(ClipError::Io(std::io::Error::other(format!(
                        "extracted {} of {} bytes for {}",
                        offset, node.data_len, node.path
                    ))));
                }
                fs::set_permissions(&path, fs::Permissions::from_mode(node.attr.mode & 0o777))?;
            }
        }
    }

    for (path, mode) in dir_modes {
        fs::set_permissions(&path, fs::Permissions::from_mode(mode))?;
    }

    info!(dest = %dest.display(), nodes = index.len(), "extracted archive");
    Ok(())
}
