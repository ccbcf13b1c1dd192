use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use tracing::warn;
use walkdir::WalkDir;

use crate::error::Result;
use crate::index::ClipIndex;
use crate::node::{ClipNode, NodeAttr, NodeKind, Timespec};

/// Hands out archive inode numbers. Source-filesystem inode values are
/// not portable, so every node gets a fresh one, starting at 1 for the
/// root.
#[derive(Debug, Default)]
pub struct InodeGenerator {
    next: u64,
}

impl InodeGenerator {
    pub fn new() -> Self {
        Self { next: 0 }
    }

    pub fn next(&mut self) -> u64 {
        self.next += 1;
        self.next
    }
}

pub fn attr_from_metadata(ino: u64, md: &fs::Metadata) -> NodeAttr {
    NodeAttr {
        ino,
        size: md.len(),
        blocks: md.blocks(),
        blksize: md.blksize() as u32,
        mode: md.mode(),
        nlink: md.nlink() as u32,
        uid: md.uid(),
        gid: md.gid(),
        atime: Timespec::new(md.atime(), md.atime_nsec() as u32),
        mtime: Timespec::new(md.mtime(), md.mtime_nsec() as u32),
        ctime: Timespec::new(md.ctime(), md.ctime_nsec() as u32),
    }
}

/// Walks `source` in sorted order and fills `index` with one node per
/// entry. Regular files, directories and symlinks are kept; anything
/// else (sockets, fifos, devices) is skipped with a warning.
pub fn walk_source(source: &Path, index: &mut ClipIndex, inodes: &mut InodeGenerator) -> Result<()> {
    for entry in WalkDir::new(source)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| std::io::Error::other(e))?;
        let path = entry.path();

        // lstat: walkdir does not follow links, so symlinks describe
        // themselves rather than their targets.
        let md = entry.metadata().map_err(|e| std::io::Error::other(e))?;

        let kind = if entry.file_type().is_dir() {
            NodeKind::Dir
        } else if entry.file_type().is_symlink() {
            NodeKind::Symlink
        } else if entry.file_type().is_file() {
            NodeKind::File
        } else {
            warn!(path = %path.display(), "skipping unsupported file type");
            continue;
        };

        let rel = path
            .strip_prefix(source)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let archive_path = if rel.is_empty() {
            "/".to_string()
        } else {
            format!("/{rel}")
        };

        let mut node = ClipNode::new(archive_path, kind, attr_from_metadata(inodes.next(), &md));
        if kind == NodeKind::Symlink {
            node.target = fs::read_link(path)?.to_string_lossy().into_owned();
        }
        index.insert(node);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    #[test]
    fn walk_builds_remapped_tree() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        fs::write(dir.path().join("sub/b.txt"), b"world").unwrap();
        symlink("a.txt", dir.path().join("l")).unwrap();

        let mut index = ClipIndex::new();
        let mut inodes = InodeGenerator::new();
        walk_source(dir.path(), &mut index, &mut inodes).unwrap();

        assert_eq!(index.len(), 5);
        let root = index.get("/").unwrap();
        assert_eq!(root.attr.ino, 1);
        assert!(root.is_dir());

        let a = index.get("/a.txt").unwrap();
        assert!(a.is_file());
        assert_eq!(a.attr.size, 5);

        let l = index.get("/l").unwrap();
        assert!(l.is_symlink());
        assert_eq!(l.target, "a.txt");

        assert!(index.get("/sub/b.txt").unwrap().is_file());

        // All inodes are fresh and unique.
        let mut inos: Vec<u64> = index.iter().map(|n| n.attr.ino).collect();
        inos.sort_unstable();
        inos.dedup();
        assert_eq!(inos.len(), 5);
    }
}
