use serde::{Deserialize, Serialize};

/// Marks `data_pos`/`data_len` as unset.
pub const DATA_UNSET: i64 = -1;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    Dir,
    File,
    Symlink,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: u32,
}

impl Timespec {
    pub fn new(sec: i64, nsec: u32) -> Self {
        Self { sec, nsec }
    }
}

/// POSIX-ish file attributes carried by every node.
///
/// Inode numbers are remapped by the packer/indexer; the on-disk values of
/// the source filesystem are not portable and never stored.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAttr {
    pub ino: u64,
    pub size: u64,
    pub blocks: u64,
    pub blksize: u32,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: Timespec,
    pub mtime: Timespec,
    pub ctime: Timespec,
}

/// Location of a file's bytes inside an OCI layer: the digest of the
/// compressed layer blob plus the position within its uncompressed tar
/// stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRef {
    pub layer_digest: String,
    pub offset: u64,
    pub length: u64,
}

/// One entry per path in the archive.
///
/// File nodes carry exactly one of `data_pos`/`data_len` (V2, offset into
/// the concatenated chunk stream) or `remote_ref` (OCI). Dir and Symlink
/// nodes carry neither.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClipNode {
    pub path: String,
    pub kind: NodeKind,
    pub attr: NodeAttr,
    pub target: String,
    pub data_pos: i64,
    pub data_len: i64,
    pub remote_ref: Option<RemoteRef>,
    pub content_hash: String,
}

impl ClipNode {
    pub fn new(path: String, kind: NodeKind, attr: NodeAttr) -> Self {
        Self {
            path,
            kind,
            attr,
            target: String::new(),
            data_pos: DATA_UNSET,
            data_len: DATA_UNSET,
            remote_ref: None,
            content_hash: String::new(),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Dir
    }

    pub fn is_file(&self) -> bool {
        self.kind == NodeKind::File
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == NodeKind::Symlink
    }

    pub fn has_local_data(&self) -> bool {
        self.data_pos >= 0 && self.data_len >= 0
    }

    /// Logical file size as recorded by whichever ref is set.
    pub fn data_size(&self) -> u64 {
        if let Some(r) = &self.remote_ref {
            r.length
        } else if self.has_local_data() {
            self.data_len as u64
        } else {
            0
        }
    }

    /// Last path component ("/" for the root).
    pub fn name(&self) -> &str {
        match self.path.rfind('/') {
            Some(i) if i + 1 < self.path.len() => &self.path[i + 1..],
            _ => &self.path,
        }
    }
}
