use std::collections::{HashMap, HashSet};
use std::ffi::OsStr;
use std::io::Read;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, UNIX_EPOCH};

use fuser::{FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyData, ReplyDirectory, ReplyEntry};
use tracing::{debug, warn};

use crate::cache::remote::{ChunkStream, ContentCache};
use crate::container::archive::ClipArchive;
use crate::error::Result;
use crate::index::ClipIndex;
use crate::node::{ClipNode, NodeKind, Timespec};
use crate::store::{ContentStore, StoreOptions, new_content_store};

const TTL: Duration = Duration::from_secs(1);

fn system_time(t: Timespec) -> std::time::SystemTime {
    if t.sec >= 0 {
        UNIX_EPOCH + Duration::new(t.sec as u64, t.nsec)
    } else {
        UNIX_EPOCH
    }
}

fn file_type(kind: NodeKind) -> FileType {
    match kind {
        NodeKind::Dir => FileType::Directory,
        NodeKind::File => FileType::RegularFile,
        NodeKind::Symlink => FileType::Symlink,
    }
}

fn file_attr(node: &ClipNode) -> FileAttr {
    let a = &node.attr;
    FileAttr {
        ino: a.ino,
        size: a.size,
        blocks: a.blocks,
        atime: system_time(a.atime),
        mtime: system_time(a.mtime),
        ctime: system_time(a.ctime),
        crtime: system_time(a.ctime),
        kind: file_type(node.kind),
        perm: (a.mode & 0o7777) as u16,
        nlink: a.nlink.max(1),
        uid: a.uid,
        gid: a.gid,
        rdev: 0,
        blksize: if a.blksize == 0 { 4096 } else { a.blksize },
        flags: 0,
    }
}

fn mode_to_file_type(mode: u32) -> FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        _ => FileType::RegularFile,
    }
}

fn join_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

/// Reads a whole file through the store, for background cache fills.
struct StoreFileReader {
    store: Arc<dyn ContentStore>,
    node: ClipNode,
    pos: i64,
}

impl Read for StoreFileReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self
            .store
            .read(&self.node, buf, self.pos)
            .map_err(std::io::Error::other)?;
        self.pos += n as i64;
        Ok(n)
    }
}

/// Read-only FUSE view over the archive index and its content store.
pub struct ClipFileSystem {
    index: Arc<ClipIndex>,
    store: Arc<dyn ContentStore>,
    content_cache: Option<Arc<dyn ContentCache>>,
    paths_by_ino: HashMap<u64, String>,
    lookup_cache: RwLock<HashMap<String, (u64, FileAttr)>>,
    /// Content hashes with a cache fill already in flight.
    filling: Arc<Mutex<HashSet<String>>>,
    total_blocks: u64,
}

impl ClipFileSystem {
    pub fn new(
        store: Arc<dyn ContentStore>,
        content_cache: Option<Arc<dyn ContentCache>>,
    ) -> Self {
        let index = store.metadata();
        let mut paths_by_ino = HashMap::with_capacity(index.len());
        let mut total_blocks = 0u64;
        for node in index.iter() {
            paths_by_ino.insert(node.attr.ino, node.path.clone());
            total_blocks += node.attr.blocks;
        }
        Self {
            index,
            store,
            content_cache,
            paths_by_ino,
            lookup_cache: RwLock::new(HashMap::new()),
            filling: Arc::new(Mutex::new(HashSet::new())),
            total_blocks,
        }
    }

    fn node_by_ino(&self, ino: u64) -> Option<&ClipNode> {
        if ino == fuser::FUSE_ROOT_ID {
            return self.index.get("/");
        }
        let path = self.paths_by_ino.get(&ino)?;
        self.index.get(path)
    }

    /// Streams the whole file into the remote cache from a detached
    /// thread; the triggering read never waits on it.
    fn spawn_cache_fill(&self, node: &ClipNode) {
        let Some(cache) = self.content_cache.clone() else {
            return;
        };
        let hash = node.content_hash.clone();
        {
            let Ok(mut filling) = self.filling.lock() else {
                return;
            };
            if !filling.insert(hash.clone()) {
                return;
            }
        }
        let filling = self.filling.clone();
        let reader = StoreFileReader {
            store: self.store.clone(),
            node: node.clone(),
            pos: 0,
        };
        thread::spawn(move || {
            let mut chunks = ChunkStream::new(reader);
            match cache.store(&mut chunks, &hash, &Default::default()) {
                Ok(stored) => debug!(key = stored.as_str(), "file cached remotely"),
                Err(e) => warn!(key = hash.as_str(), error = %e, "background cache fill failed"),
            }
            if let Ok(mut filling) = filling.lock() {
                filling.remove(&hash);
            }
        });
    }

    fn reply_entry(&self, path: &str, reply: ReplyEntry) {
        if let Ok(cache) = self.lookup_cache.read()
            && let Some((_, attr)) = cache.get(path)
        {
            reply.entry(&TTL, attr, 0);
            return;
        }
        match self.index.get(path) {
            Some(node) => {
                let attr = file_attr(node);
                if let Ok(mut cache) = self.lookup_cache.write() {
                    cache.insert(path.to_string(), (attr.ino, attr));
                }
                reply.entry(&TTL, &attr, 0);
            }
            None => reply.error(libc::ENOENT),
        }
    }
}

impl Filesystem for ClipFileSystem {
    fn lookup(&mut self, _req: &fuser::Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(parent_node) = self.node_by_ino(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = join_path(&parent_node.path, name);
        self.reply_entry(&path, reply);
    }

    fn getattr(&mut self, _req: &fuser::Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.node_by_ino(ino) {
            Some(node) => reply.attr(&TTL, &file_attr(node)),
            None => reply.error(libc::ENOENT),
        }
    }

    fn readlink(&mut self, _req: &fuser::Request<'_>, ino: u64, reply: ReplyData) {
        match self.node_by_ino(ino) {
            Some(node) if node.is_symlink() => reply.data(node.target.as_bytes()),
            Some(_) => reply.error(libc::EINVAL),
            None => reply.error(libc::ENOENT),
        }
    }

    fn open(&mut self, _req: &fuser::Request<'_>, _ino: u64, _flags: i32, reply: fuser::ReplyOpen) {
        reply.opened(0, 0);
    }

    fn opendir(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        _flags: i32,
        reply: fuser::ReplyOpen,
    ) {
        reply.opened(0, 0);
    }

    fn read(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(node) = self.node_by_ino(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        if !node.is_file() {
            reply.error(libc::EINVAL);
            return;
        }
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }

        let data_len = node.data_size();
        if data_len == 0 || offset as u64 >= data_len {
            reply.data(&[]);
            return;
        }
        let read_len = (size as u64).min(data_len - offset as u64) as usize;
        let mut buf = vec![0u8; read_len];

        // Content-cache fast path for stores that are not already local.
        if let Some(cache) = &self.content_cache
            && !node.content_hash.is_empty()
            && !self.store.cached_locally()
        {
            match cache.get(
                &node.content_hash,
                offset as u64,
                read_len as u64,
                &Default::default(),
            ) {
                Ok(bytes) if bytes.len() == read_len => {
                    reply.data(&bytes);
                    return;
                }
                Ok(_) | Err(_) => {
                    let node = node.clone();
                    self.spawn_cache_fill(&node);
                }
            }
        }

        let node = node.clone();
        match self.store.read(&node, &mut buf, offset) {
            Ok(n) => reply.data(&buf[..n]),
            Err(e) => {
                warn!(path = node.path.as_str(), error = %e, "read failed");
                reply.error(e.errno());
            }
        }
    }

    fn readdir(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(node) = self.node_by_ino(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        if !node.is_dir() {
            reply.error(libc::ENOTDIR);
            return;
        }
        let dir_path = node.path.clone();

        let parent_ino = self
            .index
            .get(parent_path(&dir_path))
            .map(|n| n.attr.ino)
            .unwrap_or(fuser::FUSE_ROOT_ID);

        let mut entries: Vec<(u64, FileType, String)> = vec![
            (node.attr.ino, FileType::Directory, ".".to_string()),
            (parent_ino, FileType::Directory, "..".to_string()),
        ];
        for child in self.index.list_dir(&dir_path) {
            let ino = self
                .index
                .get(&join_path(&dir_path, &child.name))
                .map(|n| n.attr.ino)
                .unwrap_or(0);
            if ino == 0 {
                continue;
            }
            entries.push((ino, mode_to_file_type(child.mode), child.name));
        }

        for (i, (ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            if reply.add(ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &fuser::Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        reply.statfs(
            self.total_blocks,
            0,
            0,
            self.index.len() as u64,
            0,
            4096,
            255,
            4096,
        );
    }

    // The mount is read-only; every mutating operation fails with EROFS.

    fn mkdir(
        &mut self,
        _req: &fuser::Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        reply.error(libc::EROFS);
    }

    fn mknod(
        &mut self,
        _req: &fuser::Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        reply.error(libc::EROFS);
    }

    fn unlink(
        &mut self,
        _req: &fuser::Request<'_>,
        _parent: u64,
        _name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        reply.error(libc::EROFS);
    }

    fn rmdir(
        &mut self,
        _req: &fuser::Request<'_>,
        _parent: u64,
        _name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        reply.error(libc::EROFS);
    }

    fn rename(
        &mut self,
        _req: &fuser::Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _newparent: u64,
        _newname: &OsStr,
        _flags: u32,
        reply: fuser::ReplyEmpty,
    ) {
        reply.error(libc::EROFS);
    }

    fn symlink(
        &mut self,
        _req: &fuser::Request<'_>,
        _parent: u64,
        _link_name: &OsStr,
        _target: &Path,
        reply: ReplyEntry,
    ) {
        reply.error(libc::EROFS);
    }

    fn link(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        _newparent: u64,
        _newname: &OsStr,
        reply: ReplyEntry,
    ) {
        reply.error(libc::EROFS);
    }

    fn create(
        &mut self,
        _req: &fuser::Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: fuser::ReplyCreate,
    ) {
        reply.error(libc::EROFS);
    }

    fn write(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        _fh: u64,
        _offset: i64,
        _data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyWrite,
    ) {
        reply.error(libc::EROFS);
    }

    fn setattr(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        _size: Option<u64>,
        _atime: Option<fuser::TimeOrNow>,
        _mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<std::time::SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<std::time::SystemTime>,
        _chgtime: Option<std::time::SystemTime>,
        _bkuptime: Option<std::time::SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        reply.error(libc::EROFS);
    }
}

/// Loads the archive, builds the matching store, and mounts it
/// read-only at `mountpoint` until unmounted.
pub fn mount(archive_path: &Path, mountpoint: &Path, opts: &StoreOptions) -> Result<()> {
    let archive = ClipArchive::load(archive_path)?;
    let store = new_content_store(&archive, archive_path, opts)?;
    let fs = ClipFileSystem::new(store, opts.content_cache.clone());

    let options = [
        MountOption::RO,
        MountOption::FSName("clip".to_string()),
        MountOption::DefaultPermissions,
        MountOption::AutoUnmount,
    ];
    fuser::mount2(fs, mountpoint, &options)?;
    Ok(())
}
