use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::container::archive::write_archive;
use crate::container::chunks::{ChunkList, DEFAULT_CHUNK_SIZE, chunk_name};
use crate::container::header::{ArchiveHeader, STORAGE_TYPE_LOCAL};
use crate::error::{ClipError, Result};
use crate::index::ClipIndex;
use crate::node::DATA_UNSET;
use crate::pack::walker::{InodeGenerator, walk_source};

/// Receives finished chunk files. The local directory sink is the one
/// implemented here; remote destinations (S3) supply their own and get
/// `wait()` called after the last chunk so in-flight uploads can drain.
pub trait ChunkSink {
    fn open_chunk(&mut self, name: &str) -> Result<Box<dyn Write + Send>>;

    fn wait(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Writes chunks into `<dir>/<name>`.
pub struct DirChunkSink {
    dir: PathBuf,
}

impl DirChunkSink {
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }
}

impl ChunkSink for DirChunkSink {
    fn open_chunk(&mut self, name: &str) -> Result<Box<dyn Write + Send>> {
        let file = File::create(self.dir.join(name))?;
        Ok(Box::new(BufWriter::new(file)))
    }
}

/// Splits one logical byte stream across fixed-size chunk files, opening
/// the next chunk exactly when the current one fills. A single file's
/// bytes may cross a chunk boundary.
struct ChunkStreamWriter<'a> {
    sink: &'a mut dyn ChunkSink,
    chunk_size: u64,
    current: Option<Box<dyn Write + Send>>,
    space: u64,
    chunk_list: ChunkList,
}

impl<'a> ChunkStreamWriter<'a> {
    fn new(sink: &'a mut dyn ChunkSink, chunk_size: u64) -> Self {
        Self {
            sink,
            chunk_size,
            current: None,
            space: 0,
            chunk_list: ChunkList::default(),
        }
    }

    fn close_current(&mut self) -> Result<()> {
        if let Some(mut w) = self.current.take() {
            w.flush()?;
        }
        Ok(())
    }

    fn write_all(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            if self.space == 0 {
                self.close_current()?;
            }
            if self.current.is_none() {
                let name = chunk_name(self.chunk_list.len() as u64);
                let w = self.sink.open_chunk(&name)?;
                self.chunk_list.push(name);
                self.space = self.chunk_size;
                self.current = Some(w);
            }
            let take = self.space.min(buf.len() as u64) as usize;
            if let Some(w) = self.current.as_mut() {
                w.write_all(&buf[..take])?;
            }
            self.space -= take as u64;
            buf = &buf[take..];
        }
        Ok(())
    }

    fn finish(mut self) -> Result<ChunkList> {
        self.close_current()?;
        self.sink.wait()?;
        Ok(self.chunk_list)
    }
}

#[derive(Clone, Debug)]
pub struct PackOptions {
    pub chunk_size: u64,
    /// Log each packed file.
    pub verbose: bool,
}

impl Default for PackOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            verbose: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PackSummary {
    pub files: u64,
    pub bytes: u64,
    pub chunks: u64,
}

/// Packs `source` into `<dest>/<image_id>/chunks/*.cblock` plus
/// `<dest>/<image_id>/index.clip`.
pub fn pack(source: &Path, dest: &Path, image_id: &str, opts: &PackOptions) -> Result<PackSummary> {
    if opts.chunk_size == 0 {
        return Err(ClipError::Invariant("chunk size must be non-zero".into()));
    }

    let image_dir = dest.join(image_id);
    let mut sink = DirChunkSink::new(&image_dir.join("chunks"))?;

    let mut index = ClipIndex::new();
    let mut inodes = InodeGenerator::new();
    walk_source(source, &mut index, &mut inodes)?;

    let file_paths: Vec<String> = index
        .iter()
        .filter(|n| n.is_file())
        .map(|n| n.path.clone())
        .collect();

    let mut summary = PackSummary {
        files: file_paths.len() as u64,
        ..Default::default()
    };

    let mut writer = ChunkStreamWriter::new(&mut sink, opts.chunk_size);
    let mut offset: u64 = 0;
    let mut buf = vec![0u8; opts.chunk_size.min(8 * 1024 * 1024) as usize];

    for path in &file_paths {
        let src_path = source.join(path.trim_start_matches('/'));
        let data_pos = offset;
        let mut streamed: u64 = 0;
        let mut hasher = Sha256::new();

        let stream = (|| -> Result<()> {
            let mut src = File::open(&src_path)?;
            loop {
                let n = src.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                writer.write_all(&buf[..n])?;
                streamed += n as u64;
            }
            Ok(())
        })();

        if let Err(e) = stream {
            // No partial archive: the index file is never written.
            if let Some(node) = index.get_mut(path) {
                node.data_pos = DATA_UNSET;
                node.data_len = DATA_UNSET;
            }
            return Err(e);
        }

        if let Some(node) = index.get_mut(path) {
            if streamed != node.attr.size {
                warn!(
                    path = path.as_str(),
                    streamed,
                    expected = node.attr.size,
                    "file size changed during pack"
                );
                node.attr.size = streamed;
            }
            node.data_pos = data_pos as i64;
            node.data_len = streamed as i64;
            node.content_hash = hex::encode(hasher.finalize());
        }
        if opts.verbose {
            info!(path = path.as_str(), bytes = streamed, pos = data_pos, "packed file");
        }
        offset += streamed;
    }

    let chunk_list = writer.finish()?;
    summary.bytes = offset;
    summary.chunks = chunk_list.len() as u64;

    let header = ArchiveHeader::new(opts.chunk_size, STORAGE_TYPE_LOCAL);
    let out = File::create(image_dir.join("index.clip"))?;
    write_archive(BufWriter::new(out), header, &chunk_list, &index, None)?;

    info!(
        image_id,
        files = summary.files,
        bytes = summary.bytes,
        chunks = summary.chunks,
        "packed archive"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    // Chunk bodies land in the shared vec on flush.
    struct SharedSink(Arc<Mutex<Vec<(String, Vec<u8>)>>>);

    struct SharedChunk {
        name: String,
        buf: Vec<u8>,
        out: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    }

    impl Write for SharedChunk {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.buf.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            let mut out = self.out.lock().unwrap();
            out.push((self.name.clone(), std::mem::take(&mut self.buf)));
            Ok(())
        }
    }

    impl ChunkSink for SharedSink {
        fn open_chunk(&mut self, name: &str) -> Result<Box<dyn Write + Send>> {
            Ok(Box::new(SharedChunk {
                name: name.to_string(),
                buf: Vec::new(),
                out: self.0.clone(),
            }))
        }
    }

    #[test]
    fn stream_writer_splits_at_chunk_boundary() {
        let shared = Arc::new(Mutex::new(Vec::new()));
        let mut sink = SharedSink(shared.clone());
        let mut w = ChunkStreamWriter::new(&mut sink, 4);
        w.write_all(b"abcdef").unwrap();
        w.write_all(b"ghij").unwrap();
        let list = w.finish().unwrap();

        assert_eq!(list.chunks, vec!["0.cblock", "1.cblock", "2.cblock"]);
        let chunks = shared.lock().unwrap().clone();
        assert_eq!(chunks[0].1, b"abcd");
        assert_eq!(chunks[1].1, b"efgh");
        assert_eq!(chunks[2].1, b"ij");
    }

    #[test]
    fn empty_stream_produces_no_chunks() {
        let shared = Arc::new(Mutex::new(Vec::new()));
        let mut sink = SharedSink(shared.clone());
        let w = ChunkStreamWriter::new(&mut sink, 4);
        let list = w.finish().unwrap();
        assert!(list.is_empty());
    }
}
