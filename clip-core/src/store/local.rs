use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::warn;

use crate::container::chunks::{ChunkList, map_range};
use crate::error::{ClipError, Result};
use crate::index::ClipIndex;
use crate::node::ClipNode;
use crate::store::{ContentStore, local_ref, offset_to_u64};

/// V2 store reading from chunk files on local disk.
pub struct LocalChunkStore {
    index: Arc<ClipIndex>,
    chunk_names: Vec<String>,
    chunk_size: u64,
    chunk_dir: PathBuf,
}

impl LocalChunkStore {
    pub fn new(
        index: Arc<ClipIndex>,
        chunk_list: ChunkList,
        chunk_size: u64,
        chunk_dir: &Path,
    ) -> Result<Self> {
        if chunk_size == 0 {
            return Err(ClipError::Format("archive chunk size is zero".into()));
        }
        Ok(Self {
            index,
            chunk_names: chunk_list.chunks,
            chunk_size,
            chunk_dir: chunk_dir.to_path_buf(),
        })
    }
}

impl ContentStore for LocalChunkStore {
    fn read(&self, node: &ClipNode, buf: &mut [u8], offset: i64) -> Result<usize> {
        let offset = offset_to_u64(offset)?;
        let (data_pos, data_len) = local_ref(node)?;
        if offset >= data_len || buf.is_empty() {
            return Ok(0);
        }

        let read_len = (buf.len() as u64).min(data_len - offset);
        let start = data_pos + offset;
        let mut total = 0usize;

        // One descriptor per chunk, closed before the next opens.
        for piece in map_range(start, start + read_len, self.chunk_size) {
            let name = self.chunk_names.get(piece.index as usize).ok_or_else(|| {
                ClipError::Invariant(format!(
                    "chunk index {} out of range for {}",
                    piece.index, node.path
                ))
            })?;
            let mut file = File::open(self.chunk_dir.join(name))?;
            file.seek(SeekFrom::Start(piece.offset))?;

            let want = piece.len as usize;
            let mut got = 0usize;
            while got < want {
                let n = file.read(&mut buf[total + got..total + want])?;
                if n == 0 {
                    break;
                }
                got += n;
            }
            total += got;
            if got < want {
                warn!(
                    chunk = name.as_str(),
                    got,
                    want,
                    path = node.path.as_str(),
                    "short read from chunk file"
                );
                break;
            }
        }
        Ok(total)
    }

    fn metadata(&self) -> Arc<ClipIndex> {
        self.index.clone()
    }

    fn cached_locally(&self) -> bool {
        true
    }
}
