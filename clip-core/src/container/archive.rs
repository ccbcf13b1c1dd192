use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use crate::container::chunks::ChunkList;
use crate::container::header::{
    ArchiveHeader, PRELUDE_LEN, STORAGE_TYPE_OCI, STORAGE_TYPE_S3,
};
use crate::container::storage::{OciStorageInfo, S3StorageInfo};
use crate::error::{ClipError, Result};
use crate::index::ClipIndex;

fn to_cbor<T: serde::Serialize>(value: &T, what: &str) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf)
        .map_err(|e| ClipError::Format(format!("{what} encode: {e}")))?;
    Ok(buf)
}

fn from_cbor<T: serde::de::DeserializeOwned>(bytes: &[u8], what: &str) -> Result<T> {
    ciborium::de::from_reader(bytes)
        .map_err(|e| ClipError::Format(format!("{what} decode: {e}")))
}

/// Serializes `header | chunk_list | index | storage_info` to `out`.
///
/// The header payload records the absolute position of each section, and
/// its own CBOR size depends on those values, so the positions are
/// re-derived until the encoding is stable (integer widths only ever
/// grow, so this converges in a couple of rounds).
pub fn write_archive(
    mut out: impl Write,
    mut header: ArchiveHeader,
    chunk_list: &ChunkList,
    index: &ClipIndex,
    storage_info: Option<&[u8]>,
) -> Result<ArchiveHeader> {
    let chunk_bytes = to_cbor(chunk_list, "chunk list")?;
    let index_bytes = to_cbor(index, "index")?;
    let storage_bytes = storage_info.unwrap_or(&[]);

    header.chunk_list_len = chunk_bytes.len() as u64;
    header.index_len = index_bytes.len() as u64;
    header.storage_info_len = storage_bytes.len() as u64;

    loop {
        let payload = to_cbor(&header, "header payload")?;
        let base = PRELUDE_LEN + payload.len() as u64;
        let chunk_list_pos = base;
        let index_pos = chunk_list_pos + header.chunk_list_len;
        let storage_info_pos = index_pos + header.index_len;
        if header.chunk_list_pos == chunk_list_pos
            && header.index_pos == index_pos
            && header.storage_info_pos == storage_info_pos
        {
            break;
        }
        header.chunk_list_pos = chunk_list_pos;
        header.index_pos = index_pos;
        header.storage_info_pos = storage_info_pos;
    }

    out.write_all(&header.encode()?)?;
    out.write_all(&chunk_bytes)?;
    out.write_all(&index_bytes)?;
    out.write_all(storage_bytes)?;
    out.flush()?;
    Ok(header)
}

/// A fully loaded archive: header, chunk list, index, and the raw storage
/// info section.
pub struct ClipArchive {
    pub header: ArchiveHeader,
    pub chunk_list: ChunkList,
    pub index: Arc<ClipIndex>,
    storage_info: Vec<u8>,
}

impl ClipArchive {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mut r = BufReader::new(file);
        let header = ArchiveHeader::decode(&mut r)?;

        let mut section = |pos: u64, len: u64| -> Result<Vec<u8>> {
            r.seek(SeekFrom::Start(pos))?;
            let mut buf = vec![0u8; len as usize];
            r.read_exact(&mut buf)?;
            Ok(buf)
        };

        let chunk_bytes = section(header.chunk_list_pos, header.chunk_list_len)?;
        let index_bytes = section(header.index_pos, header.index_len)?;
        let storage_info = section(header.storage_info_pos, header.storage_info_len)?;

        let chunk_list: ChunkList = from_cbor(&chunk_bytes, "chunk list")?;
        let index: ClipIndex = from_cbor(&index_bytes, "index")?;

        Ok(Self {
            header,
            chunk_list,
            index: Arc::new(index),
            storage_info,
        })
    }

    pub fn storage_type(&self) -> &str {
        self.header.storage_type()
    }

    pub fn oci_storage_info(&self) -> Result<OciStorageInfo> {
        if self.storage_type() != STORAGE_TYPE_OCI {
            return Err(ClipError::Format(format!(
                "archive storage type is {:?}, not oci",
                self.storage_type()
            )));
        }
        from_cbor(&self.storage_info, "oci storage info")
    }

    pub fn s3_storage_info(&self) -> Result<S3StorageInfo> {
        if self.storage_type() != STORAGE_TYPE_S3 {
            return Err(ClipError::Format(format!(
                "archive storage type is {:?}, not s3",
                self.storage_type()
            )));
        }
        from_cbor(&self.storage_info, "s3 storage info")
    }
}
