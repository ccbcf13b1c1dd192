use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::error::{ClipError, Result};

pub const MAGIC: [u8; 9] = [0x89, b'C', b'L', b'I', b'P', 0x0D, 0x0A, 0x1A, 0x0A];
pub const FORMAT_V2: u8 = 0x02;

/// Fixed prelude: magic + format version + 8-byte LE payload length.
pub const PRELUDE_LEN: u64 = MAGIC.len() as u64 + 1 + 8;

/// Refuse header payloads larger than this (bomb guard).
pub const MAX_PAYLOAD_LEN: u64 = 1 << 30;

pub const STORAGE_TYPE_LEN: usize = 12;
pub const STORAGE_TYPE_LOCAL: &str = "local";
pub const STORAGE_TYPE_S3: &str = "s3";
pub const STORAGE_TYPE_OCI: &str = "oci";

/// Archive header payload.
///
/// The payload is CBOR, so fields stay self-describing across versions;
/// the length prefix in front of it is what guarantees an old reader can
/// still skip a newer payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveHeader {
    pub version: u8,
    pub chunk_list_pos: u64,
    pub chunk_list_len: u64,
    pub index_pos: u64,
    pub index_len: u64,
    pub storage_info_pos: u64,
    pub storage_info_len: u64,
    pub storage_info_type: [u8; STORAGE_TYPE_LEN],
    pub chunk_size: u64,
}

impl ArchiveHeader {
    pub fn new(chunk_size: u64, storage_type: &str) -> Self {
        Self {
            version: FORMAT_V2,
            chunk_list_pos: 0,
            chunk_list_len: 0,
            index_pos: 0,
            index_len: 0,
            storage_info_pos: 0,
            storage_info_len: 0,
            storage_info_type: encode_storage_type(storage_type),
            chunk_size,
        }
    }

    pub fn storage_type(&self) -> &str {
        let end = self
            .storage_info_type
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(STORAGE_TYPE_LEN);
        std::str::from_utf8(&self.storage_info_type[..end]).unwrap_or("")
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        ciborium::ser::into_writer(self, &mut payload)
            .map_err(|e| ClipError::Format(format!("header payload encode: {e}")))?;

        let mut out = Vec::with_capacity(PRELUDE_LEN as usize + payload.len());
        out.extend_from_slice(&MAGIC);
        out.push(self.version);
        out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    pub fn decode(mut r: impl Read) -> Result<Self> {
        let mut magic = [0u8; MAGIC.len()];
        r.read_exact(&mut magic)?;
        if magic != MAGIC {
            return Err(ClipError::Format("bad archive magic".into()));
        }

        let mut version = [0u8; 1];
        r.read_exact(&mut version)?;
        if version[0] != FORMAT_V2 {
            return Err(ClipError::Format(format!(
                "unknown format version {:#04x}",
                version[0]
            )));
        }

        let mut len = [0u8; 8];
        r.read_exact(&mut len)?;
        let payload_len = u64::from_le_bytes(len);
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(ClipError::Format(format!(
                "header payload length {payload_len} exceeds {MAX_PAYLOAD_LEN}"
            )));
        }

        let mut payload = vec![0u8; payload_len as usize];
        r.read_exact(&mut payload)?;

        let header: ArchiveHeader = ciborium::de::from_reader(&payload[..])
            .map_err(|e| ClipError::Format(format!("header payload decode: {e}")))?;
        if header.version != version[0] {
            return Err(ClipError::Format(
                "header payload version disagrees with prelude".into(),
            ));
        }
        Ok(header)
    }
}

fn encode_storage_type(s: &str) -> [u8; STORAGE_TYPE_LEN] {
    let mut tag = [0u8; STORAGE_TYPE_LEN];
    let bytes = s.as_bytes();
    let n = bytes.len().min(STORAGE_TYPE_LEN);
    tag[..n].copy_from_slice(&bytes[..n]);
    tag
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let mut h = ArchiveHeader::new(32 * 1024 * 1024, STORAGE_TYPE_LOCAL);
        h.chunk_list_pos = 100;
        h.chunk_list_len = 17;
        h.index_pos = 117;
        h.index_len = 9000;
        let bytes = h.encode().unwrap();
        assert_eq!(&bytes[..9], &MAGIC);
        assert_eq!(bytes[9], FORMAT_V2);
        let back = ArchiveHeader::decode(&bytes[..]).unwrap();
        assert_eq!(back, h);
        assert_eq!(back.storage_type(), "local");
    }

    #[test]
    fn bad_magic_rejected() {
        let h = ArchiveHeader::new(0, STORAGE_TYPE_OCI);
        let mut bytes = h.encode().unwrap();
        bytes[0] = 0x00;
        assert!(matches!(
            ArchiveHeader::decode(&bytes[..]),
            Err(ClipError::Format(_))
        ));
    }

    #[test]
    fn unknown_version_rejected() {
        let h = ArchiveHeader::new(0, STORAGE_TYPE_OCI);
        let mut bytes = h.encode().unwrap();
        bytes[9] = 0x7f;
        assert!(matches!(
            ArchiveHeader::decode(&bytes[..]),
            Err(ClipError::Format(_))
        ));
    }

    #[test]
    fn oversized_length_prefix_rejected() {
        let h = ArchiveHeader::new(0, STORAGE_TYPE_OCI);
        let mut bytes = h.encode().unwrap();
        bytes[10..18].copy_from_slice(&(MAX_PAYLOAD_LEN + 1).to_le_bytes());
        assert!(matches!(
            ArchiveHeader::decode(&bytes[..]),
            Err(ClipError::Format(_))
        ));
    }

    #[test]
    fn truncated_payload_rejected() {
        let h = ArchiveHeader::new(0, STORAGE_TYPE_OCI);
        let bytes = h.encode().unwrap();
        let truncated = &bytes[..bytes.len() - 3];
        assert!(ArchiveHeader::decode(truncated).is_err());
    }

    #[test]
    fn storage_type_is_nul_padded() {
        let h = ArchiveHeader::new(0, STORAGE_TYPE_OCI);
        assert_eq!(h.storage_info_type[..3], *b"oci");
        assert!(h.storage_info_type[3..].iter().all(|&b| b == 0));
        assert_eq!(h.storage_type(), "oci");
    }
}
