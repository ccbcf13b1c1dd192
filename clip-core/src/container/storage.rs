use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Size of the sliding-window state captured per checkpoint.
pub const WINDOW_SIZE: usize = 32 * 1024;

/// One zran-style entry point into a gzip stream.
///
/// `window` holds the 32 KiB of decompressed output immediately preceding
/// `uncompressed_offset`; without it only a stream-start resume is usable.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub compressed_offset: u64,
    pub uncompressed_offset: u64,
    pub window: Option<Vec<u8>>,
}

/// Checkpoints for one layer, sorted by uncompressed offset.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GzipIndex {
    pub checkpoints: Vec<Checkpoint>,
}

impl GzipIndex {
    /// Largest checkpoint with `uncompressed_offset <= target`, or None
    /// when the stream must be decoded from the start (equivalent to a
    /// `(0, 0)` checkpoint).
    pub fn nearest(&self, target: u64) -> Option<&Checkpoint> {
        let n = self
            .checkpoints
            .partition_point(|c| c.uncompressed_offset <= target);
        if n == 0 { None } else { Some(&self.checkpoints[n - 1]) }
    }
}

/// Storage info for OCI archives: where the layers live and how to enter
/// them. The decompressed hash of a layer is the stable content-addressed
/// key for the remote cache across images.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciStorageInfo {
    pub registry: String,
    pub repository: String,
    pub reference: String,
    pub layers: Vec<String>,
    pub gzip_index: BTreeMap<String, GzipIndex>,
    pub decompressed_hash: BTreeMap<String, String>,
}

/// Storage info for archives whose chunks were uploaded to an S3 bucket.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3StorageInfo {
    pub bucket: String,
    pub region: String,
    pub key: String,
    pub endpoint: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cp(c: u64, u: u64) -> Checkpoint {
        Checkpoint {
            compressed_offset: c,
            uncompressed_offset: u,
            window: None,
        }
    }

    #[test]
    fn nearest_on_empty_index_is_stream_start() {
        let ix = GzipIndex::default();
        assert!(ix.nearest(0).is_none());
        assert!(ix.nearest(1 << 40).is_none());
    }

    #[test]
    fn nearest_picks_largest_at_or_below() {
        let ix = GzipIndex {
            checkpoints: vec![cp(10, 100), cp(20, 200), cp(30, 300)],
        };
        assert!(ix.nearest(99).is_none());
        assert_eq!(ix.nearest(100).unwrap().uncompressed_offset, 100);
        assert_eq!(ix.nearest(250).unwrap().uncompressed_offset, 200);
        assert_eq!(ix.nearest(300).unwrap().uncompressed_offset, 300);
        assert_eq!(ix.nearest(9999).unwrap().uncompressed_offset, 300);
    }
}
