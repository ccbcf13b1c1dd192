#![forbid(unsafe_code)]

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod error;

pub mod index;
pub mod node;

pub mod container {
    pub mod archive;
    pub mod chunks;
    pub mod header;
    pub mod storage;
}

pub mod pack {
    pub mod walker;
    pub mod writer;
}

pub mod oci {
    pub mod indexer;
    pub mod registry;
    pub mod zran;
}

pub mod cache {
    pub mod disk;
    pub mod lru;
    pub mod remote;
    pub mod singleflight;
}

pub mod store;

pub mod extract;
pub mod fuse;
pub mod list;

pub use crate::error::{ClipError, Result};

pub use container::archive::ClipArchive;
pub use index::{ClipIndex, DirEntry};
pub use node::{ClipNode, NodeAttr, NodeKind};

pub use extract::extract;
pub use fuse::mount;
pub use list::{ListOptions, list};
pub use oci::indexer::{IndexOptions, index_image_to_file};
pub use pack::writer::{PackOptions, PackSummary, pack};

pub mod prelude {
    pub use crate::Result;
    pub use crate::container::archive::ClipArchive;
    pub use crate::extract::extract;
    pub use crate::index::ClipIndex;
    pub use crate::node::{ClipNode, NodeKind};
    pub use crate::oci::indexer::{IndexOptions, index_image_to_file};
    pub use crate::pack::writer::{PackOptions, pack};
    pub use crate::store::{ContentStore, StoreOptions, new_content_store};
}
