use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about = "CLIP content-addressed archives", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// True when the selected subcommand asked for verbose output.
    pub fn verbose(&self) -> bool {
        matches!(self.command, Commands::Create { verbose: true, .. })
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Pack a directory into a V2 archive (chunks + index)
    Create {
        /// Source directory to pack
        #[arg(short = 'i', long = "input")]
        input: PathBuf,

        /// Destination directory; the archive lands in <output>/<image-id>/
        #[arg(short = 'o', long = "output")]
        output: PathBuf,

        /// Image id naming the archive
        #[arg(long = "image-id")]
        image_id: String,

        /// Chunk size in MiB
        #[arg(long = "chunk-size-mib", default_value_t = 32)]
        chunk_size_mib: u64,

        /// Log per-file packing detail
        #[arg(short = 'v', long)]
        verbose: bool,
    },

    /// Extract an archive back into a directory tree
    Extract {
        /// Archive directory or its index.clip
        #[arg(short = 'i', long = "input")]
        input: PathBuf,

        /// Destination directory
        #[arg(short = 'o', long = "output")]
        output: PathBuf,
    },

    /// List archive contents
    List {
        /// Archive directory or its index.clip
        #[arg(short = 'i', long = "input")]
        input: PathBuf,

        /// Long format: modes, data locations, content hashes
        #[arg(long)]
        long: bool,
    },

    /// Index a remote OCI image into a metadata-only archive
    IndexOci {
        /// Image reference, e.g. ghcr.io/owner/app:tag
        #[arg(short = 'i', long = "image")]
        image: String,

        /// Output archive path
        #[arg(short = 'o', long = "output")]
        output: PathBuf,

        /// Emit gzip checkpoints every N MiB of uncompressed layer bytes
        #[arg(long = "checkpoint-interval-mib")]
        checkpoint_interval_mib: Option<u64>,
    },

    /// Mount an archive read-only
    Mount {
        /// Archive index file
        #[arg(short = 'i', long = "input")]
        input: PathBuf,

        /// Mountpoint
        #[arg(short = 'm', long = "mountpoint")]
        mountpoint: PathBuf,

        /// Disk cache directory (required for OCI archives)
        #[arg(short = 'c', long = "cache-dir")]
        cache_dir: Option<PathBuf>,

        /// CDN base url for V2 archives whose chunks live remotely
        #[arg(long = "cdn-url")]
        cdn_url: Option<String>,

        /// Image id, for CDN chunk paths and cache routing
        #[arg(long = "image-id")]
        image_id: Option<String>,

        /// In-memory content cache budget in MiB
        #[arg(long = "content-cache-mib")]
        content_cache_mib: Option<u64>,

        /// In-memory chunk cache budget in MiB
        #[arg(long = "chunk-cache-mib")]
        chunk_cache_mib: Option<u64>,

        /// Use gzip checkpoints for partial layer reads, when indexed
        #[arg(long)]
        checkpoints: bool,
    },
}
