use std::path::PathBuf;

use clip_core::error::Result;
use clip_core::list::ListOptions;
use clip_core::oci::indexer::IndexOptions;
use clip_core::pack::writer::PackOptions;
use clip_core::store::StoreOptions;
use clip_core::{extract, list, mount, pack};

pub fn handle_create(
    input: PathBuf,
    output: PathBuf,
    image_id: String,
    chunk_size_mib: u64,
    verbose: bool,
) -> Result<()> {
    let opts = PackOptions {
        chunk_size: chunk_size_mib * 1024 * 1024,
        verbose,
    };
    let summary = pack(&input, &output, &image_id, &opts)?;
    println!(
        "packed {} files ({} bytes) into {} chunks at {}",
        summary.files,
        summary.bytes,
        summary.chunks,
        output.join(&image_id).display()
    );
    Ok(())
}

pub fn handle_extract(input: PathBuf, output: PathBuf) -> Result<()> {
    extract(&input, &output)
}

pub fn handle_list(input: PathBuf, long: bool) -> Result<()> {
    list(&input, &ListOptions { long })
}

pub fn handle_index_oci(
    image: String,
    output: PathBuf,
    checkpoint_interval_mib: Option<u64>,
) -> Result<()> {
    let opts = IndexOptions {
        checkpoint_interval_mib,
    };
    clip_core::index_image_to_file(&image, &output, &opts)
}

#[allow(clippy::too_many_arguments)]
pub fn handle_mount(
    input: PathBuf,
    mountpoint: PathBuf,
    cache_dir: Option<PathBuf>,
    cdn_url: Option<String>,
    image_id: Option<String>,
    content_cache_mib: Option<u64>,
    chunk_cache_mib: Option<u64>,
    checkpoints: bool,
) -> Result<()> {
    let opts = StoreOptions {
        cache_dir,
        cdn_url,
        image_id,
        content_cache: None,
        content_cache_budget: content_cache_mib.map(|m| m * 1024 * 1024),
        chunk_cache_budget: chunk_cache_mib.map(|m| m * 1024 * 1024),
        enable_checkpoints: checkpoints,
    };
    mount(&input, &mountpoint, &opts)
}
