pub mod handlers;

use crate::presentation::cli::{Cli, Commands};
use clap::Parser;
use clip_core::error::Result;
use tracing_subscriber::EnvFilter;

/// `-v` raises the default filter to debug; `RUST_LOG` still wins when
/// set.
fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with_writer(std::io::stderr)
        .init();
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose());
    match cli.command {
        Commands::Create {
            input,
            output,
            image_id,
            chunk_size_mib,
            verbose,
        } => handlers::handle_create(input, output, image_id, chunk_size_mib, verbose),
        Commands::Extract { input, output } => handlers::handle_extract(input, output),
        Commands::List { input, long } => handlers::handle_list(input, long),
        Commands::IndexOci {
            image,
            output,
            checkpoint_interval_mib,
        } => handlers::handle_index_oci(image, output, checkpoint_interval_mib),
        Commands::Mount {
            input,
            mountpoint,
            cache_dir,
            cdn_url,
            image_id,
            content_cache_mib,
            chunk_cache_mib,
            checkpoints,
        } => handlers::handle_mount(
            input,
            mountpoint,
            cache_dir,
            cdn_url,
            image_id,
            content_cache_mib,
            chunk_cache_mib,
            checkpoints,
        ),
    }
}
