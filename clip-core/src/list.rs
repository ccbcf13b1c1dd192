use std::path::Path;

use crate::container::archive::ClipArchive;
use crate::error::Result;
use crate::extract::resolve_index_path;
use crate::node::NodeKind;

#[derive(Clone, Copy, Debug, Default)]
pub struct ListOptions {
    /// Also print data positions and content hashes.
    pub long: bool,
}

/// Prints one line per node in path order.
pub fn list(archive: &Path, opts: &ListOptions) -> Result<()> {
    let loaded = ClipArchive::load(&resolve_index_path(archive))?;

    for node in loaded.index.iter() {
        let kind = match node.kind {
            NodeKind::Dir => 'd',
            NodeKind::File => '-',
            NodeKind::Symlink => 'l',
        };
        if opts.long {
            let location = if let Some(r) = &node.remote_ref {
                format!("{}@{}+{}", r.layer_digest, r.offset, r.length)
            } else if node.has_local_data() {
                format!("{}+{}", node.data_pos, node.data_len)
            } else {
                "-".to_string()
            };
            println!(
                "{kind} {:o} {:>12} {location} {}  {}",
                node.attr.mode & 0o7777,
                node.attr.size,
                node.path,
                node.content_hash
            );
        } else {
            println!("{kind} {:>12} {}", node.attr.size, node.path);
        }
    }
    Ok(())
}
