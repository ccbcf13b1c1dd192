use std::collections::BTreeMap;
use std::ops::Bound;

use serde::{Deserialize, Serialize};

use crate::node::ClipNode;

/// A `(name, mode)` pair produced by directory listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub mode: u32,
}

/// Ordered map of archive paths to nodes.
///
/// Built once by the packer or the OCI indexer, then only read. Insertion
/// of an existing key replaces the node, which is how layer-on-layer
/// override is expressed during OCI indexing.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ClipIndex {
    nodes: BTreeMap<String, ClipNode>,
}

impl ClipIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets or replaces the node keyed by its path.
    pub fn insert(&mut self, node: ClipNode) {
        self.nodes.insert(node.path.clone(), node);
    }

    pub fn get(&self, path: &str) -> Option<&ClipNode> {
        self.nodes.get(path)
    }

    /// Mutable access for the packer/indexer build phase; the index is
    /// never mutated once an archive is finalized.
    pub fn get_mut(&mut self, path: &str) -> Option<&mut ClipNode> {
        self.nodes.get_mut(path)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClipNode> {
        self.nodes.values()
    }

    /// Visits nodes with `path >= pivot` in ascending order until `f`
    /// returns false.
    pub fn ascend<F>(&self, pivot: &str, mut f: F)
    where
        F: FnMut(&ClipNode) -> bool,
    {
        for node in self
            .nodes
            .range::<str, _>((Bound::Included(pivot), Bound::Unbounded))
            .map(|(_, n)| n)
        {
            if !f(node) {
                break;
            }
        }
    }

    /// Immediate children of the directory at `path`.
    ///
    /// Ascends from the `dir + "\0"` pivot: NUL sorts below every printable
    /// byte, so with a strict-less comparator no child can be skipped.
    /// Deeper descendants interleave with the children and are passed over.
    pub fn list_dir(&self, path: &str) -> Vec<DirEntry> {
        let mut prefix = path.to_string();
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        let pivot = format!("{prefix}\0");

        let mut entries = Vec::new();
        self.ascend(&pivot, |node| {
            let Some(rest) = node.path.strip_prefix(prefix.as_str()) else {
                return false;
            };
            if !rest.is_empty() && !rest.contains('/') {
                entries.push(DirEntry {
                    name: rest.to_string(),
                    mode: node.attr.mode,
                });
            }
            true
        });
        entries
    }

    pub fn delete(&mut self, path: &str) -> Option<ClipNode> {
        self.nodes.remove(path)
    }

    /// Removes every node whose path starts with `prefix` (opaque-directory
    /// whiteout). Returns the number of removed nodes.
    pub fn delete_prefix(&mut self, prefix: &str) -> usize {
        let doomed: Vec<String> = self
            .nodes
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(p, _)| p.starts_with(prefix))
            .map(|(p, _)| p.clone())
            .collect();
        for p in &doomed {
            self.nodes.remove(p);
        }
        doomed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeAttr, NodeKind};

    fn node(path: &str, kind: NodeKind, mode: u32) -> ClipNode {
        let mut n = ClipNode::new(path.into(), kind, NodeAttr::default());
        n.attr.mode = mode;
        n
    }

    fn dir(path: &str) -> ClipNode {
        node(path, NodeKind::Dir, 0o040_755)
    }

    fn file(path: &str) -> ClipNode {
        node(path, NodeKind::File, 0o100_644)
    }

    #[test]
    fn insert_replaces_by_path() {
        let mut ix = ClipIndex::new();
        let mut a = file("/a");
        a.content_hash = "old".into();
        ix.insert(a);
        let mut b = file("/a");
        b.content_hash = "new".into();
        ix.insert(b);
        assert_eq!(ix.len(), 1);
        assert_eq!(ix.get("/a").unwrap().content_hash, "new");
    }

    #[test]
    fn list_dir_returns_immediate_children_only() {
        let mut ix = ClipIndex::new();
        ix.insert(dir("/"));
        ix.insert(dir("/etc"));
        ix.insert(file("/etc/passwd"));
        ix.insert(dir("/etc/ssh"));
        ix.insert(file("/etc/ssh/sshd_config"));
        ix.insert(file("/etcetera"));

        let names: Vec<String> = ix.list_dir("/etc").into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["passwd", "ssh"]);

        let root: Vec<String> = ix.list_dir("/").into_iter().map(|e| e.name).collect();
        assert_eq!(root, vec!["etc", "etcetera"]);
    }

    #[test]
    fn list_dir_empty_and_missing() {
        let mut ix = ClipIndex::new();
        ix.insert(dir("/empty"));
        assert!(ix.list_dir("/empty").is_empty());
        assert!(ix.list_dir("/nope").is_empty());
    }

    #[test]
    fn sibling_with_prefix_name_is_not_a_child() {
        let mut ix = ClipIndex::new();
        ix.insert(dir("/app"));
        ix.insert(file("/app.conf"));
        ix.insert(file("/app/bin"));
        let names: Vec<String> = ix.list_dir("/app").into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["bin"]);
    }

    #[test]
    fn delete_prefix_clears_subtree() {
        let mut ix = ClipIndex::new();
        ix.insert(dir("/etc"));
        ix.insert(file("/etc/a"));
        ix.insert(file("/etc/b"));
        ix.insert(file("/etx"));
        assert_eq!(ix.delete_prefix("/etc/"), 2);
        assert!(ix.get("/etc").is_some());
        assert!(ix.get("/etc/a").is_none());
        assert!(ix.get("/etx").is_some());
    }

    #[test]
    fn ascend_stops_when_told() {
        let mut ix = ClipIndex::new();
        ix.insert(file("/a"));
        ix.insert(file("/b"));
        ix.insert(file("/c"));
        let mut seen = Vec::new();
        ix.ascend("/b", |n| {
            seen.push(n.path.clone());
            false
        });
        assert_eq!(seen, vec!["/b"]);
    }
}
