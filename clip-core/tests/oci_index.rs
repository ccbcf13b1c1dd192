use std::io::Read;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use tar::{Builder, EntryType, Header};

use clip_core::oci::indexer::{IndexOptions, apply_layer, new_root_index};
use clip_core::pack::walker::InodeGenerator;

enum Entry<'a> {
    Dir(&'a str),
    File(&'a str, &'a [u8]),
    Symlink(&'a str, &'a str),
}

fn build_layer(entries: &[Entry<'_>]) -> (String, Vec<u8>) {
    let mut builder = Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for entry in entries {
        match entry {
            Entry::Dir(path) => {
                let mut h = Header::new_ustar();
                h.set_entry_type(EntryType::Directory);
                h.set_mode(0o755);
                h.set_size(0);
                builder
                    .append_data(&mut h, format!("{path}/"), std::io::empty())
                    .unwrap();
            }
            Entry::File(path, data) => {
                let mut h = Header::new_ustar();
                h.set_entry_type(EntryType::Regular);
                h.set_mode(0o644);
                h.set_size(data.len() as u64);
                builder.append_data(&mut h, path, *data).unwrap();
            }
            Entry::Symlink(path, target) => {
                let mut h = Header::new_ustar();
                h.set_entry_type(EntryType::Symlink);
                h.set_mode(0o777);
                h.set_size(0);
                builder.append_link(&mut h, path, target).unwrap();
            }
        }
    }
    let gz = builder.into_inner().unwrap().finish().unwrap();
    let digest = format!("sha256:{}", hex::encode(Sha256::digest(&gz)));
    (digest, gz)
}

fn gunzip(gz: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    GzDecoder::new(gz).read_to_end(&mut out).unwrap();
    out
}

#[test]
fn layer_entries_carry_exact_remote_refs() {
    let (digest, gz) = build_layer(&[
        Entry::Dir("app"),
        Entry::File("app/cfg.txt", b"configuration"),
        Entry::File("app/data.bin", &[0xAB; 1000]),
        Entry::Symlink("app/link", "cfg.txt"),
    ]);

    let mut inodes = InodeGenerator::new();
    let mut index = new_root_index(&mut inodes);
    let applied = apply_layer(
        &mut index,
        &mut inodes,
        &digest,
        &gz[..],
        &IndexOptions::default(),
    )
    .unwrap();

    let plain = gunzip(&gz);
    assert_eq!(applied.decompressed_hash, hex::encode(Sha256::digest(&plain)));

    // The recorded uncompressed range is exactly the file's bytes.
    for (path, content) in [
        ("/app/cfg.txt", &b"configuration"[..]),
        ("/app/data.bin", &[0xAB; 1000][..]),
    ] {
        let node = index.get(path).unwrap();
        let r = node.remote_ref.as_ref().unwrap();
        assert_eq!(r.layer_digest, digest);
        assert_eq!(r.length as usize, content.len());
        assert_eq!(&plain[r.offset as usize..(r.offset + r.length) as usize], content);
    }

    let link = index.get("/app/link").unwrap();
    assert!(link.is_symlink());
    assert_eq!(link.target, "cfg.txt");
    assert!(link.remote_ref.is_none());

    assert!(index.get("/app").unwrap().is_dir());
}

#[test]
fn upper_layer_overrides_lower() {
    let (d0, l0) = build_layer(&[Entry::Dir("app"), Entry::File("app/cfg.txt", b"v1")]);
    let (d1, l1) = build_layer(&[Entry::File("app/cfg.txt", b"v2")]);

    let mut inodes = InodeGenerator::new();
    let mut index = new_root_index(&mut inodes);
    let opts = IndexOptions::default();
    apply_layer(&mut index, &mut inodes, &d0, &l0[..], &opts).unwrap();
    let before = index.get("/app/cfg.txt").unwrap().attr.ino;
    apply_layer(&mut index, &mut inodes, &d1, &l1[..], &opts).unwrap();

    let node = index.get("/app/cfg.txt").unwrap();
    let r = node.remote_ref.as_ref().unwrap();
    assert_eq!(r.layer_digest, d1);
    assert_eq!(r.length, 2);
    // Overrides keep the inode of the entry they replace.
    assert_eq!(node.attr.ino, before);

    let plain = gunzip(&l1);
    assert_eq!(&plain[r.offset as usize..(r.offset + r.length) as usize], b"v2");
}

#[test]
fn whiteout_deletes_single_entry() {
    let (d0, l0) = build_layer(&[
        Entry::Dir("app"),
        Entry::File("app/secret", &[0x55; 10]),
        Entry::File("app/keep", b"ok"),
    ]);
    let (d1, l1) = build_layer(&[Entry::File("app/.wh.secret", b"")]);

    let mut inodes = InodeGenerator::new();
    let mut index = new_root_index(&mut inodes);
    let opts = IndexOptions::default();
    apply_layer(&mut index, &mut inodes, &d0, &l0[..], &opts).unwrap();
    apply_layer(&mut index, &mut inodes, &d1, &l1[..], &opts).unwrap();

    assert!(index.get("/app/secret").is_none());
    let names: Vec<String> = index.list_dir("/app").into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec!["keep"]);
}

#[test]
fn opaque_whiteout_clears_directory() {
    let (d0, l0) = build_layer(&[
        Entry::Dir("etc"),
        Entry::File("etc/a", b"a"),
        Entry::File("etc/b", b"b"),
    ]);
    let (d1, l1) = build_layer(&[
        Entry::File("etc/.wh..wh..opq", b""),
        Entry::File("etc/c", b"c"),
    ]);

    let mut inodes = InodeGenerator::new();
    let mut index = new_root_index(&mut inodes);
    let opts = IndexOptions::default();
    apply_layer(&mut index, &mut inodes, &d0, &l0[..], &opts).unwrap();
    apply_layer(&mut index, &mut inodes, &d1, &l1[..], &opts).unwrap();

    let names: Vec<String> = index.list_dir("/etc").into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec!["c"]);
    assert!(index.get("/etc").is_some());

    // The index never contains whiteout markers.
    assert!(index.iter().all(|n| !n.name().starts_with(".wh.")));
}

#[test]
fn root_opaque_whiteout_keeps_root_node() {
    let (d0, l0) = build_layer(&[
        Entry::Dir("etc"),
        Entry::File("etc/a", b"a"),
        Entry::File("b", b"b"),
    ]);
    let (d1, l1) = build_layer(&[Entry::File(".wh..wh..opq", b""), Entry::File("c", b"c")]);

    let mut inodes = InodeGenerator::new();
    let mut index = new_root_index(&mut inodes);
    let opts = IndexOptions::default();
    apply_layer(&mut index, &mut inodes, &d0, &l0[..], &opts).unwrap();
    apply_layer(&mut index, &mut inodes, &d1, &l1[..], &opts).unwrap();

    // Everything under the root is gone; the root itself survives.
    let root = index.get("/").unwrap();
    assert!(root.is_dir());
    assert_eq!(root.attr.ino, 1);
    assert!(index.get("/etc").is_none());
    assert!(index.get("/etc/a").is_none());
    assert!(index.get("/b").is_none());

    let names: Vec<String> = index.list_dir("/").into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec!["c"]);
}

#[test]
fn whiteout_on_directory_removes_subtree() {
    let (d0, l0) = build_layer(&[
        Entry::Dir("srv"),
        Entry::Dir("srv/data"),
        Entry::File("srv/data/x", b"x"),
    ]);
    let (d1, l1) = build_layer(&[Entry::File("srv/.wh.data", b"")]);

    let mut inodes = InodeGenerator::new();
    let mut index = new_root_index(&mut inodes);
    let opts = IndexOptions::default();
    apply_layer(&mut index, &mut inodes, &d0, &l0[..], &opts).unwrap();
    apply_layer(&mut index, &mut inodes, &d1, &l1[..], &opts).unwrap();

    assert!(index.get("/srv/data").is_none());
    assert!(index.get("/srv/data/x").is_none());
    assert!(index.get("/srv").is_some());
}

#[test]
fn checkpointed_layer_records_gzip_index() {
    let big: Vec<u8> = (0..3u32 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    let (digest, gz) = build_layer(&[Entry::File("blob.bin", &big)]);

    let mut inodes = InodeGenerator::new();
    let mut index = new_root_index(&mut inodes);
    let applied = apply_layer(
        &mut index,
        &mut inodes,
        &digest,
        &gz[..],
        &IndexOptions {
            checkpoint_interval_mib: Some(1),
        },
    )
    .unwrap();

    let gzip_index = applied.gzip_index.unwrap();
    assert!(!gzip_index.checkpoints.is_empty());
    // Sorted, with window state captured.
    let mut last = 0;
    for cp in &gzip_index.checkpoints {
        assert!(cp.uncompressed_offset >= last);
        assert!(cp.window.is_some());
        last = cp.uncompressed_offset;
    }

    // The checkpointed decode produced the same hash as a plain one.
    assert_eq!(
        applied.decompressed_hash,
        hex::encode(Sha256::digest(gunzip(&gz)))
    );
}
