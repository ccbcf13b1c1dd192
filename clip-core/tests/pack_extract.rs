use std::fs;
use std::os::unix::fs::{PermissionsExt, symlink};
use std::path::Path;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use clip_core::container::archive::ClipArchive;
use clip_core::pack::writer::{PackOptions, pack};
use clip_core::store::ContentStore;
use clip_core::store::local::LocalChunkStore;
use clip_core::{ClipIndex, extract};

const MIB: u64 = 1024 * 1024;

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn build_source(dir: &Path) -> Vec<u8> {
    fs::write(dir.join("a.txt"), b"hello").unwrap();
    fs::create_dir(dir.join("b")).unwrap();
    // 3 MiB of alternating 0x00/0xFF, crossing the 2 MiB chunk boundary.
    let big: Vec<u8> = (0..3 * MIB).map(|i| if i % 2 == 0 { 0x00 } else { 0xFF }).collect();
    fs::write(dir.join("b/c.bin"), &big).unwrap();
    symlink("a.txt", dir.join("l")).unwrap();
    fs::write(dir.join("z-empty"), b"").unwrap();
    big
}

fn open_store(image_dir: &Path) -> (ClipArchive, LocalChunkStore) {
    let archive = ClipArchive::load(&image_dir.join("index.clip")).unwrap();
    let store = LocalChunkStore::new(
        archive.index.clone(),
        archive.chunk_list.clone(),
        archive.header.chunk_size,
        &image_dir.join("chunks"),
    )
    .unwrap();
    (archive, store)
}

#[test]
fn pack_produces_expected_chunks_and_hashes() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let big = build_source(src.path());

    let opts = PackOptions {
        chunk_size: 2 * MIB,
        ..Default::default()
    };
    let summary = pack(src.path(), dst.path(), "img", &opts).unwrap();
    assert_eq!(summary.files, 3);
    assert_eq!(summary.bytes, 5 + 3 * MIB);
    // 5 + 3 MiB of data in 2 MiB chunks.
    assert_eq!(summary.chunks, 2);

    let (archive, _) = open_store(&dst.path().join("img"));
    assert_eq!(archive.chunk_list.len(), 2);
    assert_eq!(archive.header.chunk_size, 2 * MIB);

    let a = archive.index.get("/a.txt").unwrap();
    assert_eq!(a.data_pos, 0);
    assert_eq!(a.data_len, 5);
    assert_eq!(a.content_hash, sha256_hex(b"hello"));

    // Files are packed in path order: /a.txt then /b/c.bin.
    let c = archive.index.get("/b/c.bin").unwrap();
    assert_eq!(c.data_pos, 5);
    assert_eq!(c.data_len as u64, 3 * MIB);
    assert_eq!(c.content_hash, sha256_hex(&big));

    let empty = archive.index.get("/z-empty").unwrap();
    assert_eq!(empty.data_len, 0);
    assert_eq!(empty.content_hash, sha256_hex(b""));

    let l = archive.index.get("/l").unwrap();
    assert!(l.is_symlink());
    assert_eq!(l.target, "a.txt");

    // Every byte the index claims fits inside the chunk stream.
    for node in archive.index.iter().filter(|n| n.is_file()) {
        assert!(node.data_pos >= 0);
        assert!(
            (node.data_pos + node.data_len) as u64 <= 2 * MIB * summary.chunks,
            "{} overruns the chunk stream",
            node.path
        );
    }
}

#[test]
fn extract_round_trips_the_tree() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let big = build_source(src.path());
    fs::set_permissions(src.path().join("a.txt"), fs::Permissions::from_mode(0o640)).unwrap();

    pack(
        src.path(),
        dst.path(),
        "img",
        &PackOptions {
            chunk_size: 2 * MIB,
            ..Default::default()
        },
    )
    .unwrap();
    extract(&dst.path().join("img"), out.path()).unwrap();

    assert_eq!(fs::read(out.path().join("a.txt")).unwrap(), b"hello");
    assert_eq!(fs::read(out.path().join("b/c.bin")).unwrap(), big);
    assert_eq!(fs::read(out.path().join("z-empty")).unwrap(), b"");
    assert_eq!(
        fs::read_link(out.path().join("l")).unwrap().to_str().unwrap(),
        "a.txt"
    );
    let mode = fs::metadata(out.path().join("a.txt")).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o640);
}

#[test]
fn reads_are_positionally_consistent() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    build_source(src.path());

    pack(
        src.path(),
        dst.path(),
        "img",
        &PackOptions {
            chunk_size: 2 * MIB,
            ..Default::default()
        },
    )
    .unwrap();
    let (archive, store) = open_store(&dst.path().join("img"));
    let node = archive.index.get("/b/c.bin").unwrap();

    // Whole-file read hashes to the recorded content hash.
    let mut whole = vec![0u8; node.data_len as usize];
    assert_eq!(store.read(node, &mut whole, 0).unwrap(), whole.len());
    assert_eq!(sha256_hex(&whole), node.content_hash);

    // read(o1)[o2-o1..] == read(o2), including across the chunk boundary.
    let o1 = 2 * MIB as i64 - 512;
    let o2 = 2 * MIB as i64 + 256;
    let mut r1 = vec![0u8; 4096];
    let mut r2 = vec![0u8; 1024];
    assert_eq!(store.read(node, &mut r1, o1).unwrap(), 4096);
    assert_eq!(store.read(node, &mut r2, o2).unwrap(), 1024);
    let shift = (o2 - o1) as usize;
    assert_eq!(&r1[shift..shift + 1024], &r2[..]);

    // Read spanning EOF returns exactly data_len - offset bytes.
    let tail_off = node.data_len - 100;
    let mut tail = vec![0u8; 4096];
    assert_eq!(store.read(node, &mut tail, tail_off).unwrap(), 100);
}

#[test]
fn list_dir_matches_filesystem_layout() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    build_source(src.path());

    pack(
        src.path(),
        dst.path(),
        "img",
        &PackOptions {
            chunk_size: 2 * MIB,
            ..Default::default()
        },
    )
    .unwrap();
    let (archive, _) = open_store(&dst.path().join("img"));
    let index: Arc<ClipIndex> = archive.index.clone();

    let names: Vec<String> = index.list_dir("/").into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec!["a.txt", "b", "l", "z-empty"]);
    let sub: Vec<String> = index.list_dir("/b").into_iter().map(|e| e.name).collect();
    assert_eq!(sub, vec!["c.bin"]);
}
