//! Archive encoding determinism and content preservation through the
//! public archiver and hasher.

mod common;

use std::path::Path;

use assert_matches::assert_matches;
use common::pattern;
use stowage_core::item::HashAlgorithm;
use stowage_pipeline::archive::{ArchiveError, Archiver, SealedTarArchiver};
use stowage_pipeline::hashing::{ContentHasher, Sha2Hasher};

fn photo_album(root: &Path) {
    std::fs::create_dir_all(root.join("2023/raw")).unwrap();
    std::fs::create_dir_all(root.join("2024")).unwrap();
    std::fs::write(root.join("2023/raw/img_0001.raw"), pattern(150_000)).unwrap();
    std::fs::write(root.join("2023/notes.md"), b"# trip\n").unwrap();
    std::fs::write(root.join("2024/empty.txt"), b"").unwrap();
}

fn digests(path: &Path) -> stowage_core::item::Digests {
    Sha2Hasher.calculate(path, &HashAlgorithm::ALL).unwrap()
}

// ---------------------------------------------------------------------------
// Test: determinism
// ---------------------------------------------------------------------------

#[test]
fn same_content_encodes_to_identical_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let album = dir.path().join("album");
    photo_album(&album);
    let archiver = SealedTarArchiver::default();

    for password in [None, Some("hunter2")] {
        let first = archiver.encode(&album, &dir.path().join("one"), password).unwrap();
        let second = archiver.encode(&album, &dir.path().join("two"), password).unwrap();
        assert_eq!(
            std::fs::read(&first).unwrap(),
            std::fs::read(&second).unwrap(),
            "password = {password:?}"
        );
    }
}

// ---------------------------------------------------------------------------
// Test: content preservation
// ---------------------------------------------------------------------------

#[test]
fn decoded_folder_hashes_like_source() {
    let dir = tempfile::tempdir().unwrap();
    let album = dir.path().join("album");
    photo_album(&album);
    let archiver = SealedTarArchiver::default();

    for password in [None, Some("hunter2")] {
        let out = dir.path().join(format!("out-{}", password.is_some()));
        let archive = archiver.encode(&album, &out.join("archive"), password).unwrap();
        let root = archiver.decode(&archive, &out.join("scratch"), password).unwrap();
        assert!(digests(&album).matches(&digests(&root)));
    }
}

#[test]
fn decoded_file_hashes_like_source() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("ledger.csv");
    std::fs::write(&source, pattern(64 * 1024 + 17)).unwrap();
    let archiver = SealedTarArchiver::default();

    let archive = archiver.encode(&source, &dir.path().join("a"), Some("pw")).unwrap();
    let root = archiver.decode(&archive, &dir.path().join("x"), Some("pw")).unwrap();
    assert_eq!(root, dir.path().join("x/ledger.csv"));
    assert_eq!(digests(&source), digests(&root));
}

#[test]
fn sealed_archive_requires_the_right_password() {
    let dir = tempfile::tempdir().unwrap();
    let album = dir.path().join("album");
    photo_album(&album);
    let archiver = SealedTarArchiver::default();
    let archive = archiver.encode(&album, &dir.path().join("a"), Some("right")).unwrap();

    assert_matches!(
        archiver.decode(&archive, &dir.path().join("x"), None),
        Err(ArchiveError::PasswordRequired)
    );
    assert!(archiver.decode(&archive, &dir.path().join("y"), Some("wrong")).is_err());
}
