use std::collections::HashMap;
use std::fs::File;
use std::io::Read;

use mftar::builder::{ArchiveBuilder, BuildOptions};
use mftar::cli::DirPolicy;
use mftar::codec::Codec;
use mftar::entry::ResolveContext;
use mftar::tree;
use serde_json::{json, Value};
use tempfile::tempdir;

// Build an archive from a manifest, then regenerate a manifest from that
// archive and check the fields that must survive the round trip.
#[test]
fn manifest_fields_survive_archive_and_back() {
    let scratch = tempdir().unwrap();
    let archive = scratch.path().join("out.tar");

    let options = BuildOptions { codec: Codec::None, level: 6, dirs: DirPolicy::First };
    let ctx = ResolveContext::new(HashMap::new(), None);
    let mut builder =
        ArchiveBuilder::new(Box::new(File::create(&archive).unwrap()), options, ctx).unwrap();
    for entry in [
        json!({
            "name": "etc/", "dir": true, "mode": "0755",
            "uid": 0, "gid": 0, "uname": "root", "gname": "root",
            "mtime": 1700000000
        }),
        json!({
            "source": "base64:Y29uZmln", "name": "etc/app.conf",
            "uid": 1000, "gid": 100, "uname": "app", "gname": "users",
            "mtime": 1700000010.5, "atime": 1700000011
        }),
        json!({"name": "etc/app.link", "link": "app.conf", "mtime": 1700000000}),
    ] {
        builder.add_value(entry).unwrap();
    }
    builder.close().unwrap();

    let mut manifest = Vec::new();
    tree::generate_manifest(File::open(&archive).unwrap(), &mut manifest).unwrap();

    let lines: Vec<Value> = String::from_utf8(manifest)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 3);

    // tree pre-order: the directory comes before its contents
    assert_eq!(lines[0]["source"], json!("etc"));
    assert_eq!(lines[0]["mtime"], json!(1700000000i64));
    assert_eq!(lines[0]["uid"], json!(0));
    assert_eq!(lines[0]["gid"], json!(0));
    assert_eq!(lines[0]["uname"], json!("root"));
    assert_eq!(lines[0]["gname"], json!("root"));

    assert_eq!(lines[1]["source"], json!("etc/app.conf"));
    assert_eq!(lines[1]["uid"], json!(1000));
    assert_eq!(lines[1]["gid"], json!(100));
    assert_eq!(lines[1]["uname"], json!("app"));
    assert_eq!(lines[1]["gname"], json!("users"));
    // fractional mtime survives via the PAX record
    assert_eq!(lines[1]["mtime"], json!(1700000010.5));
    assert_eq!(lines[1]["atime"], json!("1700000011"));

    assert_eq!(lines[2]["source"], json!("etc/app.link"));
    assert_eq!(lines[2]["link"], json!("app.conf"));
}

// Generation synthesizes nothing for parents the archive never declared:
// only concrete members are emitted.
#[test]
fn virtual_parents_are_not_emitted() {
    let scratch = tempdir().unwrap();
    let archive = scratch.path().join("deep.tar");

    let options = BuildOptions { codec: Codec::None, level: 6, dirs: DirPolicy::First };
    let ctx = ResolveContext::new(HashMap::new(), None);
    let mut builder =
        ArchiveBuilder::new(Box::new(File::create(&archive).unwrap()), options, ctx).unwrap();
    builder
        .add_value(json!({"source": "base64:eA==", "name": "a/b/c/leaf.txt"}))
        .unwrap();
    builder.close().unwrap();

    let mut manifest = Vec::new();
    tree::generate_manifest(File::open(&archive).unwrap(), &mut manifest).unwrap();
    let text = String::from_utf8(manifest).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains("a/b/c/leaf.txt"));
}

// A rebuilt archive from a generated manifest keeps the member set, with
// sources re-read from a directory tree extracted alongside.
#[test]
fn generated_manifest_rebuilds_the_same_paths() {
    let scratch = tempdir().unwrap();
    let srcdir = scratch.path().join("src");
    std::fs::create_dir(&srcdir).unwrap();
    std::fs::create_dir(srcdir.join("d")).unwrap();
    std::fs::write(srcdir.join("d/one.txt"), b"one").unwrap();
    std::fs::write(srcdir.join("two.txt"), b"two").unwrap();

    let first = scratch.path().join("first.tar");
    let options = BuildOptions { codec: Codec::None, level: 6, dirs: DirPolicy::First };
    let ctx = ResolveContext::new(HashMap::new(), Some(srcdir.clone()));
    let mut builder =
        ArchiveBuilder::new(Box::new(File::create(&first).unwrap()), options.clone(), ctx).unwrap();
    builder
        .add_value(json!({"source": "", "name": "", "recursive": true}))
        .unwrap();
    builder.close().unwrap();

    let mut manifest = Vec::new();
    tree::generate_manifest(File::open(&first).unwrap(), &mut manifest).unwrap();

    // rebuild from the generated manifest, sources resolved against srcdir
    let second = scratch.path().join("second.tar");
    let ctx = ResolveContext::new(HashMap::new(), Some(srcdir));
    let mut builder =
        ArchiveBuilder::new(Box::new(File::create(&second).unwrap()), options, ctx).unwrap();
    for line in String::from_utf8(manifest).unwrap().lines() {
        builder.add_value(serde_json::from_str(line).unwrap()).unwrap();
    }
    builder.close().unwrap();

    let names = |path: &std::path::Path| -> Vec<String> {
        let mut archive = tar::Archive::new(File::open(path).unwrap());
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect()
    };
    let mut first_names = names(&first);
    let mut second_names = names(&second);
    first_names.sort();
    second_names.sort();
    assert_eq!(first_names, second_names);

    let mut archive = tar::Archive::new(File::open(&second).unwrap());
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        if entry.path().unwrap().to_string_lossy() == "d/one.txt" {
            let mut content = Vec::new();
            entry.read_to_end(&mut content).unwrap();
            assert_eq!(content, b"one");
        }
    }
}
