use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::fs::{self, File};
use assert_cmd::Command;
use std::io::Read;
use tempfile::tempdir;

#[test]
fn test_cli_build_compress_generate_cycle() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Setup: a source tree and a manifest describing it
    let source_dir = tempdir()?;
    fs::write(source_dir.path().join("hello.txt"), "Hello, manifest world.\n")?;
    fs::create_dir(source_dir.path().join("nested"))?;
    fs::write(source_dir.path().join("nested/data.bin"), [0u8, 1, 2, 3])?;

    let manifest_path = source_dir.path().join("manifest.json");
    fs::write(
        &manifest_path,
        concat!(
            "{\"name\": \"pkg/\", \"dir\": true, \"mode\": \"0755\", \"uname\": \"root\"}\n",
            "{\"source\": \"hello.txt\", \"name\": \"pkg/hello.txt\", \"mode\": \"0644\"}\n",
            "{\"source\": \"nested\", \"name\": \"pkg/nested\", \"recursive\": true}\n",
            "{\"name\": \"pkg/hello.link\", \"link\": \"hello.txt\"}\n",
        ),
    )?;

    let out_dir = tempdir()?;
    let archive_path = out_dir.path().join("build.tgz");

    // 2. Build a gzip archive, codec picked from the suffix
    let mut cmd = Command::cargo_bin("mftar")?;
    cmd.arg("-C")
        .arg(source_dir.path())
        .arg("-f")
        .arg(&archive_path)
        .arg(&manifest_path);
    cmd.assert().success();
    assert!(archive_path.exists());

    // 3. The archive decodes with plain gzip and holds the expected members
    let decoder = flate2::read::GzDecoder::new(File::open(&archive_path)?);
    let mut archive = tar::Archive::new(decoder);
    let mut names = Vec::new();
    let mut hello = String::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        if name == "pkg/hello.txt" {
            entry.read_to_string(&mut hello)?;
        }
        names.push(name);
    }
    assert_eq!(
        names,
        vec![
            "pkg/",
            "pkg/hello.txt",
            "pkg/nested/data.bin",
            "pkg/hello.link",
        ]
    );
    assert_eq!(hello, "Hello, manifest world.\n");

    // 4. Reverse direction: regenerate a manifest from the built archive
    let plain_path = out_dir.path().join("plain.tar");
    let mut cmd = Command::cargo_bin("mftar")?;
    cmd.arg("--no-auto-compress")
        .arg("-C")
        .arg(source_dir.path())
        .arg("-f")
        .arg(&plain_path)
        .arg(&manifest_path);
    cmd.assert().success();

    let mut cmd = Command::cargo_bin("mftar")?;
    cmd.arg("-g").arg(&plain_path);
    cmd.assert()
        .success()
        .stdout(
            predicate::str::contains("\"source\":\"pkg\"")
                .and(predicate::str::contains("\"source\":\"pkg/hello.txt\""))
                .and(predicate::str::contains("\"link\":\"hello.txt\""))
                .and(predicate::str::contains("\"uname\":\"root\"")),
        );

    Ok(())
}

#[test]
fn test_cli_defines_and_stdin_manifest() -> Result<(), Box<dyn std::error::Error>> {
    let out_dir = tempdir()?;
    let archive_path = out_dir.path().join("out.tar");

    let mut cmd = Command::cargo_bin("mftar")?;
    cmd.arg("-f")
        .arg(&archive_path)
        .arg("-d")
        .arg("ver=2.0")
        .write_stdin("{\"source\": \"base64:b2s=\", \"name\": \"release-${ver}.txt\"}\n");
    cmd.assert().success();

    let mut archive = tar::Archive::new(File::open(&archive_path)?);
    let names: Vec<String> = archive
        .entries()?
        .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["release-2.0.txt"]);
    Ok(())
}

#[test]
fn test_cli_definitions_file_with_cli_precedence() -> Result<(), Box<dyn std::error::Error>> {
    let scratch = tempdir()?;
    let defs_path = scratch.path().join("vars.defs");
    fs::write(&defs_path, "# build vars\nver = 1.0\nname = \"widget\"\n")?;
    let archive_path = scratch.path().join("out.tar");

    let mut cmd = Command::cargo_bin("mftar")?;
    cmd.arg("-f")
        .arg(&archive_path)
        .arg("-T")
        .arg(&defs_path)
        .arg("-d")
        .arg("ver=2.0")
        .write_stdin("{\"source\": \"base64:eA==\", \"name\": \"${name}-${ver}\"}\n");
    cmd.assert().success();

    let mut archive = tar::Archive::new(File::open(&archive_path)?);
    let names: Vec<String> = archive
        .entries()?
        .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["widget-2.0"]);
    Ok(())
}

#[test]
fn test_cli_rejects_conflicting_markers() -> Result<(), Box<dyn std::error::Error>> {
    let scratch = tempdir()?;
    let mut cmd = Command::cargo_bin("mftar")?;
    cmd.arg("-f")
        .arg(scratch.path().join("out.tar"))
        .write_stdin("{\"name\": \"x\", \"link\": \"a\", \"fifo\": true}\n");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("link/fifo/block/char/dir"));
    Ok(())
}

#[test]
fn test_cli_reports_manifest_decode_offset() -> Result<(), Box<dyn std::error::Error>> {
    let scratch = tempdir()?;
    let mut cmd = Command::cargo_bin("mftar")?;
    cmd.arg("-f")
        .arg(scratch.path().join("out.tar"))
        .write_stdin("{\"name\": \"a\", \"dir\": true}\n{nope}\n");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("manifest decode error at offset"));
    Ok(())
}
