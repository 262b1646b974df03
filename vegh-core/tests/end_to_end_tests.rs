/*!
End-to-end tests for the Vegh snapshot engine.
These tests pack real directory trees and exercise every operation against
the resulting files.
*/

use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::TempDir;
use vegh_core::format::{write_frame_header, Entry, Header, Manifest};
use vegh_core::loc::count_files;
use vegh_core::{
    create_default_engine, CollectOptions, CompressionKind, FileCollector, IgnoreMatcher, PackOptions, SnapError,
    SnapshotMetadata,
};

fn write_tree(root: &Path, files: &[(&str, &str)]) {
    for (relative, content) in files {
        let path = root.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }
}

fn lines(count: usize) -> String {
    (0..count).map(|i| format!("x = {i}\n")).collect()
}

fn manifest_paths(path: &Path) -> Vec<String> {
    create_default_engine()
        .list(path)
        .unwrap()
        .into_iter()
        .map(|e| e.relative_path)
        .collect()
}

#[test]
fn test_round_trip_preserves_tree() {
    let temp_dir = TempDir::new().unwrap();
    let source = temp_dir.path().join("project");
    let binary: Vec<u8> = (0..=255u8).cycle().take(70_000).collect();
    write_tree(
        &source,
        &[
            ("README.md", "# project\n"),
            ("src/main.rs", "fn main() {\n    println!(\"hi\");\n}\n"),
            ("src/util/mod.rs", "pub fn util() {}\n"),
            ("empty.txt", ""),
        ],
    );
    fs::write(source.join("data.bin"), &binary).unwrap();

    let output = temp_dir.path().join("project.snap");
    let engine = create_default_engine();
    let report = engine.pack(&source, &output, &PackOptions::default()).unwrap();
    assert_eq!(report.file_count(), 5);

    let dest = temp_dir.path().join("restored");
    let summary = engine.restore(&output, &dest).unwrap();
    assert_eq!(summary.files, 5);

    for relative in ["README.md", "src/main.rs", "src/util/mod.rs", "empty.txt", "data.bin"] {
        assert_eq!(
            fs::read(source.join(relative)).unwrap(),
            fs::read(dest.join(relative)).unwrap(),
            "content differs for {relative}"
        );
    }
}

#[test]
fn test_manifest_is_sorted_and_matches_sizes() {
    let temp_dir = TempDir::new().unwrap();
    let source = temp_dir.path().join("src");
    write_tree(&source, &[("b/z.txt", "zz"), ("a.txt", "a"), ("b/a.txt", "bbb")]);

    let output = temp_dir.path().join("out.snap");
    create_default_engine().pack(&source, &output, &PackOptions::default()).unwrap();

    let entries = create_default_engine().list(&output).unwrap();
    let paths: Vec<&str> = entries.iter().map(|e| e.relative_path.as_str()).collect();
    assert_eq!(paths, vec!["a.txt", "b/a.txt", "b/z.txt"]);
    let sizes: Vec<u64> = entries.iter().map(|e| e.size_bytes).collect();
    assert_eq!(sizes, vec![1, 3, 2]);
}

#[test]
fn test_packing_is_deterministic() {
    let temp_dir = TempDir::new().unwrap();
    let source = temp_dir.path().join("src");
    let files: Vec<(String, String)> = (0..40)
        .map(|i| (format!("dir{}/file{i}.rs", i % 4), lines(i + 1)))
        .collect();
    let borrowed: Vec<(&str, &str)> = files.iter().map(|(p, c)| (p.as_str(), c.as_str())).collect();
    write_tree(&source, &borrowed);

    let engine = create_default_engine();
    let first = engine
        .pack(&source, &temp_dir.path().join("one.snap"), &PackOptions::default())
        .unwrap();
    let second = engine
        .pack(&source, &temp_dir.path().join("two.snap"), &PackOptions::default())
        .unwrap();

    assert_eq!(first.summary.digest, second.summary.digest);
    assert_eq!(
        manifest_paths(&temp_dir.path().join("one.snap")),
        manifest_paths(&temp_dir.path().join("two.snap"))
    );
}

#[test]
fn test_check_reports_metadata() {
    let temp_dir = TempDir::new().unwrap();
    let source = temp_dir.path().join("src");
    write_tree(&source, &[("one.txt", "1"), ("two.txt", "22")]);

    let output = temp_dir.path().join("out.snap");
    let engine = create_default_engine();
    let packed = engine
        .pack(
            &source,
            &output,
            &PackOptions {
                comment: Some("nightly".into()),
                author: Some("ci".into()),
                ..PackOptions::default()
            },
        )
        .unwrap();

    let check = engine.check(&output).unwrap();
    assert_eq!(check.digest, packed.summary.digest);
    assert_eq!(check.digest.len(), 64);
    assert_eq!(check.entry_count, 2);
    assert_eq!(check.total_bytes, 3);
    assert_eq!(check.metadata.author, "ci");
    assert_eq!(check.metadata.comment.as_deref(), Some("nightly"));
    assert_eq!(check.metadata.entry_count, 2);
    assert_eq!(check.file_len, fs::metadata(&output).unwrap().len());
}

#[test]
fn test_flipped_payload_byte_fails_check() {
    let temp_dir = TempDir::new().unwrap();
    let source = temp_dir.path().join("src");
    write_tree(&source, &[("main.py", &lines(200))]);

    let output = temp_dir.path().join("out.snap");
    let engine = create_default_engine();
    engine.pack(&source, &output, &PackOptions::default()).unwrap();

    let header = *engine.open(&output).unwrap().header();
    let mut bytes = fs::read(&output).unwrap();
    let target = (header.payload_offset + header.payload_len / 2) as usize;
    bytes[target] ^= 0xFF;
    fs::write(&output, &bytes).unwrap();

    let err = engine.check(&output).unwrap_err();
    assert!(matches!(err, SnapError::IntegrityCheckFailed { .. }), "got {err:?}");
}

#[test]
fn test_truncated_snapshot_is_corrupt() {
    let temp_dir = TempDir::new().unwrap();
    let source = temp_dir.path().join("src");
    write_tree(&source, &[("a.txt", "hello"), ("b.txt", "world")]);

    let output = temp_dir.path().join("out.snap");
    let engine = create_default_engine();
    engine.pack(&source, &output, &PackOptions::default()).unwrap();

    let bytes = fs::read(&output).unwrap();
    fs::write(&output, &bytes[..bytes.len() - 10]).unwrap();
    assert!(engine.check(&output).unwrap_err().is_corrupt());
    assert!(engine.list(&output).unwrap_err().is_corrupt());

    fs::write(&output, &bytes[..20]).unwrap();
    assert!(engine.open(&output).unwrap_err().is_corrupt());
}

#[test]
fn test_not_a_snapshot_is_corrupt() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("fake.snap");
    fs::write(&path, vec![b'z'; 200]).unwrap();
    assert!(create_default_engine().open(&path).unwrap_err().is_corrupt());
}

#[test]
fn test_veghignore_scenario() {
    let temp_dir = TempDir::new().unwrap();
    let source = temp_dir.path().join("src");
    write_tree(
        &source,
        &[("a.py", &lines(10)), ("b.txt", &lines(5)), (".veghignore", "*.txt\n")],
    );

    let output = temp_dir.path().join("out.snap");
    let engine = create_default_engine();
    engine.pack(&source, &output, &PackOptions::default()).unwrap();
    assert_eq!(manifest_paths(&output), vec!["a.py"]);

    let report = engine.loc(&output).unwrap();
    let python = report.get("python").unwrap();
    assert_eq!(python.files, 1);
    assert_eq!(python.lines, 10);
    assert!(report.get("text").is_none());
    assert_eq!(report.total_files(), 1);
}

#[test]
fn test_ignore_precedence_and_reinclude() {
    let temp_dir = TempDir::new().unwrap();
    let source = temp_dir.path().join("src");
    write_tree(
        &source,
        &[
            ("app.log", "log"),
            ("keep.log", "kept"),
            ("build/out.o", "obj"),
            ("notes.tmp", "tmp"),
            ("special.tmp", "tmp"),
            ("main.rs", "fn main() {}"),
            (".gitignore", "build/\n*.tmp\n"),
            (".veghignore", "*.log\n!keep.log\n"),
        ],
    );

    let output = temp_dir.path().join("out.snap");
    create_default_engine()
        .pack(
            &source,
            &output,
            &PackOptions {
                include: vec!["special.tmp".into()],
                ..PackOptions::default()
            },
        )
        .unwrap();

    assert_eq!(manifest_paths(&output), vec!["keep.log", "main.rs", "special.tmp"]);
}

#[test]
fn test_nested_ignore_files_are_honored() {
    let temp_dir = TempDir::new().unwrap();
    let source = temp_dir.path().join("src");
    write_tree(
        &source,
        &[
            ("sub/.gitignore", "*.log\n"),
            ("sub/x.log", "log"),
            ("sub/keep.rs", "fn keep() {}"),
            ("deep/.veghignore", "secret.txt\n"),
            ("deep/secret.txt", "hunter2"),
            ("deep/public.txt", "hello"),
            ("top.log", "not covered by sub/.gitignore"),
        ],
    );

    let output = temp_dir.path().join("out.snap");
    let engine = create_default_engine();
    engine.pack(&source, &output, &PackOptions::default()).unwrap();
    assert_eq!(
        manifest_paths(&output),
        vec!["deep/public.txt", "sub/keep.rs", "top.log"]
    );

    // Caller overrides sit above every ignore file
    engine
        .pack(
            &source,
            &output,
            &PackOptions {
                include: vec!["sub/x.log".into()],
                ..PackOptions::default()
            },
        )
        .unwrap();
    assert_eq!(
        manifest_paths(&output),
        vec!["deep/public.txt", "sub/keep.rs", "sub/x.log", "top.log"]
    );
}

#[test]
fn test_output_inside_source_is_not_collected() {
    let temp_dir = TempDir::new().unwrap();
    let source = temp_dir.path().join("src");
    write_tree(&source, &[("a.txt", "a")]);

    let output = source.join("self.snap");
    let engine = create_default_engine();
    engine.pack(&source, &output, &PackOptions::default()).unwrap();
    // Second pack sees the first snapshot on disk
    engine.pack(&source, &output, &PackOptions::default()).unwrap();
    assert_eq!(manifest_paths(&output), vec!["a.txt"]);
}

#[test]
fn test_loc_from_snapshot_matches_source_tree() {
    let temp_dir = TempDir::new().unwrap();
    let source = temp_dir.path().join("src");
    write_tree(
        &source,
        &[
            ("lib.rs", "// header\n\nfn a() {}\n/* block\n   more */\nfn b() {}\n"),
            ("tool.py", "# comment\nimport os\n\nprint(os.name)\n"),
            ("web/index.html", "<html>\n<!-- note -->\n</html>\n"),
            ("Makefile", "all:\n\techo hi\n"),
            ("data.unknown", "stuff\n"),
        ],
    );
    fs::write(source.join("blob.rs"), [0u8, 1, 2, 0, 3]).unwrap();

    let output = temp_dir.path().join("out.snap");
    let engine = create_default_engine();
    engine.pack(&source, &output, &PackOptions::default()).unwrap();

    let collected = FileCollector::new(IgnoreMatcher::empty(), CollectOptions::default())
        .collect(&source)
        .unwrap();
    let from_tree = count_files(&collected).unwrap();
    let from_snapshot = engine.loc(&output).unwrap();

    assert_eq!(from_tree, from_snapshot);
    assert_eq!(from_snapshot.binary_files, 1);

    let rust = from_snapshot.get("rust").unwrap();
    assert_eq!((rust.files, rust.lines, rust.blank, rust.comment, rust.code), (1, 6, 1, 3, 2));
    assert_eq!(from_snapshot.get("makefile").unwrap().lines, 2);
    assert_eq!(from_snapshot.get("other").unwrap().files, 1);
}

#[test]
fn test_stream_entries_reads_selectively() {
    let temp_dir = TempDir::new().unwrap();
    let source = temp_dir.path().join("src");
    write_tree(&source, &[("a.txt", "alpha"), ("b.txt", "beta"), ("c.txt", "gamma")]);

    let output = temp_dir.path().join("out.snap");
    let engine = create_default_engine();
    engine.pack(&source, &output, &PackOptions::default()).unwrap();

    let handle = engine.open(&output).unwrap();
    let mut stream = handle.stream_entries().unwrap();
    let mut seen = Vec::new();
    while let Some((entry, mut content)) = stream.next_entry().unwrap() {
        // Only read the middle entry; the others are skipped unread
        if entry.relative_path == "b.txt" {
            let mut text = String::new();
            std::io::Read::read_to_string(&mut content, &mut text).unwrap();
            assert_eq!(text, "beta");
        }
        seen.push(entry.relative_path.clone());
    }
    assert_eq!(seen, vec!["a.txt", "b.txt", "c.txt"]);
}

#[test]
fn test_restore_overwrites_and_keeps_unrelated_files() {
    let temp_dir = TempDir::new().unwrap();
    let source = temp_dir.path().join("src");
    write_tree(&source, &[("config.toml", "new = true\n")]);

    let output = temp_dir.path().join("out.snap");
    let engine = create_default_engine();
    engine.pack(&source, &output, &PackOptions::default()).unwrap();

    let dest = temp_dir.path().join("dest");
    write_tree(&dest, &[("config.toml", "old = true\n"), ("local.txt", "mine")]);
    engine.restore(&output, &dest).unwrap();

    assert_eq!(fs::read_to_string(dest.join("config.toml")).unwrap(), "new = true\n");
    assert_eq!(fs::read_to_string(dest.join("local.txt")).unwrap(), "mine");
}

#[test]
fn test_empty_directory_round_trip() {
    let temp_dir = TempDir::new().unwrap();
    let source = temp_dir.path().join("empty");
    fs::create_dir_all(&source).unwrap();

    let output = temp_dir.path().join("empty.snap");
    let engine = create_default_engine();
    let report = engine.pack(&source, &output, &PackOptions::default()).unwrap();
    assert_eq!(report.file_count(), 0);

    assert!(engine.list(&output).unwrap().is_empty());
    engine.check(&output).unwrap();
    let summary = engine.restore(&output, &temp_dir.path().join("out")).unwrap();
    assert_eq!(summary.files, 0);
    assert_eq!(engine.loc(&output).unwrap().total_files(), 0);
}

/// Assemble an uncompressed snapshot by hand, bypassing the writer's path checks
fn craft_snapshot(path: &Path, files: &[(&str, &[u8])]) {
    let mut payload = Vec::new();
    let mut entries = Vec::new();
    for (relative, content) in files {
        write_frame_header(&mut payload, relative, content.len() as u64).unwrap();
        entries.push(Entry {
            relative_path: relative.to_string(),
            size_bytes: content.len() as u64,
            mode: 0o644,
            payload_offset: payload.len() as u64,
        });
        payload.extend_from_slice(content);
    }

    let mut metadata = SnapshotMetadata::new("crafted");
    metadata.entry_count = entries.len() as u64;
    metadata.compression = "none".into();
    let metadata_block = metadata.to_block().unwrap();
    let manifest_block = Manifest { entries }.to_block().unwrap();

    let header = Header::layout(
        CompressionKind::None,
        metadata_block.len() as u64,
        manifest_block.len() as u64,
        payload.len() as u64,
        payload.len() as u64,
    );
    let mut hasher = vegh_core::integrity::hasher();
    hasher.update(&payload);

    let mut file = fs::File::create(path).unwrap();
    header.write_to(&mut file).unwrap();
    file.write_all(&metadata_block).unwrap();
    file.write_all(&manifest_block).unwrap();
    file.write_all(&payload).unwrap();
    file.write_all(&hasher.finalize_raw()).unwrap();
}

#[test]
fn test_crafted_snapshot_is_readable() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("crafted.snap");
    craft_snapshot(&path, &[("hello.txt", b"hello\n")]);

    let engine = create_default_engine();
    engine.check(&path).unwrap();
    let dest = temp_dir.path().join("dest");
    engine.restore(&path, &dest).unwrap();
    assert_eq!(fs::read_to_string(dest.join("hello.txt")).unwrap(), "hello\n");
}

#[test]
fn test_restore_rejects_traversal_before_writing() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("evil.snap");
    craft_snapshot(&path, &[("fine.txt", b"ok"), ("../escaped.txt", b"gotcha")]);

    let dest = temp_dir.path().join("dest");
    let err = create_default_engine().restore(&path, &dest).unwrap_err();
    assert!(matches!(err, SnapError::Traversal(_)), "got {err:?}");

    assert!(!temp_dir.path().join("escaped.txt").exists());
    assert!(!dest.join("fine.txt").exists());
}

#[test]
fn test_restore_rejects_absolute_path() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("abs.snap");
    craft_snapshot(&path, &[("/etc/vegh-test", b"x")]);

    let err = create_default_engine()
        .restore(&path, &temp_dir.path().join("dest"))
        .unwrap_err();
    assert!(matches!(err, SnapError::Traversal(_)));
}

#[cfg(unix)]
#[test]
fn test_restore_keeps_permission_bits() {
    use std::os::unix::fs::PermissionsExt;

    let temp_dir = TempDir::new().unwrap();
    let source = temp_dir.path().join("src");
    write_tree(&source, &[("run.sh", "#!/bin/sh\necho hi\n")]);
    fs::set_permissions(source.join("run.sh"), fs::Permissions::from_mode(0o755)).unwrap();

    let output = temp_dir.path().join("out.snap");
    let engine = create_default_engine();
    engine.pack(&source, &output, &PackOptions::default()).unwrap();
    assert_eq!(engine.list(&output).unwrap()[0].mode, 0o755);

    let dest = temp_dir.path().join("dest");
    engine.restore(&output, &dest).unwrap();
    let mode = fs::metadata(dest.join("run.sh")).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o755);
}
