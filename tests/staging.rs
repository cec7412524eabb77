//! Collector output replayed through the stager, the way an executor sees it.

use std::fs;
use std::io::{Cursor, Read};
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::Path;
use walkdir::WalkDir;
use xproc::stage::{staged_path, FileCollector, Stager};
use xproc::wire::types::Acmd;

/// Detach the open handles and concatenate their bytes in command order.
fn take_payload(collector: FileCollector) -> (Vec<Acmd>, Vec<u8>) {
    let (mut cmds, _) = collector.into_parts();
    let mut bytes = Vec::new();
    for cmd in cmds.iter_mut() {
        if let Some(mut file) = cmd.file.take() {
            file.read_to_end(&mut bytes).unwrap();
        }
    }
    (cmds, bytes)
}

fn tree(root: &Path) -> Vec<(String, String)> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .map(|e| e.unwrap())
        .map(|e| {
            let rel = e.path().strip_prefix(root).unwrap().display().to_string();
            let what = if e.path_is_symlink() {
                format!("link:{}", fs::read_link(e.path()).unwrap().display())
            } else if e.file_type().is_file() {
                format!("file:{}", fs::read_to_string(e.path()).unwrap())
            } else {
                "dir".to_string()
            };
            (rel, what)
        })
        .collect()
}

fn fixture(dir: &Path) -> std::path::PathBuf {
    let src = dir.join("src");
    fs::create_dir_all(src.join("lib")).unwrap();
    fs::write(src.join("lib/libdemo.so.1.2"), "elf-bytes").unwrap();
    symlink("libdemo.so.1.2", src.join("lib/libdemo.so.1")).unwrap();
    fs::write(src.join("tool"), "#!/bin/sh\n").unwrap();
    fs::set_permissions(src.join("tool"), fs::Permissions::from_mode(0o750)).unwrap();
    src
}

#[test]
fn applying_the_same_closure_twice_gives_the_same_tree() {
    let dir = tempfile::tempdir().unwrap();
    let src = fixture(dir.path());
    let stage = dir.path().join("stage");

    let mut snapshots = Vec::new();
    for _ in 0..2 {
        let mut collector = FileCollector::new();
        collector.collect(&src).unwrap();
        let (cmds, data) = take_payload(collector);
        let report = Stager::new(&stage)
            .apply_all(&cmds, &mut Cursor::new(data))
            .unwrap();
        assert_eq!(report.files, 2);
        assert_eq!(report.symlinks, 1);
        snapshots.push(tree(&stage));
    }
    assert_eq!(snapshots[0], snapshots[1]);

    let tool = staged_path(&stage, &src.join("tool"));
    assert_eq!(
        fs::metadata(&tool).unwrap().permissions().mode() & 0o777,
        0o750
    );
    let link = staged_path(&stage, &src.join("lib/libdemo.so.1"));
    assert_eq!(fs::read_to_string(link).unwrap(), "elf-bytes");
}

#[test]
fn collector_totals_match_the_streamed_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let src = fixture(dir.path());
    let mut collector = FileCollector::new();
    collector.collect(&src).unwrap();
    let total = collector.total_bytes();
    let (_, data) = take_payload(collector);
    assert_eq!(total, data.len() as u64);
    assert_eq!(total, "elf-bytes".len() as u64 + "#!/bin/sh\n".len() as u64);
}
