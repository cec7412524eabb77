//! Materializes staging commands below a staging root.
//!
//! Applying the same command list twice yields the same tree: directories
//! are created if missing, links and files replace whatever non-directory
//! already sits at their destination.

use crate::config::types::{io_context, Result, XprocError};
use crate::resolve::ldd::reroot;
use crate::wire::types::{Acmd, EntryKind};
use std::fs::{self, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};

/// Destination of `fullpath` under `root`. Only normal components survive.
pub fn staged_path(root: &Path, fullpath: &Path) -> PathBuf {
    reroot(root, fullpath)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ApplyReport {
    pub directories: usize,
    pub symlinks: usize,
    pub files: usize,
    pub local: usize,
    pub bytes: u64,
}

pub struct Stager {
    root: PathBuf,
}

fn set_mode(path: &Path, mode: u32) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| io_context(format!("chmod {}", path.display()), e))
}

/// Remove a non-directory so something else can take its place.
fn clear_slot(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => Err(XprocError::Io(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} is a directory", path.display()),
        ))),
        Ok(_) => fs::remove_file(path).map_err(|e| io_context(path.display(), e)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_context(path.display(), e)),
    }
}

impl Stager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_parent(&self, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| io_context(format!("mkdir {}", parent.display()), e))?;
        }
        Ok(())
    }

    /// Apply one command, consuming its payload from `data` when it has one.
    pub fn apply<R: Read>(&self, cmd: &Acmd, data: &mut R, report: &mut ApplyReport) -> Result<()> {
        if cmd.local {
            if fs::symlink_metadata(&cmd.fullpath).is_err() {
                return Err(XprocError::PathNotFound {
                    name: cmd.fullpath.display().to_string(),
                    roots: "the local filesystem".to_string(),
                });
            }
            report.local += 1;
            return Ok(());
        }

        let dest = staged_path(&self.root, &cmd.fullpath);
        match &cmd.kind {
            EntryKind::Directory { mode } => {
                if let Ok(meta) = fs::symlink_metadata(&dest) {
                    if !meta.is_dir() {
                        fs::remove_file(&dest).map_err(|e| io_context(dest.display(), e))?;
                    }
                }
                fs::create_dir_all(&dest)
                    .map_err(|e| io_context(format!("mkdir {}", dest.display()), e))?;
                // Owner bits stay set so later entries can land inside.
                set_mode(&dest, mode | 0o700)?;
                report.directories += 1;
            }
            EntryKind::Symlink { target } => {
                self.ensure_parent(&dest)?;
                clear_slot(&dest)?;
                symlink(target, &dest)
                    .map_err(|e| io_context(format!("symlink {}", dest.display()), e))?;
                report.symlinks += 1;
            }
            EntryKind::Regular { mode, size } => {
                self.ensure_parent(&dest)?;
                // A previous apply may have left it read-only.
                clear_slot(&dest)?;
                let mut out = OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(&dest)
                    .map_err(|e| io_context(format!("create {}", dest.display()), e))?;
                let copied = io::copy(&mut data.by_ref().take(*size), &mut out)
                    .map_err(|e| io_context(format!("write {}", dest.display()), e))?;
                if copied != *size {
                    return Err(XprocError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!(
                            "{}: payload ended after {} of {} bytes",
                            dest.display(),
                            copied,
                            size
                        ),
                    )));
                }
                set_mode(&dest, *mode)?;
                report.files += 1;
                report.bytes += copied;
            }
        }
        Ok(())
    }

    /// Apply every command in order against one payload stream.
    pub fn apply_all<R: Read>(&self, cmds: &[Acmd], data: &mut R) -> Result<ApplyReport> {
        let mut report = ApplyReport::default();
        for cmd in cmds {
            self.apply(cmd, data, &mut report)?;
        }
        log::debug!(
            "staged {} dirs, {} links, {} files ({} bytes) under {}",
            report.directories,
            report.symlinks,
            report.files,
            report.bytes,
            self.root.display()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::os::unix::fs::MetadataExt;

    fn regular(path: &str, size: u64) -> Acmd {
        Acmd {
            name: path.rsplit('/').next().unwrap_or(path).to_string(),
            fullpath: PathBuf::from(path),
            local: false,
            kind: EntryKind::Regular { mode: 0o644, size },
            file: None,
        }
    }

    #[test]
    fn staged_path_ignores_traversal() {
        assert_eq!(
            staged_path(Path::new("/tmp/xproc"), Path::new("/usr/../lib/libc.so")),
            PathBuf::from("/tmp/xproc/usr/lib/libc.so")
        );
    }

    #[test]
    fn files_take_exactly_their_size_from_the_stream() {
        let dir = tempfile::tempdir().unwrap();
        let stager = Stager::new(dir.path());
        let cmds = vec![regular("/a/one", 3), regular("/a/two", 2)];
        let mut data = Cursor::new(b"abcde".to_vec());
        let report = stager.apply_all(&cmds, &mut data).unwrap();
        assert_eq!(report.files, 2);
        assert_eq!(report.bytes, 5);
        assert_eq!(fs::read(dir.path().join("a/one")).unwrap(), b"abc");
        assert_eq!(fs::read(dir.path().join("a/two")).unwrap(), b"de");
    }

    #[test]
    fn short_payload_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let stager = Stager::new(dir.path());
        let err = stager
            .apply_all(&[regular("/f", 10)], &mut Cursor::new(b"abc".to_vec()))
            .unwrap_err();
        assert!(err.to_string().contains("3 of 10"));
    }

    #[test]
    fn symlinks_replace_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let stager = Stager::new(dir.path());
        fs::write(dir.path().join("l"), b"old").unwrap();
        let link = Acmd {
            name: "l".into(),
            fullpath: "/l".into(),
            local: false,
            kind: EntryKind::Symlink {
                target: "target".into(),
            },
            file: None,
        };
        stager.apply_all(&[link], &mut io::empty()).unwrap();
        assert_eq!(
            fs::read_link(dir.path().join("l")).unwrap(),
            PathBuf::from("target")
        );
    }

    #[test]
    fn regular_file_replaces_a_symlink_instead_of_writing_through_it() {
        let dir = tempfile::tempdir().unwrap();
        let outside = dir.path().join("outside");
        fs::write(&outside, b"keep").unwrap();
        let staging = dir.path().join("stage");
        fs::create_dir_all(&staging).unwrap();
        symlink(&outside, staging.join("f")).unwrap();

        Stager::new(&staging)
            .apply_all(&[regular("/f", 2)], &mut Cursor::new(b"new".to_vec()))
            .unwrap();
        assert_eq!(fs::read(&outside).unwrap(), b"keep");
        assert_eq!(fs::read(staging.join("f")).unwrap(), b"ne");
    }

    #[test]
    fn read_only_files_are_replaced_on_a_second_apply() {
        let dir = tempfile::tempdir().unwrap();
        let stager = Stager::new(dir.path());
        let read_only = || Acmd {
            kind: EntryKind::Regular { mode: 0o444, size: 3 },
            ..regular("/bin/tool", 3)
        };

        stager.apply_all(&[read_only()], &mut Cursor::new(b"one".to_vec())).unwrap();
        let staged = dir.path().join("bin/tool");
        let first = fs::metadata(&staged).unwrap();
        assert_eq!(first.permissions().mode() & 0o777, 0o444);

        stager.apply_all(&[read_only()], &mut Cursor::new(b"two".to_vec())).unwrap();
        let second = fs::metadata(&staged).unwrap();
        assert_eq!(fs::read(&staged).unwrap(), b"two");
        assert_eq!(second.permissions().mode() & 0o777, 0o444);
        assert_ne!(first.ino(), second.ino());
    }

    #[test]
    fn missing_local_entry_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut cmd = regular("/no/such/tool", 0);
        cmd.local = true;
        assert!(matches!(
            Stager::new(dir.path()).apply_all(&[cmd], &mut io::empty()),
            Err(XprocError::PathNotFound { .. })
        ));
    }

    #[test]
    fn directories_keep_requested_mode_plus_owner_access() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = Acmd {
            name: "d".into(),
            fullpath: "/d".into(),
            local: false,
            kind: EntryKind::Directory { mode: 0o555 },
            file: None,
        };
        Stager::new(dir.path())
            .apply_all(&[cmd], &mut io::empty())
            .unwrap();
        let mode = fs::metadata(dir.path().join("d")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }
}
