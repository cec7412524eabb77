//! Turns a set of root paths into the ordered staging command list.
//!
//! Trees are walked pre-order without following symlinks, so a directory
//! always precedes its contents. A root that is itself a symlink is recorded
//! as a link and its target is collected as a further root.

use crate::config::types::{io_context, Result};
use crate::wire::types::{Acmd, EntryKind};
use std::collections::HashSet;
use std::env;
use std::fs::{self, File};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Default)]
pub struct FileCollector {
    cmds: Vec<Acmd>,
    total_bytes: u64,
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(env::current_dir()?.join(path))
    }
}

fn mode_of(meta: &fs::Metadata) -> u32 {
    meta.permissions().mode() & 0o7777
}

impl FileCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Walk `root` and append one command per entry. Entries already
    /// collected from earlier roots are emitted again.
    pub fn collect(&mut self, root: &Path) -> Result<()> {
        let mut pending = vec![absolute(root)?];
        // Guards the symlink chase against link cycles.
        let mut walked = HashSet::new();
        while let Some(root) = pending.pop() {
            if !walked.insert(root.clone()) {
                continue;
            }
            if let Some(target) = self.walk(&root)? {
                pending.push(target);
            }
        }
        Ok(())
    }

    pub fn collect_all<I, P>(&mut self, roots: I) -> Result<()>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        for root in roots {
            self.collect(root.as_ref())?;
        }
        Ok(())
    }

    /// Record a path that already exists on every executor. No bytes are sent.
    pub fn note_local(&mut self, path: &Path) -> Result<()> {
        let path = absolute(path)?;
        let meta = fs::metadata(&path).map_err(|e| io_context(path.display(), e))?;
        self.cmds.push(Acmd {
            name: file_name(&path),
            fullpath: path,
            local: true,
            kind: EntryKind::Regular {
                mode: mode_of(&meta),
                size: meta.len(),
            },
            file: None,
        });
        Ok(())
    }

    /// Returns the resolved target when `root` itself is a symlink.
    fn walk(&mut self, root: &Path) -> Result<Option<PathBuf>> {
        let mut link_target = None;
        for entry in WalkDir::new(root).follow_links(false).follow_root_links(false) {
            let entry = entry.map_err(|e| {
                let context = format!("walking {}", root.display());
                io_context(context, e.into())
            })?;
            let path = entry.path().to_path_buf();
            let meta = entry.metadata().map_err(|e| {
                let context = format!("stat {}", path.display());
                io_context(context, e.into())
            })?;
            let kind = entry.file_type();

            let (kind, file) = if kind.is_dir() {
                (EntryKind::Directory { mode: mode_of(&meta) }, None)
            } else if kind.is_symlink() {
                let target = fs::read_link(&path).map_err(|e| io_context(path.display(), e))?;
                if entry.depth() == 0 {
                    let resolved = if target.is_absolute() {
                        target.clone()
                    } else {
                        path.parent().unwrap_or_else(|| Path::new("/")).join(&target)
                    };
                    link_target = Some(resolved);
                }
                (EntryKind::Symlink { target }, None)
            } else if kind.is_file() {
                let handle = File::open(&path).map_err(|e| io_context(path.display(), e))?;
                let size = meta.len();
                self.total_bytes += size;
                (
                    EntryKind::Regular {
                        mode: mode_of(&meta),
                        size,
                    },
                    Some(handle),
                )
            } else {
                log::debug!("skipping special file {}", path.display());
                continue;
            };

            log::trace!("collect {} as {:?}", path.display(), kind);
            self.cmds.push(Acmd {
                name: file_name(&path),
                fullpath: path,
                local: false,
                kind,
                file,
            });
        }
        Ok(link_target)
    }

    pub fn commands(&self) -> &[Acmd] {
        &self.cmds
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn into_parts(self) -> (Vec<Acmd>, u64) {
        (self.cmds, self.total_bytes)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "/".to_string())
}
