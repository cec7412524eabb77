//! Transitive shared-library closure of an executable.
//!
//! Lookup order for a bare library name:
//! 1. the requesting object's RUNPATH/RPATH (`$ORIGIN` expanded)
//! 2. `<root>/<dir>/<name>` for each configured library directory
//! 3. a recursive walk of the library directories under `<root>`
//!
//! The walk is indexed once per resolver and reused for every miss.

use crate::config::types::{Result, XprocError};
use crate::resolve::elf::{self, DynamicInfo};
use std::collections::{HashMap, HashSet, VecDeque};
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// Outcome of resolving one executable.
#[derive(Debug, Default)]
pub struct Resolution {
    /// The executable first, then each dependency once, in discovery order
    pub paths: Vec<PathBuf>,
    /// Dependencies that could not be located or parsed
    pub problems: Vec<XprocError>,
}

impl Resolution {
    pub fn is_complete(&self) -> bool {
        self.problems.is_empty()
    }
}

pub struct Resolver {
    root: PathBuf,
    lib_path: Vec<PathBuf>,
    index: Option<HashMap<OsString, PathBuf>>,
}

enum Wanted {
    Name(String),
    Path(PathBuf),
}

/// Prefix an absolute path with `root`, dropping `..` and `.` components.
pub fn reroot(root: &Path, path: &Path) -> PathBuf {
    let mut out = root.to_path_buf();
    for component in path.components() {
        if let Component::Normal(part) = component {
            out.push(part);
        }
    }
    out
}

impl Resolver {
    pub fn new(root: impl Into<PathBuf>, lib_path: Vec<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lib_path,
            index: None,
        }
    }

    fn search_dirs(&self) -> Vec<PathBuf> {
        self.lib_path
            .iter()
            .map(|dir| reroot(&self.root, dir))
            .collect()
    }

    fn roots_label(&self) -> String {
        self.search_dirs()
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(":")
    }

    fn build_index(&self) -> HashMap<OsString, PathBuf> {
        let mut index = HashMap::new();
        for dir in self.search_dirs() {
            let walker = WalkDir::new(&dir)
                .follow_links(false)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|entry| match entry {
                    Ok(entry) => Some(entry),
                    Err(e) => {
                        log::trace!("skipping during library walk: {}", e);
                        None
                    }
                });
            for entry in walker {
                let kind = entry.file_type();
                if kind.is_file() || kind.is_symlink() {
                    index
                        .entry(entry.file_name().to_os_string())
                        .or_insert_with(|| entry.path().to_path_buf());
                }
            }
        }
        log::debug!("indexed {} library candidates", index.len());
        index
    }

    fn locate(&mut self, name: &str, object_dirs: &[PathBuf]) -> Option<PathBuf> {
        let direct = object_dirs
            .iter()
            .cloned()
            .chain(self.search_dirs())
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.is_file());
        if direct.is_some() {
            return direct;
        }

        if self.index.is_none() {
            self.index = Some(self.build_index());
        }
        self.index
            .as_ref()
            .and_then(|index| index.get(&OsString::from(name)))
            .filter(|path| path.is_file())
            .cloned()
    }

    fn object_dirs(&self, owner: &Path, info: &DynamicInfo) -> Vec<PathBuf> {
        let origin = owner.parent().unwrap_or_else(|| Path::new("/"));
        info.search_paths
            .iter()
            .map(|entry| {
                let expanded = entry
                    .replace("${ORIGIN}", &origin.to_string_lossy())
                    .replace("$ORIGIN", &origin.to_string_lossy());
                let path = PathBuf::from(expanded);
                if !path.is_absolute() {
                    origin.join(path)
                } else if path.starts_with(origin) {
                    path
                } else {
                    reroot(&self.root, &path)
                }
            })
            .collect()
    }

    fn wanted(&self, owner: &Path, info: &DynamicInfo) -> Vec<Wanted> {
        let origin = owner.parent().unwrap_or_else(|| Path::new("/"));
        let mut wanted = Vec::new();
        if let Some(interp) = &info.interpreter {
            wanted.push(Wanted::Path(reroot(&self.root, Path::new(interp))));
        }
        for name in &info.needed {
            let path = Path::new(name);
            if path.is_absolute() {
                wanted.push(Wanted::Path(reroot(&self.root, path)));
            } else if name.contains('/') {
                wanted.push(Wanted::Path(origin.join(path)));
            } else {
                wanted.push(Wanted::Name(name.clone()));
            }
        }
        wanted
    }

    /// Resolve `executable` and everything it transitively needs.
    ///
    /// Only a failure to parse the executable itself is an error. Missing or
    /// unreadable dependencies are collected in [`Resolution::problems`] and
    /// resolution of their siblings carries on.
    pub fn resolve(&mut self, executable: &Path) -> Result<Resolution> {
        let info = elf::read_dynamic_info(executable)?;
        let mut resolution = Resolution {
            paths: vec![executable.to_path_buf()],
            problems: Vec::new(),
        };
        let mut visited: HashSet<PathBuf> = HashSet::from([executable.to_path_buf()]);
        let mut queue = VecDeque::from([(executable.to_path_buf(), info)]);

        while let Some((owner, info)) = queue.pop_front() {
            let object_dirs = self.object_dirs(&owner, &info);
            for want in self.wanted(&owner, &info) {
                let (label, found) = match want {
                    Wanted::Path(path) => {
                        let found = path.is_file().then(|| path.clone());
                        (path.display().to_string(), found)
                    }
                    Wanted::Name(name) => {
                        let found = self.locate(&name, &object_dirs);
                        (name, found)
                    }
                };

                let Some(path) = found else {
                    log::warn!("{} needs {}, which was not found", owner.display(), label);
                    resolution.problems.push(XprocError::PathNotFound {
                        name: label,
                        roots: self.roots_label(),
                    });
                    continue;
                };

                if !visited.insert(path.clone()) {
                    continue;
                }
                log::trace!("{} -> {}", owner.display(), path.display());
                resolution.paths.push(path.clone());
                match elf::read_dynamic_info(&path) {
                    Ok(info) => queue.push_back((path, info)),
                    Err(e) => {
                        log::warn!("cannot inspect {}: {}", path.display(), e);
                        resolution.problems.push(e);
                    }
                }
            }
        }

        log::debug!(
            "{} resolves to {} objects ({} problems)",
            executable.display(),
            resolution.paths.len(),
            resolution.problems.len()
        );
        Ok(resolution)
    }
}

/// One-shot convenience wrapper around [`Resolver`].
pub fn ldd(executable: &Path, root: &Path, lib_path: &[PathBuf]) -> Result<Resolution> {
    Resolver::new(root, lib_path.to_vec()).resolve(executable)
}
