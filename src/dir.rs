//! The Directory Index
//!
//! Directories are nothing but a set of normalized paths; the root (the
//! empty path) is always present implicitly. Files and directories live in
//! independent maps keyed by path, so there is no parent-pointer graph to
//! maintain -- containment questions are answered from the path strings.
//!
//! The index needs sight of the file store for exactly two questions:
//! whether a path collides with an existing file, and whether a directory
//! being removed still has files in it. Both arrive as a borrowed store
//! argument; the index never holds one.
use std::collections::HashSet;

use log::debug;

use crate::{
    error::{FsErrorKind, Result},
    path::{is_in_directory, parent_path, relative_path},
    seal::BlockSealer,
    store::FileStore,
};

/// The set of directories in the file system
#[derive(Debug, Default)]
pub struct DirectoryIndex {
    dirs: HashSet<String>,
}

impl DirectoryIndex {
    /// Create an index holding only the implicit root.
    pub fn new() -> Self {
        DirectoryIndex {
            dirs: HashSet::new(),
        }
    }

    /// Create a directory
    ///
    /// The parent must already be a directory, and the path must collide
    /// with neither an existing directory nor a file.
    pub fn mkdir<S>(&mut self, path: &str, files: &FileStore<S>) -> Result<()>
    where
        S: BlockSealer,
    {
        if self.is_directory(path) {
            return Err(FsErrorKind::IsDirectory.into());
        }
        if files.is_file(path) {
            return Err(FsErrorKind::NotDirectory.into());
        }
        let parent = parent_path(path);
        if !self.is_directory(&parent) {
            return Err(FsErrorKind::NotDirectory.into());
        }
        debug!("mkdir {:?}", path);
        self.dirs.insert(path.to_string());
        Ok(())
    }

    /// Remove a directory
    ///
    /// The directory must exist and must be empty: no file and no
    /// directory may have it as parent. The root cannot be removed.
    pub fn rmdir<S>(&mut self, path: &str, files: &FileStore<S>) -> Result<()>
    where
        S: BlockSealer,
    {
        if path.is_empty() {
            return Err(FsErrorKind::InvalidArgument.into());
        }
        if files.is_file(path) {
            return Err(FsErrorKind::NotDirectory.into());
        }
        if !self.dirs.contains(path) {
            return Err(FsErrorKind::NotFound.into());
        }
        let has_subdirs = self.dirs.iter().any(|d| is_in_directory(path, d));
        let has_files = files.file_paths().any(|f| is_in_directory(path, f));
        if has_subdirs || has_files {
            return Err(FsErrorKind::NotEmpty.into());
        }
        debug!("rmdir {:?}", path);
        self.dirs.remove(path);
        Ok(())
    }

    /// Does this path name a directory? The root always does.
    pub fn is_directory(&self, path: &str) -> bool {
        path.is_empty() || self.dirs.contains(path)
    }

    /// List a directory
    ///
    /// Returns the names (relative to `path`) of every directory and file
    /// directly inside it, sorted so the listing is stable for the life of
    /// the mount. `.` and `..` are the kernel bridge's business, not ours.
    pub fn readdir<S>(&self, path: &str, files: &FileStore<S>) -> Result<Vec<String>>
    where
        S: BlockSealer,
    {
        if files.is_file(path) {
            return Err(FsErrorKind::NotDirectory.into());
        }
        if !self.is_directory(path) {
            return Err(FsErrorKind::NotFound.into());
        }

        let mut entries: Vec<String> = self
            .dirs
            .iter()
            .map(String::as_str)
            .chain(files.file_paths())
            .filter(|entry| is_in_directory(path, entry))
            .filter_map(|entry| relative_path(path, entry))
            .collect();
        entries.sort();
        Ok(entries)
    }

    /// Number of directories, not counting the implicit root.
    pub fn dir_count(&self) -> usize {
        self.dirs.len()
    }

    /// Re-create every ancestor of a restored file path
    ///
    /// Dumps carry no record of directories; they are reconstructed from
    /// the file paths at restore time.
    pub(crate) fn add_parents_of(&mut self, file_path: &str) {
        let mut parent = parent_path(file_path);
        while !parent.is_empty() && self.dirs.insert(parent.clone()) {
            parent = parent_path(&parent);
        }
    }
}
