//! The Enclave
//!
//! The trusted side of the house. An [`Enclave`] owns the authoritative
//! directory tree and file store, and every entry point here mirrors one
//! trusted call in the boundary's operation table: primitive arguments,
//! length-tagged byte buffers, nothing else. Plaintext crosses outward only
//! on `read`, and only as many bytes as the caller asked for and the file
//! could supply.
//!
//! Paths are normalized exactly once, on entry; below this module they are
//! opaque keys. A path carrying the reserved directory-listing separator
//! (byte `0x1C`) is rejected outright, since it could not be listed back
//! across the boundary unambiguously.
//!
//! The mount lifecycle is a straight line: restore on construction, serve,
//! dump on unmount. Operations arriving outside the serving state are
//! refused the same way a platform refuses a sealing key whose policy has
//! lapsed.
use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Instant,
};

use failure::Error;
use log::{debug, error, info};

use crate::{
    crypto::make_sealing_key,
    dir::DirectoryIndex,
    error::{FsErrorKind, Result},
    path::clean_path,
    persist,
    seal::{AeadSealer, BlockSealer},
    store::FileStore,
    uuid::FsUuid,
};

/// The byte separating names in a packed directory listing.
pub const ENTRY_SEPARATOR: u8 = 0x1C;

/// Bytes reserved per entry when sizing a listing buffer.
pub const ENTRY_SLOT_SIZE: usize = 256;

/// What kind of thing a path names.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EntryKind {
    /// A regular file.
    File,
    /// A directory.
    Directory,
}

/// Attributes synthesized for `getattr`
///
/// Times, ownership, and permissions are the untrusted side's fiction to
/// tell; the enclave reports only what it authoritatively knows.
#[derive(Clone, Copy, Debug)]
pub struct EntryAttr {
    /// File or directory.
    pub kind: EntryKind,
    /// Logical size in bytes; a directory reports one block.
    pub size: u64,
    /// Conventional link count: 2 for directories, 1 for files.
    pub links: u32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum MountState {
    Serving,
    Draining,
    Unmounted,
}

/// The mounted file system
///
/// All state lives in the file store and the directory index; the enclave
/// itself carries only the mount lifecycle and the dump location.
pub struct Enclave<S>
where
    S: BlockSealer,
{
    store: FileStore<S>,
    dirs: DirectoryIndex,
    dump_root: Option<PathBuf>,
    state: MountState,
}

impl Enclave<AeadSealer> {
    /// Mount from a host dump directory
    ///
    /// The sealing key is derived from the password and the dump root's
    /// name, so remounting the same directory with the same password
    /// unseals what the previous mount sealed. A missing dump root mounts
    /// an empty file system.
    pub fn mount<P>(dump_root: P, password: &str, block_size: usize) -> Result<Self, Error>
    where
        P: Into<PathBuf>,
    {
        let dump_root = dump_root.into();
        let name = dump_root
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| failure::format_err!("dump root {:?} has no usable name", dump_root))?;
        let id = FsUuid::new_fs(name);
        info!("mounting file system {} from {:?}", id, dump_root);

        let key = make_sealing_key(password, &id);
        let sealer = AeadSealer::new(&key);

        let start = Instant::now();
        let (store, dirs) = persist::restore(&dump_root, block_size, sealer)?;
        info!(
            "restored {} files in {} µs",
            store.file_count(),
            start.elapsed().as_micros()
        );

        Ok(Enclave {
            store,
            dirs,
            dump_root: Some(dump_root),
            state: MountState::Serving,
        })
    }
}

impl<S> Enclave<S>
where
    S: BlockSealer,
{
    /// Mount an ephemeral file system around an explicit sealer
    ///
    /// Nothing is restored and nothing will be dumped; everything is lost
    /// at unmount. Mainly useful for exercising the dispatcher directly.
    pub fn ephemeral(block_size: usize, sealer: S) -> Self {
        Enclave {
            store: FileStore::new(block_size, sealer),
            dirs: DirectoryIndex::new(),
            dump_root: None,
            state: MountState::Serving,
        }
    }

    /// Assemble a serving enclave from an already-restored store and index.
    pub fn from_parts(store: FileStore<S>, dirs: DirectoryIndex) -> Self {
        Enclave {
            store,
            dirs,
            dump_root: None,
            state: MountState::Serving,
        }
    }

    /// Take the store and index back out, consuming the enclave.
    pub fn into_parts(self) -> (FileStore<S>, DirectoryIndex) {
        (self.store, self.dirs)
    }

    /// Unmount: dump the store (when there is a dump root) and refuse all
    /// further operations.
    pub fn unmount(&mut self) -> Result<(), Error> {
        if self.state != MountState::Serving {
            return Ok(());
        }
        self.state = MountState::Draining;

        if let Some(root) = self.dump_root.clone() {
            let start = Instant::now();
            persist::dump(&self.store, &root)?;
            info!(
                "dumped {} files in {} µs",
                self.store.file_count(),
                start.elapsed().as_micros()
            );
        }

        self.state = MountState::Unmounted;
        Ok(())
    }

    /// The store's block size.
    pub fn block_size(&self) -> usize {
        self.store.block_size()
    }

    /// Totals for `statfs`: (sealed blocks held, files, directories).
    pub fn statistics(&self) -> (u64, u64, u64) {
        (
            self.store.block_count() as u64,
            self.store.file_count() as u64,
            self.dirs.dir_count() as u64,
        )
    }

    fn serving(&self) -> Result<()> {
        if self.state == MountState::Serving {
            Ok(())
        } else {
            error!("operation rejected: enclave is {:?}", self.state);
            Err(FsErrorKind::Policy.into())
        }
    }

    fn normalize(&self, path: &str) -> Result<String> {
        self.serving()?;
        if path.bytes().any(|b| b == ENTRY_SEPARATOR) {
            debug!("path {:?} contains the reserved separator byte", path);
            return Err(FsErrorKind::InvalidArgument.into());
        }
        Ok(clean_path(path))
    }

    /// What does this path name?
    ///
    /// The three outcomes stay distinct: a file, a directory, or an error
    /// for nothing at all.
    pub fn entry_kind(&self, path: &str) -> Result<EntryKind> {
        let path = self.normalize(path)?;
        if self.store.is_file(&path) {
            Ok(EntryKind::File)
        } else if self.dirs.is_directory(&path) {
            Ok(EntryKind::Directory)
        } else {
            Err(FsErrorKind::NotFound.into())
        }
    }

    /// Synthesized attributes for `getattr`.
    pub fn getattr(&self, path: &str) -> Result<EntryAttr> {
        let cleaned = self.normalize(path)?;
        match self.entry_kind(path)? {
            EntryKind::File => Ok(EntryAttr {
                kind: EntryKind::File,
                size: self.store.file_size(&cleaned)?,
                links: 1,
            }),
            EntryKind::Directory => Ok(EntryAttr {
                kind: EntryKind::Directory,
                size: self.store.block_size() as u64,
                links: 2,
            }),
        }
    }

    /// `open`, `opendir`, and `access` all reduce to existence.
    pub fn access(&self, path: &str) -> Result<()> {
        self.entry_kind(path).map(|_| ())
    }

    /// Create an empty file
    ///
    /// The mode must carry the regular-file bit; the enclave creates
    /// nothing else.
    pub fn create(&mut self, path: &str, mode: u32) -> Result<()> {
        let path = self.normalize(path)?;
        if mode & libc::S_IFREG as u32 == 0 {
            debug!("refusing to create {:?} with mode {:o}", path, mode);
            return Err(FsErrorKind::InvalidArgument.into());
        }
        self.store.create(&path, &self.dirs)
    }

    /// Read into the caller's buffer; returns the bytes produced.
    pub fn read(&self, path: &str, offset: i64, buffer: &mut [u8]) -> Result<usize> {
        let path = self.normalize(path)?;
        if offset < 0 {
            return Err(FsErrorKind::InvalidArgument.into());
        }
        self.store.read(&path, offset as u64, buffer)
    }

    /// Write the caller's buffer; returns the bytes consumed.
    pub fn write(&mut self, path: &str, offset: i64, data: &[u8]) -> Result<usize> {
        let path = self.normalize(path)?;
        if offset < 0 {
            return Err(FsErrorKind::InvalidArgument.into());
        }
        self.store.write(&path, offset as u64, data)
    }

    /// Remove a file.
    pub fn unlink(&mut self, path: &str) -> Result<()> {
        let path = self.normalize(path)?;
        self.store.unlink(&path, &self.dirs)
    }

    /// Set a file's length.
    pub fn truncate(&mut self, path: &str, length: i64) -> Result<()> {
        let path = self.normalize(path)?;
        if length < 0 {
            return Err(FsErrorKind::InvalidArgument.into());
        }
        self.store.truncate(&path, length as u64)
    }

    /// A file's logical size.
    pub fn file_size(&self, path: &str) -> Result<u64> {
        let path = self.normalize(path)?;
        self.store.file_size(&path)
    }

    /// Create a directory.
    pub fn mkdir(&mut self, path: &str) -> Result<()> {
        let path = self.normalize(path)?;
        self.dirs.mkdir(&path, &self.store)
    }

    /// Remove an empty directory.
    pub fn rmdir(&mut self, path: &str) -> Result<()> {
        let path = self.normalize(path)?;
        self.dirs.rmdir(&path, &self.store)
    }

    /// List a directory as names.
    pub fn readdir(&self, path: &str) -> Result<Vec<String>> {
        let path = self.normalize(path)?;
        self.dirs.readdir(&path, &self.store)
    }

    /// Entries directly inside a directory, files and subdirectories both.
    pub fn entry_count(&self, path: &str) -> Result<usize> {
        self.readdir(path).map(|entries| entries.len())
    }

    /// Files directly inside a directory.
    pub fn number_of_entries(&self, path: &str) -> Result<usize> {
        let path = self.normalize(path)?;
        if !self.dirs.is_directory(&path) {
            return Err(FsErrorKind::NotFound.into());
        }
        Ok(self.store.number_of_entries(&path))
    }

    /// List a directory into a caller-supplied buffer
    ///
    /// The boundary form of `readdir`: names are written back to back,
    /// each terminated by [`ENTRY_SEPARATOR`], and the number of entries
    /// written is returned separately. Entries that do not fit in the
    /// buffer are dropped from the tail of the listing.
    pub fn readdir_into(&self, path: &str, buffer: &mut [u8]) -> Result<usize> {
        let entries = self.readdir(path)?;
        let mut written = 0;
        let mut count = 0;
        for name in &entries {
            let bytes = name.as_bytes();
            if written + bytes.len() + 1 > buffer.len() {
                debug!("listing buffer full after {} of {} entries", count, entries.len());
                break;
            }
            buffer[written..written + bytes.len()].copy_from_slice(bytes);
            buffer[written + bytes.len()] = ENTRY_SEPARATOR;
            written += bytes.len() + 1;
            count += 1;
        }
        Ok(count)
    }
}

/// Decode a packed directory listing
///
/// The untrusted half of the [`readdir_into`](Enclave::readdir_into) pair.
pub fn unpack_dir_entries(buffer: &[u8], count: usize) -> Vec<String> {
    buffer
        .split(|b| *b == ENTRY_SEPARATOR)
        .take(count)
        .map(|name| String::from_utf8_lossy(name).into_owned())
        .collect()
}

/// Shared handle to a mounted enclave
///
/// The one lock in the system: the kernel bridge may field concurrent
/// requests, but every crossing into the enclave serializes here, which is
/// the concurrency contract the core is written against.
pub struct EnclaveMounter<S>
where
    S: BlockSealer,
{
    inner: Arc<Mutex<Enclave<S>>>,
}

impl<S> EnclaveMounter<S>
where
    S: BlockSealer,
{
    /// Wrap a mounted enclave for sharing with the bridge.
    pub fn new(enclave: Enclave<S>) -> Self {
        EnclaveMounter {
            inner: Arc::new(Mutex::new(enclave)),
        }
    }

    /// Lock the enclave for one operation.
    pub fn lock(&self) -> std::sync::MutexGuard<Enclave<S>> {
        self.inner.lock().expect("poisoned enclave lock")
    }

    /// Drain and unmount.
    pub fn unmount(&self) -> Result<(), Error> {
        self.lock().unmount()
    }
}

impl<S> Clone for EnclaveMounter<S>
where
    S: BlockSealer,
{
    fn clone(&self) -> Self {
        EnclaveMounter {
            inner: self.inner.clone(),
        }
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;
    use crate::error::FsErrorKind;

    const BLOCK_SIZE: usize = 16;

    fn enclave() -> Enclave<AeadSealer> {
        Enclave::ephemeral(BLOCK_SIZE, AeadSealer::new(&[0x07; 32]))
    }

    const FILE_MODE: u32 = libc::S_IFREG as u32 | 0o644;

    #[test]
    fn paths_are_normalized_on_entry() {
        let mut e = enclave();
        e.create("//a///b/", FILE_MODE).unwrap_err(); // parent a does not exist
        e.mkdir("/a/").unwrap();
        e.create("//a///b/", FILE_MODE).unwrap();

        assert_eq!(e.entry_kind("a/b").unwrap(), EntryKind::File);
        assert_eq!(e.entry_kind("/a").unwrap(), EntryKind::Directory);
        assert_eq!(e.file_size("a//b").unwrap(), 0);
    }

    #[test]
    fn separator_byte_is_rejected() {
        let mut e = enclave();
        let weird = format!("bad{}name", ENTRY_SEPARATOR as char);
        assert_matches!(
            e.create(&weird, FILE_MODE).map_err(|err| err.kind()),
            Err(FsErrorKind::InvalidArgument)
        );
    }

    #[test]
    fn create_requires_the_regular_file_bit() {
        let mut e = enclave();
        assert_matches!(
            e.create("dev", libc::S_IFCHR as u32).map_err(|err| err.kind()),
            Err(FsErrorKind::InvalidArgument)
        );
    }

    #[test]
    fn directory_scenario() {
        // mkdir p; create p/x; readdir p == {x}; rmdir p fails NotEmpty;
        // unlink p/x; rmdir p succeeds.
        let mut e = enclave();
        e.mkdir("p").unwrap();
        e.create("p/x", FILE_MODE).unwrap();
        assert_eq!(e.readdir("p").unwrap(), vec!["x"]);
        assert_matches!(
            e.rmdir("p").map_err(|err| err.kind()),
            Err(FsErrorKind::NotEmpty)
        );
        e.unlink("p/x").unwrap();
        e.rmdir("p").unwrap();
        assert_matches!(
            e.entry_kind("p").map_err(|err| err.kind()),
            Err(FsErrorKind::NotFound)
        );
    }

    #[test]
    fn getattr_shapes() {
        let mut e = enclave();
        e.mkdir("d").unwrap();
        e.create("d/f", FILE_MODE).unwrap();
        e.write("d/f", 0, &[9u8; 21]).unwrap();

        let file = e.getattr("d/f").unwrap();
        assert_eq!(file.kind, EntryKind::File);
        assert_eq!(file.size, 21);
        assert_eq!(file.links, 1);

        let dir = e.getattr("d").unwrap();
        assert_eq!(dir.kind, EntryKind::Directory);
        assert_eq!(dir.links, 2);

        let root = e.getattr("/").unwrap();
        assert_eq!(root.kind, EntryKind::Directory);
    }

    #[test]
    fn listing_round_trips_through_the_boundary_buffer() {
        let mut e = enclave();
        e.mkdir("dir").unwrap();
        e.create("alpha", FILE_MODE).unwrap();
        e.create("omega", FILE_MODE).unwrap();

        let expected = e.readdir("").unwrap();
        let mut buffer = vec![0u8; expected.len() * ENTRY_SLOT_SIZE];
        let count = e.readdir_into("", &mut buffer).unwrap();
        assert_eq!(count, 3);
        assert_eq!(unpack_dir_entries(&buffer, count), expected);
    }

    #[test]
    fn listing_buffer_overflow_drops_the_tail() {
        let mut e = enclave();
        e.create("abcdef", FILE_MODE).unwrap();
        e.create("ghijkl", FILE_MODE).unwrap();

        let mut buffer = vec![0u8; 8]; // room for one 6-byte name + separator
        let count = e.readdir_into("", &mut buffer).unwrap();
        assert_eq!(count, 1);
        assert_eq!(unpack_dir_entries(&buffer, count), vec!["abcdef"]);
    }

    #[test]
    fn operations_refused_after_unmount() {
        let mut e = enclave();
        e.create("f", FILE_MODE).unwrap();
        e.unmount().unwrap();

        assert_matches!(
            e.read("f", 0, &mut [0u8; 4]).map_err(|err| err.kind()),
            Err(FsErrorKind::Policy)
        );
        assert_matches!(
            e.create("g", FILE_MODE).map_err(|err| err.kind()),
            Err(FsErrorKind::Policy)
        );
    }

    #[test]
    fn negative_offsets_are_invalid() {
        let mut e = enclave();
        e.create("f", FILE_MODE).unwrap();
        assert_matches!(
            e.read("f", -1, &mut [0u8; 4]).map_err(|err| err.kind()),
            Err(FsErrorKind::InvalidArgument)
        );
        assert_matches!(
            e.write("f", -1, b"x").map_err(|err| err.kind()),
            Err(FsErrorKind::InvalidArgument)
        );
        assert_matches!(
            e.truncate("f", -1).map_err(|err| err.kind()),
            Err(FsErrorKind::InvalidArgument)
        );
    }

    #[test]
    fn statistics_track_the_tree() {
        let mut e = enclave();
        e.mkdir("d").unwrap();
        e.create("d/f", FILE_MODE).unwrap();
        e.write("d/f", 0, &[1u8; 40]).unwrap();

        let (blocks, files, dirs) = e.statistics();
        assert_eq!(blocks, 3);
        assert_eq!(files, 1);
        assert_eq!(dirs, 1);

        assert_eq!(e.number_of_entries("d").unwrap(), 1, "one file directly in d");
        assert_eq!(e.number_of_entries("").unwrap(), 0, "files only, not directories");
        assert_eq!(e.entry_count("").unwrap(), 1);
        assert_matches!(
            e.number_of_entries("d/f").map_err(|err| err.kind()),
            Err(FsErrorKind::NotFound)
        );
    }
}
