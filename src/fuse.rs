//! FUSE Interface for sealfs
//!
//! The untrusted half of the kernel bridge. FUSE speaks inodes; the
//! enclave speaks paths. This adapter keeps the inode-to-path maps on the
//! untrusted side (they are names and numbers, nothing confidential),
//! synthesizes the attribute fields the enclave deliberately does not
//! track -- times from the moment of mount, ownership from the mounting
//! process -- and translates the core's typed errors into the numeric codes
//! the kernel expects.
//!
//! Every callback crosses into the enclave through the single mounter
//! lock; the kernel may thread requests, the enclave never sees it.
use std::{collections::HashMap, ffi::OsStr, path::Path};

use fuse::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyBmap, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
};
use libc::{c_int, EEXIST, EINVAL, EIO, EISDIR, ENOENT, ENOTDIR, ENOTEMPTY};
use log::{debug, error, trace, warn};
use time::Timespec;

use crate::{
    enclave::{unpack_dir_entries, EnclaveMounter, EntryAttr, EntryKind, ENTRY_SLOT_SIZE},
    error::{FsError, FsErrorKind},
    path::parent_path,
    seal::BlockSealer,
};

const TTL: Timespec = Timespec { sec: 1, nsec: 0 };

const ROOT_INODE: u64 = 1;

/// Translate a core error into the code handed back to the kernel.
fn errno(err: &FsError) -> c_int {
    match err.kind() {
        FsErrorKind::NotFound => ENOENT,
        FsErrorKind::Exists => EEXIST,
        FsErrorKind::IsDirectory => EISDIR,
        FsErrorKind::NotDirectory => ENOTDIR,
        FsErrorKind::NotEmpty => ENOTEMPTY,
        FsErrorKind::InvalidArgument => EINVAL,
        FsErrorKind::Integrity => EIO,
        FsErrorKind::Policy => EIO,
        FsErrorKind::Unsupported => EINVAL,
    }
}

fn unsupported(operation: &str) -> c_int {
    debug!("`{}` is not supported", operation);
    let err: FsError = FsErrorKind::Unsupported.into();
    errno(&err)
}

/// FUSE integration
///
/// Holds the mounter handle and the inode bookkeeping. Inode numbers are
/// handed out on first sight of a path and retired when the entry is
/// removed; inode 1 is always the root.
pub struct SealFsFuse<S>
where
    S: BlockSealer + 'static,
{
    enclave: EnclaveMounter<S>,
    // Inode bookkeeping lives out here because it is the bridge's fiction,
    // not file system state.
    inodes: HashMap<u64, String>,
    numbers: HashMap<String, u64>,
    next_inode: u64,
    mount_time: Timespec,
    uid: u32,
    gid: u32,
}

impl<S> SealFsFuse<S>
where
    S: BlockSealer + 'static,
{
    /// Create a new bridge around a mounted enclave.
    pub fn new(enclave: EnclaveMounter<S>) -> Self {
        let mut fs = SealFsFuse {
            enclave,
            inodes: HashMap::new(),
            numbers: HashMap::new(),
            next_inode: ROOT_INODE + 1,
            mount_time: time::get_time(),
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        };
        fs.inodes.insert(ROOT_INODE, String::new());
        fs.numbers.insert(String::new(), ROOT_INODE);
        fs
    }

    fn inode_for(&mut self, path: &str) -> u64 {
        if let Some(number) = self.numbers.get(path) {
            return *number;
        }
        let number = self.next_inode;
        self.next_inode = number.wrapping_add(1);
        self.inodes.insert(number, path.to_string());
        self.numbers.insert(path.to_string(), number);
        number
    }

    fn path_of(&self, ino: u64) -> Option<String> {
        self.inodes.get(&ino).cloned()
    }

    fn forget_path(&mut self, path: &str) {
        if let Some(number) = self.numbers.remove(path) {
            self.inodes.remove(&number);
        }
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Option<String> {
        let parent = self.inodes.get(&parent)?;
        let name = name.to_str()?;
        if parent.is_empty() {
            Some(name.to_string())
        } else {
            Some(format!("{}/{}", parent, name))
        }
    }

    fn file_attr(&self, ino: u64, entry: &EntryAttr) -> FileAttr {
        let (kind, perm) = match entry.kind {
            EntryKind::File => (FileType::RegularFile, 0o644),
            EntryKind::Directory => (FileType::Directory, 0o755),
        };
        FileAttr {
            ino,
            size: entry.size,
            blocks: 1,
            atime: self.mount_time,
            mtime: self.mount_time,
            ctime: self.mount_time,
            crtime: self.mount_time,
            kind,
            perm,
            nlink: entry.links,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            flags: 0,
        }
    }
}

impl<S> Filesystem for SealFsFuse<S>
where
    S: BlockSealer + 'static,
{
    fn init(&mut self, _req: &Request) -> Result<(), c_int> {
        Ok(())
    }

    /// The kernel signalled unmount: drain and dump.
    fn destroy(&mut self, _req: &Request) {
        if let Err(e) = self.enclave.unmount() {
            error!("error dumping file system at unmount: {}", e);
        }
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let path = match self.child_path(parent, name) {
            Some(path) => path,
            None => {
                reply.error(ENOENT);
                return;
            }
        };
        trace!("`lookup`: {:?}", path);

        let found = {
            let guard = self.enclave.lock();
            guard.getattr(&path)
        };
        match found {
            Ok(entry) => {
                let ino = self.inode_for(&path);
                reply.entry(&TTL, &self.file_attr(ino, &entry), 0);
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        let path = match self.path_of(ino) {
            Some(path) => path,
            None => {
                warn!("`getattr` can't find requested inode {}", ino);
                reply.error(ENOENT);
                return;
            }
        };

        let guard = self.enclave.lock();
        match guard.getattr(&path) {
            Ok(entry) => reply.attr(&TTL, &self.file_attr(ino, &entry)),
            Err(e) => reply.error(errno(&e)),
        }
    }

    /// Only size changes mean anything here: a size is a truncate. Mode,
    /// ownership, and time changes are accepted and forgotten, since the
    /// enclave does not track them.
    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<Timespec>,
        _mtime: Option<Timespec>,
        _fh: Option<u64>,
        _crtime: Option<Timespec>,
        _chgtime: Option<Timespec>,
        _bkuptime: Option<Timespec>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let path = match self.path_of(ino) {
            Some(path) => path,
            None => {
                reply.error(ENOENT);
                return;
            }
        };
        debug!("`setattr`: {:?}, size: {:?}", path, size);

        let mut guard = self.enclave.lock();
        if let Some(new_len) = size {
            if let Err(e) = guard.truncate(&path, new_len as i64) {
                reply.error(errno(&e));
                return;
            }
        }
        match guard.getattr(&path) {
            Ok(entry) => reply.attr(&TTL, &self.file_attr(ino, &entry)),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        reply.error(unsupported("mknod"));
    }

    fn mkdir(&mut self, _req: &Request, parent: u64, name: &OsStr, _mode: u32, reply: ReplyEntry) {
        let path = match self.child_path(parent, name) {
            Some(path) => path,
            None => {
                reply.error(ENOENT);
                return;
            }
        };
        debug!("`mkdir`: {:?}", path);

        let made = {
            let mut guard = self.enclave.lock();
            guard.mkdir(&path).and_then(|_| guard.getattr(&path))
        };
        match made {
            Ok(entry) => {
                let ino = self.inode_for(&path);
                reply.entry(&TTL, &self.file_attr(ino, &entry), 0);
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_path(parent, name) {
            Some(path) => path,
            None => {
                reply.error(ENOENT);
                return;
            }
        };
        debug!("`unlink`: {:?}", path);

        let removed = {
            let mut guard = self.enclave.lock();
            guard.unlink(&path)
        };
        match removed {
            Ok(()) => {
                self.forget_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_path(parent, name) {
            Some(path) => path,
            None => {
                reply.error(ENOENT);
                return;
            }
        };
        debug!("`rmdir`: {:?}", path);

        let removed = {
            let mut guard = self.enclave.lock();
            guard.rmdir(&path)
        };
        match removed {
            Ok(()) => {
                self.forget_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request,
        _parent: u64,
        _name: &OsStr,
        _link: &Path,
        reply: ReplyEntry,
    ) {
        reply.error(unsupported("symlink"));
    }

    fn rename(
        &mut self,
        _req: &Request,
        _parent: u64,
        _name: &OsStr,
        _newparent: u64,
        _newname: &OsStr,
        reply: ReplyEmpty,
    ) {
        reply.error(unsupported("rename"));
    }

    fn link(
        &mut self,
        _req: &Request,
        _ino: u64,
        _newparent: u64,
        _newname: &OsStr,
        reply: ReplyEntry,
    ) {
        reply.error(unsupported("link"));
    }

    fn open(&mut self, _req: &Request, ino: u64, _flags: u32, reply: ReplyOpen) {
        let path = match self.path_of(ino) {
            Some(path) => path,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        let guard = self.enclave.lock();
        match guard.access(&path) {
            Ok(()) => reply.opened(0, 0),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        reply: ReplyData,
    ) {
        let path = match self.path_of(ino) {
            Some(path) => path,
            None => {
                reply.error(ENOENT);
                return;
            }
        };
        trace!("`read`: {:?}, offset: {}, size: {}", path, offset, size);

        let mut buffer = vec![0u8; size as usize];
        let guard = self.enclave.lock();
        match guard.read(&path, offset, &mut buffer) {
            Ok(read) => reply.data(&buffer[..read]),
            Err(e) => {
                error!("error reading {:?}: {}", path, e);
                reply.error(errno(&e));
            }
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _flags: u32,
        reply: ReplyWrite,
    ) {
        let path = match self.path_of(ino) {
            Some(path) => path,
            None => {
                reply.error(ENOENT);
                return;
            }
        };
        trace!("`write`: {:?}, offset: {}, {} bytes", path, offset, data.len());

        let mut guard = self.enclave.lock();

        // The store does not sparse-extend; a write past the end of the
        // file is preceded by a truncate out to its offset.
        if offset > 0 {
            match guard.file_size(&path) {
                Ok(size) if size < offset as u64 => {
                    if let Err(e) = guard.truncate(&path, offset) {
                        reply.error(errno(&e));
                        return;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    reply.error(errno(&e));
                    return;
                }
            }
        }

        match guard.write(&path, offset, data) {
            Ok(written) => reply.written(written as u32),
            Err(e) => {
                error!("error writing {:?}: {}", path, e);
                reply.error(errno(&e));
            }
        }
    }

    fn flush(&mut self, _req: &Request, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request,
        _ino: u64,
        _fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request, ino: u64, _flags: u32, reply: ReplyOpen) {
        let path = match self.path_of(ino) {
            Some(path) => path,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        let guard = self.enclave.lock();
        match guard.access(&path) {
            Ok(()) => reply.opened(0, 0),
            Err(e) => reply.error(errno(&e)),
        }
    }

    /// List a directory
    ///
    /// The listing crosses the trusted boundary in its packed buffer form
    /// and is decoded here; `.` and `..` are injected on this side, since
    /// the enclave has no use for either.
    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let path = match self.path_of(ino) {
            Some(path) => path,
            None => {
                reply.error(ENOENT);
                return;
            }
        };
        trace!("`readdir`: {:?}, offset: {}", path, offset);

        let listed = {
            let guard = self.enclave.lock();
            guard.entry_count(&path).and_then(|count| {
                let mut buffer = vec![0u8; count.max(1) * ENTRY_SLOT_SIZE];
                let packed = guard.readdir_into(&path, &mut buffer)?;
                let names = unpack_dir_entries(&buffer, packed);
                let mut children = Vec::with_capacity(names.len());
                for name in names {
                    let child = if path.is_empty() {
                        name
                    } else {
                        format!("{}/{}", path, name)
                    };
                    let kind = guard.entry_kind(&child)?;
                    children.push((child, kind));
                }
                Ok(children)
            })
        };

        let children = match listed {
            Ok(children) => children,
            Err(e) => {
                reply.error(errno(&e));
                return;
            }
        };

        let parent_ino = *self.numbers.get(&parent_path(&path)).unwrap_or(&ROOT_INODE);
        let mut entries: Vec<(u64, FileType, String)> = vec![
            (ino, FileType::Directory, ".".to_string()),
            (parent_ino, FileType::Directory, "..".to_string()),
        ];
        for (child, kind) in children {
            let number = self.inode_for(&child);
            let file_type = match kind {
                EntryKind::File => FileType::RegularFile,
                EntryKind::Directory => FileType::Directory,
            };
            let name = child.rsplit('/').next().unwrap_or(&child).to_string();
            entries.push((number, file_type, name));
        }

        for (i, entry) in entries.into_iter().enumerate().skip(offset as usize) {
            // i + 1 is the offset of the next entry
            reply.add(entry.0, (i + 1) as i64, entry.1, entry.2);
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request, _ino: u64, _fh: u64, _flags: u32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
        let guard = self.enclave.lock();
        let (blocks, files, _dirs) = guard.statistics();
        let block_size = guard.block_size() as u32;
        reply.statfs(
            blocks,
            // Backed by host memory; free space is whatever the host will
            // still give us.
            i64::max_value() as u64,
            i64::max_value() as u64,
            files,
            i64::max_value() as u64,
            block_size,
            0xff,
            block_size,
        );
    }

    fn setxattr(
        &mut self,
        _req: &Request,
        _ino: u64,
        _name: &OsStr,
        _value: &[u8],
        _flags: u32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        reply.error(unsupported("setxattr"));
    }

    fn access(&mut self, _req: &Request, ino: u64, _mask: u32, reply: ReplyEmpty) {
        let path = match self.path_of(ino) {
            Some(path) => path,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        let guard = self.enclave.lock();
        match guard.access(&path) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        flags: u32,
        reply: ReplyCreate,
    ) {
        let path = match self.child_path(parent, name) {
            Some(path) => path,
            None => {
                reply.error(ENOENT);
                return;
            }
        };
        debug!("`create`: {:?}, mode: {:#o}", path, mode);

        let created = {
            let mut guard = self.enclave.lock();
            guard.create(&path, mode).and_then(|_| guard.getattr(&path))
        };
        match created {
            Ok(entry) => {
                let ino = self.inode_for(&path);
                reply.created(&TTL, &self.file_attr(ino, &entry), 0, 0, flags);
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn bmap(&mut self, _req: &Request, _ino: u64, _blocksize: u32, _idx: u64, reply: ReplyBmap) {
        reply.error(unsupported("bmap"));
    }
}
