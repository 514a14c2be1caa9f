#![warn(missing_docs)]
//! An in-memory file system that never holds your data in the clear: *sealfs*
//!
//! # Trust Model
//!
//! The file system is split across a trust boundary. On the untrusted side
//! sits the kernel bridge -- a FUSE adapter that fields requests from the
//! OS, keeps the inode bookkeeping, and forwards every operation through a
//! single lock. On the trusted side (the "enclave" in the original
//! deployment; here, the [`Enclave`] type) live the authoritative directory
//! tree, the file store, and every byte of plaintext that ever exists.
//! Plaintext crosses outward exactly once -- on `read`, to fill the caller's
//! buffer -- and only in the quantity the caller asked for.
//!
//! File *contents* are confidential. File names, sizes, and the shape of
//! the directory tree are not; hiding those is a different project.
//!
//! # Blocks
//!
//! File contents are carved into fixed-size blocks, 4096 bytes unless
//! configured otherwise, and each block is individually sealed: encrypted
//! and authenticated with AES-256-GCM under a key derived from the mount
//! password and the file system's identity. A [`SealedBlock`] carries a
//! small self-describing header (nonce, tag, payload size), so the store
//! can do all of its block arithmetic without ever unsealing anything.
//!
//! For every file, all blocks but the last hold exactly the block size;
//! the last holds whatever remains, and an empty file holds no blocks at
//! all. Reads unseal only the blocks they touch; writes reseal overlapped
//! blocks and append fresh ones; truncate pads or trims under the same
//! rules. The plaintext for any of this exists only for the duration of
//! the operation, and is wiped before the buffer is released.
//!
//! # Persistence
//!
//! At unmount the store is dumped to a host directory: one host file per
//! enclave file at the same relative path, containing that file's sealed
//! blocks back to back. At mount the dump is walked and re-framed from the
//! block headers, and directories are reconstructed from the file paths.
//! The sealed bytes are exactly what was in memory, so a remount with the
//! same password picks up where the last mount left off -- and a tampered
//! dump is caught by the first unseal of the tampered block.
mod crypto;
mod dir;
mod error;
mod path;
mod persist;
mod seal;
mod store;
mod uuid;

pub mod enclave;
pub mod fuse;

pub use crate::{
    crypto::make_sealing_key,
    dir::DirectoryIndex,
    enclave::{unpack_dir_entries, Enclave, EnclaveMounter, EntryAttr, EntryKind},
    error::{FsError, FsErrorKind, Result},
    fuse::SealFsFuse,
    persist::{dump, restore},
    seal::{AeadSealer, BlockSealer, SealedBlock, HEADER_SIZE},
    store::FileStore,
    uuid::FsUuid,
};

/// The block size used unless a mount asks for something else.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;
