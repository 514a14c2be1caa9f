//! Dump and Restore
//!
//! Between mounts the file system lives as a host-visible directory tree:
//! one regular host file per enclave file, at the same relative path, whose
//! contents are that file's sealed blocks back to back (each block its
//! header followed by its ciphertext). Nothing else is written -- no index,
//! no manifest. The block framing is recovered from the headers alone, and
//! the directory tree is recovered from the file paths alone, which is why
//! empty directories do not survive an unmount.
//!
//! Everything this module touches is sealed; it never holds plaintext and
//! never needs the sealing key. A tampered dump is therefore not detected
//! here (beyond framing damage) -- it surfaces as an integrity failure on
//! the first unseal of the tampered block.
use std::{
    fs,
    path::{Path, PathBuf},
};

use failure::{format_err, Error};
use log::{debug, info};

use crate::{
    dir::DirectoryIndex,
    path::clean_path,
    seal::{BlockSealer, SealedBlock},
    store::FileStore,
};

/// Dump a file store to a host directory
///
/// Replaces whatever dump was at `dump_root` before, so the tree on disk
/// always mirrors exactly the store being dumped.
pub fn dump<S, P>(store: &FileStore<S>, dump_root: P) -> Result<(), Error>
where
    S: BlockSealer,
    P: AsRef<Path>,
{
    let root = dump_root.as_ref();
    if root.exists() {
        fs::remove_dir_all(root)?;
    }
    fs::create_dir_all(root)?;

    for (path, blocks) in store.get_files() {
        let host_path = root.join(path);
        if let Some(parent) = host_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut bytes = Vec::with_capacity(blocks.iter().map(SealedBlock::sealed_size).sum());
        for block in blocks {
            block.write_to(&mut bytes);
        }
        debug!("dumping {:?}: {} blocks, {} bytes", path, blocks.len(), bytes.len());
        fs::write(&host_path, &bytes)?;
    }

    info!("dumped {} files to {:?}", store.file_count(), root);
    Ok(())
}

/// Restore a file store from a host directory
///
/// A missing `dump_root` is an empty file system, not an error. Every
/// regular host file under the root is re-framed into its sealed blocks and
/// inserted under its cleaned relative path; afterwards every proper prefix
/// of every file path is re-created as a directory.
pub fn restore<S, P>(
    dump_root: P,
    block_size: usize,
    sealer: S,
) -> Result<(FileStore<S>, DirectoryIndex), Error>
where
    S: BlockSealer,
    P: AsRef<Path>,
{
    let mut store = FileStore::new(block_size, sealer);
    let mut dirs = DirectoryIndex::new();

    let root = dump_root.as_ref();
    if !root.is_dir() {
        info!("no dump at {:?}, starting with an empty file system", root);
        return Ok((store, dirs));
    }

    let mut host_files = Vec::new();
    collect_host_files(root, &mut host_files)?;

    for host_path in host_files {
        let relative = host_path
            .strip_prefix(root)?
            .to_str()
            .ok_or_else(|| format_err!("non-utf8 path in dump: {:?}", host_path))?;
        let path = clean_path(relative);

        let bytes = fs::read(&host_path)?;
        let mut blocks = Vec::new();
        let mut offset = 0;
        while offset < bytes.len() {
            let (block, consumed) = SealedBlock::from_bytes(&bytes[offset..])
                .map_err(|e| format_err!("corrupt dump file {:?}: {}", host_path, e))?;
            blocks.push(block);
            offset += consumed;
        }

        store
            .insert_restored(path, blocks)
            .map_err(|e| format_err!("corrupt dump file {:?}: {}", host_path, e))?;
    }

    let paths: Vec<String> = store.file_paths().map(String::from).collect();
    for path in &paths {
        dirs.add_parents_of(path);
    }

    info!("restored {} files from {:?}", store.file_count(), root);
    Ok((store, dirs))
}

fn collect_host_files(directory: &Path, found: &mut Vec<PathBuf>) -> Result<(), Error> {
    for entry in fs::read_dir(directory)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_host_files(&entry.path(), found)?;
        } else if file_type.is_file() {
            found.push(entry.path());
        }
        // Anything else (symlinks, sockets) has no business in a dump.
    }
    Ok(())
}
