//! The File Store
//!
//! Maps each normalized file path to an ordered sequence of sealed blocks,
//! and owns every piece of partial-block logic in the system: carving a
//! write across block boundaries, decrypt-modify-reseal of overlapped
//! blocks, and growing or shrinking a file under the sealed model.
//!
//! The block sequence of every file satisfies, after every operation:
//!
//!  * every block but the last holds exactly `block_size` bytes;
//!  * the last block holds between 1 and `block_size` bytes;
//!  * an empty file has no blocks at all.
//!
//! The logical file size is therefore fully determined by the block count
//! and the last block's payload size -- no separate size field to fall out
//! of sync.
//!
//! Paths are expected to arrive normalized; the dispatcher cleans them
//! once on entry. The store treats them as opaque keys.
use std::collections::HashMap;

use log::{debug, error, trace};

use crate::{
    dir::DirectoryIndex,
    error::{FsErrorKind, Result},
    path::{is_in_directory, parent_path},
    seal::{wipe, BlockSealer, SealedBlock},
};

/// The file store
///
/// Holds every file as a list of sealed blocks which it exclusively owns.
/// Blocks are created by writes and truncate-grow, replaced by overlapping
/// writes, and released by unlink and truncate-shrink; they are never
/// shared between files.
pub struct FileStore<S>
where
    S: BlockSealer,
{
    block_size: usize,
    sealer: S,
    files: HashMap<String, Vec<SealedBlock>>,
}

impl<S> FileStore<S>
where
    S: BlockSealer,
{
    /// Create an empty store
    ///
    /// `block_size` is a design parameter of the file system, fixed for its
    /// lifetime; [`DEFAULT_BLOCK_SIZE`](crate::DEFAULT_BLOCK_SIZE) unless
    /// there is a reason to differ.
    pub fn new(block_size: usize, sealer: S) -> Self {
        assert!(block_size > 0, "block size must be positive");
        FileStore {
            block_size,
            sealer,
            files: HashMap::new(),
        }
    }

    /// The store's block size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Create an empty file
    ///
    /// The parent must already be a directory (the root always is), the
    /// path must not name a directory, and the file must not already exist.
    pub fn create(&mut self, path: &str, dirs: &DirectoryIndex) -> Result<()> {
        let parent = parent_path(path);
        if !dirs.is_directory(&parent) {
            return Err(FsErrorKind::NotDirectory.into());
        }
        if dirs.is_directory(path) {
            return Err(FsErrorKind::IsDirectory.into());
        }
        if self.files.contains_key(path) {
            return Err(FsErrorKind::Exists.into());
        }
        debug!("create {:?}", path);
        self.files.insert(path.to_string(), Vec::new());
        Ok(())
    }

    /// Remove a file and release its blocks.
    pub fn unlink(&mut self, path: &str, dirs: &DirectoryIndex) -> Result<()> {
        let parent = parent_path(path);
        if !dirs.is_directory(&parent) {
            return Err(FsErrorKind::NotDirectory.into());
        }
        if dirs.is_directory(path) {
            return Err(FsErrorKind::IsDirectory.into());
        }
        match self.files.remove(path) {
            Some(blocks) => {
                debug!("unlink {:?}, releasing {} blocks", path, blocks.len());
                Ok(())
            }
            None => Err(FsErrorKind::NotFound.into()),
        }
    }

    /// Read up to `buffer.len()` bytes starting at `offset`
    ///
    /// Unseals each touched block in turn and copies the requested range
    /// out. Returns the number of bytes read: 0 at or past end of file, and
    /// possibly fewer than requested when the file ends first.
    ///
    /// An integrity failure on the first touched block is returned as an
    /// error; a failure after some bytes have already been produced
    /// terminates the read early, logging the failure and returning the
    /// short count, which is how the kernel bridge expects partial failure
    /// to surface. The next read at the poisoned offset reports the error.
    pub fn read(&self, path: &str, offset: u64, buffer: &mut [u8]) -> Result<usize> {
        let blocks = self.files.get(path).ok_or(FsErrorKind::NotFound)?;
        let block_size = self.block_size as u64;

        let first = (offset / block_size) as usize;
        if first >= blocks.len() || buffer.is_empty() {
            return Ok(0);
        }

        let mut intra = (offset % block_size) as usize;
        let mut read = 0;
        for block in &blocks[first..] {
            if read == buffer.len() {
                break;
            }
            let mut plaintext = match self.sealer.unseal(block) {
                Ok(plaintext) => plaintext,
                Err(e) if read > 0 => {
                    error!("read of {:?} cut short at {} bytes: {}", path, read, e);
                    return Ok(read);
                }
                Err(e) => return Err(e),
            };
            if intra < plaintext.len() {
                let n = (plaintext.len() - intra).min(buffer.len() - read);
                buffer[read..read + n].copy_from_slice(&plaintext[intra..intra + n]);
                read += n;
            }
            wipe(&mut plaintext);
            intra = 0;
        }
        trace!("read {} bytes from {:?} at offset {}", read, path, offset);
        Ok(read)
    }

    /// Write `data` at `offset`
    ///
    /// Overlapped blocks are unsealed, modified in place, and resealed;
    /// remaining data is sealed into fresh blocks appended at the end,
    /// which is the only way a file grows through this entry point.
    ///
    /// `offset` must not exceed the current file size -- a caller that wants
    /// to write past end of file truncates up to the target offset first,
    /// which is the kernel bridge's convention.
    pub fn write(&mut self, path: &str, offset: u64, data: &[u8]) -> Result<usize> {
        let block_size = self.block_size;
        let sealer = &self.sealer;
        let blocks = self.files.get_mut(path).ok_or(FsErrorKind::NotFound)?;

        if offset > file_size_of(blocks, block_size) {
            return Err(FsErrorKind::InvalidArgument.into());
        }

        let mut index = (offset / block_size as u64) as usize;
        let mut intra = (offset % block_size as u64) as usize;
        let mut consumed = 0;

        // Overlap phase: decrypt-modify-reseal every block the write
        // touches that already exists.
        while consumed < data.len() && index < blocks.len() {
            let n = (block_size - intra).min(data.len() - consumed);
            let mut plaintext = sealer.unseal(&blocks[index])?;
            if plaintext.len() < intra + n {
                // Extending within the last block; the gap can only be
                // zero-sized here since the offset is bounded by the file
                // size, but resize keeps the arithmetic honest.
                plaintext.resize(intra + n, 0);
            }
            plaintext[intra..intra + n].copy_from_slice(&data[consumed..consumed + n]);
            let resealed = sealer.seal(&plaintext)?;
            wipe(&mut plaintext);
            blocks[index] = resealed;
            consumed += n;
            index += 1;
            intra = 0;
        }

        // Append phase: seal what is left into fresh blocks.
        while consumed < data.len() {
            let n = (data.len() - consumed).min(block_size);
            let block = sealer.seal(&data[consumed..consumed + n])?;
            blocks.push(block);
            consumed += n;
        }

        trace!("wrote {} bytes to {:?} at offset {}", consumed, path, offset);
        Ok(consumed)
    }

    /// Set the file's length
    ///
    /// Growing appends freshly sealed all-zero blocks (padding a partial
    /// last block first, so interior blocks stay full); shrinking drops
    /// whole blocks and reseals a trimmed last block. Truncating to the
    /// current length touches nothing -- not even to reseal.
    pub fn truncate(&mut self, path: &str, new_len: u64) -> Result<()> {
        let block_size = self.block_size;
        let sealer = &self.sealer;
        let blocks = self.files.get_mut(path).ok_or(FsErrorKind::NotFound)?;

        let old_len = file_size_of(blocks, block_size);
        if new_len == old_len {
            return Ok(());
        }
        debug!("truncate {:?} from {} to {}", path, old_len, new_len);

        if new_len > old_len {
            let mut remaining = new_len - old_len;

            // Pad a partial last block up to the block size (or to the
            // target, if that comes first).
            if let Some(last) = blocks.last() {
                let payload = last.payload_size();
                if payload < block_size {
                    let target = (payload as u64 + remaining).min(block_size as u64) as usize;
                    let mut plaintext = sealer.unseal(last)?;
                    plaintext.resize(target, 0);
                    let resealed = sealer.seal(&plaintext)?;
                    wipe(&mut plaintext);
                    *blocks.last_mut().unwrap() = resealed;
                    remaining -= (target - payload) as u64;
                }
            }

            // Whole zero blocks, then one short zero block for the tail.
            let zeros = vec![0u8; block_size];
            while remaining >= block_size as u64 {
                blocks.push(sealer.seal(&zeros)?);
                remaining -= block_size as u64;
            }
            if remaining > 0 {
                blocks.push(sealer.seal(&zeros[..remaining as usize])?);
            }
            return Ok(());
        }

        // Shrink: keep ceil(new_len / block_size) blocks, trim the last.
        let keep = ((new_len + block_size as u64 - 1) / block_size as u64) as usize;
        blocks.truncate(keep);

        let tail = (new_len % block_size as u64) as usize;
        if tail > 0 {
            let last = blocks.last().ok_or(FsErrorKind::InvalidArgument)?;
            let mut plaintext = sealer.unseal(last)?;
            plaintext.truncate(tail);
            let resealed = sealer.seal(&plaintext)?;
            wipe(&mut plaintext);
            *blocks.last_mut().unwrap() = resealed;
        }
        Ok(())
    }

    /// The file's logical size.
    pub fn file_size(&self, path: &str) -> Result<u64> {
        let blocks = self.files.get(path).ok_or(FsErrorKind::NotFound)?;
        Ok(file_size_of(blocks, self.block_size))
    }

    /// Does this path name a file?
    pub fn is_file(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    /// Number of files directly inside `directory` (not in subdirectories).
    pub fn number_of_entries(&self, directory: &str) -> usize {
        self.files
            .keys()
            .filter(|path| is_in_directory(directory, path))
            .count()
    }

    /// All file paths in the store.
    pub fn file_paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    /// Total number of files.
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Total number of sealed blocks held, across all files.
    pub fn block_count(&self) -> usize {
        self.files.values().map(Vec::len).sum()
    }

    /// Read-only snapshot of every file's block sequence, for persistence.
    pub fn get_files(&self) -> &HashMap<String, Vec<SealedBlock>> {
        &self.files
    }

    /// Insert a file restored from a dump
    ///
    /// The block sequence must already satisfy the store's shape: full
    /// interior blocks and a non-empty tail. A dump that does not is
    /// corrupt.
    pub(crate) fn insert_restored(
        &mut self,
        path: String,
        blocks: Vec<SealedBlock>,
    ) -> Result<()> {
        for (index, block) in blocks.iter().enumerate() {
            let payload = block.payload_size();
            let interior = index + 1 < blocks.len();
            if payload == 0 || payload > self.block_size || (interior && payload != self.block_size)
            {
                error!(
                    "restored file {:?} has a malformed block {} (payload {})",
                    path, index, payload
                );
                return Err(FsErrorKind::Integrity.into());
            }
        }
        debug!("restored {:?} with {} blocks", path, blocks.len());
        self.files.insert(path, blocks);
        Ok(())
    }
}

fn file_size_of(blocks: &[SealedBlock], block_size: usize) -> u64 {
    match blocks.last() {
        Some(last) => {
            (blocks.len() as u64 - 1) * block_size as u64 + last.payload_size() as u64
        }
        None => 0,
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;
    use crate::{dir::DirectoryIndex, error::FsErrorKind, seal::AeadSealer};

    const BLOCK_SIZE: usize = 16;

    fn store() -> FileStore<AeadSealer> {
        FileStore::new(BLOCK_SIZE, AeadSealer::new(&[0x07; 32]))
    }

    fn read_all(fs: &FileStore<AeadSealer>, path: &str) -> Vec<u8> {
        let size = fs.file_size(path).unwrap() as usize;
        let mut buffer = vec![0u8; size];
        assert_eq!(fs.read(path, 0, &mut buffer).unwrap(), size);
        buffer
    }

    fn assert_invariants(fs: &FileStore<AeadSealer>, path: &str) {
        let blocks = &fs.get_files()[path];
        let size: usize = blocks.iter().map(|b| b.payload_size()).sum();
        assert_eq!(size as u64, fs.file_size(path).unwrap(), "sizes consistent");
        for block in &blocks[..blocks.len().saturating_sub(1)] {
            assert_eq!(block.payload_size(), BLOCK_SIZE, "interior blocks are full");
        }
        if let Some(last) = blocks.last() {
            assert!(last.payload_size() >= 1 && last.payload_size() <= BLOCK_SIZE);
        }
    }

    #[test]
    fn create_small_write_read() {
        let dirs = DirectoryIndex::new();
        let mut fs = store();
        fs.create("a", &dirs).unwrap();
        assert_eq!(fs.file_size("a").unwrap(), 0);

        assert_eq!(fs.write("a", 0, b"hello").unwrap(), 5);
        assert_eq!(fs.file_size("a").unwrap(), 5);

        let mut buffer = [0u8; 5];
        assert_eq!(fs.read("a", 0, &mut buffer).unwrap(), 5);
        assert_eq!(&buffer, b"hello");
        assert_invariants(&fs, "a");
    }

    #[test]
    fn cross_block_write() {
        let dirs = DirectoryIndex::new();
        let mut fs = store();
        fs.create("b", &dirs).unwrap();
        assert_eq!(fs.write("b", 0, &[b'A'; 30]).unwrap(), 30);

        let blocks = &fs.get_files()["b"];
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].payload_size(), 16);
        assert_eq!(blocks[1].payload_size(), 14);

        let mut buffer = [0u8; 4];
        assert_eq!(fs.read("b", 14, &mut buffer).unwrap(), 4, "read spanning blocks");
        assert_eq!(&buffer, b"AAAA");

        let mut buffer = [0u8; 10];
        assert_eq!(fs.read("b", 28, &mut buffer).unwrap(), 2, "short read at eof");
        assert_eq!(&buffer[..2], b"AA");
        assert_invariants(&fs, "b");
    }

    #[test]
    fn truncate_grow_then_shrink() {
        let dirs = DirectoryIndex::new();
        let mut fs = store();
        fs.create("c", &dirs).unwrap();

        fs.truncate("c", 20).unwrap();
        let blocks = &fs.get_files()["c"];
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].payload_size(), 16);
        assert_eq!(blocks[1].payload_size(), 4);
        assert_eq!(read_all(&fs, "c"), vec![0u8; 20], "grown region is zero filled");

        fs.truncate("c", 5).unwrap();
        assert_eq!(fs.file_size("c").unwrap(), 5);
        assert_eq!(fs.get_files()["c"].len(), 1);
        assert_eq!(fs.get_files()["c"][0].payload_size(), 5);
        assert_invariants(&fs, "c");
    }

    #[test]
    fn partial_in_place_overwrite() {
        let dirs = DirectoryIndex::new();
        let mut fs = store();
        fs.create("d", &dirs).unwrap();
        fs.write("d", 0, &[b'X'; 16]).unwrap();
        fs.write("d", 4, b"YYY").unwrap();

        assert_eq!(read_all(&fs, "d"), b"XXXXYYYXXXXXXXXX");
        assert_invariants(&fs, "d");
    }

    #[test]
    fn overwrite_spanning_existing_and_new_blocks() {
        let dirs = DirectoryIndex::new();
        let mut fs = store();
        fs.create("e", &dirs).unwrap();
        fs.write("e", 0, &[b'a'; 20]).unwrap();
        // Overwrite from inside block 0 through the end of block 1 and
        // into a brand new block 2.
        fs.write("e", 10, &[b'b'; 30]).unwrap();

        assert_eq!(fs.file_size("e").unwrap(), 40);
        let mut expected = vec![b'a'; 10];
        expected.extend_from_slice(&[b'b'; 30]);
        assert_eq!(read_all(&fs, "e"), expected);
        assert_invariants(&fs, "e");
    }

    #[test]
    fn write_at_exact_eof_extends() {
        let dirs = DirectoryIndex::new();
        let mut fs = store();
        fs.create("f", &dirs).unwrap();
        fs.write("f", 0, b"0123456789").unwrap();
        fs.write("f", 10, b"abcdef").unwrap();

        assert_eq!(fs.file_size("f").unwrap(), 16);
        assert_eq!(read_all(&fs, "f"), b"0123456789abcdef");
        assert_invariants(&fs, "f");
    }

    #[test]
    fn write_past_eof_is_rejected() {
        let dirs = DirectoryIndex::new();
        let mut fs = store();
        fs.create("g", &dirs).unwrap();
        assert_matches!(
            fs.write("g", 1, b"x").map_err(|e| e.kind()),
            Err(FsErrorKind::InvalidArgument),
            "the caller must truncate out to the offset first"
        );
    }

    #[test]
    fn truncate_grow_pads_partial_last_block() {
        let dirs = DirectoryIndex::new();
        let mut fs = store();
        fs.create("h", &dirs).unwrap();
        fs.write("h", 0, b"hello").unwrap();
        fs.truncate("h", 40).unwrap();

        let blocks = &fs.get_files()["h"];
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].payload_size(), 16, "old partial block padded full");
        assert_eq!(blocks[1].payload_size(), 16);
        assert_eq!(blocks[2].payload_size(), 8);

        let contents = read_all(&fs, "h");
        assert_eq!(&contents[..5], b"hello");
        assert!(contents[5..].iter().all(|b| *b == 0));
        assert_invariants(&fs, "h");
    }

    #[test]
    fn truncate_grow_within_last_block() {
        let dirs = DirectoryIndex::new();
        let mut fs = store();
        fs.create("i", &dirs).unwrap();
        fs.write("i", 0, b"abc").unwrap();
        fs.truncate("i", 10).unwrap();

        assert_eq!(fs.get_files()["i"].len(), 1);
        let contents = read_all(&fs, "i");
        assert_eq!(&contents[..3], b"abc");
        assert!(contents[3..].iter().all(|b| *b == 0));
    }

    #[test]
    fn truncate_to_same_length_reseals_nothing() {
        let dirs = DirectoryIndex::new();
        let mut fs = store();
        fs.create("j", &dirs).unwrap();
        fs.write("j", 0, &[b'z'; 20]).unwrap();

        let before = fs.get_files()["j"].clone();
        fs.truncate("j", 20).unwrap();
        assert_eq!(
            fs.get_files()["j"], before,
            "a no-op truncate must not reseal any block"
        );
    }

    #[test]
    fn truncate_to_block_multiple_leaves_no_tail() {
        let dirs = DirectoryIndex::new();
        let mut fs = store();
        fs.create("k", &dirs).unwrap();
        fs.write("k", 0, &[b'q'; 40]).unwrap();
        fs.truncate("k", 32).unwrap();

        let blocks = &fs.get_files()["k"];
        assert_eq!(blocks.len(), 2);
        assert!(blocks.iter().all(|b| b.payload_size() == BLOCK_SIZE));
        assert_invariants(&fs, "k");
    }

    #[test]
    fn truncate_to_zero_releases_all_blocks() {
        let dirs = DirectoryIndex::new();
        let mut fs = store();
        fs.create("l", &dirs).unwrap();
        fs.write("l", 0, &[1u8; 33]).unwrap();
        fs.truncate("l", 0).unwrap();

        assert_eq!(fs.file_size("l").unwrap(), 0);
        assert!(fs.get_files()["l"].is_empty());
    }

    #[test]
    fn read_past_eof_returns_zero_bytes() {
        let dirs = DirectoryIndex::new();
        let mut fs = store();
        fs.create("m", &dirs).unwrap();
        fs.write("m", 0, b"tiny").unwrap();

        let mut buffer = [0u8; 8];
        assert_eq!(fs.read("m", 100, &mut buffer).unwrap(), 0);
        assert_eq!(fs.read("m", 4, &mut buffer).unwrap(), 0, "exactly at eof");
    }

    #[test]
    fn create_errors() {
        let mut dirs = DirectoryIndex::new();
        let mut fs = store();

        fs.create("n", &dirs).unwrap();
        assert_matches!(
            fs.create("n", &dirs).map_err(|e| e.kind()),
            Err(FsErrorKind::Exists)
        );
        assert_matches!(
            fs.create("missing/o", &dirs).map_err(|e| e.kind()),
            Err(FsErrorKind::NotDirectory),
            "the parent directory must exist"
        );

        dirs.mkdir("p", &fs).unwrap();
        assert_matches!(
            fs.create("p", &dirs).map_err(|e| e.kind()),
            Err(FsErrorKind::IsDirectory)
        );
        fs.create("p/o", &dirs).unwrap();
    }

    #[test]
    fn unlink_errors_and_release() {
        let mut dirs = DirectoryIndex::new();
        let mut fs = store();

        assert_matches!(
            fs.unlink("ghost", &dirs).map_err(|e| e.kind()),
            Err(FsErrorKind::NotFound)
        );

        dirs.mkdir("q", &fs).unwrap();
        assert_matches!(
            fs.unlink("q", &dirs).map_err(|e| e.kind()),
            Err(FsErrorKind::IsDirectory)
        );

        fs.create("r", &dirs).unwrap();
        fs.write("r", 0, &[0xAB; 48]).unwrap();
        fs.unlink("r", &dirs).unwrap();
        assert!(!fs.is_file("r"));
        assert_eq!(fs.block_count(), 0, "all blocks released");
    }

    #[test]
    fn entry_counting_is_per_directory() {
        let mut dirs = DirectoryIndex::new();
        let mut fs = store();
        dirs.mkdir("top", &fs).unwrap();
        dirs.mkdir("top/sub", &fs).unwrap();
        fs.create("top/one", &dirs).unwrap();
        fs.create("top/two", &dirs).unwrap();
        fs.create("top/sub/three", &dirs).unwrap();

        assert_eq!(fs.number_of_entries("top"), 2);
        assert_eq!(fs.number_of_entries("top/sub"), 1);
        assert_eq!(fs.number_of_entries(""), 0);
    }
}
