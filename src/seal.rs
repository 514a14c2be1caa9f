//! Sealed Blocks
//!
//! File contents never sit in memory as plaintext. Every block of file data
//! is held as a [`SealedBlock`]: an authenticated ciphertext with a small
//! self-describing header in front. The header is the only part of a block
//! the file store may inspect; it exposes exactly one fact -- the payload
//! size -- which is all the block math needs.
//!
//! The header layout is fixed: a 12-byte nonce, a 16-byte authentication
//! tag, and the payload size as a little-endian `u32`, serialized with
//! bincode so the on-disk framing is the in-memory struct, byte for byte.
//! A block's serialized form is thus `HEADER_SIZE + payload_size` bytes,
//! which is what lets the persistence layer re-frame a concatenated dump
//! without any out-of-band index.
//!
//! Sealing is deterministic only in payload length; the nonce is fresh on
//! every call, so sealing the same plaintext twice yields different bytes.
use aes_gcm::aead::{generic_array::GenericArray, Aead, NewAead};
use aes_gcm::Aes256Gcm;
use log::error;
use rand::{thread_rng, RngCore};
use serde_derive::{Deserialize, Serialize};

use crate::error::{FsErrorKind, Result};

/// Number of bytes of sealing metadata in front of every block's ciphertext.
pub const HEADER_SIZE: usize = 32;

const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;

/// Overwrite a plaintext buffer with zeros
///
/// Plaintext buffers are request-scoped; every path that filled one wipes
/// it before release.
pub(crate) fn wipe(buffer: &mut [u8]) {
    for byte in buffer.iter_mut() {
        *byte = 0;
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
struct SealedHeader {
    nonce: [u8; NONCE_SIZE],
    tag: [u8; TAG_SIZE],
    payload_size: u32,
}

/// One sealed block of file data
///
/// Owned exclusively by the file store; blocks are never aliased between
/// files or between operations. Cloning produces an independent copy of the
/// sealed bytes, not a second reference to them.
#[derive(Clone, Debug, PartialEq)]
pub struct SealedBlock {
    header: SealedHeader,
    ciphertext: Vec<u8>,
}

impl SealedBlock {
    /// Plaintext length of this block.
    pub fn payload_size(&self) -> usize {
        self.header.payload_size as usize
    }

    /// Total serialized length: header plus ciphertext.
    pub fn sealed_size(&self) -> usize {
        HEADER_SIZE + self.payload_size()
    }

    /// Append this block's serialized form to `buffer`.
    pub fn write_to(&self, buffer: &mut Vec<u8>) {
        let header = bincode::serialize(&self.header).unwrap();
        buffer.extend_from_slice(&header);
        buffer.extend_from_slice(&self.ciphertext);
    }

    /// Read one block back from the front of `bytes`
    ///
    /// Returns the block and the number of bytes consumed, so a
    /// concatenation of blocks can be walked front to back. A truncated or
    /// malformed prefix is an integrity failure: the framing itself is part
    /// of what the seal protects.
    pub fn from_bytes(bytes: &[u8]) -> Result<(SealedBlock, usize)> {
        if bytes.len() < HEADER_SIZE {
            error!("sealed block truncated in header: {} bytes", bytes.len());
            return Err(FsErrorKind::Integrity.into());
        }
        let header: SealedHeader = bincode::deserialize(&bytes[..HEADER_SIZE])
            .map_err(|_| FsErrorKind::Integrity)?;
        let payload_size = header.payload_size as usize;
        if payload_size == 0 || bytes.len() < HEADER_SIZE + payload_size {
            error!(
                "sealed block truncated in payload: want {}, have {}",
                payload_size,
                bytes.len() - HEADER_SIZE
            );
            return Err(FsErrorKind::Integrity.into());
        }
        let ciphertext = bytes[HEADER_SIZE..HEADER_SIZE + payload_size].to_vec();
        Ok((SealedBlock { header, ciphertext }, HEADER_SIZE + payload_size))
    }
}

/// The sealing primitive consumed by the file store
///
/// `seal` and `unseal` are pure with respect to the store: no shared state,
/// no caching of payloads. Implementations verify integrity on every
/// unseal.
pub trait BlockSealer {
    /// Seal a plaintext buffer into a block. The plaintext must be
    /// non-empty.
    fn seal(&self, plaintext: &[u8]) -> Result<SealedBlock>;

    /// Unseal a block back to its plaintext, verifying the tag.
    fn unseal(&self, block: &SealedBlock) -> Result<Vec<u8>>;
}

/// AES-256-GCM sealer
///
/// The production [`BlockSealer`]. Constructed with a key derived by
/// [`make_sealing_key`](crate::make_sealing_key); a sealer may also be
/// built without key material to model a platform whose sealing policy
/// refuses to release the key, in which case every operation fails with
/// `Policy`.
pub struct AeadSealer {
    cipher: Option<Aes256Gcm>,
}

impl AeadSealer {
    /// Create a sealer from a 256-bit key.
    pub fn new(key: &[u8; 32]) -> Self {
        AeadSealer {
            cipher: Some(Aes256Gcm::new(GenericArray::from_slice(key))),
        }
    }

    /// Create a sealer whose key the platform has refused to release.
    pub fn without_key() -> Self {
        AeadSealer { cipher: None }
    }
}

impl BlockSealer for AeadSealer {
    fn seal(&self, plaintext: &[u8]) -> Result<SealedBlock> {
        let cipher = self.cipher.as_ref().ok_or(FsErrorKind::Policy)?;
        if plaintext.is_empty() || plaintext.len() > u32::max_value() as usize {
            return Err(FsErrorKind::InvalidArgument.into());
        }

        let mut nonce = [0u8; NONCE_SIZE];
        thread_rng().fill_bytes(&mut nonce);

        let mut sealed = cipher
            .encrypt(GenericArray::from_slice(&nonce), plaintext)
            .map_err(|_| FsErrorKind::Policy)?;

        // The aead crate appends the tag to the ciphertext; the header
        // carries it separately.
        let tag_offset = sealed.len() - TAG_SIZE;
        let mut tag = [0u8; TAG_SIZE];
        tag.copy_from_slice(&sealed[tag_offset..]);
        sealed.truncate(tag_offset);

        Ok(SealedBlock {
            header: SealedHeader {
                nonce,
                tag,
                payload_size: plaintext.len() as u32,
            },
            ciphertext: sealed,
        })
    }

    fn unseal(&self, block: &SealedBlock) -> Result<Vec<u8>> {
        let cipher = self.cipher.as_ref().ok_or(FsErrorKind::Policy)?;

        let mut sealed = Vec::with_capacity(block.ciphertext.len() + TAG_SIZE);
        sealed.extend_from_slice(&block.ciphertext);
        sealed.extend_from_slice(&block.header.tag);

        let plaintext = cipher
            .decrypt(GenericArray::from_slice(&block.header.nonce), &sealed[..])
            .map_err(|_| {
                error!("tag verification failed unsealing a block");
                FsErrorKind::Integrity
            })?;

        if plaintext.len() != block.payload_size() {
            error!(
                "unsealed payload length {} does not match header {}",
                plaintext.len(),
                block.payload_size()
            );
            return Err(FsErrorKind::Integrity.into());
        }
        Ok(plaintext)
    }
}
