///! Cryptographic Helpers, etc.
use {hmac::Hmac, sha2::Sha256};

use crate::uuid::FsUuid;

/// Derive the sealing key for a file system
///
/// The key is stretched from the mount password with the file system's
/// identity as salt, so two file systems sealed with the same password
/// still hold distinct keys.
pub fn make_sealing_key(password: &str, id: &FsUuid) -> [u8; 32] {
    let mut key = [0; 32];
    pbkdf2::pbkdf2::<Hmac<Sha256>>(password.as_bytes(), id.as_bytes(), 271828, &mut key);
    key
}
