use std::fmt;

use lazy_static::lazy_static;
use uuid::Uuid;

lazy_static! {
    /// The root of the sealfs UUID namespace
    ///
    /// Every file system identity is a V5 UUID derived from this root, so
    /// the same name always yields the same identity.
    static ref FS_ROOT_UUID: Uuid = Uuid::new_v5(&Uuid::NAMESPACE_DNS, b"sealfs.io");
}

/// A file system identity
///
/// Derived from the name of the host directory the file system persists to,
/// so remounting the same dump root re-derives the same identity -- and with
/// it, the same sealing-key salt.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct FsUuid {
    inner: Uuid,
}

impl FsUuid {
    /// Create a file system FsUuid from a name
    pub fn new_fs<N>(name: N) -> Self
    where
        N: AsRef<[u8]>,
    {
        FsUuid {
            inner: Uuid::new_v5(&FS_ROOT_UUID, name.as_ref()),
        }
    }

    /// The identity as raw bytes, for use as key-derivation salt.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.inner.as_bytes()
    }
}

impl AsRef<Uuid> for FsUuid {
    fn as_ref(&self) -> &Uuid {
        &self.inner
    }
}

impl fmt::Display for FsUuid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn derivation_is_stable() {
        assert_eq!(FsUuid::new_fs("store"), FsUuid::new_fs("store"));
        assert_ne!(FsUuid::new_fs("store"), FsUuid::new_fs("other"));
    }
}
