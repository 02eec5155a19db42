//! Owned key-material buffers.

use std::fmt;
use std::hash::{Hash, Hasher};

use zeroize::Zeroize;

use crate::Error;

/// Largest public value, private scalar or shared secret we accept on
/// the wire: an 8192-bit DH group value with its mpint sign octet.
pub const MAX_KEY_MATERIAL: usize = 1025;

/// An owned, bounded byte buffer holding a DH/ECDH public value, a
/// private scalar or a shared secret.
///
/// Immutable once constructed. Compared and hashed by raw content so it
/// can key keylog correlation maps. The buffer is wiped on drop and the
/// `Debug` output never shows the bytes.
#[derive(Clone)]
pub struct KeyMaterial {
    data: Vec<u8>,
}

impl KeyMaterial {
    /// Build from wire bytes, rejecting empty or oversized material.
    pub fn from_wire(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.is_empty() || bytes.len() > MAX_KEY_MATERIAL {
            return Err(Error::InvalidKeyLength(bytes.len()));
        }
        Ok(KeyMaterial {
            data: bytes.to_vec(),
        })
    }

    /// Build from a hex string (keylog input form).
    pub fn from_hex(s: &str) -> Result<Self, Error> {
        let bytes = hex::decode(s).map_err(|_| Error::Keylog(format!("bad hex: {:?}", s)))?;
        Self::from_wire(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl PartialEq for KeyMaterial {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl Eq for KeyMaterial {}

impl Hash for KeyMaterial {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.data.hash(state);
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("len", &self.data.len())
            .field("data", &"<redacted>")
            .finish()
    }
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        self.data.zeroize();
    }
}
