//! Content addresses.
//!
//! An [`ObjectId`] is the BLAKE3 digest of an object's canonical stored form,
//! `"<kind> <len>\0"` followed by the payload. Two objects are the same object
//! exactly when their ids are byte-equal, which is what makes writes
//! idempotent and lets two repositories agree on identity without talking.

use std::fmt;
use std::str::FromStr;

use hex::FromHex;
use hex::FromHexError;

use crate::object::ObjectKind;

/// Length of an [`ObjectId`] in bytes.
pub const ID_LEN: usize = 32;

pub type RawObjectId = [u8; ID_LEN];

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ObjectId(RawObjectId);

impl ObjectId {
    pub const fn from_raw(raw: RawObjectId) -> Self {
        ObjectId(raw)
    }

    pub fn as_bytes(&self) -> &RawObjectId {
        &self.0
    }

    /// Hashes `payload` as an object of the given kind.
    pub fn hash_object(kind: ObjectKind, payload: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(kind.header(payload.len()).as_bytes());
        hasher.update(payload);
        ObjectId(*hasher.finalize().as_bytes())
    }

    /// Hashes an already framed byte sequence (header included).
    pub fn hash_stored(stored: &[u8]) -> Self {
        ObjectId(*blake3::hash(stored).as_bytes())
    }

    pub fn from_hex(hex: &str) -> Result<Self, FromHexError> {
        RawObjectId::from_hex(hex).map(ObjectId)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The first twelve hex digits, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.short())
    }
}

impl FromStr for ObjectId {
    type Err = FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ObjectId::from_hex(s)
    }
}

impl From<RawObjectId> for ObjectId {
    fn from(raw: RawObjectId) -> Self {
        ObjectId(raw)
    }
}

impl AsRef<[u8]> for ObjectId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
