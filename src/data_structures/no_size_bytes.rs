use bytes::Bytes;
use serde::ser::SerializeTuple;
use serde::{Serialize, Serializer};

/// Payload bytes that serialize without a length prefix.
///
/// Wire messages carry their own length, so a trailing payload (bitfield,
/// block, extension body) is written as a bare tuple of bytes.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct NoSizeBytes(Bytes);

impl NoSizeBytes {
    pub fn new(data: Bytes) -> Self {
        Self(data)
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    pub fn as_bytes(&self) -> Bytes {
        self.0.clone()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &u8> {
        self.0.iter()
    }
}

impl AsRef<[u8]> for NoSizeBytes {
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl From<&[u8]> for NoSizeBytes {
    fn from(value: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(value))
    }
}

impl From<Vec<u8>> for NoSizeBytes {
    fn from(value: Vec<u8>) -> Self {
        Self(Bytes::from(value))
    }
}

impl From<Bytes> for NoSizeBytes {
    fn from(value: Bytes) -> Self {
        Self(value)
    }
}

impl Serialize for NoSizeBytes {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut tup = s.serialize_tuple(self.0.len())?;
        for byte in self.0.iter() {
            tup.serialize_element(byte)?;
        }
        tup.end()
    }
}
