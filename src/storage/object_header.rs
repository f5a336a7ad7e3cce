//! Header written ahead of every stored object.
//!
//! The header names the object so a storage block can be traced back to its
//! location record during defragmentation.

use std::io::{self, Read, Write};

use crate::common::{GroupId, ObjectId, ObjectKey};

/// Identity prefix of a serialized object.
///
/// # Layout (16 bytes)
/// ```text
/// Offset  Size  Field
/// ------  ----  -----
/// 0       8     group id (little-endian)
/// 8       8     object id (little-endian)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectHeader {
    pub group: GroupId,
    pub object: ObjectId,
}

impl ObjectHeader {
    /// Size of the header in bytes.
    pub const SIZE: usize = 16;

    pub const OFFSET_GROUP: usize = 0;
    pub const OFFSET_OBJECT: usize = 8;

    pub fn new(key: ObjectKey) -> Self {
        Self {
            group: key.group,
            object: key.object,
        }
    }

    #[inline]
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.group, self.object)
    }

    /// Decode a header.
    ///
    /// # Panics
    /// Panics if `bytes` is shorter than [`ObjectHeader::SIZE`].
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let field = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[at..at + 8]);
            u64::from_le_bytes(raw)
        };
        Self {
            group: field(Self::OFFSET_GROUP),
            object: field(Self::OFFSET_OBJECT),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[Self::OFFSET_GROUP..Self::OFFSET_OBJECT].copy_from_slice(&self.group.to_le_bytes());
        bytes[Self::OFFSET_OBJECT..].copy_from_slice(&self.object.to_le_bytes());
        bytes
    }

    pub fn read_from<R: Read + ?Sized>(reader: &mut R) -> io::Result<Self> {
        let mut bytes = [0u8; Self::SIZE];
        reader.read_exact(&mut bytes)?;
        Ok(Self::from_bytes(&bytes))
    }

    pub fn write_to<W: Write + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = ObjectHeader::new(ObjectKey::new(1, 0x0203));
        let bytes = header.to_bytes();
        assert_eq!(bytes[0], 1);
        assert_eq!(bytes[8], 0x03);
        assert_eq!(bytes[9], 0x02);
        assert_eq!(ObjectHeader::from_bytes(&bytes), header);
    }

    #[test]
    fn test_header_stream() {
        let header = ObjectHeader::new(ObjectKey::new(u64::MAX, 9));
        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        buf.extend_from_slice(b"payload");

        let mut reader = &buf[..];
        assert_eq!(ObjectHeader::read_from(&mut reader).unwrap().key(), header.key());
        assert_eq!(reader, b"payload");
    }

    #[test]
    fn test_short_stream_fails() {
        let mut reader: &[u8] = &[0u8; 10];
        assert!(ObjectHeader::read_from(&mut reader).is_err());
    }
}
