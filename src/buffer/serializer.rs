//! Object serialization seam.

use std::io::{self, Read, Write};

use crate::common::GroupId;

/// Converts objects of one cache group to and from bytes.
///
/// The cache prefixes its own header and streams the serializer's bytes
/// straight into memory blocks, so implementations never see the layout.
///
/// # Example
/// ```
/// use std::io::{self, Read, Write};
/// use spillcache::Serializer;
///
/// struct Bytes(u64);
///
/// impl Serializer<Vec<u8>> for Bytes {
///     fn group_id(&self) -> u64 {
///         self.0
///     }
///
///     fn serialize(&self, value: &Vec<u8>, out: &mut dyn Write) -> io::Result<()> {
///         out.write_all(value)
///     }
///
///     fn deserialize(&self, input: &mut dyn Read) -> io::Result<Vec<u8>> {
///         let mut value = Vec::new();
///         input.read_to_end(&mut value)?;
///         Ok(value)
///     }
/// }
/// ```
pub trait Serializer<T>: Send + Sync {
    /// Group owning the objects this serializer handles.
    fn group_id(&self) -> GroupId;

    fn serialize(&self, value: &T, out: &mut dyn Write) -> io::Result<()>;

    fn deserialize(&self, input: &mut dyn Read) -> io::Result<T>;
}
