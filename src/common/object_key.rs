//! Buffered object identity.

use std::fmt;

/// Identifies a cache group (one per query or temporary table).
pub type GroupId = u64;

/// Identifies a buffered object within its group.
pub type ObjectId = u64;

/// Identifies one buffered object: its group plus its id in that group.
///
/// # Example
/// ```
/// use spillcache::ObjectKey;
///
/// let key = ObjectKey::new(3, 17);
/// assert_eq!(key.group, 3);
/// assert_eq!(format!("{}", key), "Object(3/17)");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub group: GroupId,
    pub object: ObjectId,
}

impl ObjectKey {
    #[inline]
    pub fn new(group: GroupId, object: ObjectId) -> Self {
        ObjectKey { group, object }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Object({}/{})", self.group, self.object)
    }
}
