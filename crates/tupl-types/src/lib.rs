//! Shared identifiers and wire values for the tupl row engine.
//!
//! Everything here is plain data: newtypes for the ids that flow between
//! the codec, the version chain and the mutation engine, plus the flat
//! attribute-id/value form rows travel in.

pub mod value;
pub mod words;

pub use value::AttrValue;
pub use words::{WORD_BYTES, bytes_to_words, words_for_bytes, words_to_bytes};

use std::fmt;
use std::num::NonZeroU64;

// ---------------------------------------------------------------------------
// TxnId
// ---------------------------------------------------------------------------

/// Transaction identifier assigned by the external coordinator.
///
/// Zero is reserved, so `Option<TxnId>` costs no extra space.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct TxnId(NonZeroU64);

impl TxnId {
    /// Construct a `TxnId`; returns `None` for zero.
    #[inline]
    pub const fn new(raw: u64) -> Option<Self> {
        match NonZeroU64::new(raw) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }

    /// Get the raw u64 value.
    #[inline]
    pub const fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn#{}", self.get())
    }
}

// ---------------------------------------------------------------------------
// Savepoint
// ---------------------------------------------------------------------------

/// Intra-transaction ordering marker.
///
/// An operation stamped with savepoint `s` is visible to a reader of the
/// same transaction whose savepoint is `>= s`.
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[repr(transparent)]
pub struct Savepoint(u32);

impl Savepoint {
    /// Sees every operation of the transaction.
    pub const LATEST: Self = Self(u32::MAX);

    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Savepoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sp{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// PartitionId / AttrId / LogGroupId
// ---------------------------------------------------------------------------

/// One physical shard of a table, owned by a single execution context.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct PartitionId(u32);

impl PartitionId {
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "part#{}", self.0)
    }
}

/// Attribute (column) id; equal to its declaration index in the table.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct AttrId(u16);

impl AttrId {
    #[inline]
    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u16 {
        self.0
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for AttrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "attr#{}", self.0)
    }
}

/// Undo log group that reservations are charged against.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct LogGroupId(u32);

impl LogGroupId {
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }
}

// ---------------------------------------------------------------------------
// TupleVersion
// ---------------------------------------------------------------------------

/// Per-row version counter, 16 bits wide and wrapping.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct TupleVersion(u16);

impl TupleVersion {
    /// Version stamped on a freshly inserted row.
    pub const INITIAL: Self = Self(1);

    #[inline]
    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u16 {
        self.0
    }

    /// The following version, modulo 2^16.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for TupleVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// RowLocator / PageRef / DiskRef
// ---------------------------------------------------------------------------

/// Physical slot of a row's memory part: fixed page number and index.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct RowLocator {
    pub page: u32,
    pub index: u16,
}

impl RowLocator {
    #[inline]
    pub const fn new(page: u32, index: u16) -> Self {
        Self { page, index }
    }
}

impl fmt::Display for RowLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.page, self.index)
    }
}

/// A disk page in a tablespace data file.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct PageRef {
    pub file: u16,
    pub page: u32,
}

impl fmt::Display for PageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "file{}/page{}", self.file, self.page)
    }
}

/// Location of a row's disk-resident mirror.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct DiskRef {
    pub file: u16,
    pub page: u32,
    pub index: u16,
}

impl DiskRef {
    #[inline]
    pub const fn new(file: u16, page: u32, index: u16) -> Self {
        Self { file, page, index }
    }

    /// The page holding this record.
    #[inline]
    pub const fn page_ref(self) -> PageRef {
        PageRef {
            file: self.file,
            page: self.page,
        }
    }

    /// Two-word form stored in the tuple's fixed header.
    #[inline]
    pub const fn to_words(self) -> [u32; 2] {
        [((self.file as u32) << 16) | self.index as u32, self.page]
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from_words(words: [u32; 2]) -> Self {
        Self {
            file: (words[0] >> 16) as u16,
            index: (words[0] & 0xffff) as u16,
            page: words[1],
        }
    }
}

impl fmt::Display for DiskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "file{}/page{}/{}", self.file, self.page, self.index)
    }
}

// ---------------------------------------------------------------------------
// OpKind
// ---------------------------------------------------------------------------

/// Kind of a row-level operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum OpKind {
    Read,
    Insert,
    Update,
    Delete,
}

impl OpKind {
    /// Whether the operation produces a new row image.
    #[inline]
    pub const fn is_write(self) -> bool {
        !matches!(self, Self::Read)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_txn_id_rejects_zero() {
        assert!(TxnId::new(0).is_none());
        assert_eq!(TxnId::new(9).unwrap().get(), 9);
        assert_eq!(TxnId::new(9).unwrap().to_string(), "txn#9");
        assert_eq!(
            std::mem::size_of::<Option<TxnId>>(),
            std::mem::size_of::<u64>()
        );
    }

    #[test]
    fn test_tuple_version_wraps() {
        assert_eq!(TupleVersion::INITIAL.next().get(), 2);
        assert_eq!(TupleVersion::new(u16::MAX).next().get(), 0);
    }

    #[test]
    fn test_disk_ref_words() {
        let r = DiskRef::new(3, 0x0102_0304, 77);
        assert_eq!(DiskRef::from_words(r.to_words()), r);
        assert_eq!(r.page_ref(), PageRef { file: 3, page: 0x0102_0304 });
        assert_eq!(r.to_string(), "file3/page16909060/77");
    }

    #[test]
    fn test_savepoint_ordering() {
        assert!(Savepoint::new(3) < Savepoint::new(4));
        assert!(Savepoint::new(u32::MAX - 1) < Savepoint::LATEST);
    }

    #[test]
    fn test_locator_serde() {
        let loc = RowLocator::new(12, 5);
        let json = serde_json::to_string(&loc).unwrap();
        let back: RowLocator = serde_json::from_str(&json).unwrap();
        assert_eq!(back, loc);
        assert_eq!(loc.to_string(), "12:5");
    }
}
