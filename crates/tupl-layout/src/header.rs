//! Tuple header word: state flags in the low half, version in the high half.

use tupl_types::TupleVersion;

bitflags::bitflags! {
    /// Allocation and size-change state of a physical tuple.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TupleFlags: u16 {
        /// Slot is on the free list.
        const FREE = 1;
        /// Slot holds a tuple.
        const ALLOC = 1 << 1;
        /// Tuple has a disk-resident part.
        const DISK_PART = 1 << 2;
        /// Variable part lives in another slot; the original is a forward.
        const VAR_RELOCATED = 1 << 3;
        /// Variable part grew since the last undo record.
        const MM_GROWN = 1 << 4;
        /// Variable part shrank since the last undo record.
        const MM_SHRINK = 1 << 5;
    }
}

/// Decoded header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TupleHeader {
    pub flags: TupleFlags,
    pub version: TupleVersion,
}

impl TupleHeader {
    pub const fn new(flags: TupleFlags, version: TupleVersion) -> Self {
        Self { flags, version }
    }

    /// Header of a free slot.
    pub const fn free() -> Self {
        Self::new(TupleFlags::FREE, TupleVersion::new(0))
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from_word(word: u32) -> Self {
        Self {
            flags: TupleFlags::from_bits_retain(word as u16),
            version: TupleVersion::new((word >> 16) as u16),
        }
    }

    #[inline]
    pub const fn to_word(self) -> u32 {
        ((self.version.get() as u32) << 16) | self.flags.bits() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_word_layout() {
        let h = TupleHeader::new(
            TupleFlags::ALLOC | TupleFlags::DISK_PART,
            TupleVersion::new(0x1234),
        );
        assert_eq!(h.to_word(), 0x1234_0006);
        assert_eq!(TupleHeader::from_word(h.to_word()), h);
    }

    #[test]
    fn test_unknown_bits_preserved() {
        let h = TupleHeader::from_word(0x0001_8002);
        assert_eq!(h.to_word(), 0x0001_8002);
        assert!(h.flags.contains(TupleFlags::ALLOC));
    }

    #[test]
    fn test_free_header() {
        assert_eq!(TupleHeader::free().to_word(), 1);
    }
}
