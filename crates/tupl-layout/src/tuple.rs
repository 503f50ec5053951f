//! Packed and expanded tuple representations.
//!
//! A [`PackedTuple`] is what sits on pages: fixed words, a compact variable
//! part and an optional disk mirror. An [`ExpandedTuple`] is the addressable
//! working view where every variable attribute has a stable byte offset, so
//! the codec can overwrite one value without moving the others.
//!
//! # Packed variable part
//!
//! ```text
//! u16 offsets[n + 1]   offsets[0] = 0, offsets[i+1] - offsets[i] = len(i)
//! data bytes           concatenated in declaration order
//! zero padding         up to the next word boundary
//! ```
//!
//! `shrink(expand(t)) == t` for every `t` produced by [`shrink`].

use std::fmt;

use smallvec::SmallVec;
use tupl_error::{Result, TuplError};
use tupl_types::{DiskRef, TupleVersion, bytes_to_words, words_for_bytes, words_to_bytes};

use crate::header::{TupleFlags, TupleHeader};
use crate::schema::{
    AttrDescriptor, CHECKSUM_WORD, HEADER_WORD, Placement, TableDescriptor,
};

/// Words needed to pack `n` variable attributes holding `total_bytes` bytes.
#[inline]
pub const fn packed_var_words(n: usize, total_bytes: usize) -> usize {
    words_for_bytes(2 * (n + 1) + total_bytes)
}

// ---------------------------------------------------------------------------
// VarRef
// ---------------------------------------------------------------------------

/// Location of a memory variable part in the variable area.
///
/// Stored in one fixed word as `(page + 1) << 16 | slot`; zero means none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarRef {
    pub page: u16,
    pub slot: u16,
}

impl VarRef {
    pub const fn new(page: u16, slot: u16) -> Self {
        Self { page, slot }
    }

    #[inline]
    pub const fn to_word(self) -> u32 {
        ((self.page as u32 + 1) << 16) | self.slot as u32
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from_word(word: u32) -> Option<Self> {
        let hi = word >> 16;
        if hi == 0 {
            return None;
        }
        Some(Self {
            page: (hi - 1) as u16,
            slot: (word & 0xffff) as u16,
        })
    }
}

impl fmt::Display for VarRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "var{}.{}", self.page, self.slot)
    }
}

// ---------------------------------------------------------------------------
// VarSection
// ---------------------------------------------------------------------------

/// Expanded variable part: each attribute owns `cap` bytes at a stable start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarSection {
    buf: Vec<u8>,
    starts: SmallVec<[u32; 9]>,
    lens: SmallVec<[u32; 8]>,
}

impl VarSection {
    /// All attributes empty.
    pub fn new(caps: &[u32]) -> Self {
        let mut starts = SmallVec::with_capacity(caps.len() + 1);
        let mut at = 0u32;
        starts.push(at);
        for cap in caps {
            at += cap;
            starts.push(at);
        }
        Self {
            buf: vec![0; at as usize],
            starts,
            lens: SmallVec::from_elem(0, caps.len()),
        }
    }

    /// Number of attributes.
    #[inline]
    pub fn len(&self) -> usize {
        self.lens.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.lens.is_empty()
    }

    #[inline]
    pub fn cap(&self, i: usize) -> usize {
        (self.starts[i + 1] - self.starts[i]) as usize
    }

    /// Stable byte offset of attribute `i` inside the expanded buffer.
    #[inline]
    pub fn start(&self, i: usize) -> usize {
        self.starts[i] as usize
    }

    pub fn get(&self, i: usize) -> &[u8] {
        let s = self.start(i);
        &self.buf[s..s + self.lens[i] as usize]
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn set(&mut self, i: usize, bytes: &[u8]) -> Result<()> {
        if i >= self.len() || bytes.len() > self.cap(i) {
            return Err(TuplError::internal(format!(
                "var slot {i} cannot hold {} bytes",
                bytes.len()
            )));
        }
        let s = self.start(i);
        self.buf[s..s + bytes.len()].copy_from_slice(bytes);
        self.lens[i] = bytes.len() as u32;
        Ok(())
    }

    /// Total data bytes currently held.
    pub fn data_len(&self) -> usize {
        self.lens.iter().map(|l| *l as usize).sum()
    }

    /// Size of the packed form.
    pub fn packed_words(&self) -> usize {
        packed_var_words(self.len(), self.data_len())
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn pack(&self) -> Vec<u32> {
        let n = self.len();
        let mut bytes = Vec::with_capacity(2 * (n + 1) + self.data_len());
        let mut off = 0u16;
        bytes.extend_from_slice(&off.to_le_bytes());
        for len in &self.lens {
            off += *len as u16;
            bytes.extend_from_slice(&off.to_le_bytes());
        }
        for i in 0..n {
            bytes.extend_from_slice(self.get(i));
        }
        bytes_to_words(&bytes)
    }

    /// Rebuild from a packed part; trailing words beyond the data are ignored.
    pub fn unpack(caps: &[u32], words: &[u32]) -> Result<Self> {
        let n = caps.len();
        let header_bytes = 2 * (n + 1);
        let avail = words.len() * 4;
        if avail < header_bytes {
            return Err(TuplError::malformed(format!(
                "variable part of {} words too short for {n} offsets",
                words.len()
            )));
        }
        let raw = words_to_bytes(words, avail)
            .ok_or_else(|| TuplError::malformed("variable part unreadable"))?;
        let offsets: SmallVec<[usize; 9]> = raw[..header_bytes]
            .chunks_exact(2)
            .map(|c| usize::from(u16::from_le_bytes([c[0], c[1]])))
            .collect();
        if offsets[0] != 0 {
            return Err(TuplError::malformed("variable part does not start at 0"));
        }
        if header_bytes + offsets[n] > avail {
            return Err(TuplError::malformed(format!(
                "variable part claims {} data bytes, only {} present",
                offsets[n],
                avail - header_bytes
            )));
        }
        let mut section = Self::new(caps);
        for i in 0..n {
            let (lo, hi) = (offsets[i], offsets[i + 1]);
            if hi < lo {
                return Err(TuplError::malformed(format!(
                    "variable offsets decrease at attribute {i}"
                )));
            }
            let value = &raw[header_bytes + lo..header_bytes + hi];
            if value.len() > section.cap(i) {
                return Err(TuplError::malformed(format!(
                    "variable attribute {i} holds {} bytes, cap {}",
                    value.len(),
                    section.cap(i)
                )));
            }
            section.set(i, value)?;
        }
        Ok(section)
    }
}

// ---------------------------------------------------------------------------
// DiskSection
// ---------------------------------------------------------------------------

/// Expanded disk mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskSection {
    pub nulls: Vec<u32>,
    pub fixed: Vec<u32>,
    pub var: Option<VarSection>,
}

impl DiskSection {
    fn blank(desc: &TableDescriptor) -> Self {
        let mut nulls = vec![0; desc.disk_null_words()];
        for a in desc.disk_attrs() {
            set_bit(&mut nulls, a.null_bit, true);
        }
        Self {
            nulls,
            fixed: vec![0; desc.disk_fixed_words()],
            var: (!desc.disk_var_caps().is_empty()).then(|| VarSection::new(desc.disk_var_caps())),
        }
    }

    pub fn pack(&self) -> Vec<u32> {
        let mut out = Vec::with_capacity(self.packed_words());
        out.extend_from_slice(&self.nulls);
        out.extend_from_slice(&self.fixed);
        if let Some(var) = &self.var {
            out.extend(var.pack());
        }
        out
    }

    pub fn packed_words(&self) -> usize {
        self.nulls.len() + self.fixed.len() + self.var.as_ref().map_or(0, VarSection::packed_words)
    }

    pub fn unpack(desc: &TableDescriptor, words: &[u32]) -> Result<Self> {
        let head = desc.disk_null_words() + desc.disk_fixed_words();
        if words.len() < head {
            return Err(TuplError::malformed(format!(
                "disk part of {} words, expected at least {head}",
                words.len()
            )));
        }
        let (nulls, rest) = words.split_at(desc.disk_null_words());
        let (fixed, var) = rest.split_at(desc.disk_fixed_words());
        let var = if desc.disk_var_caps().is_empty() {
            None
        } else {
            Some(VarSection::unpack(desc.disk_var_caps(), var)?)
        };
        Ok(Self {
            nulls: nulls.to_vec(),
            fixed: fixed.to_vec(),
            var,
        })
    }
}

// ---------------------------------------------------------------------------
// PackedTuple / ExpandedTuple
// ---------------------------------------------------------------------------

/// On-page form of a row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedTuple {
    pub fixed: Vec<u32>,
    pub var: Option<Vec<u32>>,
    pub disk: Option<Vec<u32>>,
}

impl PackedTuple {
    #[inline]
    pub fn var_words(&self) -> usize {
        self.var.as_ref().map_or(0, Vec::len)
    }

    #[inline]
    pub fn disk_words(&self) -> usize {
        self.disk.as_ref().map_or(0, Vec::len)
    }
}

/// Addressable working view of a row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpandedTuple {
    pub fixed: Vec<u32>,
    pub var: Option<VarSection>,
    /// `None` until the disk mirror has been loaded.
    pub disk: Option<DiskSection>,
}

impl ExpandedTuple {
    /// Fresh insert image: every null bit set, version 1.
    pub fn blank(desc: &TableDescriptor) -> Self {
        let mut fixed = vec![0; desc.fixed_words()];
        fixed[HEADER_WORD] = TupleHeader::new(TupleFlags::ALLOC, TupleVersion::INITIAL).to_word();
        {
            let nulls = &mut fixed[desc.null_offset()..desc.null_offset() + desc.mm_null_words()];
            for a in desc.attrs().iter().filter(|a| !a.codec.is_disk()) {
                set_bit(nulls, a.null_bit, true);
            }
        }
        Self {
            fixed,
            var: desc.has_mm_var().then(|| VarSection::new(desc.mm_var_caps())),
            disk: desc.has_disk().then(|| DiskSection::blank(desc)),
        }
    }

    #[inline]
    pub fn header(&self) -> TupleHeader {
        TupleHeader::from_word(self.fixed[HEADER_WORD])
    }

    #[inline]
    pub fn set_header(&mut self, header: TupleHeader) {
        self.fixed[HEADER_WORD] = header.to_word();
    }

    #[inline]
    pub fn version(&self) -> TupleVersion {
        self.header().version
    }

    pub fn set_version(&mut self, version: TupleVersion) {
        let mut h = self.header();
        h.version = version;
        self.set_header(h);
    }

    #[inline]
    pub fn flags(&self) -> TupleFlags {
        self.header().flags
    }

    pub fn set_flags(&mut self, flags: TupleFlags, on: bool) {
        let mut h = self.header();
        h.flags.set(flags, on);
        self.set_header(h);
    }

    pub fn var_ref(&self, desc: &TableDescriptor) -> Option<VarRef> {
        desc.var_ref_offset()
            .and_then(|at| VarRef::from_word(self.fixed[at]))
    }

    pub fn set_var_ref(&mut self, desc: &TableDescriptor, var_ref: Option<VarRef>) {
        if let Some(at) = desc.var_ref_offset() {
            self.fixed[at] = var_ref.map_or(0, VarRef::to_word);
        }
    }

    /// Disk mirror location; present once `DISK_PART` is set.
    pub fn disk_ref(&self, desc: &TableDescriptor) -> Option<DiskRef> {
        let at = desc.disk_ref_offset()?;
        if !self.flags().contains(TupleFlags::DISK_PART) {
            return None;
        }
        Some(DiskRef::from_words([self.fixed[at], self.fixed[at + 1]]))
    }

    pub fn set_disk_ref(&mut self, desc: &TableDescriptor, disk_ref: DiskRef) {
        if let Some(at) = desc.disk_ref_offset() {
            let [a, b] = disk_ref.to_words();
            self.fixed[at] = a;
            self.fixed[at + 1] = b;
            self.set_flags(TupleFlags::DISK_PART, true);
        }
    }

    /// Null bit of `attr`. Disk attributes require the disk part.
    pub fn is_null(&self, desc: &TableDescriptor, attr: &AttrDescriptor) -> Result<bool> {
        Ok(match attr.placement() {
            Placement::Memory => get_bit(
                &self.fixed[desc.null_offset()..desc.null_offset() + desc.mm_null_words()],
                attr.null_bit,
            ),
            Placement::Disk => get_bit(&self.disk_part()?.nulls, attr.null_bit),
        })
    }

    pub fn set_null(&mut self, desc: &TableDescriptor, attr: &AttrDescriptor, null: bool) -> Result<()> {
        match attr.placement() {
            Placement::Memory => {
                let range = desc.null_offset()..desc.null_offset() + desc.mm_null_words();
                set_bit(&mut self.fixed[range], attr.null_bit, null);
            }
            Placement::Disk => set_bit(&mut self.disk_part_mut()?.nulls, attr.null_bit, null),
        }
        Ok(())
    }

    pub fn disk_part(&self) -> Result<&DiskSection> {
        self.disk
            .as_ref()
            .ok_or_else(|| TuplError::internal("disk part of row not loaded"))
    }

    pub fn disk_part_mut(&mut self) -> Result<&mut DiskSection> {
        self.disk
            .as_mut()
            .ok_or_else(|| TuplError::internal("disk part of row not loaded"))
    }

    /// Packed words the memory variable part needs right now.
    pub fn var_packed_words(&self) -> usize {
        self.var.as_ref().map_or(0, VarSection::packed_words)
    }

    /// Packed words the disk part needs right now.
    pub fn disk_packed_words(&self) -> usize {
        self.disk.as_ref().map_or(0, DiskSection::packed_words)
    }
}

/// Rebuild the addressable view from a packed tuple.
///
/// The variable words must already be resolved past any forwarding entry.
/// A packed tuple without disk words yields a view with `disk == None`.
pub fn expand(desc: &TableDescriptor, packed: &PackedTuple) -> Result<ExpandedTuple> {
    if packed.fixed.len() != desc.fixed_words() {
        return Err(TuplError::malformed(format!(
            "fixed part of {} words, table {} expects {}",
            packed.fixed.len(),
            desc.name(),
            desc.fixed_words()
        )));
    }
    let var = match (desc.has_mm_var(), &packed.var) {
        (false, _) => None,
        (true, Some(words)) => Some(VarSection::unpack(desc.mm_var_caps(), words)?),
        (true, None) => return Err(TuplError::malformed("variable part missing")),
    };
    let disk = match (&packed.disk, desc.has_disk()) {
        (Some(words), true) => Some(DiskSection::unpack(desc, words)?),
        _ => None,
    };
    tracing::trace!(
        table = desc.name(),
        var_words = packed.var_words(),
        disk_words = packed.disk_words(),
        "expanded tuple"
    );
    Ok(ExpandedTuple {
        fixed: packed.fixed.clone(),
        var,
        disk,
    })
}

/// Repack a view into its minimal on-page form.
pub fn shrink(expanded: &ExpandedTuple) -> PackedTuple {
    PackedTuple {
        fixed: expanded.fixed.clone(),
        var: expanded.var.as_ref().map(VarSection::pack),
        disk: expanded.disk.as_ref().map(DiskSection::pack),
    }
}

// ---------------------------------------------------------------------------
// Checksum
// ---------------------------------------------------------------------------

/// XOR of every fixed word except the checksum word.
pub fn compute_checksum(desc: &TableDescriptor, fixed: &[u32]) -> u32 {
    fixed
        .iter()
        .enumerate()
        .filter(|(i, _)| !(desc.has_checksum() && *i == CHECKSUM_WORD))
        .fold(0, |acc, (_, w)| acc ^ w)
}

/// Store a fresh checksum; no-op when the table carries none.
pub fn seal_checksum(desc: &TableDescriptor, fixed: &mut [u32]) {
    if desc.has_checksum() {
        fixed[CHECKSUM_WORD] = compute_checksum(desc, fixed);
    }
}

/// Verify the stored checksum.
pub fn verify_checksum(
    desc: &TableDescriptor,
    fixed: &[u32],
    location: impl fmt::Display,
) -> Result<()> {
    if !desc.has_checksum() {
        return Ok(());
    }
    let stored = fixed[CHECKSUM_WORD];
    let computed = compute_checksum(desc, fixed);
    if stored != computed {
        tracing::warn!(
            table = desc.name(),
            %location,
            stored,
            computed,
            "tuple checksum mismatch"
        );
        return Err(TuplError::CorruptionDetected {
            location: location.to_string(),
            stored,
            computed,
        });
    }
    Ok(())
}

// ── bit helpers ──────────────────────────────────────────────────────────

#[inline]
fn get_bit(words: &[u32], bit: u32) -> bool {
    words[(bit / 32) as usize] & (1 << (bit % 32)) != 0
}

#[inline]
fn set_bit(words: &mut [u32], bit: u32, on: bool) {
    let w = &mut words[(bit / 32) as usize];
    if on {
        *w |= 1 << (bit % 32);
    } else {
        *w &= !(1 << (bit % 32));
    }
}
