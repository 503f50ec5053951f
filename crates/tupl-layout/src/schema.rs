//! Attribute descriptor table.
//!
//! Built once per relation by [`TableDescriptorBuilder`]; offsets, null-bit
//! positions and codec variants never change afterwards.
//!
//! # Fixed-part layout
//!
//! ```text
//! word 0              header (flags | version << 16)
//! word 1              checksum                  (if enabled)
//! memory null bitmap  ceil(memory attrs / 32) words
//! var ref             1 word                    (if any memory var attr)
//! disk ref            2 words                   (if any disk attr)
//! fixed attributes    ceil(bytes / 4) words each, declaration order
//! ```
//!
//! The disk part is `[disk null bitmap][disk fixed words][disk var packed]`.

use smallvec::SmallVec;
use tupl_error::{Result, TuplError};
use tupl_types::{AttrId, words_for_bytes};

use crate::collation::CollationId;
use crate::tuple::packed_var_words;

/// Word index of the tuple header.
pub const HEADER_WORD: usize = 0;
/// Word index of the checksum when the table carries one.
pub const CHECKSUM_WORD: usize = 1;

/// Where an attribute's value lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Placement {
    Memory,
    Disk,
}

/// Declared size of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum SizeClass {
    /// Exactly `bytes` bytes, stored in `ceil(bytes / 4)` words.
    Fixed { bytes: u32 },
    /// Up to `max_bytes` bytes in the variable part.
    Variable { max_bytes: u32 },
}

impl SizeClass {
    #[inline]
    pub const fn is_fixed(self) -> bool {
        matches!(self, Self::Fixed { .. })
    }
}

/// Per-attribute read/update variant, chosen at schema-build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttrCodec {
    FixedNotNull,
    FixedNullable,
    VarNotNull,
    VarNullable,
    DiskFixedNotNull,
    DiskFixedNullable,
    DiskVarNotNull,
    DiskVarNullable,
}

impl AttrCodec {
    const fn select(placement: Placement, size: SizeClass, nullable: bool) -> Self {
        match (placement, size.is_fixed(), nullable) {
            (Placement::Memory, true, false) => Self::FixedNotNull,
            (Placement::Memory, true, true) => Self::FixedNullable,
            (Placement::Memory, false, false) => Self::VarNotNull,
            (Placement::Memory, false, true) => Self::VarNullable,
            (Placement::Disk, true, false) => Self::DiskFixedNotNull,
            (Placement::Disk, true, true) => Self::DiskFixedNullable,
            (Placement::Disk, false, false) => Self::DiskVarNotNull,
            (Placement::Disk, false, true) => Self::DiskVarNullable,
        }
    }

    #[inline]
    pub const fn is_nullable(self) -> bool {
        matches!(
            self,
            Self::FixedNullable
                | Self::VarNullable
                | Self::DiskFixedNullable
                | Self::DiskVarNullable
        )
    }

    #[inline]
    pub const fn is_disk(self) -> bool {
        matches!(
            self,
            Self::DiskFixedNotNull
                | Self::DiskFixedNullable
                | Self::DiskVarNotNull
                | Self::DiskVarNullable
        )
    }
}

// ---------------------------------------------------------------------------
// AttrMask
// ---------------------------------------------------------------------------

/// Bit set over attribute ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttrMask(SmallVec<[u64; 2]>);

impl AttrMask {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, id: AttrId) {
        let (w, b) = (id.index() / 64, id.index() % 64);
        if self.0.len() <= w {
            self.0.resize(w + 1, 0);
        }
        self.0[w] |= 1u64 << b;
    }

    pub fn contains(&self, id: AttrId) -> bool {
        let (w, b) = (id.index() / 64, id.index() % 64);
        self.0.get(w).is_some_and(|word| word & (1u64 << b) != 0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|w| *w == 0)
    }

    pub fn count(&self) -> usize {
        self.0.iter().map(|w| w.count_ones() as usize).sum()
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn iter(&self) -> impl Iterator<Item = AttrId> + '_ {
        self.0.iter().enumerate().flat_map(|(wi, word)| {
            (0..64)
                .filter(move |b| word & (1u64 << b) != 0)
                .map(move |b| AttrId::new((wi * 64 + b) as u16))
        })
    }
}

impl FromIterator<AttrId> for AttrMask {
    fn from_iter<I: IntoIterator<Item = AttrId>>(iter: I) -> Self {
        let mut mask = Self::new();
        for id in iter {
            mask.set(id);
        }
        mask
    }
}

// ---------------------------------------------------------------------------
// AttrSpec (builder input)
// ---------------------------------------------------------------------------

/// Declaration of one attribute, as handed to the builder.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AttrSpec {
    pub name: String,
    pub placement: Placement,
    pub size: SizeClass,
    pub nullable: bool,
    pub primary_key: bool,
    pub collation: Option<CollationId>,
}

impl AttrSpec {
    /// Not-null memory attribute of exactly `bytes` bytes.
    pub fn fixed(name: impl Into<String>, bytes: u32) -> Self {
        Self {
            name: name.into(),
            placement: Placement::Memory,
            size: SizeClass::Fixed { bytes },
            nullable: false,
            primary_key: false,
            collation: None,
        }
    }

    /// Not-null memory attribute of at most `max_bytes` bytes.
    pub fn var(name: impl Into<String>, max_bytes: u32) -> Self {
        Self {
            size: SizeClass::Variable { max_bytes },
            ..Self::fixed(name, 0)
        }
    }

    #[must_use]
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    #[must_use]
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    #[must_use]
    pub fn on_disk(mut self) -> Self {
        self.placement = Placement::Disk;
        self
    }

    #[must_use]
    pub fn collation(mut self, id: CollationId) -> Self {
        self.collation = Some(id);
        self
    }
}

// ---------------------------------------------------------------------------
// AttrDescriptor
// ---------------------------------------------------------------------------

/// Resolved layout of one attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttrDescriptor {
    pub id: AttrId,
    pub name: String,
    pub size: SizeClass,
    pub codec: AttrCodec,
    pub primary_key: bool,
    pub collation: Option<CollationId>,
    /// Bit index in the memory or disk null bitmap.
    pub null_bit: u32,
    /// Fixed: word offset (absolute for memory, relative to the disk fixed
    /// area for disk). Variable: index within its var section.
    pub offset: u32,
}

impl AttrDescriptor {
    #[inline]
    pub const fn placement(&self) -> Placement {
        if self.codec.is_disk() {
            Placement::Disk
        } else {
            Placement::Memory
        }
    }

    #[inline]
    pub const fn is_nullable(&self) -> bool {
        self.codec.is_nullable()
    }

    /// Words a fixed attribute occupies; zero for variable attributes.
    #[inline]
    pub const fn fixed_words(&self) -> usize {
        match self.size {
            SizeClass::Fixed { bytes } => words_for_bytes(bytes as usize),
            SizeClass::Variable { .. } => 0,
        }
    }
}

// ---------------------------------------------------------------------------
// TableDescriptor
// ---------------------------------------------------------------------------

/// Layout of every attribute of a relation plus the derived part sizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescriptor {
    name: String,
    attrs: Vec<AttrDescriptor>,
    checksum: bool,
    fixed_words: usize,
    null_offset: usize,
    mm_null_words: usize,
    var_ref_offset: Option<usize>,
    disk_ref_offset: Option<usize>,
    mm_var_caps: Vec<u32>,
    disk_null_words: usize,
    disk_fixed_words: usize,
    disk_var_caps: Vec<u32>,
    not_null: AttrMask,
    primary_key: AttrMask,
}

impl TableDescriptor {
    pub fn builder(name: impl Into<String>) -> TableDescriptorBuilder {
        TableDescriptorBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attrs(&self) -> &[AttrDescriptor] {
        &self.attrs
    }

    /// Look up an attribute by id.
    pub fn attr(&self, id: AttrId) -> Result<&AttrDescriptor> {
        self.attrs
            .get(id.index())
            .ok_or(TuplError::NoSuchAttribute { attr: id.get() })
    }

    #[inline]
    pub fn has_checksum(&self) -> bool {
        self.checksum
    }

    /// Total words in the fixed part.
    #[inline]
    pub fn fixed_words(&self) -> usize {
        self.fixed_words
    }

    #[inline]
    pub fn null_offset(&self) -> usize {
        self.null_offset
    }

    #[inline]
    pub fn mm_null_words(&self) -> usize {
        self.mm_null_words
    }

    #[inline]
    pub fn var_ref_offset(&self) -> Option<usize> {
        self.var_ref_offset
    }

    #[inline]
    pub fn disk_ref_offset(&self) -> Option<usize> {
        self.disk_ref_offset
    }

    #[inline]
    pub fn has_mm_var(&self) -> bool {
        !self.mm_var_caps.is_empty()
    }

    #[inline]
    pub fn has_disk(&self) -> bool {
        self.disk_ref_offset.is_some()
    }

    /// Maximum byte size of each memory var attribute, by var index.
    pub fn mm_var_caps(&self) -> &[u32] {
        &self.mm_var_caps
    }

    pub fn disk_var_caps(&self) -> &[u32] {
        &self.disk_var_caps
    }

    #[inline]
    pub fn disk_null_words(&self) -> usize {
        self.disk_null_words
    }

    #[inline]
    pub fn disk_fixed_words(&self) -> usize {
        self.disk_fixed_words
    }

    /// Packed size of the memory var part when every attribute is at its
    /// maximum length.
    pub fn mm_var_max_words(&self) -> usize {
        packed_var_words(self.mm_var_caps.len(), sum_caps(&self.mm_var_caps))
    }

    /// Size the tablespace preallocates for one disk part.
    pub fn disk_max_words(&self) -> usize {
        if !self.has_disk() {
            return 0;
        }
        let var = if self.disk_var_caps.is_empty() {
            0
        } else {
            packed_var_words(self.disk_var_caps.len(), sum_caps(&self.disk_var_caps))
        };
        self.disk_null_words + self.disk_fixed_words + var
    }

    /// Attributes declared NOT NULL.
    pub fn not_null(&self) -> &AttrMask {
        &self.not_null
    }

    /// Attributes forming the primary key.
    pub fn primary_key(&self) -> &AttrMask {
        &self.primary_key
    }

    /// Iterate attributes that live in the disk part.
    pub fn disk_attrs(&self) -> impl Iterator<Item = &AttrDescriptor> {
        self.attrs.iter().filter(|a| a.codec.is_disk())
    }
}

fn sum_caps(caps: &[u32]) -> usize {
    caps.iter().map(|c| *c as usize).sum()
}

/// Builder validating and laying out a [`TableDescriptor`].
#[derive(Debug, Clone)]
pub struct TableDescriptorBuilder {
    name: String,
    specs: Vec<AttrSpec>,
    checksum: bool,
}

impl TableDescriptorBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            specs: Vec::new(),
            checksum: true,
        }
    }

    #[must_use]
    pub fn attr(mut self, spec: AttrSpec) -> Self {
        self.specs.push(spec);
        self
    }

    /// Whether tuples carry a checksum word (default on).
    #[must_use]
    pub fn checksum(mut self, enabled: bool) -> Self {
        self.checksum = enabled;
        self
    }

    #[allow(clippy::cast_possible_truncation, clippy::too_many_lines)]
    pub fn build(self) -> Result<TableDescriptor> {
        let Self {
            name,
            specs,
            checksum,
        } = self;

        if specs.is_empty() {
            return Err(TuplError::schema(format!("table {name} has no attributes")));
        }
        if specs.len() > usize::from(u16::MAX) {
            return Err(TuplError::schema(format!(
                "table {name} declares {} attributes",
                specs.len()
            )));
        }
        if !specs.iter().any(|s| s.primary_key) {
            return Err(TuplError::schema(format!("table {name} has no primary key")));
        }
        for s in &specs {
            if s.primary_key && (s.nullable || s.placement == Placement::Disk) {
                return Err(TuplError::schema(format!(
                    "primary key attribute {} must be NOT NULL and memory-resident",
                    s.name
                )));
            }
            match s.size {
                SizeClass::Fixed { bytes: 0 } | SizeClass::Variable { max_bytes: 0 } => {
                    return Err(TuplError::schema(format!(
                        "attribute {} has zero size",
                        s.name
                    )));
                }
                _ => {}
            }
        }

        let n_mm = specs
            .iter()
            .filter(|s| s.placement == Placement::Memory)
            .count();
        let n_disk = specs.len() - n_mm;
        let has_mm_var = specs
            .iter()
            .any(|s| s.placement == Placement::Memory && !s.size.is_fixed());

        let null_offset = 1 + usize::from(checksum);
        let mm_null_words = n_mm.div_ceil(32);
        let mut next = null_offset + mm_null_words;
        let var_ref_offset = has_mm_var.then(|| {
            let at = next;
            next += 1;
            at
        });
        let disk_ref_offset = (n_disk > 0).then(|| {
            let at = next;
            next += 2;
            at
        });

        let mut attrs = Vec::with_capacity(specs.len());
        let mut mm_var_caps = Vec::new();
        let mut disk_var_caps = Vec::new();
        let mut disk_fixed_words = 0usize;
        let (mut mm_bit, mut disk_bit) = (0u32, 0u32);
        let mut not_null = AttrMask::new();
        let mut primary_key = AttrMask::new();

        for (i, s) in specs.into_iter().enumerate() {
            let id = AttrId::new(i as u16);
            let codec = AttrCodec::select(s.placement, s.size, s.nullable);
            let null_bit = match s.placement {
                Placement::Memory => {
                    mm_bit += 1;
                    mm_bit - 1
                }
                Placement::Disk => {
                    disk_bit += 1;
                    disk_bit - 1
                }
            };
            let offset = match (s.placement, s.size) {
                (Placement::Memory, SizeClass::Fixed { bytes }) => {
                    let at = next;
                    next += words_for_bytes(bytes as usize);
                    at
                }
                (Placement::Disk, SizeClass::Fixed { bytes }) => {
                    let at = disk_fixed_words;
                    disk_fixed_words += words_for_bytes(bytes as usize);
                    at
                }
                (Placement::Memory, SizeClass::Variable { max_bytes }) => {
                    mm_var_caps.push(max_bytes);
                    mm_var_caps.len() - 1
                }
                (Placement::Disk, SizeClass::Variable { max_bytes }) => {
                    disk_var_caps.push(max_bytes);
                    disk_var_caps.len() - 1
                }
            };
            if !s.nullable {
                not_null.set(id);
            }
            if s.primary_key {
                primary_key.set(id);
            }
            attrs.push(AttrDescriptor {
                id,
                name: s.name,
                size: s.size,
                codec,
                primary_key: s.primary_key,
                collation: s.collation,
                null_bit,
                offset: offset as u32,
            });
        }

        for caps in [&mm_var_caps, &disk_var_caps] {
            let packed_bytes = 2 * (caps.len() + 1) + sum_caps(caps);
            if packed_bytes > usize::from(u16::MAX) {
                return Err(TuplError::schema(format!(
                    "table {name}: variable part of {packed_bytes} bytes exceeds 65535"
                )));
            }
        }

        tracing::debug!(
            table = %name,
            attrs = attrs.len(),
            fixed_words = next,
            mm_var = mm_var_caps.len(),
            disk_attrs = n_disk,
            "built table descriptor"
        );

        Ok(TableDescriptor {
            name,
            attrs,
            checksum,
            fixed_words: next,
            null_offset,
            mm_null_words,
            var_ref_offset,
            disk_ref_offset,
            mm_var_caps,
            disk_null_words: n_disk.div_ceil(32),
            disk_fixed_words,
            disk_var_caps,
            not_null,
            primary_key,
        })
    }
}
