//! Pluggable collations for charset-aware attributes.
//!
//! A collation is a pure comparator plus a normalization to "comparable
//! form" (the bytes a reader gets when it asks for comparable output) and a
//! LIKE matcher. Text comparisons in the interpreter go through whichever
//! collation the attribute declares; nothing here assumes a fixed byte
//! order beyond what each collation defines.
//!
//! # Contract
//!
//! Implementations **must** be deterministic and define a total order, and
//! `compare(a, b) == normalize(a).cmp(normalize(b))` whenever both
//! normalizations succeed.
#![allow(clippy::unnecessary_literal_bound)]

use std::cmp::Ordering;
use std::fmt;

use tupl_error::{Result, TuplError};

/// Registry key of a collation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct CollationId(u16);

impl CollationId {
    pub const BINARY: Self = Self(0);
    pub const UTF8_CI: Self = Self(1);

    #[inline]
    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u16 {
        self.0
    }
}

impl fmt::Display for CollationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "collation#{}", self.0)
    }
}

/// A collation comparator.
pub trait Collation: Send + Sync {
    /// Collation name.
    fn name(&self) -> &str;

    /// Compare two stored values.
    fn compare(&self, left: &[u8], right: &[u8]) -> Ordering;

    /// Transform stored bytes into comparable form.
    ///
    /// Returns `None` when the bytes are not in an encoding this collation
    /// recognises.
    fn normalize(&self, bytes: &[u8]) -> Option<Vec<u8>>;

    /// Whether `bytes` may be stored under this collation.
    fn is_valid(&self, bytes: &[u8]) -> bool {
        self.normalize(bytes).is_some()
    }

    /// SQL LIKE: `%` matches any run, `_` one unit, `\` escapes.
    fn like(&self, value: &[u8], pattern: &[u8]) -> bool;
}

// ── Built-in collations ──────────────────────────────────────────────────

/// Raw byte comparison. Accepts any bytes.
pub struct BinaryCollation;

impl Collation for BinaryCollation {
    fn name(&self) -> &str {
        "binary"
    }

    fn compare(&self, left: &[u8], right: &[u8]) -> Ordering {
        left.cmp(right)
    }

    fn normalize(&self, bytes: &[u8]) -> Option<Vec<u8>> {
        Some(bytes.to_vec())
    }

    fn like(&self, value: &[u8], pattern: &[u8]) -> bool {
        like_match(pattern, value, b'%', b'_', Some(b'\\'))
    }
}

/// UTF-8 text compared after Unicode lowercasing.
///
/// Invalid UTF-8 is rejected on write and reported as an invalid format on
/// comparable reads.
pub struct Utf8CaseInsensitive;

impl Utf8CaseInsensitive {
    fn fold(bytes: &[u8]) -> Option<String> {
        std::str::from_utf8(bytes).ok().map(str::to_lowercase)
    }
}

impl Collation for Utf8CaseInsensitive {
    fn name(&self) -> &str {
        "utf8_ci"
    }

    fn compare(&self, left: &[u8], right: &[u8]) -> Ordering {
        match (Self::fold(left), Self::fold(right)) {
            (Some(l), Some(r)) => l.cmp(&r),
            _ => left.cmp(right),
        }
    }

    fn normalize(&self, bytes: &[u8]) -> Option<Vec<u8>> {
        Self::fold(bytes).map(String::into_bytes)
    }

    fn like(&self, value: &[u8], pattern: &[u8]) -> bool {
        let (Some(v), Some(p)) = (Self::fold(value), Self::fold(pattern)) else {
            return false;
        };
        let txt: Vec<char> = v.chars().collect();
        let pat: Vec<char> = p.chars().collect();
        like_match(&pat, &txt, '%', '_', Some('\\'))
    }
}

/// LIKE matching over any unit type (bytes or chars).
pub fn like_match<T: Copy + PartialEq>(
    pat: &[T],
    txt: &[T],
    any: T,
    one: T,
    escape: Option<T>,
) -> bool {
    let (mut pi, mut ti) = (0, 0);
    while pi < pat.len() {
        let pc = pat[pi];

        if Some(pc) == escape {
            pi += 1;
            if pi >= pat.len() || ti >= txt.len() || pat[pi] != txt[ti] {
                return false;
            }
            pi += 1;
            ti += 1;
            continue;
        }

        if pc == any {
            while pi < pat.len() && pat[pi] == any {
                pi += 1;
            }
            if pi >= pat.len() {
                return true;
            }
            return (ti..=txt.len())
                .any(|start| like_match(&pat[pi..], &txt[start..], any, one, escape));
        }

        if ti >= txt.len() || (pc != one && pc != txt[ti]) {
            return false;
        }
        pi += 1;
        ti += 1;
    }
    ti >= txt.len()
}

// ── Registry ─────────────────────────────────────────────────────────────

/// Collations available to a partition, keyed by [`CollationId`].
pub struct CollationRegistry {
    slots: Vec<Option<Box<dyn Collation>>>,
}

impl CollationRegistry {
    /// Empty registry.
    pub fn empty() -> Self {
        Self { slots: Vec::new() }
    }

    /// Registry holding [`BinaryCollation`] and [`Utf8CaseInsensitive`].
    pub fn with_builtins() -> Self {
        let mut reg = Self::empty();
        reg.register(CollationId::BINARY, Box::new(BinaryCollation));
        reg.register(CollationId::UTF8_CI, Box::new(Utf8CaseInsensitive));
        reg
    }

    /// Install (or replace) a collation.
    pub fn register(&mut self, id: CollationId, collation: Box<dyn Collation>) {
        let idx = usize::from(id.get());
        if self.slots.len() <= idx {
            self.slots.resize_with(idx + 1, || None);
        }
        self.slots[idx] = Some(collation);
    }

    pub fn contains(&self, id: CollationId) -> bool {
        self.slots
            .get(usize::from(id.get()))
            .is_some_and(Option::is_some)
    }

    /// Look up a collation.
    pub fn get(&self, id: CollationId) -> Result<&dyn Collation> {
        self.slots
            .get(usize::from(id.get()))
            .and_then(Option::as_deref)
            .ok_or_else(|| TuplError::schema(format!("{id} is not registered")))
    }
}

impl Default for CollationRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl fmt::Debug for CollationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.slots.iter().flatten().map(|c| c.name()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_orders_bytes() {
        let c = BinaryCollation;
        assert_eq!(c.compare(b"ABC", b"abc"), Ordering::Less);
        assert_eq!(c.normalize(&[0xff, 0x00]), Some(vec![0xff, 0x00]));
    }

    #[test]
    fn test_case_insensitive_compare() {
        let c = Utf8CaseInsensitive;
        assert_eq!(c.compare(b"Hello", b"hELLO"), Ordering::Equal);
        assert_eq!(c.compare("Äpfel".as_bytes(), "äpfel".as_bytes()), Ordering::Equal);
        assert_eq!(c.normalize(b"MiXeD"), Some(b"mixed".to_vec()));
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let c = Utf8CaseInsensitive;
        assert!(c.normalize(&[0xc3, 0x28]).is_none());
        assert!(!c.is_valid(&[0xff]));
        assert!(!c.like(&[0xff], b"%"));
    }

    #[test]
    fn test_like_patterns() {
        let ci = Utf8CaseInsensitive;
        assert!(ci.like(b"Hello World", b"hello%"));
        assert!(ci.like(b"Hello World", b"%WORLD"));
        assert!(ci.like(b"abc", b"a_c"));
        assert!(!ci.like(b"abc", b"a_"));
        assert!(ci.like(b"", b"%"));
        assert!(ci.like(b"100%", b"100\\%"));
        assert!(!ci.like(b"1000", b"100\\%"));

        let bin = BinaryCollation;
        assert!(!bin.like(b"ABC", b"abc"));
        assert!(bin.like(b"ABC", b"A%"));
    }

    #[test]
    fn test_registry_lookup() {
        let mut reg = CollationRegistry::with_builtins();
        assert_eq!(reg.get(CollationId::UTF8_CI).unwrap().name(), "utf8_ci");
        assert!(reg.get(CollationId::new(9)).is_err());
        reg.register(CollationId::new(9), Box::new(BinaryCollation));
        assert!(reg.contains(CollationId::new(9)));
        assert!(!reg.contains(CollationId::new(5)));
    }

    #[test]
    fn test_collations_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<BinaryCollation>();
        assert_send_sync::<CollationRegistry>();
    }
}
