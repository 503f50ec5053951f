use std::fmt;

use crate::AttrId;
use crate::words::words_for_bytes;

/// One attribute in the flat id/value wire form.
///
/// `data == None` is SQL NULL. Fixed-size numeric attributes carry their
/// little-endian bytes.
#[derive(Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct AttrValue {
    pub id: AttrId,
    pub data: Option<Vec<u8>>,
}

impl AttrValue {
    pub fn new(id: AttrId, data: Option<Vec<u8>>) -> Self {
        Self { id, data }
    }

    pub fn null(id: AttrId) -> Self {
        Self { id, data: None }
    }

    pub fn bytes(id: AttrId, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            data: Some(bytes.into()),
        }
    }

    pub fn u32(id: AttrId, v: u32) -> Self {
        Self::bytes(id, v.to_le_bytes())
    }

    pub fn u64(id: AttrId, v: u64) -> Self {
        Self::bytes(id, v.to_le_bytes())
    }

    pub fn text(id: AttrId, s: &str) -> Self {
        Self::bytes(id, s.as_bytes())
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.data.is_none()
    }

    /// Decode a 4-byte little-endian value.
    pub fn as_u32(&self) -> Option<u32> {
        let d = self.data.as_deref()?;
        let arr: [u8; 4] = d.try_into().ok()?;
        Some(u32::from_le_bytes(arr))
    }

    /// Decode an 8-byte little-endian value.
    pub fn as_u64(&self) -> Option<u64> {
        let d = self.data.as_deref()?;
        let arr: [u8; 8] = d.try_into().ok()?;
        Some(u64::from_le_bytes(arr))
    }

    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(self.data.as_deref()?).ok()
    }

    /// Words this value occupies on the wire: one header word plus payload.
    #[inline]
    pub fn wire_words(&self) -> usize {
        1 + self.data.as_ref().map_or(0, |d| words_for_bytes(d.len()))
    }
}

impl fmt::Debug for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.data {
            None => write!(f, "{}=NULL", self.id),
            Some(d) => match std::str::from_utf8(d) {
                Ok(s) if !s.is_empty() && s.chars().all(|c| !c.is_control()) => {
                    write!(f, "{}={s:?}", self.id)
                }
                _ => write!(f, "{}={d:02x?}", self.id),
            },
        }
    }
}
