//! Byte/word packing helpers.
//!
//! Rows are stored as little-endian 32-bit words. Byte payloads are packed
//! into words with zero padding in the final word.

/// Bytes per storage word.
pub const WORD_BYTES: usize = 4;

/// Number of words needed to hold `len` bytes.
#[inline]
pub const fn words_for_bytes(len: usize) -> usize {
    len.div_ceil(WORD_BYTES)
}

/// Pack bytes into zero-padded little-endian words.
pub fn bytes_to_words(bytes: &[u8]) -> Vec<u32> {
    let mut out = Vec::with_capacity(words_for_bytes(bytes.len()));
    for chunk in bytes.chunks(WORD_BYTES) {
        let mut buf = [0u8; WORD_BYTES];
        buf[..chunk.len()].copy_from_slice(chunk);
        out.push(u32::from_le_bytes(buf));
    }
    out
}

/// Unpack the first `len` bytes from little-endian words.
///
/// Returns `None` if `words` holds fewer than `len` bytes.
pub fn words_to_bytes(words: &[u32], len: usize) -> Option<Vec<u8>> {
    if words.len() * WORD_BYTES < len {
        return None;
    }
    let mut out = Vec::with_capacity(len);
    for w in words {
        out.extend_from_slice(&w.to_le_bytes());
        if out.len() >= len {
            break;
        }
    }
    out.truncate(len);
    Some(out)
}
