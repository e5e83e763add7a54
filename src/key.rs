//! Key encoding helpers.
//!
//! Keys are unsigned 64-bit integers stored big-endian on disk so that
//! lexicographic byte order equals numeric order. Pages strip the prefix
//! shared by their fence keys before storing record keys; the helpers here
//! compute that prefix.

/// A user key. Fixed width; variable-width keys are unsupported.
pub type Key = u64;

/// Encoded width of a key on disk.
pub const KEY_SIZE: usize = 8;

/// Encodes a key in its on-disk (big-endian) form.
#[inline]
pub fn encode(key: Key) -> [u8; KEY_SIZE] {
    key.to_be_bytes()
}

/// Decodes a key from its on-disk form.
///
/// The slice must be exactly [`KEY_SIZE`] bytes.
#[inline]
pub fn decode(bytes: &[u8]) -> Key {
    let mut buf = [0u8; KEY_SIZE];
    buf.copy_from_slice(bytes);
    Key::from_be_bytes(buf)
}

/// Returns the length of the byte prefix shared by two encoded keys.
///
/// Every key in `[a, b]` (numerically) shares at least this prefix, which
/// is what makes fence-derived prefix stripping sound.
pub fn shared_prefix_len(a: &[u8; KEY_SIZE], b: &[u8; KEY_SIZE]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}
