//! Byte transmogrification.
//!
//! Every ASCII letter has its case bit (0x20) flipped; every other byte,
//! including non-ASCII bytes, passes through unchanged. Applying the
//! transform twice yields the original input.

use bytes::BytesMut;

/// The bit that separates upper and lower case ASCII letters.
pub const CASE_BIT: u8 = b' ';

/// Transmogrify a single byte.
#[inline]
pub fn transmogrify_byte(byte: u8) -> u8 {
    if byte.is_ascii_alphabetic() {
        byte ^ CASE_BIT
    } else {
        byte
    }
}

/// Append the transmogrified form of `input` to `output`.
pub fn transmogrify(input: &[u8], output: &mut BytesMut) {
    output.reserve(input.len());
    output.extend(input.iter().map(|&b| transmogrify_byte(b)));
}
