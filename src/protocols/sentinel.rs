//! End-of-session sentinel.
//!
//! A message consisting of `EOM`, optionally surrounded by whitespace or
//! control bytes, asks the server to close the connection without a reply.

/// The literal end-of-session token.
pub const END_OF_MESSAGE: &[u8] = b"EOM";

/// Check whether a received message is the end-of-session sentinel.
pub fn is_end_of_message(message: &[u8]) -> bool {
    trim(message) == END_OF_MESSAGE
}

/// Strip leading and trailing bytes at or below the space character.
fn trim(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|&b| b > b' ').unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|&b| b > b' ').map_or(start, |i| i + 1);
    &bytes[start..end]
}
