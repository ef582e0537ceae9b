//! Word-by-word reversal.
//!
//! The input is split on runs of non-word characters (anything other than
//! ASCII letters, digits and `_`). Each token is reversed and the tokens are
//! joined with a single space. Separators at the end of the input produce no
//! token; a separator at the very start yields one empty leading token, so
//! the output then starts with a space.

/// Whether `c` belongs to a word.
#[inline]
fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Split `input` into word tokens.
///
/// The first token is kept even when empty; later empty tokens are runs of
/// consecutive separators and are dropped.
pub fn words(input: &str) -> Vec<&str> {
    let mut parts = input.split(|c: char| !is_word_char(c));
    let mut tokens = Vec::new();

    if let Some(first) = parts.next() {
        tokens.push(first);
    }
    tokens.extend(parts.filter(|part| !part.is_empty()));

    // A lone empty token means there were no words at all.
    if tokens.len() == 1 && tokens[0].is_empty() {
        tokens.clear();
    }
    tokens
}

/// Reverse every word of `input`, joining the results with single spaces.
pub fn reverse_words(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    for (i, word) in words(input).into_iter().enumerate() {
        if i > 0 {
            output.push(' ');
        }
        output.extend(word.chars().rev());
    }
    output
}
