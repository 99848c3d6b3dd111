#![forbid(unsafe_code)]

//! Filename sanitizer applied to every user-influenced output name.

/// Characters that are rejected by at least one common filesystem or that
/// would let a caller escape the downloads directory.
const RESERVED: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Maps an arbitrary title to a token that is safe to use as a file name.
///
/// Reserved characters and whitespace become `_`, runs of `_` collapse into a
/// single one, and leading/trailing spaces, dots and underscores are trimmed.
/// The function is total and idempotent, so `sanitize(sanitize(x)) ==
/// sanitize(x)` for every input.
pub fn sanitize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        let mapped = if RESERVED.contains(&c) || c.is_whitespace() {
            '_'
        } else {
            c
        };
        if mapped == '_' && out.ends_with('_') {
            continue;
        }
        out.push(mapped);
    }
    out.trim_matches(|c: char| c == ' ' || c == '.' || c == '_')
        .to_string()
}
