//! Input parsing utilities for trie source files.

/// One `key<delim>value` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record<'a> {
    pub key: &'a str,
    /// `None` when the line has no delimiter or nothing follows it.
    pub value: Option<&'a str>,
}

/// Split a source line into key and value at the first `delimiter`.
///
/// Only the trailing line terminator is removed; surrounding whitespace is
/// part of the key or value. Lines of at most one byte and lines with an
/// empty key are skipped.
pub fn parse_record<'a>(line: &'a str, delimiter: &str) -> Option<Record<'a>> {
    let line = parse_key(line);
    if line.len() <= 1 {
        return None;
    }

    let (key, value) = match line.split_once(delimiter) {
        Some((key, value)) if !delimiter.is_empty() => (key, Some(value)),
        _ => (line, None),
    };
    if key.is_empty() {
        return None;
    }

    Some(Record {
        key,
        value: value.filter(|v| !v.is_empty()),
    })
}

/// Strip the line terminator from a bare key line.
pub fn parse_key(line: &str) -> &str {
    let line = line.strip_suffix('\n').unwrap_or(line);
    line.strip_suffix('\r').unwrap_or(line)
}

/// Strip the line terminator from a raw key line read as bytes.
///
/// Returns `None` when the line is not valid UTF-8; no trie built from
/// strings can hold such a key.
pub fn parse_key_bytes(line: &[u8]) -> Option<&str> {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    std::str::from_utf8(line).ok()
}
