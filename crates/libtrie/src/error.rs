use std::path::PathBuf;

use thiserror::Error;

/// Structural problems found while validating a trie file.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FormatError {
    #[error("file too small: {0} bytes")]
    FileTooSmall(usize),
    #[error("invalid magic")]
    InvalidMagic,
    #[error("unsupported version {0}")]
    UnsupportedVersion(u32),
    #[error("header checksum mismatch")]
    HeaderChecksum,
    #[error("body checksum mismatch (expected {expected:#010x}, got {actual:#010x})")]
    BodyChecksum { expected: u32, actual: u32 },
    #[error("unsupported key encoding {0}")]
    UnsupportedKeyEncoding(u8),
    #[error("unknown flags {0:#04x}")]
    UnknownFlags(u8),
    #[error("{0} section out of bounds")]
    SectionOutOfBounds(&'static str),
    #[error("{0} section overlaps another section")]
    SectionOverlap(&'static str),
    #[error("root node {root} out of range ({node_count} nodes)")]
    RootOutOfRange { root: u32, node_count: u32 },
    #[error("node {node}: edge range out of bounds")]
    EdgeRangeOutOfBounds { node: u32 },
    #[error("node {node}: edges not strictly sorted")]
    UnsortedEdges { node: u32 },
    #[error("node {node}: child {child} out of range")]
    ChildOutOfRange { node: u32, child: u32 },
    #[error("node {node}: payload offset {offset} out of range")]
    PayloadOutOfRange { node: u32, offset: u64 },
    #[error("node {node}: keys-only marker in a trie with content")]
    UnexpectedKeysOnlyMarker { node: u32 },
    #[error("payload block at {offset} is truncated")]
    TruncatedPayload { offset: u64 },
    #[error("payload block at {offset} is empty")]
    EmptyPayload { offset: u64 },
    #[error("payload block at {offset} is not valid UTF-8")]
    InvalidUtf8 { offset: u64 },
    #[error("payload block at {offset} shares {shared} bytes with a {key_len}-byte key")]
    BadSharedPrefix {
        offset: u64,
        shared: u32,
        key_len: usize,
    },
}

/// Why `load` did not produce a trie.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("cannot open {}: {source}", path.display())]
    NotFound {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("format error: {0}")]
    Format(#[from] FormatError),
    #[error("out of memory allocating {needed} bytes")]
    OutOfMemory { needed: usize },
}

/// Faults raised by a lookup. "Key not present" is never one of these.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LookupFault {
    #[error("lookup on a released trie handle")]
    Released,
    #[error("corrupt payload: {0}")]
    Corrupt(#[from] FormatError),
    #[error("out of memory building lookup result ({needed} requested)")]
    OutOfMemory { needed: usize },
    #[error("output buffer too small (needed {needed}, got {actual})")]
    OutputBufferTooSmall { needed: usize, actual: usize },
    #[error("value contains a newline and cannot be newline-joined")]
    ValueContainsNewline,
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("trie too large: {0} exceeds u32 range")]
    TooLarge(&'static str),
    #[error("value longer than u32::MAX bytes")]
    ValueTooLong,
}

pub type Result<T> = std::result::Result<T, LoadError>;
