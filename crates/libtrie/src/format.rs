//! On-disk layout of a compiled trie.
//!
//! ```text
//! Header (72 bytes, little-endian)
//!   magic [u8; 8] = "LIBTRIE\0"   version u32        key_encoding u8
//!   flags u8                       reserved u16       root u32
//!   node_count u32                 edge_count u32     body_crc32 u32
//!   nodes_offset u64               edges_offset u64   payload_offset u64
//!   payload_len u64                reserved u32       header_crc32 u32
//! Node table    node_count x (first_edge u32, edge_count u32, payload u64)
//! Edge table    edge_count x (label u32, child u32), sorted by label per node
//! Payload table byte 0 is padding; blocks are
//!               count u32, count x (len u32, bytes)
//!               or, when prefix-compressed,
//!               count u32, count x (shared u32, len u32, suffix bytes)
//! ```

use byteorder::{ByteOrder, LittleEndian};

use crate::error::FormatError;

/// Magic header for trie files.
pub const MAGIC: &[u8; 8] = b"LIBTRIE\0";

/// Current on-disk format version.
pub const VERSION: u32 = 1;

pub const HEADER_LEN: usize = 72;
pub const NODE_LEN: usize = 16;
pub const EDGE_LEN: usize = 8;

/// Terminal nodes carry no values; lookups report "found" with nothing attached.
pub const FLAG_KEYS_ONLY: u8 = 0b01;
/// Values are stored as (shared-with-key, suffix) pairs.
pub const FLAG_PREFIX_COMPRESSED: u8 = 0b10;
const KNOWN_FLAGS: u8 = FLAG_KEYS_ONLY | FLAG_PREFIX_COMPRESSED;

/// Node payload slot for non-terminal nodes.
pub const NO_PAYLOAD: u64 = 0;
/// Node payload slot for terminal nodes in a keys-only trie.
pub const KEYS_ONLY_TERMINAL: u64 = u64::MAX;

/// How key strings are split into edge labels.
///
/// The same encoding must be used when building and when looking up. A key
/// normalised differently from the builder's input does not match and the
/// lookup reports "not found".
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
#[repr(u8)]
pub enum KeyEncoding {
    /// One edge per UTF-8 byte.
    #[default]
    Utf8 = 1,
    /// One edge per Unicode scalar value.
    Codepoint = 2,
}

impl KeyEncoding {
    pub fn from_id(id: u8) -> Result<Self, FormatError> {
        match id {
            1 => Ok(KeyEncoding::Utf8),
            2 => Ok(KeyEncoding::Codepoint),
            other => Err(FormatError::UnsupportedKeyEncoding(other)),
        }
    }

    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn symbols(self, key: &str) -> Symbols<'_> {
        match self {
            KeyEncoding::Utf8 => Symbols::Bytes(key.bytes()),
            KeyEncoding::Codepoint => Symbols::Chars(key.chars()),
        }
    }
}

/// Edge labels of a key under a given [`KeyEncoding`].
pub enum Symbols<'a> {
    Bytes(std::str::Bytes<'a>),
    Chars(std::str::Chars<'a>),
}

impl Iterator for Symbols<'_> {
    type Item = u32;

    #[inline]
    fn next(&mut self) -> Option<u32> {
        match self {
            Symbols::Bytes(bytes) => bytes.next().map(u32::from),
            Symbols::Chars(chars) => chars.next().map(u32::from),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Header {
    pub version: u32,
    pub key_encoding: KeyEncoding,
    pub flags: u8,
    pub root: u32,
    pub node_count: u32,
    pub edge_count: u32,
    pub body_crc32: u32,
    pub nodes_offset: u64,
    pub edges_offset: u64,
    pub payload_offset: u64,
    pub payload_len: u64,
}

impl Header {
    /// Parse and check the fixed-size header. Magic and version are checked
    /// before anything else is read.
    pub fn parse(buf: &[u8]) -> Result<Self, FormatError> {
        if buf.len() < HEADER_LEN {
            return Err(FormatError::FileTooSmall(buf.len()));
        }
        if &buf[..MAGIC.len()] != MAGIC {
            return Err(FormatError::InvalidMagic);
        }

        let version = LittleEndian::read_u32(&buf[8..12]);
        if version != VERSION {
            return Err(FormatError::UnsupportedVersion(version));
        }

        let stored_crc = LittleEndian::read_u32(&buf[68..72]);
        if stored_crc != crc32fast::hash(&buf[..68]) {
            return Err(FormatError::HeaderChecksum);
        }

        let key_encoding = KeyEncoding::from_id(buf[12])?;
        let flags = buf[13];
        if flags & !KNOWN_FLAGS != 0 {
            return Err(FormatError::UnknownFlags(flags));
        }

        Ok(Header {
            version,
            key_encoding,
            flags,
            root: LittleEndian::read_u32(&buf[16..20]),
            node_count: LittleEndian::read_u32(&buf[20..24]),
            edge_count: LittleEndian::read_u32(&buf[24..28]),
            body_crc32: LittleEndian::read_u32(&buf[28..32]),
            nodes_offset: LittleEndian::read_u64(&buf[32..40]),
            edges_offset: LittleEndian::read_u64(&buf[40..48]),
            payload_offset: LittleEndian::read_u64(&buf[48..56]),
            payload_len: LittleEndian::read_u64(&buf[56..64]),
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[..8].copy_from_slice(MAGIC);
        LittleEndian::write_u32(&mut buf[8..12], self.version);
        buf[12] = self.key_encoding.id();
        buf[13] = self.flags;
        LittleEndian::write_u32(&mut buf[16..20], self.root);
        LittleEndian::write_u32(&mut buf[20..24], self.node_count);
        LittleEndian::write_u32(&mut buf[24..28], self.edge_count);
        LittleEndian::write_u32(&mut buf[28..32], self.body_crc32);
        LittleEndian::write_u64(&mut buf[32..40], self.nodes_offset);
        LittleEndian::write_u64(&mut buf[40..48], self.edges_offset);
        LittleEndian::write_u64(&mut buf[48..56], self.payload_offset);
        LittleEndian::write_u64(&mut buf[56..64], self.payload_len);
        let crc = crc32fast::hash(&buf[..68]);
        LittleEndian::write_u32(&mut buf[68..72], crc);
        buf
    }

    pub fn keys_only(&self) -> bool {
        self.flags & FLAG_KEYS_ONLY != 0
    }

    pub fn prefix_compressed(&self) -> bool {
        self.flags & FLAG_PREFIX_COMPRESSED != 0
    }
}

/// Fixed-size node table entry.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NodeRecord {
    pub first_edge: u32,
    pub edge_count: u32,
    pub payload: u64,
}

impl NodeRecord {
    #[inline]
    pub fn read(buf: &[u8]) -> Self {
        NodeRecord {
            first_edge: LittleEndian::read_u32(&buf[0..4]),
            edge_count: LittleEndian::read_u32(&buf[4..8]),
            payload: LittleEndian::read_u64(&buf[8..16]),
        }
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        let mut buf = [0u8; NODE_LEN];
        LittleEndian::write_u32(&mut buf[0..4], self.first_edge);
        LittleEndian::write_u32(&mut buf[4..8], self.edge_count);
        LittleEndian::write_u64(&mut buf[8..16], self.payload);
        out.extend_from_slice(&buf);
    }

    pub fn is_terminal(&self) -> bool {
        self.payload != NO_PAYLOAD
    }
}

/// Fixed-size edge table entry.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct EdgeRecord {
    pub label: u32,
    pub child: u32,
}

impl EdgeRecord {
    #[inline]
    pub fn read(buf: &[u8]) -> Self {
        EdgeRecord {
            label: LittleEndian::read_u32(&buf[0..4]),
            child: LittleEndian::read_u32(&buf[4..8]),
        }
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        let mut buf = [0u8; EDGE_LEN];
        LittleEndian::write_u32(&mut buf[0..4], self.label);
        LittleEndian::write_u32(&mut buf[4..8], self.child);
        out.extend_from_slice(&buf);
    }
}

/// One stored value, split into the part borrowed from the lookup key and
/// the part stored in the file.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ValueParts<'a> {
    pub prefix: &'a str,
    pub suffix: &'a str,
}

impl ValueParts<'_> {
    pub fn len(&self) -> usize {
        self.prefix.len() + self.suffix.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains_newline(&self) -> bool {
        self.prefix.contains('\n') || self.suffix.contains('\n')
    }
}

/// Decodes one payload block lazily, validating as it goes.
pub struct PayloadBlock<'a> {
    table: &'a [u8],
    offset: u64,
    pos: usize,
    remaining: u32,
    key: &'a str,
    compressed: bool,
}

impl<'a> PayloadBlock<'a> {
    /// `table` is the whole payload table; `offset` is the node's payload slot.
    pub fn open(
        table: &'a [u8],
        offset: u64,
        key: &'a str,
        compressed: bool,
    ) -> Result<Self, FormatError> {
        let start = usize::try_from(offset).map_err(|_| FormatError::TruncatedPayload { offset })?;
        let count_end = start
            .checked_add(4)
            .ok_or(FormatError::TruncatedPayload { offset })?;
        if count_end > table.len() {
            return Err(FormatError::TruncatedPayload { offset });
        }
        let remaining = LittleEndian::read_u32(&table[start..count_end]);
        if remaining == 0 {
            return Err(FormatError::EmptyPayload { offset });
        }
        // Every value carries at least its length word(s).
        let min_entry = if compressed { 8 } else { 4 };
        if remaining as usize > (table.len() - count_end) / min_entry {
            return Err(FormatError::TruncatedPayload { offset });
        }
        Ok(PayloadBlock {
            table,
            offset,
            pos: count_end,
            remaining,
            key,
            compressed,
        })
    }

    /// Values still to be decoded.
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    fn read_u32(&mut self) -> Result<u32, FormatError> {
        let end = self.pos + 4;
        if end > self.table.len() {
            return Err(FormatError::TruncatedPayload {
                offset: self.offset,
            });
        }
        let value = LittleEndian::read_u32(&self.table[self.pos..end]);
        self.pos = end;
        Ok(value)
    }

    fn next_value(&mut self) -> Result<ValueParts<'a>, FormatError> {
        let offset = self.offset;
        let prefix = if self.compressed {
            let shared = self.read_u32()?;
            let shared_len = shared as usize;
            if shared_len > self.key.len() || !self.key.is_char_boundary(shared_len) {
                return Err(FormatError::BadSharedPrefix {
                    offset,
                    shared,
                    key_len: self.key.len(),
                });
            }
            &self.key[..shared_len]
        } else {
            ""
        };

        let len = self.read_u32()? as usize;
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.table.len())
            .ok_or(FormatError::TruncatedPayload { offset })?;
        let suffix = std::str::from_utf8(&self.table[self.pos..end])
            .map_err(|_| FormatError::InvalidUtf8 { offset })?;
        self.pos = end;
        Ok(ValueParts { prefix, suffix })
    }
}

impl<'a> Iterator for PayloadBlock<'a> {
    type Item = Result<ValueParts<'a>, FormatError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let item = self.next_value();
        if item.is_err() {
            self.remaining = 0;
        }
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> Header {
        Header {
            version: VERSION,
            key_encoding: KeyEncoding::Codepoint,
            flags: FLAG_PREFIX_COMPRESSED,
            root: 0,
            node_count: 12,
            edge_count: 11,
            body_crc32: 0xdead_beef,
            nodes_offset: HEADER_LEN as u64,
            edges_offset: 264,
            payload_offset: 352,
            payload_len: 40,
        }
    }

    #[test]
    fn header_survives_serialization() {
        let header = sample_header();
        let parsed = Header::parse(&header.to_bytes()).expect("valid header");
        assert_eq!(parsed, header);
        assert!(parsed.prefix_compressed());
        assert!(!parsed.keys_only());
    }

    #[test]
    fn magic_is_checked_first() {
        let mut bytes = sample_header().to_bytes();
        bytes[0] = b'X';
        bytes[8] = 0xff;
        assert_eq!(Header::parse(&bytes), Err(FormatError::InvalidMagic));
    }

    #[test]
    fn unknown_version_is_refused() {
        let mut bytes = sample_header().to_bytes();
        LittleEndian::write_u32(&mut bytes[8..12], VERSION + 1);
        assert_eq!(
            Header::parse(&bytes),
            Err(FormatError::UnsupportedVersion(VERSION + 1))
        );
    }

    #[test]
    fn flipped_header_byte_fails_checksum() {
        let mut bytes = sample_header().to_bytes();
        bytes[20] ^= 0x01;
        assert_eq!(Header::parse(&bytes), Err(FormatError::HeaderChecksum));
    }

    #[test]
    fn short_buffer_is_too_small() {
        assert_eq!(Header::parse(&[0u8; 10]), Err(FormatError::FileTooSmall(10)));
    }

    #[test]
    fn codepoint_symbols_follow_chars() {
        let bytes: Vec<u32> = KeyEncoding::Utf8.symbols("né").collect();
        let chars: Vec<u32> = KeyEncoding::Codepoint.symbols("né").collect();
        assert_eq!(bytes, vec![0x6e, 0xc3, 0xa9]);
        assert_eq!(chars, vec![0x6e, 0xe9]);
    }

    #[test]
    fn payload_block_rejects_truncation() {
        // count = 1, len = 10, but only 3 bytes follow.
        let mut table = vec![0u8];
        table.extend_from_slice(&1u32.to_le_bytes());
        table.extend_from_slice(&10u32.to_le_bytes());
        table.extend_from_slice(b"abc");

        let mut block = PayloadBlock::open(&table, 1, "key", false).expect("count readable");
        assert_eq!(
            block.next(),
            Some(Err(FormatError::TruncatedPayload { offset: 1 }))
        );
        assert_eq!(block.next(), None);
    }

    #[test]
    fn payload_block_restores_shared_prefix() {
        let mut table = vec![0u8];
        table.extend_from_slice(&1u32.to_le_bytes());
        table.extend_from_slice(&3u32.to_le_bytes());
        table.extend_from_slice(&2u32.to_le_bytes());
        table.extend_from_slice(b"ry");

        let parts: Vec<_> = PayloadBlock::open(&table, 1, "carpet", true)
            .expect("block")
            .collect::<Result<_, _>>()
            .expect("valid block");
        assert_eq!(
            parts,
            vec![ValueParts {
                prefix: "car",
                suffix: "ry"
            }]
        );
    }

    #[test]
    fn count_larger_than_table_is_rejected() {
        let mut table = vec![0u8];
        table.extend_from_slice(&u32::MAX.to_le_bytes());
        table.extend_from_slice(&1u32.to_le_bytes());
        table.extend_from_slice(b"x");
        assert!(matches!(
            PayloadBlock::open(&table, 1, "k", false),
            Err(FormatError::TruncatedPayload { offset: 1 })
        ));
    }

    #[test]
    fn empty_block_is_rejected() {
        let mut table = vec![0u8];
        table.extend_from_slice(&0u32.to_le_bytes());
        assert!(matches!(
            PayloadBlock::open(&table, 1, "k", false),
            Err(FormatError::EmptyPayload { offset: 1 })
        ));
    }
}
