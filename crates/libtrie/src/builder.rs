//! Insert-only trie that serializes to the on-disk format.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::Path;

use byteorder::{LittleEndian, WriteBytesExt};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::BuildError;
use crate::format::{
    EDGE_LEN, EdgeRecord, FLAG_KEYS_ONLY, FLAG_PREFIX_COMPRESSED, HEADER_LEN, Header,
    KEYS_ONLY_TERMINAL, KeyEncoding, NO_PAYLOAD, NODE_LEN, NodeRecord, VERSION,
};

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct BuilderOptions {
    pub key_encoding: KeyEncoding,
    /// Store keys without values; lookups only report presence.
    pub keys_only: bool,
    /// Store each value as the bytes it shares with its key plus a suffix.
    pub prefix_compression: bool,
}

#[derive(Debug, Default)]
struct BuildNode {
    edges: BTreeMap<u32, usize>,
    values: Vec<String>,
    terminal: bool,
    key: Option<Box<str>>,
}

impl BuildNode {
    fn stored(&self, keys_only: bool) -> bool {
        self.terminal && (keys_only || !self.values.is_empty())
    }
}

#[derive(Debug)]
pub struct TrieBuilder {
    options: BuilderOptions,
    nodes: Vec<BuildNode>,
}

impl Default for TrieBuilder {
    fn default() -> Self {
        Self::new(BuilderOptions::default())
    }
}

impl TrieBuilder {
    pub fn new(options: BuilderOptions) -> Self {
        TrieBuilder {
            options,
            nodes: vec![BuildNode::default()],
        }
    }

    /// Append `value` to the values stored under `key`. Order and duplicates
    /// are kept. In a keys-only builder the value is dropped.
    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        let idx = self.mark(key);
        if !self.options.keys_only {
            self.nodes[idx].values.push(value.into());
        }
    }

    /// Mark `key` present without a value. Only keys-only builders store such
    /// keys; a builder with content writes a key once it has a value.
    pub fn insert_key(&mut self, key: &str) {
        self.mark(key);
    }

    /// Number of keys that will be written.
    pub fn len(&self) -> usize {
        let keys_only = self.options.keys_only;
        self.nodes.iter().filter(|n| n.stored(keys_only)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn mark(&mut self, key: &str) -> usize {
        let mut current = 0usize;
        for label in self.options.key_encoding.symbols(key) {
            current = match self.nodes[current].edges.get(&label) {
                Some(&child) => child,
                None => {
                    let child = self.nodes.len();
                    self.nodes.push(BuildNode::default());
                    self.nodes[current].edges.insert(label, child);
                    child
                }
            };
        }

        let node = &mut self.nodes[current];
        if !node.terminal {
            node.terminal = true;
            if self.options.prefix_compression {
                node.key = Some(key.into());
            }
        }
        current
    }

    /// Serialize into a complete trie file image.
    pub fn to_bytes(&self) -> Result<Vec<u8>, BuildError> {
        let node_count =
            u32::try_from(self.nodes.len()).map_err(|_| BuildError::TooLarge("node count"))?;
        let keys_only = self.options.keys_only;
        let compress = self.options.prefix_compression && !keys_only;

        let mut node_table = Vec::with_capacity(self.nodes.len() * NODE_LEN);
        let mut edge_table = Vec::new();
        let mut payload_table = vec![0u8];
        let mut blocks: HashMap<Vec<u8>, u64> = HashMap::new();
        let mut scratch = Vec::new();
        let mut edge_count = 0u32;

        for node in &self.nodes {
            let first_edge = edge_count;
            for (&label, &child) in &node.edges {
                let child = u32::try_from(child).map_err(|_| BuildError::TooLarge("node count"))?;
                EdgeRecord { label, child }.write(&mut edge_table);
                edge_count = edge_count
                    .checked_add(1)
                    .ok_or(BuildError::TooLarge("edge count"))?;
            }

            let payload = if !node.stored(keys_only) {
                NO_PAYLOAD
            } else if keys_only {
                KEYS_ONLY_TERMINAL
            } else {
                scratch.clear();
                let key = if compress { node.key.as_deref() } else { None };
                encode_block(&node.values, key, &mut scratch)?;
                match blocks.get(&scratch) {
                    Some(&offset) => offset,
                    None => {
                        let offset = payload_table.len() as u64;
                        payload_table.extend_from_slice(&scratch);
                        blocks.insert(scratch.clone(), offset);
                        offset
                    }
                }
            };

            NodeRecord {
                first_edge,
                edge_count: edge_count - first_edge,
                payload,
            }
            .write(&mut node_table);
        }

        let nodes_offset = HEADER_LEN as u64;
        let edges_offset = nodes_offset + node_table.len() as u64;
        let payload_offset = edges_offset + u64::from(edge_count) * EDGE_LEN as u64;

        let mut crc = crc32fast::Hasher::new();
        crc.update(&node_table);
        crc.update(&edge_table);
        crc.update(&payload_table);

        let mut flags = 0u8;
        if keys_only {
            flags |= FLAG_KEYS_ONLY;
        }
        if compress {
            flags |= FLAG_PREFIX_COMPRESSED;
        }

        let header = Header {
            version: VERSION,
            key_encoding: self.options.key_encoding,
            flags,
            root: 0,
            node_count,
            edge_count,
            body_crc32: crc.finalize(),
            nodes_offset,
            edges_offset,
            payload_offset,
            payload_len: payload_table.len() as u64,
        };

        let mut out = Vec::with_capacity(
            HEADER_LEN + node_table.len() + edge_table.len() + payload_table.len(),
        );
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(&node_table);
        out.extend_from_slice(&edge_table);
        out.extend_from_slice(&payload_table);

        debug!(
            nodes = node_count,
            edges = edge_count,
            payload_bytes = payload_table.len(),
            unique_blocks = blocks.len(),
            "trie serialized"
        );
        Ok(out)
    }

    pub fn write(&self, mut writer: impl Write) -> Result<(), BuildError> {
        writer.write_all(&self.to_bytes()?)?;
        writer.flush()?;
        Ok(())
    }

    /// Write to `path` through a temporary file in the same directory, so a
    /// reader never maps a half-written trie.
    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<(), BuildError> {
        let path = path.as_ref();
        let bytes = self.to_bytes()?;
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|err| BuildError::Io(err.error))?;
        debug!(path = %path.display(), bytes = bytes.len(), "trie written");
        Ok(())
    }
}

fn encode_block(values: &[String], key: Option<&str>, out: &mut Vec<u8>) -> Result<(), BuildError> {
    let count = u32::try_from(values.len()).map_err(|_| BuildError::TooLarge("value count"))?;
    out.write_u32::<LittleEndian>(count)?;
    for value in values {
        let suffix = match key {
            Some(key) => {
                let shared = shared_prefix(key, value);
                out.write_u32::<LittleEndian>(shared as u32)?;
                &value[shared..]
            }
            None => value.as_str(),
        };
        let len = u32::try_from(suffix.len()).map_err(|_| BuildError::ValueTooLong)?;
        out.write_u32::<LittleEndian>(len)?;
        out.extend_from_slice(suffix.as_bytes());
    }
    Ok(())
}

/// Length in bytes of the longest common prefix, ending on a char boundary.
fn shared_prefix(key: &str, value: &str) -> usize {
    let mut shared = 0;
    for ((idx, a), b) in key.char_indices().zip(value.chars()) {
        if a != b {
            break;
        }
        shared = idx + a.len_utf8();
    }
    shared
}

#[cfg(test)]
mod tests {
    use super::{BuilderOptions, TrieBuilder, shared_prefix};
    use crate::format::{FLAG_KEYS_ONLY, Header};
    use crate::trie::Trie;
    use tempfile::tempdir;

    #[test]
    fn shared_prefix_stops_at_char_boundary() {
        assert_eq!(shared_prefix("carpet", "carry"), 3);
        assert_eq!(shared_prefix("", "abc"), 0);
        assert_eq!(shared_prefix("abc", ""), 0);
        // 'á' and 'é' share their first UTF-8 byte but differ as chars.
        assert_eq!(shared_prefix("ná", "né"), 1);
        assert_eq!(shared_prefix("Novák", "Nováková"), "Novák".len());
    }

    #[test]
    fn identical_payloads_are_stored_once() -> Result<(), Box<dyn std::error::Error>> {
        let mut distinct = TrieBuilder::default();
        distinct.insert("a", "shared value");
        distinct.insert("b", "other value!");

        let mut shared = TrieBuilder::default();
        shared.insert("a", "shared value");
        shared.insert("b", "shared value");

        let distinct = Header::parse(&distinct.to_bytes()?)?;
        let shared_bytes = shared.to_bytes()?;
        let shared_header = Header::parse(&shared_bytes)?;
        assert!(shared_header.payload_len < distinct.payload_len);

        let trie = Trie::from_vec(shared_bytes)?;
        assert_eq!(trie.lookup("a")?, ["shared value"]);
        assert_eq!(trie.lookup("b")?, ["shared value"]);
        Ok(())
    }

    #[test]
    fn prefix_compression_shrinks_payload() -> Result<(), Box<dyn std::error::Error>> {
        let records = [
            ("Svoboda", "Svobodová"),
            ("Svoboda", "Svobodovi"),
            ("Dvořák", "Dvořáková"),
        ];
        let mut plain = TrieBuilder::default();
        let mut compressed = TrieBuilder::new(BuilderOptions {
            prefix_compression: true,
            ..BuilderOptions::default()
        });
        for (key, value) in records {
            plain.insert(key, value);
            compressed.insert(key, value);
        }

        let plain = Header::parse(&plain.to_bytes()?)?;
        let compressed = Header::parse(&compressed.to_bytes()?)?;
        assert!(compressed.prefix_compressed());
        assert!(compressed.payload_len < plain.payload_len);
        Ok(())
    }

    #[test]
    fn len_counts_stored_keys() {
        let mut builder = TrieBuilder::default();
        assert!(builder.is_empty());
        builder.insert("cat", "feline");
        builder.insert("cat", "pet");
        builder.insert("car", "vehicle");
        builder.insert_key("dog");
        assert_eq!(builder.len(), 2);

        let mut keys = TrieBuilder::new(BuilderOptions {
            keys_only: true,
            ..BuilderOptions::default()
        });
        keys.insert_key("dog");
        keys.insert("do", "dropped");
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn key_without_value_is_not_written() -> Result<(), Box<dyn std::error::Error>> {
        let mut builder = TrieBuilder::default();
        builder.insert_key("ghost");
        builder.insert("real", "value");
        let trie = Trie::from_vec(builder.to_bytes()?)?;
        assert!(!trie.contains("ghost"));
        assert_eq!(trie.get("ghost")?, None);
        assert_eq!(trie.lookup("real")?, ["value"]);
        Ok(())
    }

    #[test]
    fn keys_only_sets_flag() -> Result<(), Box<dyn std::error::Error>> {
        let mut builder = TrieBuilder::new(BuilderOptions {
            keys_only: true,
            prefix_compression: true,
            ..BuilderOptions::default()
        });
        builder.insert_key("x");
        let header = Header::parse(&builder.to_bytes()?)?;
        assert_eq!(header.flags, FLAG_KEYS_ONLY);
        Ok(())
    }

    #[test]
    fn write_to_replaces_existing_file() -> Result<(), Box<dyn std::error::Error>> {
        let tmp = tempdir()?;
        let path = tmp.path().join("names.trie");

        let mut first = TrieBuilder::default();
        first.insert("k", "old");
        first.write_to(&path)?;

        let mut second = TrieBuilder::default();
        second.insert("k", "new");
        second.write_to(&path)?;

        let trie = Trie::open(&path)?;
        assert_eq!(trie.lookup("k")?, ["new"]);
        assert_eq!(std::fs::read_dir(tmp.path())?.count(), 1);
        Ok(())
    }

    #[test]
    fn write_streams_same_bytes() -> Result<(), Box<dyn std::error::Error>> {
        let mut builder = TrieBuilder::default();
        builder.insert("k", "v");
        let mut sink = Vec::new();
        builder.write(&mut sink)?;
        assert_eq!(sink, builder.to_bytes()?);
        Ok(())
    }
}
