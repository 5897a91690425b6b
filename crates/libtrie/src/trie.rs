use std::cell::RefCell;
use std::cmp::Ordering;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::ops::{Deref, Range};
use std::path::Path;

use memmap2::Mmap;
use tracing::{debug, warn};

use crate::error::{FormatError, LoadError, LookupFault, Result};
use crate::format::{
    EDGE_LEN, EdgeRecord, HEADER_LEN, Header, KEYS_ONLY_TERMINAL, KeyEncoding, NO_PAYLOAD,
    NODE_LEN, NodeRecord, PayloadBlock,
};
use crate::values::{LookupHit, Values};

thread_local! {
    static LAST_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Message describing the most recent failed load on this thread.
///
/// Cleared by every successful load. The `Err` returned by the load itself is
/// the authoritative failure signal; this is diagnostic text only.
pub fn last_error() -> Option<String> {
    LAST_ERROR.with(|slot| slot.borrow().clone())
}

fn record_load<T>(origin: &str, result: Result<T>) -> Result<T> {
    LAST_ERROR.with(|slot| {
        *slot.borrow_mut() = match &result {
            Ok(_) => None,
            Err(err) => {
                warn!(origin, error = %err, "trie load failed");
                Some(format!("failed to load trie from {origin}: {err}"))
            }
        };
    });
    result
}

/// Open the trie file at `path` with default options.
pub fn load(path: impl AsRef<Path>) -> Result<Trie> {
    Trie::open(path)
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub enum LoadMode {
    /// Map the file read-only; pages are faulted in on demand.
    #[default]
    Mmap,
    /// Copy the whole file into a heap buffer.
    Read,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct LoadOptions {
    pub mode: LoadMode,
    /// Check the body CRC at load time. Costs one pass over the file.
    pub verify_checksum: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        LoadOptions {
            mode: LoadMode::Mmap,
            verify_checksum: true,
        }
    }
}

enum Backing {
    Mapped(Mmap),
    Heap(Vec<u8>),
}

impl Deref for Backing {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Backing::Mapped(mmap) => mmap,
            Backing::Heap(buf) => buf,
        }
    }
}

/// A loaded, immutable trie.
///
/// Lookups never block or allocate beyond the returned [`Values`]. The trie
/// is `Send + Sync`; share it behind an `Arc` or a
/// [`TrieHandle`](crate::TrieHandle) for concurrent readers.
pub struct Trie {
    bytes: Backing,
    header: Header,
    nodes: Range<usize>,
    edges: Range<usize>,
    payload: Range<usize>,
}

impl Trie {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, LoadOptions::default())
    }

    pub fn open_with(path: impl AsRef<Path>, options: LoadOptions) -> Result<Self> {
        let path = path.as_ref();
        let result = Self::open_file(path, options);
        if let Ok(trie) = &result {
            debug!(
                path = %path.display(),
                nodes = trie.header.node_count,
                bytes = trie.file_len(),
                mapped = trie.is_mapped(),
                "trie loaded"
            );
        }
        record_load(&path.display().to_string(), result)
    }

    /// Load from an in-memory image, e.g. one produced by
    /// [`TrieBuilder::to_bytes`](crate::TrieBuilder::to_bytes).
    pub fn from_vec(bytes: Vec<u8>) -> Result<Self> {
        record_load("memory", Self::from_backing(Backing::Heap(bytes), true))
    }

    fn open_file(path: &Path, options: LoadOptions) -> Result<Self> {
        let file = File::open(path).map_err(|source| classify_open_error(path, source))?;
        let metadata = file.metadata()?;
        if !metadata.is_file() {
            return Err(LoadError::NotFound {
                path: path.to_path_buf(),
                source: std::io::Error::new(ErrorKind::InvalidInput, "not a regular file"),
            });
        }
        let len = usize::try_from(metadata.len()).map_err(|_| LoadError::OutOfMemory {
            needed: usize::MAX,
        })?;
        if len < HEADER_LEN {
            return Err(FormatError::FileTooSmall(len).into());
        }

        let bytes = match options.mode {
            // SAFETY: the map is read-only and private to this trie. Trie files
            // are written once and replaced atomically, never edited in place.
            LoadMode::Mmap => Backing::Mapped(unsafe { Mmap::map(&file)? }),
            LoadMode::Read => Backing::Heap(read_to_heap(file, len)?),
        };
        Self::from_backing(bytes, options.verify_checksum)
    }

    fn from_backing(bytes: Backing, verify_checksum: bool) -> Result<Self> {
        let header = Header::parse(&bytes)?;
        let file_len = bytes.len();

        let nodes = section(
            file_len,
            header.nodes_offset,
            u64::from(header.node_count) * NODE_LEN as u64,
            "node",
        )?;
        let edges = section(
            file_len,
            header.edges_offset,
            u64::from(header.edge_count) * EDGE_LEN as u64,
            "edge",
        )?;
        let payload = section(file_len, header.payload_offset, header.payload_len, "payload")?;
        check_disjoint(&[("node", &nodes), ("edge", &edges), ("payload", &payload)])?;

        if verify_checksum {
            let actual = crc32fast::hash(&bytes[HEADER_LEN..]);
            if actual != header.body_crc32 {
                return Err(FormatError::BodyChecksum {
                    expected: header.body_crc32,
                    actual,
                }
                .into());
            }
        }

        let trie = Trie {
            bytes,
            header,
            nodes,
            edges,
            payload,
        };
        trie.validate_graph()?;
        Ok(trie)
    }

    fn validate_graph(&self) -> std::result::Result<(), FormatError> {
        let node_count = self.header.node_count;
        if self.header.root >= node_count {
            return Err(FormatError::RootOutOfRange {
                root: self.header.root,
                node_count,
            });
        }

        let keys_only = self.header.keys_only();
        let payload_len = self.payload.len() as u64;
        for idx in 0..node_count {
            let node = self.node(idx);
            let end = u64::from(node.first_edge) + u64::from(node.edge_count);
            if end > u64::from(self.header.edge_count) {
                return Err(FormatError::EdgeRangeOutOfBounds { node: idx });
            }

            let mut prev: Option<u32> = None;
            for edge_idx in node.first_edge..node.first_edge + node.edge_count {
                let edge = self.edge(edge_idx);
                if edge.child >= node_count {
                    return Err(FormatError::ChildOutOfRange {
                        node: idx,
                        child: edge.child,
                    });
                }
                if prev.is_some_and(|p| p >= edge.label) {
                    return Err(FormatError::UnsortedEdges { node: idx });
                }
                prev = Some(edge.label);
            }

            match node.payload {
                NO_PAYLOAD => {}
                KEYS_ONLY_TERMINAL if keys_only => {}
                KEYS_ONLY_TERMINAL => {
                    return Err(FormatError::UnexpectedKeysOnlyMarker { node: idx });
                }
                offset if keys_only || offset >= payload_len => {
                    return Err(FormatError::PayloadOutOfRange { node: idx, offset });
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn key_encoding(&self) -> KeyEncoding {
        self.header.key_encoding
    }

    pub fn node_count(&self) -> u32 {
        self.header.node_count
    }

    pub fn file_len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self.bytes, Backing::Mapped(_))
    }

    /// Release the backing memory, unmapping the file if it was mapped.
    pub fn close(self) {
        debug!(bytes = self.file_len(), "trie released");
    }

    #[inline]
    fn node(&self, idx: u32) -> NodeRecord {
        let start = self.nodes.start + idx as usize * NODE_LEN;
        NodeRecord::read(&self.bytes[start..start + NODE_LEN])
    }

    #[inline]
    fn edge(&self, idx: u32) -> EdgeRecord {
        let start = self.edges.start + idx as usize * EDGE_LEN;
        EdgeRecord::read(&self.bytes[start..start + EDGE_LEN])
    }

    /// Binary search over the node's sorted edge run.
    fn child(&self, node: &NodeRecord, label: u32) -> Option<u32> {
        let mut lo = 0u32;
        let mut hi = node.edge_count;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let edge = self.edge(node.first_edge + mid);
            match edge.label.cmp(&label) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Some(edge.child),
            }
        }
        None
    }

    fn find(&self, key: &str) -> Option<NodeRecord> {
        let mut node = self.node(self.header.root);
        for label in self.header.key_encoding.symbols(key) {
            node = self.node(self.child(&node, label)?);
        }
        Some(node)
    }

    fn block<'a>(
        &'a self,
        offset: u64,
        key: &'a str,
    ) -> std::result::Result<PayloadBlock<'a>, FormatError> {
        PayloadBlock::open(
            &self.bytes[self.payload.clone()],
            offset,
            key,
            self.header.prefix_compressed(),
        )
    }

    /// Whether `key` was inserted by the builder.
    pub fn contains(&self, key: &str) -> bool {
        self.find(key).is_some_and(|node| node.is_terminal())
    }

    /// Values for `key`, or `None` if the key is not present.
    ///
    /// Keys-only tries answer `Some` with no values for present keys.
    pub fn get(&self, key: &str) -> std::result::Result<Option<Values>, LookupFault> {
        let Some(node) = self.find(key).filter(NodeRecord::is_terminal) else {
            return Ok(None);
        };
        if node.payload == KEYS_ONLY_TERMINAL {
            return Ok(Some(Values::new()));
        }
        let block = self.block(node.payload, key)?;
        Values::from_block(block).map(Some)
    }

    /// Values for `key` in builder insertion order. Empty means not found.
    pub fn lookup(&self, key: &str) -> std::result::Result<Values, LookupFault> {
        Ok(self.get(key)?.unwrap_or_default())
    }

    /// Write the newline-joined values for `key` into `out`.
    ///
    /// Returns `Ok(None)` when the key is not present. The write is rejected
    /// rather than truncated if `out` is too small, and values that contain a
    /// newline cannot be written at all. Nothing is allocated.
    pub fn lookup_into(
        &self,
        key: &str,
        out: &mut [u8],
    ) -> std::result::Result<Option<LookupHit>, LookupFault> {
        let Some(node) = self.find(key).filter(NodeRecord::is_terminal) else {
            return Ok(None);
        };
        if node.payload == KEYS_ONLY_TERMINAL {
            return Ok(Some(LookupHit { len: 0, count: 0 }));
        }

        let mut needed = 0usize;
        let mut count = 0u32;
        for parts in self.block(node.payload, key)? {
            let parts = parts?;
            if parts.contains_newline() {
                return Err(LookupFault::ValueContainsNewline);
            }
            needed += parts.len() + usize::from(count > 0);
            count += 1;
        }
        if needed > out.len() {
            return Err(LookupFault::OutputBufferTooSmall {
                needed,
                actual: out.len(),
            });
        }

        let mut pos = 0usize;
        for (i, parts) in self.block(node.payload, key)?.enumerate() {
            let parts = parts?;
            if i > 0 {
                out[pos] = b'\n';
                pos += 1;
            }
            for piece in [parts.prefix, parts.suffix] {
                out[pos..pos + piece.len()].copy_from_slice(piece.as_bytes());
                pos += piece.len();
            }
        }
        Ok(Some(LookupHit { len: pos, count }))
    }
}

fn classify_open_error(path: &Path, source: std::io::Error) -> LoadError {
    match source.kind() {
        ErrorKind::NotFound | ErrorKind::PermissionDenied => LoadError::NotFound {
            path: path.to_path_buf(),
            source,
        },
        _ => LoadError::Io(source),
    }
}

fn read_to_heap(mut file: File, len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| LoadError::OutOfMemory { needed: len })?;
    file.read_to_end(&mut buf)?;
    Ok(buf)
}

fn section(
    file_len: usize,
    offset: u64,
    len: u64,
    name: &'static str,
) -> std::result::Result<Range<usize>, FormatError> {
    let end = offset
        .checked_add(len)
        .ok_or(FormatError::SectionOutOfBounds(name))?;
    if offset < HEADER_LEN as u64 || end > file_len as u64 {
        return Err(FormatError::SectionOutOfBounds(name));
    }
    Ok(offset as usize..end as usize)
}

fn check_disjoint(
    sections: &[(&'static str, &Range<usize>)],
) -> std::result::Result<(), FormatError> {
    for (i, (name, a)) in sections.iter().enumerate() {
        for (_, b) in &sections[i + 1..] {
            if !a.is_empty() && !b.is_empty() && a.start < b.end && b.start < a.end {
                return Err(FormatError::SectionOverlap(*name));
            }
        }
    }
    Ok(())
}
