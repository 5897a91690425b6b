use std::ops::Deref;

use crate::error::LookupFault;
use crate::format::PayloadBlock;

/// Owned result of a lookup, sized exactly to the values it holds.
///
/// An empty `Values` from [`Trie::lookup`](crate::Trie::lookup) means the key
/// is not present. Use [`Trie::get`](crate::Trie::get) to tell that apart
/// from a keys-only hit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Values {
    items: Vec<String>,
}

impl Values {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_block(block: PayloadBlock<'_>) -> Result<Self, LookupFault> {
        let count = block.remaining() as usize;
        let mut items = Vec::new();
        items
            .try_reserve_exact(count)
            .map_err(|_| LookupFault::OutOfMemory { needed: count })?;

        for parts in block {
            let parts = parts?;
            let mut value = String::new();
            value
                .try_reserve_exact(parts.len())
                .map_err(|_| LookupFault::OutOfMemory {
                    needed: parts.len(),
                })?;
            value.push_str(parts.prefix);
            value.push_str(parts.suffix);
            items.push(value);
        }
        Ok(Values { items })
    }

    pub fn as_slice(&self) -> &[String] {
        &self.items
    }

    pub fn into_vec(self) -> Vec<String> {
        self.items
    }
}

impl Deref for Values {
    type Target = [String];

    fn deref(&self) -> &[String] {
        &self.items
    }
}

impl IntoIterator for Values {
    type Item = String;
    type IntoIter = std::vec::IntoIter<String>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<'a> IntoIterator for &'a Values {
    type Item = &'a String;
    type IntoIter = std::slice::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

impl<const N: usize> PartialEq<[&str; N]> for Values {
    fn eq(&self, other: &[&str; N]) -> bool {
        self.items.len() == N && self.items.iter().zip(other).all(|(a, b)| a == b)
    }
}

/// Outcome of a lookup written into a caller-supplied buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupHit {
    /// Bytes written to the front of the buffer.
    pub len: usize,
    /// Number of newline-separated values written.
    pub count: u32,
}
