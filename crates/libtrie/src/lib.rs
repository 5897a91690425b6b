//! Read-only, file-backed trie mapping string keys to ordered string values.
//!
//! The on-disk layout is documented in [`format`]. Files are produced by
//! [`TrieBuilder`] (or the `trie-compile` tool), loaded with [`load`] and
//! queried with [`Trie::lookup`]. Loading memory-maps the file by default;
//! lookups are pure in-memory traversal.

pub mod builder;
pub mod cache;
pub mod error;
pub mod format;
pub mod handle;
pub mod trie;
mod values;

pub use crate::builder::{BuilderOptions, TrieBuilder};
pub use crate::cache::{CacheConfig, CacheStats, CachedTrie};
pub use crate::error::{BuildError, FormatError, LoadError, LookupFault};
pub use crate::format::KeyEncoding;
pub use crate::handle::TrieHandle;
pub use crate::trie::{LoadMode, LoadOptions, Trie, last_error, load};
pub use crate::values::{LookupHit, Values};
