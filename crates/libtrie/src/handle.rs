use std::path::Path;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard};
use tracing::{debug, error, warn};

use crate::error::{LoadError, LookupFault};
use crate::trie::{LoadOptions, Trie};
use crate::values::{LookupHit, Values};

/// Cloneable handle for many readers and one eventual release.
///
/// Lookups hold a read lock for their duration; [`close`](Self::close) takes
/// the write lock, so it waits for in-flight lookups and every later lookup
/// on any clone fails with [`LookupFault::Released`].
#[derive(Clone)]
pub struct TrieHandle {
    inner: Arc<RwLock<Option<Trie>>>,
}

impl TrieHandle {
    pub fn new(trie: Trie) -> Self {
        TrieHandle {
            inner: Arc::new(RwLock::new(Some(trie))),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        Trie::open(path).map(Self::new)
    }

    pub fn load_with(path: impl AsRef<Path>, options: LoadOptions) -> Result<Self, LoadError> {
        Trie::open_with(path, options).map(Self::new)
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Option<Trie>> {
        self.inner.read()
    }

    fn with_trie<T>(
        &self,
        f: impl FnOnce(&Trie) -> Result<T, LookupFault>,
    ) -> Result<T, LookupFault> {
        match self.read().as_ref() {
            Some(trie) => f(trie),
            None => Err(released()),
        }
    }

    pub fn lookup(&self, key: &str) -> Result<Values, LookupFault> {
        self.with_trie(|trie| trie.lookup(key))
    }

    pub fn get(&self, key: &str) -> Result<Option<Values>, LookupFault> {
        self.with_trie(|trie| trie.get(key))
    }

    pub fn lookup_into(&self, key: &str, out: &mut [u8]) -> Result<Option<LookupHit>, LookupFault> {
        self.with_trie(|trie| trie.lookup_into(key, out))
    }

    pub fn contains(&self, key: &str) -> Result<bool, LookupFault> {
        self.with_trie(|trie| Ok(trie.contains(key)))
    }

    /// Release the trie. Returns `true` for the call that released it and
    /// `false` for every later call.
    pub fn close(&self) -> bool {
        let released = self.inner.write().take();
        match released {
            Some(trie) => {
                trie.close();
                debug!(clones = Arc::strong_count(&self.inner), "trie handle closed");
                true
            }
            None => {
                warn!("trie handle closed twice");
                false
            }
        }
    }

    pub fn is_released(&self) -> bool {
        self.inner.read().is_none()
    }

    /// Number of live clones of this handle, including `self`.
    pub fn clone_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

pub(crate) fn released() -> LookupFault {
    error!("lookup on a released trie handle");
    LookupFault::Released
}
