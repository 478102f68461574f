//! Deduplicated value log
//!
//! The log is the single source of truth for what this node has seen. It is
//! split into two handles over the same storage:
//! - [`DedupLog`]: cloneable, read-only view (`contains`, `snapshot`, `range_since`)
//! - [`LogWriter`]: the only handle that can append; not cloneable, owned by
//!   the ingestor task
//!
//! Entries are never removed or reordered, so an index handed out once stays
//! valid for the life of the process.

use std::{collections::HashSet, fmt::Debug, hash::Hash, ops::Range, sync::Arc};

use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use tracing::trace;

/// Values that can travel through the mesh.
pub trait MeshValue:
    Serialize + DeserializeOwned + Clone + Eq + Hash + Debug + Send + Sync + 'static
{
}

// Blanket implementation for all types that satisfy the bounds
impl<T> MeshValue for T where
    T: Serialize + DeserializeOwned + Clone + Eq + Hash + Debug + Send + Sync + 'static
{
}

#[derive(Debug)]
struct LogInner<V> {
    seen: HashSet<V>,
    entries: Vec<V>,
}

/// Read handle over the deduplicated log.
#[derive(Debug)]
pub struct DedupLog<V> {
    inner: Arc<RwLock<LogInner<V>>>,
}

impl<V> Clone for DedupLog<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V: MeshValue> DedupLog<V> {
    /// Create an empty log, returning the shared reader and its sole writer.
    pub fn new() -> (Self, LogWriter<V>) {
        let inner = Arc::new(RwLock::new(LogInner {
            seen: HashSet::new(),
            entries: Vec::new(),
        }));
        (
            Self {
                inner: inner.clone(),
            },
            LogWriter { inner },
        )
    }

    pub fn contains(&self, value: &V) -> bool {
        self.inner.read().seen.contains(value)
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the whole log in acceptance order.
    pub fn snapshot(&self) -> Vec<V> {
        self.inner.read().entries.clone()
    }

    /// Entries from `index` to the current end.
    ///
    /// # Panics
    /// If `index` is past the end of the log.
    pub fn range_since(&self, index: usize) -> Vec<V> {
        let inner = self.inner.read();
        assert!(
            index <= inner.entries.len(),
            "range_since({}) past end of log (len {})",
            index,
            inner.entries.len()
        );
        inner.entries[index..].to_vec()
    }

    /// Entries in `range`, which must lie within the current log.
    ///
    /// # Panics
    /// If the range ends past the end of the log.
    pub fn range(&self, range: Range<usize>) -> Vec<V> {
        let inner = self.inner.read();
        assert!(
            range.start <= range.end && range.end <= inner.entries.len(),
            "range {:?} outside log (len {})",
            range,
            inner.entries.len()
        );
        inner.entries[range].to_vec()
    }
}

/// Exclusive append handle. Holding `&mut` is what makes it the single writer.
#[derive(Debug)]
pub struct LogWriter<V> {
    inner: Arc<RwLock<LogInner<V>>>,
}

impl<V: MeshValue> LogWriter<V> {
    /// Accept `value` unless it was accepted before. Returns `true` if it was new.
    pub fn append(&mut self, value: V) -> bool {
        let mut inner = self.inner.write();
        if inner.seen.contains(&value) {
            trace!(?value, "Value already present");
            return false;
        }
        inner.seen.insert(value.clone());
        inner.entries.push(value);
        true
    }

    pub fn reader(&self) -> DedupLog<V> {
        DedupLog {
            inner: self.inner.clone(),
        }
    }
}
