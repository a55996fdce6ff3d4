use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// One uploaded file: an ordered sequence of data blocks. Every block except
/// the last holds exactly 512 bytes; the last holds 0-511. A blob is
/// append-only while its upload is in flight and immutable once published.
#[derive(Debug)]
pub struct Blob {
    blocks: Vec<Vec<u8>>,
}

impl Blob {
    pub fn from_blocks(blocks: Vec<Vec<u8>>) -> Blob {
        Blob { blocks }
    }

    pub fn block(&self, idx: usize) -> Option<&[u8]> {
        self.blocks.get(idx).map(|b| b.as_slice())
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// The blob's full contents, blocks concatenated in order.
    pub fn contents(&self) -> Vec<u8> {
        self.blocks.concat()
    }
}

/// The result of offering a blob to the store.
#[derive(Debug, PartialEq)]
pub enum PublishOutcome {
    /// The blob is now visible under its name.
    Published,
    /// Another upload of the same name finished first; the offered blob was
    /// discarded.
    AlreadyExists,
}

/// Process-wide mapping from filename to published blob, shared by every
/// transfer handler. Names are write-once: a publish either installs the
/// first blob under a name or reports that one is already there, and nothing
/// removes a blob short of process exit.
#[derive(Clone, Debug)]
pub struct BlobStore {
    inner: Arc<RwLock<HashMap<String, Arc<Blob>>>>,
}

impl BlobStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn contains(&self, filename: &str) -> bool {
        self.inner.read().unwrap().contains_key(filename)
    }

    /// Returns a handle over the named blob. Blobs never change after
    /// publish, so the handle is a stable snapshot for however long a read
    /// transfer takes.
    pub fn get(&self, filename: &str) -> Option<Arc<Blob>> {
        self.inner.read().unwrap().get(filename).cloned()
    }

    /// Compare-and-insert. Exactly one of any set of racing publishes for
    /// the same name sees `Published`; the rest see `AlreadyExists` and
    /// their blobs are dropped.
    pub fn publish(&self, filename: String, blob: Blob) -> PublishOutcome {
        let mut map = self.inner.write().unwrap();
        if map.contains_key(&filename) {
            return PublishOutcome::AlreadyExists;
        }
        map.insert(filename, Arc::new(blob));
        PublishOutcome::Published
    }
}

impl Default for BlobStore {
    fn default() -> Self {
        Self::new()
    }
}
