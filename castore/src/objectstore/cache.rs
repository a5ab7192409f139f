//! Two cache tiers sitting in front of a [`crate::objectstore::BackingStore`]:
//! an in-memory LRU tier and a `redb`-backed durable tier. Adapted from the
//! near/far chaining idea in the teacher's `directoryservice::combinators::Cache`,
//! generalized from a single near/far pair of `DirectoryService`s to two
//! concrete tiers covering trees, blobs, and blob metadata (spec §4.1).

use std::path::Path;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use redb::{Database, ReadableTable, TableDefinition};

use crate::{
    errors::Error,
    ids::{BlobMetadata, ObjectId, Sha1},
    objectstore::backing_store::Blob,
    tree::{Tree, TreeDecodeError},
};

const TREES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("trees");
const BLOBS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("blobs");
const METADATA: TableDefinition<&[u8], (u64, &[u8; 20])> = TableDefinition::new("blob_metadata");

/// What the in-memory tier holds for one [`ObjectId`]. Trees and blobs share
/// one LRU so a mount's byte budget is spent on whichever kind it is
/// actually materializing, instead of two independently-sized pools.
#[derive(Clone)]
enum Cached {
    Tree(Tree),
    Blob(Blob),
}

impl Cached {
    fn size(&self) -> usize {
        match self {
            Cached::Tree(t) => t.entries().len() * 64 + 32,
            Cached::Blob(b) => b.len(),
        }
    }
}

struct MemoryState {
    lru: LruCache<ObjectId, Cached>,
    bytes_used: usize,
}

/// Bounded in-memory cache. Eviction is pure LRU against a byte budget, with
/// a floor on entry count so a handful of very large blobs can't evict the
/// cache down to nothing (spec §4.1: "a minimum entry count").
pub struct MemoryCache {
    state: Mutex<MemoryState>,
    byte_budget: usize,
    min_entries: usize,
}

impl MemoryCache {
    pub fn new(byte_budget: usize, min_entries: usize) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                lru: LruCache::unbounded(),
                bytes_used: 0,
            }),
            byte_budget,
            min_entries,
        }
    }

    pub fn get_tree(&self, id: &ObjectId) -> Option<Tree> {
        let mut state = self.state.lock();
        match state.lru.get(id) {
            Some(Cached::Tree(t)) => Some(t.clone()),
            _ => None,
        }
    }

    pub fn get_blob(&self, id: &ObjectId) -> Option<Blob> {
        let mut state = self.state.lock();
        match state.lru.get(id) {
            Some(Cached::Blob(b)) => Some(b.clone()),
            _ => None,
        }
    }

    pub fn put_tree(&self, id: ObjectId, tree: Tree) {
        self.put(id, Cached::Tree(tree));
    }

    pub fn put_blob(&self, id: ObjectId, blob: Blob) {
        self.put(id, Cached::Blob(blob));
    }

    fn put(&self, id: ObjectId, entry: Cached) {
        let mut state = self.state.lock();
        if let Some(old) = state.lru.put(id, entry.clone()) {
            state.bytes_used -= old.size();
        }
        state.bytes_used += entry.size();

        while state.bytes_used > self.byte_budget && state.lru.len() > self.min_entries {
            match state.lru.pop_lru() {
                Some((evicted_id, evicted)) => {
                    state.bytes_used -= evicted.size();
                    tracing::trace!(object_id = %evicted_id, "evicting from memory cache");
                }
                None => break,
            }
        }
    }
}

/// Durable cache tier backed by a `redb` database. Write-through: every
/// object fetched from the backing store lands here before the caller sees
/// it, so a restart only loses the (smaller) in-memory tier, not cold-start
/// performance entirely (spec §4.1).
pub struct DurableCache {
    db: Database,
}

impl DurableCache {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let db = Database::create(path)?;
        let txn = db.begin_write()?;
        {
            txn.open_table(TREES)?;
            txn.open_table(BLOBS)?;
            txn.open_table(METADATA)?;
        }
        txn.commit()?;
        Ok(Self { db })
    }

    pub fn get_tree(&self, id: &ObjectId) -> Result<Option<Tree>, Error> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(TREES)?;
        match table.get(id.as_bytes())? {
            Some(bytes) => Tree::decode(bytes.value())
                .map(Some)
                .map_err(|e: TreeDecodeError| Error::Cache(e.to_string())),
            None => Ok(None),
        }
    }

    pub fn put_tree(&self, id: &ObjectId, tree: &Tree) -> Result<(), Error> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(TREES)?;
            table.insert(id.as_bytes(), tree.encode().as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get_blob(&self, id: &ObjectId) -> Result<Option<Blob>, Error> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(BLOBS)?;
        Ok(table
            .get(id.as_bytes())?
            .map(|bytes| Blob::copy_from_slice(bytes.value())))
    }

    pub fn put_blob(&self, id: &ObjectId, blob: &Blob) -> Result<(), Error> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(BLOBS)?;
            table.insert(id.as_bytes(), blob.as_ref())?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get_metadata(&self, id: &ObjectId) -> Result<Option<BlobMetadata>, Error> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(METADATA)?;
        Ok(table.get(id.as_bytes())?.map(|v| {
            let (size, sha1) = v.value();
            BlobMetadata {
                sha1: Sha1::from_bytes(*sha1),
                size,
            }
        }))
    }

    pub fn put_metadata(&self, id: &ObjectId, metadata: &BlobMetadata) -> Result<(), Error> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(METADATA)?;
            table.insert(id.as_bytes(), (metadata.size, metadata.sha1.as_bytes()))?;
        }
        txn.commit()?;
        Ok(())
    }
}

/// Ties both tiers together behind the single set of operations
/// [`crate::objectstore::ObjectStore`] needs, so the façade doesn't have to
/// know there are two layers.
pub struct CacheStack {
    memory: MemoryCache,
    durable: Arc<DurableCache>,
}

impl CacheStack {
    pub fn new(memory: MemoryCache, durable: Arc<DurableCache>) -> Self {
        Self { memory, durable }
    }

    pub fn get_tree(&self, id: &ObjectId) -> Result<Option<Tree>, Error> {
        if let Some(tree) = self.memory.get_tree(id) {
            return Ok(Some(tree));
        }
        if let Some(tree) = self.durable.get_tree(id)? {
            self.memory.put_tree(id.clone(), tree.clone());
            return Ok(Some(tree));
        }
        Ok(None)
    }

    pub fn insert_tree(&self, id: &ObjectId, tree: &Tree) -> Result<(), Error> {
        self.durable.put_tree(id, tree)?;
        self.memory.put_tree(id.clone(), tree.clone());
        Ok(())
    }

    pub fn get_blob(&self, id: &ObjectId) -> Result<Option<Blob>, Error> {
        if let Some(blob) = self.memory.get_blob(id) {
            return Ok(Some(blob));
        }
        if let Some(blob) = self.durable.get_blob(id)? {
            self.memory.put_blob(id.clone(), blob.clone());
            return Ok(Some(blob));
        }
        Ok(None)
    }

    pub fn insert_blob(&self, id: &ObjectId, blob: &Blob) -> Result<(), Error> {
        self.durable.put_blob(id, blob)?;
        self.memory.put_blob(id.clone(), blob.clone());
        Ok(())
    }

    /// Metadata is write-through only: it's cheap, small, and never evicted
    /// from the durable tier, so there's no point shadowing it in memory.
    pub fn get_metadata(&self, id: &ObjectId) -> Result<Option<BlobMetadata>, Error> {
        self.durable.get_metadata(id)
    }

    pub fn insert_metadata(&self, id: &ObjectId, metadata: &BlobMetadata) -> Result<(), Error> {
        self.durable.put_metadata(id, metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(bytes: &[u8]) -> Blob {
        Blob::copy_from_slice(bytes)
    }

    fn id(n: u8) -> ObjectId {
        ObjectId::new(vec![n]).unwrap()
    }

    #[test]
    fn memory_cache_evicts_past_budget() {
        let cache = MemoryCache::new(16, 1);
        cache.put_blob(id(1), blob(b"0123456789"));
        cache.put_blob(id(2), blob(b"0123456789"));
        // id(1) should have been evicted; min_entries=1 still allows it since
        // len was 2 > 1 when id(2) was inserted.
        assert!(cache.get_blob(&id(1)).is_none());
        assert!(cache.get_blob(&id(2)).is_some());
    }

    #[test]
    fn memory_cache_respects_min_entries() {
        let cache = MemoryCache::new(1, 2);
        cache.put_blob(id(1), blob(b"0123456789"));
        cache.put_blob(id(2), blob(b"0123456789"));
        // both entries stay despite exceeding the byte budget, since evicting
        // either would drop below min_entries.
        assert!(cache.get_blob(&id(1)).is_some());
        assert!(cache.get_blob(&id(2)).is_some());
    }

    #[test]
    fn durable_cache_round_trips_blob() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DurableCache::open(&dir.path().join("cache.redb")).unwrap();
        let oid = id(7);
        cache.put_blob(&oid, &blob(b"hello")).unwrap();
        assert_eq!(cache.get_blob(&oid).unwrap(), Some(blob(b"hello")));
    }

    #[test]
    fn durable_cache_round_trips_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DurableCache::open(&dir.path().join("cache.redb")).unwrap();
        let oid = id(9);
        let meta = BlobMetadata {
            sha1: Sha1::of(b"hello"),
            size: 5,
        };
        cache.put_metadata(&oid, &meta).unwrap();
        assert_eq!(cache.get_metadata(&oid).unwrap(), Some(meta));
    }
}
