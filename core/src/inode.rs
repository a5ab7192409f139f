//! The inode graph and its `InodeMap` resolver (spec §3, §4.3, §4.4).
//! Grounded in shape on the teacher's `fs::inode_tracker::InodeTracker`
//! (a `HashMap<InodeNumber, _>` plus a load-on-demand path), but its
//! content-addressed dedup does not survive the transform: spec invariant 4
//! requires one inode number per kernel-visible path identity, so children
//! are allocated by `(parent, name)` and the number is persisted into the
//! parent's [`OverlayDir`] entry instead of being looked up by content hash.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use edenfs_castore::{
    Blob, CaseAwareMap, CasePolicy, FetchContext, InodeNumber, ObjectId, PathComponent,
    RelativePathBuf, Sha1, Tree,
};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::errors::Error;
use crate::objectsource::ObjectSource;
use crate::overlay::{Overlay, OverlayDir, OverlayEntry};

const TREE_MODE_BIT: u32 = 0o40000;

/// Hook C4 calls into C9 on mutation (spec §4.4 "Invalidation").
pub trait Invalidator: Send + Sync {
    fn invalidate_inode(&self, ino: InodeNumber);
    fn invalidate_entry(&self, parent: InodeNumber, name: &PathComponent);
}

/// An invalidator that does nothing; used by tests and by any mount that
/// hasn't attached a channel yet.
pub struct NullInvalidator;
impl Invalidator for NullInvalidator {
    fn invalidate_inode(&self, _ino: InodeNumber) {}
    fn invalidate_entry(&self, _parent: InodeNumber, _name: &PathComponent) {}
}

/// Where an inode currently sits in the namespace (spec §3's
/// `location: (parent_inode, name) | Unlinked`), plus the root's distinguished
/// case.
#[derive(Debug, Clone)]
enum Location {
    Root,
    Child { parent: InodeNumber, name: PathComponent },
    Unlinked,
}

/// spec §3 `FileInode` state.
enum FileState {
    NotLoaded { hash: ObjectId },
    Loading { hash: ObjectId },
    Loaded { hash: ObjectId, blob: Blob },
    Materialized,
}

struct FileInner {
    state: FileState,
    loaders: Option<broadcast::Sender<Result<(), String>>>,
}

pub struct FileInode {
    ino: InodeNumber,
    location: Mutex<Location>,
    inner: Mutex<FileInner>,
    fs_refcount: AtomicU64,
}

enum LoadAction {
    Wait(broadcast::Receiver<Result<(), String>>),
    Fetch(ObjectId),
}

impl FileInode {
    pub fn ino(&self) -> InodeNumber {
        self.ino
    }

    pub fn is_materialized(&self) -> bool {
        matches!(self.inner.lock().state, FileState::Materialized)
    }

    /// Ensures the blob is fetched, fanning a single in-flight fetch out to
    /// concurrent callers (spec §4.3 point 4, applied here to file bodies).
    pub async fn ensure_loaded(
        &self,
        source: &dyn ObjectSource,
        ctx: &FetchContext,
    ) -> Result<Blob, Error> {
        loop {
            let action = {
                let mut inner = self.inner.lock();
                match &inner.state {
                    FileState::Materialized => {
                        return Err(Error::InvalidArgument(
                            "ensure_loaded called on a materialized file".into(),
                        ))
                    }
                    FileState::Loaded { blob, .. } => return Ok(blob.clone()),
                    FileState::Loading { .. } => {
                        let rx = inner
                            .loaders
                            .as_ref()
                            .expect("Loading state always has a sender")
                            .subscribe();
                        LoadAction::Wait(rx)
                    }
                    FileState::NotLoaded { hash } => {
                        let hash = hash.clone();
                        let (tx, _rx) = broadcast::channel(1);
                        inner.state = FileState::Loading { hash: hash.clone() };
                        inner.loaders = Some(tx);
                        LoadAction::Fetch(hash)
                    }
                }
            };
            match action {
                LoadAction::Wait(mut rx) => match rx.recv().await {
                    Ok(Ok(())) => continue,
                    Ok(Err(msg)) => return Err(Error::Backing(msg)),
                    Err(_) => return Err(Error::Cancelled),
                },
                LoadAction::Fetch(hash) => {
                    let result = source.get_blob(&hash, ctx).await;
                    let mut inner = self.inner.lock();
                    let tx = inner.loaders.take();
                    match result {
                        Ok(blob) => {
                            inner.state = FileState::Loaded { hash, blob: blob.clone() };
                            if let Some(tx) = tx {
                                let _ = tx.send(Ok(()));
                            }
                            return Ok(blob);
                        }
                        Err(e) => {
                            inner.state = FileState::NotLoaded { hash };
                            if let Some(tx) = tx {
                                let _ = tx.send(Err(e.to_string()));
                            }
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    /// Transitions to `Materialized` if not already, copying existing
    /// content into the overlay first so the write/truncate that triggered
    /// this doesn't lose data (spec §3: "any of {NotLoaded, Loading,
    /// Loaded}→Materialized (through write or truncate)").
    pub async fn materialize(
        &self,
        overlay: &Overlay,
        source: &dyn ObjectSource,
        ctx: &FetchContext,
    ) -> Result<(), Error> {
        if self.is_materialized() {
            return Ok(());
        }
        let blob = self.ensure_loaded(source, ctx).await?;
        overlay.write(self.ino, 0, &blob)?;
        self.inner.lock().state = FileState::Materialized;
        Ok(())
    }

    pub async fn read(
        &self,
        overlay: &Overlay,
        source: &dyn ObjectSource,
        ctx: &FetchContext,
        offset: u64,
        size: usize,
    ) -> Result<Vec<u8>, Error> {
        if self.is_materialized() {
            return overlay.read(self.ino, offset, size);
        }
        let blob = self.ensure_loaded(source, ctx).await?;
        let start = (offset as usize).min(blob.len());
        let end = (start + size).min(blob.len());
        Ok(blob[start..end].to_vec())
    }

    pub async fn write(
        &self,
        overlay: &Overlay,
        source: &dyn ObjectSource,
        ctx: &FetchContext,
        offset: u64,
        bytes: &[u8],
    ) -> Result<usize, Error> {
        self.materialize(overlay, source, ctx).await?;
        overlay.write(self.ino, offset, bytes)
    }

    pub async fn truncate(
        &self,
        overlay: &Overlay,
        source: &dyn ObjectSource,
        ctx: &FetchContext,
        size: u64,
    ) -> Result<(), Error> {
        self.materialize(overlay, source, ctx).await?;
        overlay.truncate(self.ino, size)
    }

    /// Cheap hash comparison against a source-control entry without
    /// re-reading the blob: unmaterialized files already know their
    /// source-control hash, so this never touches the backing store (spec
    /// §4.5 "cheap hash check when not materialized").
    pub fn hash_matches(&self, entry_hash: &ObjectId) -> bool {
        match &self.inner.lock().state {
            FileState::NotLoaded { hash } | FileState::Loading { hash } | FileState::Loaded { hash, .. } => {
                hash == entry_hash
            }
            FileState::Materialized => false,
        }
    }

    pub fn sha1(&self, overlay: &Overlay) -> Result<Sha1, Error> {
        overlay.sha1(self.ino)
    }
}

pub struct TreeInode {
    ino: InodeNumber,
    policy: CasePolicy,
    location: Mutex<Location>,
    contents: Mutex<OverlayDir>,
    children: Mutex<CaseAwareMap<Weak<Inode>>>,
    fs_refcount: AtomicU64,
}

impl TreeInode {
    pub fn ino(&self) -> InodeNumber {
        self.ino
    }

    pub fn is_materialized(&self) -> bool {
        self.contents.lock().materialized
    }

    pub fn entries(&self) -> Vec<(PathComponent, OverlayEntry)> {
        self.contents
            .lock()
            .entries
            .iter()
            .filter_map(|(name, e)| PathComponent::new(name.clone()).ok().map(|n| (n, e.clone())))
            .collect()
    }

    /// Sets `contents.materialized = true`; the caller (`InodeMap`) walks the
    /// parent chain to propagate it to the root (spec §4.4 `materialize_up`).
    fn mark_materialized(&self, overlay: &Overlay) -> Result<(), Error> {
        let mut contents = self.contents.lock();
        if !contents.materialized {
            contents.materialized = true;
            contents.source_tree = None;
            overlay.save_dir(self.ino, &contents)?;
        }
        Ok(())
    }
}

pub enum Inode {
    Tree(Arc<TreeInode>),
    File(Arc<FileInode>),
}

impl Inode {
    pub fn ino(&self) -> InodeNumber {
        match self {
            Inode::Tree(t) => t.ino(),
            Inode::File(f) => f.ino(),
        }
    }

    fn location(&self) -> Location {
        match self {
            Inode::Tree(t) => t.location.lock().clone(),
            Inode::File(f) => f.location.lock().clone(),
        }
    }

    fn fs_refcount(&self) -> &AtomicU64 {
        match self {
            Inode::Tree(t) => &t.fs_refcount,
            Inode::File(f) => &f.fs_refcount,
        }
    }

    pub fn as_tree(&self) -> Result<Arc<TreeInode>, Error> {
        match self {
            Inode::Tree(t) => Ok(t.clone()),
            Inode::File(f) => Err(Error::NotADirectory(format!("inode {}", f.ino()))),
        }
    }

    pub fn as_file(&self) -> Result<Arc<FileInode>, Error> {
        match self {
            Inode::File(f) => Ok(f.clone()),
            Inode::Tree(t) => Err(Error::IsADirectory(format!("inode {}", t.ino()))),
        }
    }

    /// Eligible for the unload sweep: not dirty relative to source control.
    fn is_loaded_clean(&self) -> bool {
        match self {
            Inode::File(f) => !f.is_materialized(),
            Inode::Tree(t) => !t.is_materialized(),
        }
    }
}

/// Restores inode-number identity across a graceful restart (spec §4.3
/// `shutdown`/`initialize_from_takeover`, tested by scenario F).
#[derive(Debug, Clone, Default)]
pub struct SerializedInodeMap {
    pub entries: Vec<(RelativePathBuf, InodeNumber)>,
}

/// The per-mount inode registry (spec §4.3). Entries are strong: an inode
/// lives as long as it's in this map. `unload_sweep` prunes ones that are
/// eligible per spec §4.3 (no kernel refcount, no other strong referrer,
/// clean/unmaterialized state).
pub struct InodeMap {
    policy: CasePolicy,
    entries: Mutex<HashMap<InodeNumber, Arc<Inode>>>,
    in_flight: Mutex<HashMap<(InodeNumber, Vec<u8>), broadcast::Sender<Result<InodeNumber, String>>>>,
    overlay: Arc<Overlay>,
    source: Arc<dyn ObjectSource>,
    #[allow(dead_code)]
    invalidator: Arc<dyn Invalidator>,
    shutdown: AtomicBool,
}

impl InodeMap {
    /// `root_tree_id` is the tree this mount's parent commit checks out at
    /// the root; it seeds the root `TreeInode`'s `source_tree` the first
    /// time the overlay has no record of it yet. `None` leaves the root
    /// unseeded (populated as empty until the first checkout), for callers
    /// that have no root tree id to hand — e.g. a mount whose backing store
    /// can resolve a root id to its tree's content but not to that tree's
    /// own object id.
    pub fn new(
        overlay: Arc<Overlay>,
        source: Arc<dyn ObjectSource>,
        invalidator: Arc<dyn Invalidator>,
        policy: CasePolicy,
        root_tree_id: Option<&ObjectId>,
    ) -> Result<Self, Error> {
        let mut contents = overlay.load_dir(InodeNumber::ROOT)?.unwrap_or_default();
        if let Some(root_tree_id) = root_tree_id {
            if !contents.materialized && contents.source_tree.is_none() {
                contents.source_tree = Some(root_tree_id.as_bytes().to_vec());
                overlay.save_dir(InodeNumber::ROOT, &contents)?;
            }
        }
        let root = Arc::new(Inode::Tree(Arc::new(TreeInode {
            ino: InodeNumber::ROOT,
            policy,
            location: Mutex::new(Location::Root),
            contents: Mutex::new(contents),
            children: Mutex::new(CaseAwareMap::new(policy)),
            fs_refcount: AtomicU64::new(0),
        })));
        let mut entries = HashMap::new();
        entries.insert(InodeNumber::ROOT, root);
        Ok(Self {
            policy,
            entries: Mutex::new(entries),
            in_flight: Mutex::new(HashMap::new()),
            overlay,
            source,
            invalidator,
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn root(&self) -> Arc<TreeInode> {
        self.entries
            .lock()
            .get(&InodeNumber::ROOT)
            .expect("root always present")
            .as_tree()
            .expect("root is always a tree")
    }

    pub fn lookup_inode(&self, ino: InodeNumber) -> Result<Arc<Inode>, Error> {
        self.entries.lock().get(&ino).cloned().ok_or(Error::NotFoundInode(ino))
    }

    pub fn lookup_tree(&self, ino: InodeNumber) -> Result<Arc<TreeInode>, Error> {
        self.lookup_inode(ino)?.as_tree()
    }

    pub fn lookup_file(&self, ino: InodeNumber) -> Result<Arc<FileInode>, Error> {
        self.lookup_inode(ino)?.as_file()
    }

    pub fn get_path_for_inode(&self, ino: InodeNumber) -> Option<RelativePathBuf> {
        let mut components = Vec::new();
        let mut current = ino;
        loop {
            let inode = self.entries.lock().get(&current)?.clone();
            match inode.location() {
                Location::Root => break,
                Location::Unlinked => return None,
                Location::Child { parent, name } => {
                    components.push(name);
                    current = parent;
                }
            }
        }
        components.reverse();
        Some(RelativePathBuf::from_components(components.iter()))
    }

    pub fn inc_fs_refcount(&self, ino: InodeNumber) -> Result<(), Error> {
        self.lookup_inode(ino)?.fs_refcount().fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub fn dec_fs_refcount(&self, ino: InodeNumber, n: u64) -> Result<(), Error> {
        self.lookup_inode(ino)?.fs_refcount().fetch_sub(n, Ordering::SeqCst);
        Ok(())
    }

    /// Propagates a materialized flag from `leaf` up to the root (spec §4.4
    /// `materialize_up`): a write anywhere under an unmaterialized directory
    /// forces every ancestor to become materialized too, since the overlay
    /// can no longer describe that subtree purely by source-control hash.
    pub fn materialize_up(&self, leaf: &Arc<TreeInode>) -> Result<(), Error> {
        leaf.mark_materialized(&self.overlay)?;
        let mut current = leaf.location.lock().clone();
        loop {
            match current {
                Location::Root | Location::Unlinked => break,
                Location::Child { parent, .. } => {
                    let parent_tree = self.lookup_tree(parent)?;
                    if parent_tree.is_materialized() {
                        break;
                    }
                    parent_tree.mark_materialized(&self.overlay)?;
                    current = parent_tree.location.lock().clone();
                }
            }
        }
        Ok(())
    }

    /// A direct write/truncate materializes a file in place without going
    /// through `create_child_from_scm`/`reconfigure_child`, so nothing else
    /// clears the cached source-control hash its parent directory still
    /// carries for it. Left alone, that stale hash would make a later clean
    /// check (checkout's `is_live_file_clean`, diff's `diff_matched_entry`)
    /// trust the cache instead of noticing the on-disk bytes changed. Also
    /// propagates the materialized flag up the ancestor chain the same way
    /// a structural write does.
    pub fn note_file_written(&self, ino: InodeNumber) -> Result<(), Error> {
        let inode = self.lookup_inode(ino)?;
        let location = match inode.as_ref() {
            Inode::File(f) => f.location.lock().clone(),
            Inode::Tree(_) => return Ok(()),
        };
        let Location::Child { parent, name } = location else {
            return Ok(());
        };
        let parent_tree = self.lookup_tree(parent)?;
        let cleared = {
            let mut contents = parent_tree.contents.lock();
            match contents.entries.get_mut(name.as_bytes()) {
                Some(entry) if entry.hash.is_some() => {
                    entry.hash = None;
                    true
                }
                _ => false,
            }
        };
        if cleared {
            let contents = parent_tree.contents.lock().clone();
            self.overlay.save_dir(parent, &contents)?;
        }
        self.materialize_up(&parent_tree)
    }

    /// Loads (or returns the already-live) child of `parent` named `name`,
    /// fetching from the object store on first access to a source-control
    /// entry that has never been demand-loaded (spec §4.3's four-step
    /// algorithm).
    pub async fn get_or_load_child(
        &self,
        parent: &Arc<TreeInode>,
        name: &PathComponent,
        ctx: &FetchContext,
    ) -> Result<Arc<Inode>, Error> {
        if let Some(weak) = parent.children.lock().get(name) {
            if let Some(strong) = weak.upgrade() {
                return Ok(strong);
            }
        }

        let key = (parent.ino, name.as_bytes().to_vec());
        let rx = {
            let mut in_flight = self.in_flight.lock();
            if let Some(tx) = in_flight.get(&key) {
                Some(tx.subscribe())
            } else {
                let (tx, _rx) = broadcast::channel(1);
                in_flight.insert(key.clone(), tx);
                None
            }
        };

        if let Some(mut rx) = rx {
            return match rx.recv().await {
                Ok(Ok(ino)) => self.lookup_inode(ino),
                Ok(Err(msg)) => Err(Error::Internal(msg)),
                Err(_) => Err(Error::Cancelled),
            };
        }

        let result = self.load_child(parent, name, ctx).await;
        let tx = self.in_flight.lock().remove(&key);
        match &result {
            Ok(inode) => {
                if let Some(tx) = tx {
                    let _ = tx.send(Ok(inode.ino()));
                }
            }
            Err(e) => {
                if let Some(tx) = tx {
                    let _ = tx.send(Err(e.to_string()));
                }
            }
        }
        result
    }

    /// Faults in a whole directory's listing from source control the first
    /// time anything inside it is looked up, rather than one name at a time:
    /// once `populated`, an entry's absence from `contents.entries`
    /// unambiguously means deleted (spec §4.3/§4.6 rely on this to tell "not
    /// yet loaded" apart from "removed").
    pub async fn ensure_populated(&self, dir: &Arc<TreeInode>, ctx: &FetchContext) -> Result<(), Error> {
        let (already_done, source_tree) = {
            let contents = dir.contents.lock();
            (contents.materialized || contents.populated, contents.source_tree.clone())
        };
        if already_done {
            return Ok(());
        }
        let tree_id_bytes = match source_tree {
            Some(bytes) => bytes,
            None => {
                let mut contents = dir.contents.lock();
                contents.populated = true;
                self.overlay.save_dir(dir.ino, &contents)?;
                return Ok(());
            }
        };
        let tree_id = ObjectId::new(tree_id_bytes).map_err(|e| Error::Internal(e.to_string()))?;
        let tree: Tree = self.source.get_tree(&tree_id, ctx).await?;

        let mut contents = dir.contents.lock();
        if contents.populated || contents.materialized {
            return Ok(());
        }
        for entry in tree.entries() {
            let mode = if entry.kind.is_tree() { entry.mode | TREE_MODE_BIT } else { entry.mode };
            contents.entries.entry(entry.name.as_bytes().to_vec()).or_insert(OverlayEntry {
                mode,
                inode: None,
                hash: Some(entry.object_id.as_bytes().to_vec()),
            });
        }
        contents.populated = true;
        self.overlay.save_dir(dir.ino, &contents)?;
        Ok(())
    }

    async fn load_child(
        &self,
        parent: &Arc<TreeInode>,
        name: &PathComponent,
        ctx: &FetchContext,
    ) -> Result<Arc<Inode>, Error> {
        self.ensure_populated(parent, ctx).await?;

        let (entry_ino, entry) = {
            let contents = parent.contents.lock();
            let (_, e) = contents
                .entry(name, self.policy)
                .ok_or_else(|| Error::NotFoundPath(name.to_string()))?;
            (e.inode, e.clone())
        };

        let ino = match entry_ino {
            Some(ino) => ino,
            None => {
                let ino = self.overlay.allocate_inode_number()?;
                let mut contents = parent.contents.lock();
                if let Some(slot) = contents.entries.get_mut(name.as_bytes()) {
                    slot.inode = Some(ino);
                }
                self.overlay.save_dir(parent.ino, &contents)?;
                ino
            }
        };

        let is_tree = entry.mode & TREE_MODE_BIT != 0;

        let inode: Arc<Inode> = if is_tree {
            let mut contents = self.overlay.load_dir(ino)?.unwrap_or_default();
            if !contents.materialized && contents.source_tree.is_none() {
                contents.source_tree = entry.hash.clone();
                self.overlay.save_dir(ino, &contents)?;
            }
            Arc::new(Inode::Tree(Arc::new(TreeInode {
                ino,
                policy: self.policy,
                location: Mutex::new(Location::Child { parent: parent.ino, name: name.clone() }),
                contents: Mutex::new(contents),
                children: Mutex::new(CaseAwareMap::new(self.policy)),
                fs_refcount: AtomicU64::new(0),
            })))
        } else {
            let state = match &entry.hash {
                Some(hash_bytes) => FileState::NotLoaded {
                    hash: ObjectId::new(hash_bytes.clone())
                        .map_err(|e| Error::Internal(e.to_string()))?,
                },
                None => FileState::Materialized,
            };
            Arc::new(Inode::File(Arc::new(FileInode {
                ino,
                location: Mutex::new(Location::Child { parent: parent.ino, name: name.clone() }),
                inner: Mutex::new(FileInner { state, loaders: None }),
                fs_refcount: AtomicU64::new(0),
            })))
        };

        parent.children.lock().insert(name.clone(), Arc::downgrade(&inode));
        self.entries.lock().insert(ino, inode.clone());
        Ok(inode)
    }

    /// Creates a new empty, materialized directory under `parent` (spec §4.4
    /// `mkdir`).
    pub fn mkdir(&self, parent: &Arc<TreeInode>, name: &PathComponent, mode: u32) -> Result<Arc<TreeInode>, Error> {
        if parent.contents.lock().entry(name, self.policy).is_some() {
            return Err(Error::AlreadyExists { path: name.to_string() });
        }
        let ino = self.overlay.allocate_inode_number()?;
        let entry = OverlayEntry { mode: mode | TREE_MODE_BIT, inode: Some(ino), hash: None };
        {
            let mut contents = parent.contents.lock();
            contents.entries.insert(name.as_bytes().to_vec(), entry);
            self.overlay.save_dir(parent.ino, &contents)?;
        }
        self.materialize_up(parent)?;
        let child_contents = OverlayDir { materialized: true, ..Default::default() };
        self.overlay.save_dir(ino, &child_contents)?;
        let child = Arc::new(TreeInode {
            ino,
            policy: self.policy,
            location: Mutex::new(Location::Child { parent: parent.ino, name: name.clone() }),
            contents: Mutex::new(child_contents),
            children: Mutex::new(CaseAwareMap::new(self.policy)),
            fs_refcount: AtomicU64::new(0),
        });
        let inode = Arc::new(Inode::Tree(child.clone()));
        parent.children.lock().insert(name.clone(), Arc::downgrade(&inode));
        self.entries.lock().insert(ino, inode);
        Ok(child)
    }

    /// Creates a new empty, materialized regular file (spec §4.4 `mknod`,
    /// restricted to plain files; device/fifo nodes are out of scope).
    pub fn mknod_regular(&self, parent: &Arc<TreeInode>, name: &PathComponent, mode: u32) -> Result<Arc<FileInode>, Error> {
        if parent.contents.lock().entry(name, self.policy).is_some() {
            return Err(Error::AlreadyExists { path: name.to_string() });
        }
        let ino = self.overlay.allocate_inode_number()?;
        let entry = OverlayEntry { mode, inode: Some(ino), hash: None };
        {
            let mut contents = parent.contents.lock();
            contents.entries.insert(name.as_bytes().to_vec(), entry);
            self.overlay.save_dir(parent.ino, &contents)?;
        }
        self.materialize_up(parent)?;
        self.overlay.write(ino, 0, b"")?;
        let file = Arc::new(FileInode {
            ino,
            location: Mutex::new(Location::Child { parent: parent.ino, name: name.clone() }),
            inner: Mutex::new(FileInner { state: FileState::Materialized, loaders: None }),
            fs_refcount: AtomicU64::new(0),
        });
        let inode = Arc::new(Inode::File(file.clone()));
        parent.children.lock().insert(name.clone(), Arc::downgrade(&inode));
        self.entries.lock().insert(ino, inode);
        Ok(file)
    }

    /// Removes a file or empty directory from `parent` (spec §4.4
    /// `unlink`/`rmdir`). `expect_tree` selects which POSIX error (`EISDIR`
    /// vs `ENOTDIR`) a type mismatch reports.
    pub fn remove_child(&self, parent: &Arc<TreeInode>, name: &PathComponent, expect_tree: bool) -> Result<(), Error> {
        let (ino, is_tree) = {
            let contents = parent.contents.lock();
            let (_, entry) = contents
                .entry(name, self.policy)
                .ok_or_else(|| Error::NotFoundPath(name.to_string()))?;
            (entry.inode, entry.mode & TREE_MODE_BIT != 0)
        };
        if is_tree != expect_tree {
            return if is_tree {
                Err(Error::IsADirectory(name.to_string()))
            } else {
                Err(Error::NotADirectory(name.to_string()))
            };
        }
        if is_tree {
            if let Some(ino) = ino {
                if !self.overlay.load_dir(ino)?.unwrap_or_default().entries.is_empty() {
                    return Err(Error::DirectoryNotEmpty(name.to_string()));
                }
            }
        }
        {
            let mut contents = parent.contents.lock();
            contents.entries.remove(name.as_bytes());
            self.overlay.save_dir(parent.ino, &contents)?;
        }
        self.materialize_up(parent)?;
        if let Some(ino) = ino {
            if let Some(inode) = parent.children.lock().remove(name) {
                if let Some(strong) = inode.upgrade() {
                    match &*strong {
                        Inode::Tree(t) => *t.location.lock() = Location::Unlinked,
                        Inode::File(f) => *f.location.lock() = Location::Unlinked,
                    }
                }
            }
            self.overlay.remove_dir(ino)?;
        }
        Ok(())
    }

    /// Moves `(old_parent, old_name)` to `(new_parent, new_name)`,
    /// overwriting an existing empty-directory or absent target the way
    /// POSIX `rename(2)` does (spec §4.4 `rename`). Callers serialize
    /// concurrent renames with the mount-wide rename lock (spec §5); this
    /// method assumes that lock is already held.
    pub fn rename(
        &self,
        old_parent: &Arc<TreeInode>,
        old_name: &PathComponent,
        new_parent: &Arc<TreeInode>,
        new_name: &PathComponent,
    ) -> Result<(), Error> {
        let moved = {
            let mut contents = old_parent.contents.lock();
            contents
                .entries
                .remove(old_name.as_bytes())
                .ok_or_else(|| Error::NotFoundPath(old_name.to_string()))?
        };
        {
            let mut contents = new_parent.contents.lock();
            if let Some(existing) = contents.entry(new_name, self.policy) {
                let existing_is_tree = existing.1.mode & TREE_MODE_BIT != 0;
                if existing_is_tree {
                    let empty = existing
                        .1
                        .inode
                        .map(|ino| {
                            self.overlay
                                .load_dir(ino)
                                .ok()
                                .flatten()
                                .map(|d| d.entries.is_empty())
                                .unwrap_or(true)
                        })
                        .unwrap_or(true);
                    if !empty {
                        return Err(Error::DirectoryNotEmpty(new_name.to_string()));
                    }
                }
            }
            contents.entries.insert(new_name.as_bytes().to_vec(), moved);
        }
        {
            let old_contents = old_parent.contents.lock();
            self.overlay.save_dir(old_parent.ino, &old_contents)?;
        }
        {
            let new_contents = new_parent.contents.lock();
            self.overlay.save_dir(new_parent.ino, &new_contents)?;
        }
        self.materialize_up(old_parent)?;
        self.materialize_up(new_parent)?;

        if let Some(weak) = old_parent.children.lock().remove(old_name) {
            if let Some(strong) = weak.upgrade() {
                match &*strong {
                    Inode::Tree(t) => {
                        *t.location.lock() = Location::Child { parent: new_parent.ino, name: new_name.clone() }
                    }
                    Inode::File(f) => {
                        *f.location.lock() = Location::Child { parent: new_parent.ino, name: new_name.clone() }
                    }
                }
                new_parent.children.lock().insert(new_name.clone(), Arc::downgrade(&strong));
            }
        }
        Ok(())
    }

    /// Repoints an existing child at a different source-control hash/mode
    /// without removing and recreating it (spec §4.5 checkout "replace"
    /// step). Any live inode for the child is dropped from the map so the
    /// next lookup re-demand-loads it against the new target.
    pub fn reconfigure_child(
        &self,
        parent: &Arc<TreeInode>,
        name: &PathComponent,
        mode: u32,
        hash: Option<Vec<u8>>,
    ) -> Result<(), Error> {
        let old_ino = {
            let mut contents = parent.contents.lock();
            let key = contents
                .entry(name, self.policy)
                .map(|(k, _)| k.clone())
                .ok_or_else(|| Error::NotFoundPath(name.to_string()))?;
            let entry = contents.entries.get_mut(&key).expect("looked up above");
            let old_ino = entry.inode.take();
            entry.mode = mode;
            entry.hash = hash;
            self.overlay.save_dir(parent.ino, &contents)?;
            old_ino
        };
        self.materialize_up(parent)?;
        if let Some(weak) = parent.children.lock().remove(name) {
            if let Some(strong) = weak.upgrade() {
                self.entries.lock().remove(&strong.ino());
            }
        }
        if let Some(ino) = old_ino {
            self.entries.lock().remove(&ino);
        }
        Ok(())
    }

    /// Adds a child entry that points at a source-control object without
    /// demand-loading it (spec §4.5 checkout "create" step): files start
    /// `NotLoaded`, directories start unmaterialized, both faulted in lazily
    /// on first lookup the same way a pre-existing tree entry would be.
    pub fn create_child_from_scm(
        &self,
        parent: &Arc<TreeInode>,
        name: &PathComponent,
        mode: u32,
        hash: Vec<u8>,
    ) -> Result<(), Error> {
        let entry = OverlayEntry { mode, inode: None, hash: Some(hash) };
        {
            let mut contents = parent.contents.lock();
            contents.entries.insert(name.as_bytes().to_vec(), entry);
            self.overlay.save_dir(parent.ino, &contents)?;
        }
        self.materialize_up(parent)?;
        Ok(())
    }

    /// Drops inodes with no kernel refcount, no other strong referrer, and
    /// clean/unmaterialized state (spec §4.3 "Unload sweep").
    pub fn unload_sweep(&self) {
        let mut entries = self.entries.lock();
        let doomed: Vec<InodeNumber> = entries
            .iter()
            .filter(|(ino, inode)| {
                **ino != InodeNumber::ROOT
                    && inode.fs_refcount().load(Ordering::SeqCst) == 0
                    && Arc::strong_count(inode) == 1
                    && inode.is_loaded_clean()
            })
            .map(|(ino, _)| *ino)
            .collect();
        for ino in doomed {
            entries.remove(&ino);
        }
    }

    /// Serializes kernel-referenced inodes for handoff (spec §4.3 `shutdown`).
    pub fn shutdown(&self, do_takeover: bool) -> SerializedInodeMap {
        self.shutdown.store(true, Ordering::SeqCst);
        if !do_takeover {
            return SerializedInodeMap::default();
        }
        let inos: Vec<InodeNumber> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, inode)| inode.fs_refcount().load(Ordering::SeqCst) > 0)
            .map(|(ino, _)| *ino)
            .collect();
        let entries = inos
            .into_iter()
            .filter_map(|ino| self.get_path_for_inode(ino).map(|path| (path, ino)))
            .collect();
        SerializedInodeMap { entries }
    }

    /// Pre-registers `(path, inode_number)` pairs from a predecessor's
    /// `shutdown(do_takeover=true)` so the same paths resolve to the same
    /// numbers (spec §4.3 `initialize_from_takeover`, scenario F). Intermediate
    /// directories along each path are pinned as trees; the leaf's actual
    /// kind is resolved normally the next time it's loaded.
    pub fn initialize_from_takeover(&self, map: SerializedInodeMap) -> Result<(), Error> {
        for (path, ino) in map.entries {
            let mut current_ino = InodeNumber::ROOT;
            for raw in path.components() {
                let component =
                    PathComponent::new(raw.to_vec()).map_err(|e| Error::Internal(e.to_string()))?;
                let mut contents = self.overlay.load_dir(current_ino)?.unwrap_or_default();
                let slot = contents
                    .entries
                    .entry(component.as_bytes().to_vec())
                    .or_insert(OverlayEntry { mode: TREE_MODE_BIT, inode: None, hash: None });
                if slot.inode.is_none() {
                    slot.inode = Some(ino);
                }
                let next_ino = slot.inode.unwrap();
                self.overlay.save_dir(current_ino, &contents)?;
                current_ino = next_ino;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EmptySource;
    #[async_trait]
    impl ObjectSource for EmptySource {
        async fn get_tree(&self, _id: &ObjectId, _ctx: &FetchContext) -> Result<Tree, Error> {
            Ok(Tree::from_entries(Vec::new(), CasePolicy::Sensitive).unwrap())
        }
        async fn get_blob(&self, _id: &ObjectId, _ctx: &FetchContext) -> Result<Blob, Error> {
            unimplemented!()
        }
        async fn get_blob_sha1(&self, _id: &ObjectId, _ctx: &FetchContext) -> Result<Sha1, Error> {
            unimplemented!()
        }
        async fn get_root_tree(
            &self,
            _root: &edenfs_castore::RootId,
            _ctx: &FetchContext,
        ) -> Result<Tree, Error> {
            unimplemented!()
        }
        fn parse_root_id(&self, s: &str) -> Result<edenfs_castore::RootId, Error> {
            Ok(edenfs_castore::RootId(s.to_string()))
        }
        fn render_root_id(&self, root: &edenfs_castore::RootId) -> String {
            root.0.clone()
        }
    }

    fn test_map() -> (tempfile::TempDir, InodeMap) {
        let dir = tempfile::tempdir().unwrap();
        let overlay = Arc::new(Overlay::init(dir.path(), |_| {}).unwrap());
        let root_tree_id = ObjectId::new(vec![0xAB]).unwrap();
        let map = InodeMap::new(
            overlay,
            Arc::new(EmptySource),
            Arc::new(NullInvalidator),
            CasePolicy::Sensitive,
            Some(&root_tree_id),
        )
        .unwrap();
        (dir, map)
    }

    #[test]
    fn root_has_inode_one() {
        let (_dir, map) = test_map();
        assert_eq!(map.root().ino().get(), 1);
    }

    #[test]
    fn get_path_for_root_is_root_path() {
        let (_dir, map) = test_map();
        let path = map.get_path_for_inode(InodeNumber::ROOT).unwrap();
        assert!(path.is_root());
    }

    #[tokio::test]
    async fn loading_unknown_child_is_not_found() {
        let (_dir, map) = test_map();
        let root = map.root();
        let name = PathComponent::new("missing").unwrap();
        let ctx = FetchContext::new(0, edenfs_castore::FetchCause::Channel, "test");
        let err = map.get_or_load_child(&root, &name, &ctx).await;
        assert!(err.is_err());
    }

    #[test]
    fn mkdir_then_mknod_then_rmdir() {
        let (_dir, map) = test_map();
        let root = map.root();
        let dirname = PathComponent::new("src").unwrap();
        let child = map.mkdir(&root, &dirname, 0o755).unwrap();
        assert!(child.is_materialized());
        assert!(root.is_materialized());

        let filename = PathComponent::new("main.rs").unwrap();
        let file = map.mknod_regular(&child, &filename, 0o644).unwrap();
        assert!(file.is_materialized());

        assert!(map.remove_child(&child, &filename, false).is_ok());
        assert!(map.remove_child(&root, &dirname, true).is_ok());
    }

    #[test]
    fn rename_moves_entry_between_directories() {
        let (_dir, map) = test_map();
        let root = map.root();
        let a = map.mkdir(&root, &PathComponent::new("a").unwrap(), 0o755).unwrap();
        let b = map.mkdir(&root, &PathComponent::new("b").unwrap(), 0o755).unwrap();
        map.mknod_regular(&a, &PathComponent::new("f").unwrap(), 0o644).unwrap();

        map.rename(
            &a,
            &PathComponent::new("f").unwrap(),
            &b,
            &PathComponent::new("g").unwrap(),
        )
        .unwrap();

        assert!(a.entries().is_empty());
        assert_eq!(b.entries().len(), 1);
        assert_eq!(b.entries()[0].0.as_bytes(), b"g");
    }

    #[test]
    fn unload_sweep_keeps_root() {
        let (_dir, map) = test_map();
        map.unload_sweep();
        assert!(map.lookup_tree(InodeNumber::ROOT).is_ok());
    }

    #[test]
    fn takeover_round_trip_reuses_inode_numbers() {
        let (_dir, map) = test_map();
        let root = map.root();
        let child = map.mkdir(&root, &PathComponent::new("dir").unwrap(), 0o755).unwrap();
        let file = map
            .mknod_regular(&child, &PathComponent::new("f").unwrap(), 0o644)
            .unwrap();
        let serialized = map.shutdown(true);
        assert!(serialized.entries.iter().any(|(_, ino)| *ino == file.ino()));

        let (_dir2, map2) = test_map();
        map2.initialize_from_takeover(serialized).unwrap();
        let root_contents = map2.overlay.load_dir(InodeNumber::ROOT).unwrap().unwrap();
        assert!(root_contents.entries.contains_key(b"dir".as_slice()));
    }
}
