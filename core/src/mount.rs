//! Per-mount lifecycle state machine (spec §4.10). Grounded on
//! `EdenMount.cpp`'s state machine and on the teacher's `tvix-store Mount`
//! subcommand for the "build every collaborator, then wire them together"
//! shape of a startup routine; the states themselves come straight from
//! spec §4.10 since nothing in the teacher (a stateless gRPC server with no
//! mount concept) models a lifecycle like this.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use edenfs_castore::{CasePolicy, ObjectId, PathComponent};
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{watch, Mutex as AsyncMutex};

use crate::channel::Dispatcher;
use crate::checkout::{CheckoutEngine, CheckoutMode, CheckoutResult, ParentStore};
use crate::config::MountConfig;
use crate::diff::{diff_against_tree, CollectingDiff, DiffOptions};
use crate::errors::Error;
use crate::inode::{InodeMap, Invalidator, NullInvalidator};
use crate::journal::Journal;
use crate::objectsource::ObjectSource;
use crate::overlay::Overlay;

const SYMLINK_MODE_BIT: u32 = 0o120000;

/// spec §4.10's lifecycle. `InitError`/`ChannelError` are terminal failure
/// states a mount can land in instead of progressing; `Destroying` is
/// reachable from any of the others and always precedes final removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountState {
    Uninitialized,
    Initializing,
    Initialized,
    Starting,
    Running,
    ShuttingDown,
    ShutDown,
    InitError(String),
    ChannelError(String),
    Destroying,
}

impl MountState {
    fn allows_checkout(&self) -> bool {
        matches!(self, MountState::Running)
    }

    fn allows_diff(&self) -> bool {
        matches!(self, MountState::Initialized | MountState::Running)
    }
}

/// The 64-bit handoff identity a takeover exchanges (spec §4.10): the high
/// 48 bits identify this process incarnation (derived from pid and start
/// time so two incarnations of the same binary never collide), the low 16
/// bits count mounts started within that incarnation.
fn next_mount_generation() -> u64 {
    static PROCESS_COUNTER: AtomicU16 = AtomicU16::new(0);
    static PROCESS_HIGH_BITS: AtomicU64 = AtomicU64::new(0);

    let mut high = PROCESS_HIGH_BITS.load(Ordering::SeqCst);
    if high == 0 {
        let pid = std::process::id() as u64;
        let started = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let candidate = ((pid & 0xFFFF) << 32) | (started & 0xFFFF_FFFF);
        let candidate = if candidate == 0 { 1 } else { candidate };
        match PROCESS_HIGH_BITS.compare_exchange(0, candidate, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => high = candidate,
            Err(existing) => high = existing,
        }
    }
    let low = PROCESS_COUNTER.fetch_add(1, Ordering::SeqCst) as u64;
    (high << 16) | low
}

/// Owns everything a checked-out working copy needs: the inode graph, the
/// overlay, the journal, the checkout engine, and the channel dispatcher a
/// kernel bridge talks to. One instance per mounted repository.
pub struct Mount {
    config_path: PathBuf,
    config: SyncMutex<MountConfig>,
    pub inode_map: Arc<InodeMap>,
    pub overlay: Arc<Overlay>,
    pub source: Arc<dyn ObjectSource>,
    pub journal: Arc<Journal>,
    pub checkout_engine: Arc<CheckoutEngine>,
    pub dispatcher: Arc<Dispatcher>,
    policy: CasePolicy,
    generation: u64,
    state: SyncMutex<MountState>,
    unmount_started: AsyncMutex<bool>,
    unmount_done: watch::Sender<bool>,
}

impl ParentStore for Mount {
    fn set_parent(&self, root_to: &str) -> Result<(), Error> {
        let mut config = self.config.lock();
        config.parent_root_id = root_to.to_string();
        config.save(&self.config_path)
    }
}

impl Mount {
    /// Builds every collaborator but does not yet touch the filesystem
    /// beyond reading config/overlay metadata (spec §4.10 `Uninitialized`
    /// -> `Initializing` -> `Initialized`).
    pub fn initialize(config_path: PathBuf, source: Arc<dyn ObjectSource>) -> Result<Arc<Self>, Error> {
        let config = MountConfig::load(&config_path)?;
        let overlay = Arc::new(Overlay::init(&config.overlay_dir, |_| {})?);
        // The backing store only resolves a root id to its `Tree` content,
        // never to that tree's own object id (spec §6's `BackingStore` has no
        // such accessor), so there is no real tree hash to seed the root
        // directory with up front. Leaving it unseeded makes a pristine
        // mount's root populate as empty until the first checkout walks it
        // against a real `tree_from`/`tree_to` pair and fills in its children.
        let invalidator: Arc<dyn Invalidator> = Arc::new(NullInvalidator);
        let inode_map = Arc::new(InodeMap::new(overlay.clone(), source.clone(), invalidator, config.case_policy, None)?);
        let journal = Arc::new(Journal::new(config.journal_memory_limit_bytes));
        let checkout_engine = Arc::new(CheckoutEngine::new(
            inode_map.clone(),
            source.clone(),
            overlay.clone(),
            config.case_policy,
            journal.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(inode_map.clone(), overlay.clone(), source.clone(), config.case_policy));
        let (unmount_done, _) = watch::channel(false);
        let policy = config.case_policy;
        Ok(Arc::new(Mount {
            config_path,
            config: SyncMutex::new(config),
            inode_map,
            overlay,
            source,
            journal,
            checkout_engine,
            dispatcher,
            policy,
            generation: next_mount_generation(),
            state: SyncMutex::new(MountState::Initialized),
            unmount_started: AsyncMutex::new(false),
            unmount_done,
        }))
    }

    pub fn state(&self) -> MountState {
        self.state.lock().clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn mount_path(&self) -> PathBuf {
        self.config.lock().mount_path.clone()
    }

    fn set_state(&self, state: MountState) {
        *self.state.lock() = state;
    }

    /// spec §4.10 `Initialized` -> `Starting` -> `Running`. A real kernel
    /// bridge is an external collaborator; this only flips the state once
    /// the in-process side (the dispatcher) is ready to answer it, then
    /// builds the `.eden` magic directory (spec §4.10/§9).
    pub async fn start_channel(self: &Arc<Self>, _read_only: bool) -> Result<(), Error> {
        if *self.state.lock() != MountState::Initialized {
            return Err(Error::Internal("start_channel requires Initialized state".into()));
        }
        self.set_state(MountState::Starting);
        if let Err(e) = self.setup_eden_dir() {
            self.set_state(MountState::ChannelError(e.to_string()));
            return Err(e);
        }
        self.set_state(MountState::Running);
        Ok(())
    }

    /// Resumes from a predecessor's `shutdown(do_takeover=true)` instead of
    /// starting fresh (spec §4.10 scenario F / `takeover_channel`).
    pub async fn takeover_channel(
        self: &Arc<Self>,
        serialized: crate::inode::SerializedInodeMap,
        _stop_data: crate::channel::StopData,
    ) -> Result<(), Error> {
        if *self.state.lock() != MountState::Initialized {
            return Err(Error::Internal("takeover_channel requires Initialized state".into()));
        }
        self.set_state(MountState::Starting);
        self.inode_map.initialize_from_takeover(serialized)?;
        if let Err(e) = self.setup_eden_dir() {
            self.set_state(MountState::ChannelError(e.to_string()));
            return Err(e);
        }
        self.set_state(MountState::Running);
        Ok(())
    }

    /// Builds the `root`/`socket`/`client`/`this-dir` symlinks under
    /// `.eden` (spec §4.10/§9). Idempotent: a directory that already holds
    /// `this-dir` is left untouched so repeated calls from both
    /// `start_channel` and `takeover_channel` paths don't collide.
    fn setup_eden_dir(&self) -> Result<(), Error> {
        let root = self.inode_map.root();
        let eden_name = PathComponent::new("eden".as_bytes().to_vec()).map_err(|e| Error::Internal(e.to_string()))?;
        if root.entries().into_iter().any(|(n, _)| n.as_bytes() == eden_name.as_bytes()) {
            return Ok(());
        }
        let eden_dir = self.inode_map.mkdir(&root, &eden_name, 0o755)?;
        let mount_path = self.mount_path();
        let links = [
            ("root", mount_path.to_string_lossy().into_owned()),
            ("socket", mount_path.join(".eden-socket").to_string_lossy().into_owned()),
            ("client", self.config.lock().overlay_dir.to_string_lossy().into_owned()),
            ("this-dir", mount_path.join(".eden").to_string_lossy().into_owned()),
        ];
        for (name, target) in links {
            let component = PathComponent::new(name.as_bytes().to_vec()).map_err(|e| Error::Internal(e.to_string()))?;
            let file = self.inode_map.mknod_regular(&eden_dir, &component, SYMLINK_MODE_BIT | 0o777)?;
            self.overlay.write(file.ino(), 0, target.as_bytes())?;
        }
        Ok(())
    }

    /// Runs a checkout transition; requires `Running` (spec §4.10's
    /// contract table).
    pub async fn checkout(
        &self,
        root_from: &edenfs_castore::RootId,
        root_to: &edenfs_castore::RootId,
        mode: CheckoutMode,
    ) -> Result<CheckoutResult, Error> {
        if !self.state.lock().allows_checkout() {
            return Err(Error::Internal("checkout requires a running mount".into()));
        }
        self.checkout_engine
            .checkout(root_from, root_to, mode, Duration::from_secs(30), self, self.dispatcher.as_ref())
            .await
    }

    /// Compares the working copy against a tree; allowed at `Initialized`
    /// too since it doesn't touch the channel (spec §4.10's contract table).
    pub async fn diff(&self, against: &edenfs_castore::RootId, options: DiffOptions) -> Result<CollectingDiff, Error> {
        if !self.state.lock().allows_diff() {
            return Err(Error::Internal("diff requires an initialized mount".into()));
        }
        let fetch = no_op_fetch_ctx();
        let tree = self.source.get_root_tree(against, &fetch).await?;
        let collector = CollectingDiff::default();
        diff_against_tree(
            &self.inode_map,
            self.source.as_ref(),
            &self.overlay,
            self.policy,
            &tree,
            options,
            tokio_util::sync::CancellationToken::new(),
            &collector,
        )
        .await?;
        Ok(collector)
    }

    /// Idempotent unmount: concurrent callers all await the same underlying
    /// work instead of racing each other through the drain (spec §4.10's
    /// "unmount is idempotent; concurrent callers share one outcome").
    pub async fn unmount(self: &Arc<Self>, do_takeover: bool) -> Result<crate::inode::SerializedInodeMap, Error> {
        let mut started = self.unmount_started.lock().await;
        if *started {
            drop(started);
            let mut rx = self.unmount_done.subscribe();
            let _ = rx.wait_for(|done| *done).await;
            return Ok(self.inode_map.shutdown(false));
        }
        *started = true;
        drop(started);

        self.set_state(MountState::ShuttingDown);
        self.journal.flush();
        let serialized = self.inode_map.shutdown(do_takeover);
        self.overlay.flush_pending_async();
        self.set_state(MountState::ShutDown);
        let _ = self.unmount_done.send(true);
        Ok(serialized)
    }

    /// Collapses any non-terminal state straight into a shut-down,
    /// unrecoverable mount (spec §4.10: "destroy is reachable from any
    /// state").
    pub async fn destroy(self: &Arc<Self>) -> Result<(), Error> {
        self.set_state(MountState::Destroying);
        let _ = self.unmount(false).await;
        Ok(())
    }
}

fn no_op_fetch_ctx() -> edenfs_castore::FetchContext {
    edenfs_castore::FetchContext::new(0, edenfs_castore::FetchCause::Channel, "mount")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use edenfs_castore::{Blob, Sha1, Tree};

    struct EmptySource;
    #[async_trait]
    impl ObjectSource for EmptySource {
        async fn get_tree(&self, _id: &ObjectId, _ctx: &edenfs_castore::FetchContext) -> Result<Tree, Error> {
            Ok(Tree::from_entries(Vec::new(), CasePolicy::Sensitive).unwrap())
        }
        async fn get_blob(&self, _id: &ObjectId, _ctx: &edenfs_castore::FetchContext) -> Result<Blob, Error> {
            unimplemented!()
        }
        async fn get_blob_sha1(&self, _id: &ObjectId, _ctx: &edenfs_castore::FetchContext) -> Result<Sha1, Error> {
            unimplemented!()
        }
        async fn get_root_tree(&self, _root: &edenfs_castore::RootId, _ctx: &edenfs_castore::FetchContext) -> Result<Tree, Error> {
            Ok(Tree::from_entries(Vec::new(), CasePolicy::Sensitive).unwrap())
        }
        fn parse_root_id(&self, s: &str) -> Result<edenfs_castore::RootId, Error> {
            Ok(edenfs_castore::RootId(s.to_string()))
        }
        fn render_root_id(&self, root: &edenfs_castore::RootId) -> String {
            root.0.clone()
        }
    }

    fn test_mount() -> (tempfile::TempDir, Arc<Mount>) {
        let dir = tempfile::tempdir().unwrap();
        let overlay_dir = dir.path().join("overlay");
        std::fs::create_dir_all(&overlay_dir).unwrap();
        let config = MountConfig {
            parent_root_id: "0000".into(),
            case_policy: CasePolicy::Sensitive,
            mount_path: dir.path().join("checkout"),
            overlay_dir,
            journal_memory_limit_bytes: 1 << 20,
        };
        let config_path = dir.path().join("config.json");
        config.save(&config_path).unwrap();
        let mount = Mount::initialize(config_path, Arc::new(EmptySource)).unwrap();
        (dir, mount)
    }

    #[test]
    fn initialize_reaches_initialized_state() {
        let (_dir, mount) = test_mount();
        assert_eq!(mount.state(), MountState::Initialized);
    }

    #[tokio::test]
    async fn start_channel_builds_eden_dir_and_reaches_running() {
        let (_dir, mount) = test_mount();
        mount.start_channel(false).await.unwrap();
        assert_eq!(mount.state(), MountState::Running);
        let root = mount.inode_map.root();
        assert!(root.entries().into_iter().any(|(n, _)| n.as_bytes() == b"eden"));
    }

    #[tokio::test]
    async fn checkout_rejected_before_running() {
        let (_dir, mount) = test_mount();
        let root_id = edenfs_castore::RootId("0000".into());
        let err = mount.checkout(&root_id, &root_id, CheckoutMode::DryRun).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn concurrent_unmounts_share_one_outcome() {
        let (_dir, mount) = test_mount();
        mount.start_channel(false).await.unwrap();
        let (a, b) = tokio::join!(mount.unmount(false), mount.unmount(false));
        assert!(a.is_ok());
        assert!(b.is_ok());
        assert_eq!(mount.state(), MountState::ShutDown);
    }

    #[test]
    fn mount_generations_are_unique_and_monotonic_within_process() {
        let a = next_mount_generation();
        let b = next_mount_generation();
        assert_ne!(a, b);
        assert_eq!(a >> 16, b >> 16);
    }
}
