//! End-to-end lifecycle tests, one per scenario in the mount's acceptance
//! walkthrough: a fresh checkout, a forced revert of a local edit, a clean
//! update between two tracked revisions, an ignore-aware status listing, and
//! a graceful-restart handoff. Scenario E (journal accumulation) already has
//! its own coverage in `journal.rs`'s unit tests and isn't duplicated here.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use edenfs_castore::{
    Blob, CasePolicy, EntryKind, FetchContext, ObjectId, PathComponent, RootId, Sha1, Tree, TreeEntry,
};
use edenfs_core::channel::{ChannelDispatcher, SetAttr, StopData};
use edenfs_core::checkout::CheckoutMode;
use edenfs_core::config::MountConfig;
use edenfs_core::diff::DiffOptions;
use edenfs_core::errors::Error;
use edenfs_core::mount::Mount;
use edenfs_core::objectsource::ObjectSource;

/// An in-memory object store keyed by content hash, with named roots. Builds
/// up a fixture with `put_blob`/`put_tree`/`set_root`; `ObjectId`s are
/// derived straight from `Sha1::of` the same way the real backing stores in
/// the examples derive theirs, so two identical blobs/trees collapse to one
/// entry.
#[derive(Default)]
struct InMemorySource {
    blobs: HashMap<ObjectId, Blob>,
    trees: HashMap<ObjectId, Tree>,
    roots: HashMap<String, Tree>,
}

impl InMemorySource {
    fn put_blob(&mut self, content: &[u8]) -> ObjectId {
        let id = ObjectId::new(Sha1::of(content).as_bytes().to_vec()).unwrap();
        self.blobs.insert(id.clone(), Blob::from(content.to_vec()));
        id
    }

    fn file_entry(&mut self, name: &str, content: &[u8]) -> TreeEntry {
        let object_id = self.put_blob(content);
        TreeEntry { name: PathComponent::new(name).unwrap(), mode: 0o644, kind: EntryKind::Regular, object_id }
    }

    fn put_tree(&mut self, entries: Vec<TreeEntry>) -> (ObjectId, Tree) {
        let tree = Tree::from_entries(entries, CasePolicy::Sensitive).unwrap();
        let id = ObjectId::new(Sha1::of(&tree.encode()).as_bytes().to_vec()).unwrap();
        self.trees.insert(id.clone(), tree.clone());
        (id, tree)
    }

    fn dir_entry(&mut self, name: &str, entries: Vec<TreeEntry>) -> TreeEntry {
        let (object_id, _tree) = self.put_tree(entries);
        TreeEntry { name: PathComponent::new(name).unwrap(), mode: 0o755, kind: EntryKind::Tree, object_id }
    }

    fn set_root(&mut self, name: &str, entries: Vec<TreeEntry>) {
        let tree = Tree::from_entries(entries, CasePolicy::Sensitive).unwrap();
        self.roots.insert(name.to_string(), tree);
    }
}

#[async_trait]
impl ObjectSource for InMemorySource {
    async fn get_tree(&self, id: &ObjectId, _ctx: &FetchContext) -> Result<Tree, Error> {
        self.trees.get(id).cloned().ok_or_else(|| Error::NotFoundObject(id.clone()))
    }
    async fn get_blob(&self, id: &ObjectId, _ctx: &FetchContext) -> Result<Blob, Error> {
        self.blobs.get(id).cloned().ok_or_else(|| Error::NotFoundObject(id.clone()))
    }
    async fn get_blob_sha1(&self, id: &ObjectId, _ctx: &FetchContext) -> Result<Sha1, Error> {
        self.blobs.get(id).map(|b| Sha1::of(b)).ok_or_else(|| Error::NotFoundObject(id.clone()))
    }
    async fn get_root_tree(&self, root: &RootId, _ctx: &FetchContext) -> Result<Tree, Error> {
        self.roots.get(&root.0).cloned().ok_or_else(|| Error::NotFoundPath(root.0.clone()))
    }
    fn parse_root_id(&self, s: &str) -> Result<RootId, Error> {
        Ok(RootId(s.to_string()))
    }
    fn render_root_id(&self, root: &RootId) -> String {
        root.0.clone()
    }
}

fn build_mount(config_dir: &Path, parent_root_id: &str, source: Arc<dyn ObjectSource>) -> Arc<Mount> {
    let overlay_dir = config_dir.join("overlay");
    let config = MountConfig {
        parent_root_id: parent_root_id.to_string(),
        case_policy: CasePolicy::Sensitive,
        mount_path: config_dir.join("checkout"),
        overlay_dir,
        journal_memory_limit_bytes: 1 << 20,
    };
    let config_path = config_dir.join("config.json");
    config.save(&config_path).unwrap();
    Mount::initialize(config_path, source).unwrap()
}

fn name(s: &str) -> PathComponent {
    PathComponent::new(s).unwrap()
}

/// Scenario A: a freshly initialized mount checks out its first real
/// revision from nothing, populating the working copy with every tracked
/// file and directory.
#[tokio::test]
async fn scenario_a_initial_checkout_populates_working_copy() {
    let dir = tempfile::tempdir().unwrap();
    let mut fixture = InMemorySource::default();
    fixture.set_root("empty", Vec::new());
    let readme = fixture.file_entry("README", b"hello world");
    let main_rs = fixture.file_entry("main.rs", b"fn main() {}");
    let src = fixture.dir_entry("src", vec![main_rs]);
    fixture.set_root("r1", vec![readme, src]);

    let mount = build_mount(dir.path(), "empty", Arc::new(fixture));
    mount.start_channel(false).await.unwrap();

    let result = mount
        .checkout(&RootId("empty".into()), &RootId("r1".into()), CheckoutMode::Normal)
        .await
        .unwrap();
    assert!(result.conflicts.is_empty());

    let readme_attr = mount.dispatcher.lookup(edenfs_castore::InodeNumber::ROOT, &name("README")).await.unwrap();
    let readme_bytes = mount.dispatcher.read(readme_attr.ino, 0, 64).await.unwrap();
    assert_eq!(readme_bytes, b"hello world");

    let src_attr = mount.dispatcher.lookup(edenfs_castore::InodeNumber::ROOT, &name("src")).await.unwrap();
    assert!(src_attr.is_dir);
    let main_attr = mount.dispatcher.lookup(src_attr.ino, &name("main.rs")).await.unwrap();
    let main_bytes = mount.dispatcher.read(main_attr.ino, 0, 64).await.unwrap();
    assert_eq!(main_bytes, b"fn main() {}");
}

/// Scenario B: checking the currently-checked-out revision out against
/// itself under `Force` discards a local edit and still records the
/// conflict it overwrote.
#[tokio::test]
async fn scenario_b_force_checkout_discards_local_edit_and_reports_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let mut fixture = InMemorySource::default();
    fixture.set_root("empty", Vec::new());
    let readme = fixture.file_entry("README", b"hello world");
    fixture.set_root("r1", vec![readme]);

    let mount = build_mount(dir.path(), "empty", Arc::new(fixture));
    mount.start_channel(false).await.unwrap();
    mount
        .checkout(&RootId("empty".into()), &RootId("r1".into()), CheckoutMode::Normal)
        .await
        .unwrap();

    let readme_attr = mount.dispatcher.lookup(edenfs_castore::InodeNumber::ROOT, &name("README")).await.unwrap();
    mount.dispatcher.write(readme_attr.ino, 0, b"local edit").await.unwrap();
    mount
        .dispatcher
        .setattr(readme_attr.ino, SetAttr { size: Some(b"local edit".len() as u64), ..Default::default() })
        .await
        .unwrap();

    let result = mount
        .checkout(&RootId("r1".into()), &RootId("r1".into()), CheckoutMode::Force)
        .await
        .unwrap();
    assert_eq!(result.conflicts.len(), 1);
    assert_eq!(result.conflicts[0].path, edenfs_castore::RelativePathBuf::from_components([name("README")].iter()));
    assert_eq!(result.conflicts[0].kind, edenfs_core::checkout::ConflictKind::ModifiedModified);

    // Force-mode replace removes the edited entry and creates a fresh one for
    // the same name, so the post-checkout ino isn't necessarily `readme_attr.ino`.
    let reverted_attr = mount.dispatcher.lookup(edenfs_castore::InodeNumber::ROOT, &name("README")).await.unwrap();
    let reverted = mount.dispatcher.read(reverted_attr.ino, 0, 64).await.unwrap();
    assert_eq!(reverted, b"hello world");
}

/// Scenario C: updating between two tracked revisions with no local
/// modifications in the way applies cleanly, with no conflicts.
#[tokio::test]
async fn scenario_c_clean_update_between_revisions() {
    let dir = tempfile::tempdir().unwrap();
    let mut fixture = InMemorySource::default();
    fixture.set_root("empty", Vec::new());
    let readme_v1 = fixture.file_entry("README", b"hello v1");
    fixture.set_root("r1", vec![readme_v1]);
    let readme_v2 = fixture.file_entry("README", b"hello v2");
    fixture.set_root("r2", vec![readme_v2]);

    let mount = build_mount(dir.path(), "empty", Arc::new(fixture));
    mount.start_channel(false).await.unwrap();
    mount
        .checkout(&RootId("empty".into()), &RootId("r1".into()), CheckoutMode::Normal)
        .await
        .unwrap();

    let result = mount
        .checkout(&RootId("r1".into()), &RootId("r2".into()), CheckoutMode::Normal)
        .await
        .unwrap();
    assert!(result.conflicts.is_empty());

    let readme_attr = mount.dispatcher.lookup(edenfs_castore::InodeNumber::ROOT, &name("README")).await.unwrap();
    let contents = mount.dispatcher.read(readme_attr.ino, 0, 64).await.unwrap();
    assert_eq!(contents, b"hello v2");
}

/// Scenario D: a status listing with ignored files requested reports
/// gitignore-excluded entries separately from genuinely untracked ones, and
/// recurses into an excluded directory's contents instead of collapsing
/// them into one entry.
#[tokio::test]
async fn scenario_d_diff_separates_ignored_from_added() {
    let dir = tempfile::tempdir().unwrap();
    let mut fixture = InMemorySource::default();
    fixture.set_root("empty", Vec::new());

    let mount = build_mount(dir.path(), "empty", Arc::new(fixture));
    mount.start_channel(false).await.unwrap();

    let root = edenfs_castore::InodeNumber::ROOT;
    let gitignore = mount.dispatcher.create(root, &name(".gitignore"), 0o644).await.unwrap();
    mount.dispatcher.write(gitignore.ino, 0, b"/1.txt\nignore.txt\njunk/\n").await.unwrap();

    let f1 = mount.dispatcher.create(root, &name("1.txt"), 0o644).await.unwrap();
    mount.dispatcher.write(f1.ino, 0, b"a").await.unwrap();
    let f2 = mount.dispatcher.create(root, &name("ignore.txt"), 0o644).await.unwrap();
    mount.dispatcher.write(f2.ino, 0, b"b").await.unwrap();

    let junk = mount.dispatcher.mkdir(root, &name("junk"), 0o755).await.unwrap();
    let important = mount.dispatcher.create(junk.ino, &name("important.txt"), 0o644).await.unwrap();
    mount.dispatcher.write(important.ino, 0, b"c").await.unwrap();

    let src = mount.dispatcher.mkdir(root, &name("src"), 0o755).await.unwrap();
    let src_file = mount.dispatcher.create(src.ino, &name("1.txt"), 0o644).await.unwrap();
    mount.dispatcher.write(src_file.ino, 0, b"d").await.unwrap();

    let collected = mount.diff(&RootId("empty".into()), DiffOptions { list_ignored: true }).await.unwrap();

    let mut ignored: Vec<String> = collected.ignored.lock().iter().map(|p| p.to_string()).collect();
    ignored.sort();
    assert_eq!(ignored, vec!["1.txt".to_string(), "ignore.txt".to_string(), "junk/important.txt".to_string()]);

    let mut added: Vec<String> = collected.added.lock().iter().map(|p| p.to_string()).collect();
    added.sort();
    assert_eq!(added, vec![".gitignore".to_string(), "src/1.txt".to_string()]);
}

/// Scenario F: a graceful restart hands the predecessor's kernel-referenced
/// inode numbers to the successor, which resumes serving the same paths at
/// the same numbers instead of renumbering them.
#[tokio::test]
async fn scenario_f_takeover_preserves_inode_numbers() {
    let dir = tempfile::tempdir().unwrap();
    let mut fixture = InMemorySource::default();
    fixture.set_root("empty", Vec::new());
    let source: Arc<dyn ObjectSource> = Arc::new(fixture);

    let overlay_dir = dir.path().join("overlay");
    let config = MountConfig {
        parent_root_id: "empty".to_string(),
        case_policy: CasePolicy::Sensitive,
        mount_path: dir.path().join("checkout"),
        overlay_dir,
        journal_memory_limit_bytes: 1 << 20,
    };
    let config_path = dir.path().join("config.json");
    config.save(&config_path).unwrap();

    let (serialized, stop_data, original_ino, original_contents) = {
        let mount = Mount::initialize(config_path.clone(), source.clone()).unwrap();
        mount.start_channel(false).await.unwrap();

        let root = edenfs_castore::InodeNumber::ROOT;
        let foo = mount.dispatcher.create(root, &name("foo.txt"), 0o644).await.unwrap();
        mount.dispatcher.write(foo.ino, 0, b"kept across restart").await.unwrap();
        mount.inode_map.inc_fs_refcount(foo.ino).unwrap();

        let stop_data = mount.dispatcher.takeover_stop();
        let serialized = mount.unmount(true).await.unwrap();
        let contents = mount.dispatcher.read(foo.ino, 0, 64).await.unwrap();
        (serialized, stop_data, foo.ino, contents)
    };

    let mount_b = Mount::initialize(config_path, source).unwrap();
    mount_b
        .takeover_channel(serialized, StopData { raw_device_handle: stop_data.raw_device_handle, settings: stop_data.settings })
        .await
        .unwrap();

    let root = edenfs_castore::InodeNumber::ROOT;
    let attr = mount_b.dispatcher.lookup(root, &name("foo.txt")).await.unwrap();
    assert_eq!(attr.ino, original_ino);
    let contents = mount_b.dispatcher.read(attr.ino, 0, 64).await.unwrap();
    assert_eq!(contents, original_contents);
}
