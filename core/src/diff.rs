//! Compares a source-control tree against the live working copy (spec §4.6).
//! The recursive sorted merge-walk is grounded on the teacher's
//! `directoryservice::utils::traverse_directory` (enqueue children, never
//! revisit a directory, surface per-node errors without aborting the whole
//! walk); unlike that BFS-over-one-tree helper this walks two sides at once
//! and distinguishes tracked-only, live-only, and both-present names.

use std::sync::Arc;

use edenfs_castore::{CasePolicy, FetchContext, ObjectId, PathComponent, RelativePath, RelativePathBuf, Tree, TreeEntry};
use tokio_util::sync::CancellationToken;

use crate::errors::Error;
use crate::ignore::{FileType, GitIgnoreStack, Verdict};
use crate::inode::{InodeMap, TreeInode};
use crate::objectsource::ObjectSource;
use crate::overlay::{Overlay, OverlayEntry};

const TREE_MODE_BIT: u32 = 0o40000;

pub trait DiffCallback: Send + Sync {
    fn added_file(&self, path: &RelativePath);
    fn removed_file(&self, path: &RelativePath, scm_entry: &TreeEntry);
    fn modified_file(&self, path: &RelativePath, scm_entry: &TreeEntry);
    fn ignored_file(&self, path: &RelativePath);
    fn diff_error(&self, path: &RelativePath, error: &Error);
}

/// A `DiffCallback` that just accumulates results; handy for callers (e.g.
/// `status`) that want the whole result set rather than a streaming report.
#[derive(Default)]
pub struct CollectingDiff {
    pub added: parking_lot::Mutex<Vec<RelativePathBuf>>,
    pub removed: parking_lot::Mutex<Vec<RelativePathBuf>>,
    pub modified: parking_lot::Mutex<Vec<RelativePathBuf>>,
    pub ignored: parking_lot::Mutex<Vec<RelativePathBuf>>,
    pub errors: parking_lot::Mutex<Vec<(RelativePathBuf, String)>>,
}

impl DiffCallback for CollectingDiff {
    fn added_file(&self, path: &RelativePath) {
        self.added.lock().push(path.to_owned());
    }
    fn removed_file(&self, path: &RelativePath, _scm_entry: &TreeEntry) {
        self.removed.lock().push(path.to_owned());
    }
    fn modified_file(&self, path: &RelativePath, _scm_entry: &TreeEntry) {
        self.modified.lock().push(path.to_owned());
    }
    fn ignored_file(&self, path: &RelativePath) {
        self.ignored.lock().push(path.to_owned());
    }
    fn diff_error(&self, path: &RelativePath, error: &Error) {
        self.errors.lock().push((path.to_owned(), error.to_string()));
    }
}

pub struct DiffOptions {
    pub list_ignored: bool,
}

struct DiffCtx<'a> {
    inode_map: &'a InodeMap,
    source: &'a dyn ObjectSource,
    overlay: &'a Overlay,
    policy: CasePolicy,
    fetch: FetchContext,
    options: DiffOptions,
    cancel: CancellationToken,
    callback: &'a dyn DiffCallback,
}

fn is_hidden(name: &PathComponent) -> bool {
    name.as_bytes() == b".hg" || name.as_bytes() == b".eden"
}

/// Diffs `root` (the live inode graph's root) against the tree rooted at
/// `root_tree_id` (spec §4.6).
pub async fn diff(
    inode_map: &InodeMap,
    source: &dyn ObjectSource,
    overlay: &Overlay,
    policy: CasePolicy,
    root_tree_id: &ObjectId,
    options: DiffOptions,
    cancel: CancellationToken,
    callback: &dyn DiffCallback,
) -> Result<(), Error> {
    let fetch = FetchContext::new(0, edenfs_castore::FetchCause::Thrift, "diff");
    let tree = source.get_tree(root_tree_id, &fetch).await?;
    diff_against_tree(inode_map, source, overlay, policy, &tree, options, cancel, callback).await
}

/// As [`diff`], but takes an already-fetched root tree instead of its id —
/// useful to callers (e.g. checkout's pre-mutation "unclean paths" snapshot)
/// that already hold the tree from an earlier fetch.
#[allow(clippy::too_many_arguments)]
pub async fn diff_against_tree(
    inode_map: &InodeMap,
    source: &dyn ObjectSource,
    overlay: &Overlay,
    policy: CasePolicy,
    tree: &Tree,
    options: DiffOptions,
    cancel: CancellationToken,
    callback: &dyn DiffCallback,
) -> Result<(), Error> {
    let ctx = DiffCtx {
        inode_map,
        source,
        overlay,
        policy,
        fetch: FetchContext::new(0, edenfs_castore::FetchCause::Thrift, "diff"),
        options,
        cancel,
        callback,
    };
    let root = inode_map.root();
    let root_ignore = maybe_push_ignore(&ctx, &root, &GitIgnoreStack::root()).await?;
    diff_dir(&ctx, &root, tree, &RelativePathBuf::root(), &root_ignore).await
}

/// The degenerate tree-vs-tree case with no working-copy side (spec §4.6
/// `diff_commits`), used for revision-to-revision status.
pub async fn diff_commits(
    source: &dyn ObjectSource,
    policy: CasePolicy,
    root_a: &ObjectId,
    root_b: &ObjectId,
    callback: &dyn DiffCallback,
) -> Result<(), Error> {
    let fetch = FetchContext::new(0, edenfs_castore::FetchCause::Thrift, "diff_commits");
    let tree_a = source.get_tree(root_a, &fetch).await?;
    let tree_b = source.get_tree(root_b, &fetch).await?;
    diff_trees(source, policy, &fetch, &tree_a, &tree_b, &RelativePathBuf::root(), callback).await
}

fn diff_trees<'a>(
    source: &'a dyn ObjectSource,
    policy: CasePolicy,
    fetch: &'a FetchContext,
    tree_a: &'a Tree,
    tree_b: &'a Tree,
    dir_path: &'a RelativePath,
    callback: &'a dyn DiffCallback,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), Error>> + Send + 'a>> {
    Box::pin(async move {
        let a = tree_a.entries();
        let b = tree_b.entries();
        let mut i = 0;
        let mut j = 0;
        while i < a.len() || j < b.len() {
            let cmp = match (a.get(i), b.get(j)) {
                (Some(x), Some(y)) => fold(x.name.as_bytes(), policy).cmp(&fold(y.name.as_bytes(), policy)),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => break,
            };
            match cmp {
                std::cmp::Ordering::Less => {
                    let entry = &a[i];
                    if !is_hidden(&entry.name) {
                        report_removed_tree_entry(source, policy, fetch, entry, &dir_path.join(&entry.name), callback).await;
                    }
                    i += 1;
                }
                std::cmp::Ordering::Greater => {
                    let entry = &b[j];
                    if !is_hidden(&entry.name) {
                        report_added_tree_entry(source, policy, fetch, entry, &dir_path.join(&entry.name), callback).await;
                    }
                    j += 1;
                }
                std::cmp::Ordering::Equal => {
                    let ea = &a[i];
                    let eb = &b[j];
                    let path = dir_path.join(&ea.name);
                    if !is_hidden(&ea.name) {
                        if ea.kind.is_tree() && eb.kind.is_tree() {
                            if ea.object_id != eb.object_id {
                                let ta = source.get_tree(&ea.object_id, fetch).await?;
                                let tb = source.get_tree(&eb.object_id, fetch).await?;
                                diff_trees(source, policy, fetch, &ta, &tb, &path, callback).await?;
                            }
                        } else if !ea.kind.is_tree() && !eb.kind.is_tree() {
                            if ea.object_id != eb.object_id || ea.mode != eb.mode {
                                callback.modified_file(&path, eb);
                            }
                        } else {
                            report_removed_tree_entry(source, policy, fetch, ea, &path, callback).await;
                            report_added_tree_entry(source, policy, fetch, eb, &path, callback).await;
                        }
                    }
                    i += 1;
                    j += 1;
                }
            }
        }
        Ok(())
    })
}

async fn report_removed_tree_entry(
    source: &dyn ObjectSource,
    policy: CasePolicy,
    fetch: &FetchContext,
    entry: &TreeEntry,
    path: &RelativePath,
    callback: &dyn DiffCallback,
) {
    if !entry.kind.is_tree() {
        callback.removed_file(path, entry);
        return;
    }
    match source.get_tree(&entry.object_id, fetch).await {
        Ok(tree) => {
            for child in tree.entries() {
                let child_path = path.join(&child.name);
                Box::pin(report_removed_tree_entry(source, policy, fetch, child, &child_path, callback)).await;
            }
        }
        Err(e) => callback.diff_error(path, &e),
    }
}

async fn report_added_tree_entry(
    source: &dyn ObjectSource,
    policy: CasePolicy,
    fetch: &FetchContext,
    entry: &TreeEntry,
    path: &RelativePath,
    callback: &dyn DiffCallback,
) {
    if !entry.kind.is_tree() {
        callback.added_file(path);
        return;
    }
    match source.get_tree(&entry.object_id, fetch).await {
        Ok(tree) => {
            for child in tree.entries() {
                let child_path = path.join(&child.name);
                Box::pin(report_added_tree_entry(source, policy, fetch, child, &child_path, callback)).await;
            }
        }
        Err(e) => callback.diff_error(path, &e),
    }
}

fn diff_dir<'a>(
    ctx: &'a DiffCtx<'a>,
    live: &'a Arc<TreeInode>,
    scm: &'a Tree,
    dir_path: &'a RelativePathBuf,
    ignore: &'a Arc<GitIgnoreStack>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), Error>> + Send + 'a>> {
    Box::pin(async move {
        if ctx.cancel.is_cancelled() {
            return Ok(());
        }
        ctx.inode_map.ensure_populated(live, &ctx.fetch).await?;
        let live_entries = live.entries();
        let scm_entries = scm.entries();

        let mut i = 0;
        let mut j = 0;
        while i < live_entries.len() || j < scm_entries.len() {
            let cmp = match (live_entries.get(i), scm_entries.get(j)) {
                (Some((ln, _)), Some(se)) => fold(ln.as_bytes(), ctx.policy).cmp(&fold(se.name.as_bytes(), ctx.policy)),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => break,
            };

            match cmp {
                std::cmp::Ordering::Less => {
                    let (name, entry) = &live_entries[i];
                    if !is_hidden(name) {
                        report_added_live_entry(ctx, live, name, entry, dir_path, ignore).await?;
                    }
                    i += 1;
                }
                std::cmp::Ordering::Greater => {
                    let scm_entry = &scm_entries[j];
                    if !is_hidden(&scm_entry.name) {
                        let path = dir_path.join(&scm_entry.name);
                        report_removed_tree_entry(ctx.source, ctx.policy, &ctx.fetch, scm_entry, &path, ctx.callback).await;
                    }
                    j += 1;
                }
                std::cmp::Ordering::Equal => {
                    let (name, live_entry) = &live_entries[i];
                    let scm_entry = &scm_entries[j];
                    if !is_hidden(name) {
                        diff_matched_entry(ctx, live, name, live_entry, scm_entry, dir_path, ignore).await?;
                    }
                    i += 1;
                    j += 1;
                }
            }
        }
        Ok(())
    })
}

async fn diff_matched_entry(
    ctx: &DiffCtx<'_>,
    parent: &Arc<TreeInode>,
    name: &PathComponent,
    live_entry: &OverlayEntry,
    scm_entry: &TreeEntry,
    dir_path: &RelativePathBuf,
    ignore: &Arc<GitIgnoreStack>,
) -> Result<(), Error> {
    let path = dir_path.join(name);
    let live_is_tree = live_entry.mode & TREE_MODE_BIT != 0;

    if live_is_tree != scm_entry.kind.is_tree() {
        report_removed_tree_entry(ctx.source, ctx.policy, &ctx.fetch, scm_entry, &path, ctx.callback).await;
        report_added_subtree(ctx, parent, name, live_entry, &path).await?;
        return Ok(());
    }

    if live_is_tree {
        let child = ctx.inode_map.get_or_load_child(parent, name, &ctx.fetch).await?.as_tree()?;
        let child_ignore = maybe_push_ignore(ctx, &child, ignore).await?;
        let child_scm = ctx.source.get_tree(&scm_entry.object_id, &ctx.fetch).await?;
        diff_dir(ctx, &child, &child_scm, &path, &child_ignore).await?;
        return Ok(());
    }

    let unchanged = match &live_entry.hash {
        Some(hash_bytes) => hash_bytes.as_slice() == scm_entry.object_id.as_bytes() && live_entry.mode == scm_entry.mode,
        None => false,
    };
    if unchanged {
        return Ok(());
    }

    if live_entry.hash.is_none() {
        // Materialized: compare on-disk bytes to the source-control blob.
        if let Some(ino) = live_entry.inode {
            let live_sha1 = ctx.overlay.sha1(ino)?;
            let source_sha1 = ctx.source.get_blob_sha1(&scm_entry.object_id, &ctx.fetch).await?;
            if live_sha1 != source_sha1 {
                ctx.callback.modified_file(&path, scm_entry);
            }
        }
    } else {
        ctx.callback.modified_file(&path, scm_entry);
    }
    Ok(())
}

async fn report_added_live_entry(
    ctx: &DiffCtx<'_>,
    parent: &Arc<TreeInode>,
    name: &PathComponent,
    entry: &OverlayEntry,
    dir_path: &RelativePathBuf,
    ignore: &Arc<GitIgnoreStack>,
) -> Result<(), Error> {
    let path = dir_path.join(name);
    let is_tree = entry.mode & TREE_MODE_BIT != 0;
    let file_type = if is_tree { FileType::Directory } else { FileType::File };
    let verdict = ignore.matches(&path, file_type);
    match verdict {
        Verdict::Hidden => return Ok(()),
        Verdict::Exclude => {
            if ctx.options.list_ignored {
                report_ignored_subtree(ctx, parent, name, entry, &path).await?;
            }
            return Ok(());
        }
        Verdict::Include | Verdict::NoMatch => {}
    }
    report_added_subtree(ctx, parent, name, entry, &path).await
}

async fn report_added_subtree(
    ctx: &DiffCtx<'_>,
    parent: &Arc<TreeInode>,
    name: &PathComponent,
    entry: &OverlayEntry,
    path: &RelativePathBuf,
) -> Result<(), Error> {
    let is_tree = entry.mode & TREE_MODE_BIT != 0;
    if !is_tree {
        ctx.callback.added_file(path);
        return Ok(());
    }
    let child = ctx.inode_map.get_or_load_child(parent, name, &ctx.fetch).await?.as_tree()?;
    ctx.inode_map.ensure_populated(&child, &ctx.fetch).await?;
    for (child_name, child_entry) in child.entries() {
        if is_hidden(&child_name) {
            continue;
        }
        Box::pin(report_added_subtree(ctx, &child, &child_name, &child_entry, &path.join(&child_name))).await?;
    }
    Ok(())
}

/// An excluded directory's contents are reported file-by-file as ignored
/// rather than collapsed into one entry for the directory itself, but
/// without re-running ignore matching on them: a negated pattern below an
/// already-excluded directory can't bring a file back (matches git's own
/// "not possible to re-include a file if a parent directory is excluded").
async fn report_ignored_subtree(
    ctx: &DiffCtx<'_>,
    parent: &Arc<TreeInode>,
    name: &PathComponent,
    entry: &OverlayEntry,
    path: &RelativePathBuf,
) -> Result<(), Error> {
    let is_tree = entry.mode & TREE_MODE_BIT != 0;
    if !is_tree {
        ctx.callback.ignored_file(path);
        return Ok(());
    }
    let child = ctx.inode_map.get_or_load_child(parent, name, &ctx.fetch).await?.as_tree()?;
    ctx.inode_map.ensure_populated(&child, &ctx.fetch).await?;
    for (child_name, child_entry) in child.entries() {
        if is_hidden(&child_name) {
            continue;
        }
        Box::pin(report_ignored_subtree(ctx, &child, &child_name, &child_entry, &path.join(&child_name))).await?;
    }
    Ok(())
}

async fn maybe_push_ignore(
    ctx: &DiffCtx<'_>,
    dir: &Arc<TreeInode>,
    parent_ignore: &Arc<GitIgnoreStack>,
) -> Result<Arc<GitIgnoreStack>, Error> {
    let gitignore_name = PathComponent::new(".gitignore").expect("valid component");
    if let Ok(file) = ctx.inode_map.get_or_load_child(dir, &gitignore_name, &ctx.fetch).await {
        if let Ok(file) = file.as_file() {
            let bytes = if file.is_materialized() {
                ctx.overlay.read(file.ino(), 0, ctx.overlay.size(file.ino())? as usize)?
            } else {
                file.ensure_loaded(ctx.source, &ctx.fetch).await?.to_vec()
            };
            let contents = String::from_utf8_lossy(&bytes);
            return Ok(parent_ignore.child(crate::ignore::GitIgnore::parse(&contents)));
        }
    }
    Ok(parent_ignore.clone())
}

fn fold(bytes: &[u8], policy: CasePolicy) -> Vec<u8> {
    match policy {
        CasePolicy::Sensitive => bytes.to_vec(),
        CasePolicy::InsensitivePreserving => bytes.to_ascii_lowercase(),
    }
}

