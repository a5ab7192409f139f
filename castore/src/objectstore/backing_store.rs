//! The external backing-store collaborator (spec §1, §6). The core only
//! ever talks to this trait; mercurial/git/http implementations live
//! outside this crate.

use async_trait::async_trait;

use crate::{errors::Error, ids::ObjectId, objectstore::fetch_context::FetchContext, tree::Tree};

pub type Blob = bytes::Bytes;

/// Opaque identifier for a source-control commit-like root, as rendered by
/// the backing store (spec §3 glossary: "root id").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RootId(pub String);

/// The read-only surface a backing store must provide (spec §6). All
/// methods are async and fallible; "not found" is reported distinctly via
/// `Ok(None)`-shaped higher layers rather than conflated with transport
/// errors, so callers can tell "this object doesn't exist" from "the
/// backing store is unreachable."
#[async_trait]
pub trait BackingStore: Send + Sync {
    async fn get_tree(&self, id: &ObjectId, ctx: &FetchContext) -> Result<Option<Tree>, Error>;

    async fn get_blob(&self, id: &ObjectId, ctx: &FetchContext) -> Result<Option<Blob>, Error>;

    async fn get_tree_for_commit(
        &self,
        root: &RootId,
        ctx: &FetchContext,
    ) -> Result<Option<Tree>, Error>;

    /// Best-effort hint: the implementation may start background fetches
    /// for these ids but must not block the caller on their completion.
    async fn prefetch_blobs(&self, ids: &[ObjectId], ctx: &FetchContext);

    fn parse_root_id(&self, s: &str) -> Result<RootId, Error>;

    fn render_root_id(&self, root: &RootId) -> String;

    /// Tells the backing store that `manifest_id` is known to be the tree
    /// for `root_id`, short-circuiting its own root-to-tree resolution.
    /// Most backing stores have no use for this; default is a no-op.
    async fn import_manifest_for_root(&self, _root_id: &RootId, _manifest_id: &ObjectId) {}

    /// Optional: not every backing store can name itself.
    fn repo_name(&self) -> Option<&str> {
        None
    }
}
