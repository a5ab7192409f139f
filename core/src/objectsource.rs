//! Type-erased handle to the object store façade. The mount coordinator
//! links exactly one concrete `BackingStore` implementation, but threading
//! its type parameter through `InodeMap`/checkout/diff would infect every
//! signature in the crate; instead those modules hold `Arc<dyn ObjectSource>`,
//! the same shape the teacher's `TvixStoreFs` holds `Arc<dyn BlobService>`
//! and `Arc<dyn DirectoryService>` rather than being generic over them.

use async_trait::async_trait;
use edenfs_castore::{BackingStore, Blob, FetchContext, ObjectId, ObjectStore, RootId, Sha1, Tree};

use crate::errors::Error;

#[async_trait]
pub trait ObjectSource: Send + Sync {
    async fn get_tree(&self, id: &ObjectId, ctx: &FetchContext) -> Result<Tree, Error>;
    async fn get_blob(&self, id: &ObjectId, ctx: &FetchContext) -> Result<Blob, Error>;
    async fn get_blob_sha1(&self, id: &ObjectId, ctx: &FetchContext) -> Result<Sha1, Error>;
    async fn get_root_tree(&self, root: &RootId, ctx: &FetchContext) -> Result<Tree, Error>;
    fn parse_root_id(&self, s: &str) -> Result<RootId, Error>;
    fn render_root_id(&self, root: &RootId) -> String;
}

#[async_trait]
impl<B: BackingStore + Send + Sync + 'static> ObjectSource for ObjectStore<B> {
    async fn get_tree(&self, id: &ObjectId, ctx: &FetchContext) -> Result<Tree, Error> {
        Ok(ObjectStore::get_tree(self, id, ctx).await?)
    }

    async fn get_blob(&self, id: &ObjectId, ctx: &FetchContext) -> Result<Blob, Error> {
        Ok(ObjectStore::get_blob(self, id, ctx).await?)
    }

    async fn get_blob_sha1(&self, id: &ObjectId, ctx: &FetchContext) -> Result<Sha1, Error> {
        Ok(ObjectStore::get_blob_sha1(self, id, ctx).await?)
    }

    async fn get_root_tree(&self, root: &RootId, ctx: &FetchContext) -> Result<Tree, Error> {
        Ok(ObjectStore::get_root_tree(self, root, ctx).await?)
    }

    fn parse_root_id(&self, s: &str) -> Result<RootId, Error> {
        Ok(ObjectStore::parse_root_id(self, s)?)
    }

    fn render_root_id(&self, root: &RootId) -> String {
        ObjectStore::render_root_id(self, root)
    }
}
