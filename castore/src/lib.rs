//! Content-addressed storage primitives shared by the mount: object ids,
//! path handling, the tree model, and the cached object store façade over a
//! backing store.

pub mod errors;
pub mod ids;
pub mod objectstore;
pub mod path;
pub mod tree;

pub use errors::Error;
pub use ids::{BlobMetadata, InodeNumber, ObjectId, Sha1};
pub use objectstore::{BackingStore, Blob, FetchCause, FetchContext, ImportPriority, ObjectStore, RootId};
pub use path::{CaseAwareMap, CasePolicy, PathComponent, RelativePath, RelativePathBuf};
pub use tree::{EntryKind, Tree, TreeEntry};
