// $I30 directory index engine
// B+tree over INDEX_ROOT, INDEX_ALLOCATION and $BITMAP: lookup,
// enumeration, path resolution and name mutation against any backend
// implementing the VolumeServices contract

pub mod bitmap;
pub mod collation;
pub mod create;
pub mod index;
pub mod link;
pub mod lookup;
pub mod memory;
pub mod path_resolver;
pub mod readdir;
pub mod remove;
pub mod structures;
pub mod volume;

// Re-export the operation surface
pub use create::{create, FileKind};
pub use link::{link, link_for_rename};
pub use lookup::{lookup, lookup_name};
pub use path_resolver::resolve_path;
pub use readdir::{list_dir, parent_reference, read_dir, DirEntry, DirentKind};
pub use remove::delete;
pub use volume::{Volume, VolumeParams};

// In-memory backend for tests and tooling
pub use memory::{mem_volume, FailPoint, MemServices, MemVolumeOptions};
