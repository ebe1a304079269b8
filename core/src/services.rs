// Storage backend contract consumed by the index engine

use crate::error::I30Error;
use crate::types::{AttributeType, FileRecord, MftRef};

/// Which timestamps a metadata update touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUpdate {
    ChangeTime,
    ModificationAndChangeTime,
}

/// Services the surrounding driver supplies to the index engine: MFT record
/// management, attribute I/O, and the index-maintenance primitives that hide
/// B+tree page split/merge mechanics.
///
/// All calls happen under the caller-held per-volume lock, hence `&mut self`
/// throughout. Implementations report failures through the same error type
/// the engine uses.
pub trait VolumeServices {
    /// Open the file record with the given number. Freed or never-allocated
    /// records yield `NotFound`.
    fn open_record(&mut self, number: u64) -> Result<FileRecord, I30Error>;

    /// Persist header fields (link count, flags, file attributes) of an open
    /// record.
    fn save_record(&mut self, record: &FileRecord) -> Result<(), I30Error>;

    /// Allocate a fresh, in-use, empty file record. `OutOfSpace` when the
    /// record pool is exhausted.
    fn allocate_record(&mut self) -> Result<FileRecord, I30Error>;

    /// Free a record and everything resident in it.
    fn free_record(&mut self, number: u64) -> Result<(), I30Error>;

    /// Release the clusters backing a record's non-resident attributes.
    /// Called before `free_record` when a file's last link goes away.
    fn free_attribute_storage(&mut self, number: u64) -> Result<(), I30Error>;

    /// Size in bytes of an attribute's value, or `None` if the record has no
    /// such attribute.
    fn attribute_size(
        &mut self,
        file: u64,
        ty: AttributeType,
        name: &str,
    ) -> Result<Option<u64>, I30Error>;

    /// Read an attribute's entire value. Missing attribute is `NotFound`.
    fn read_attribute(
        &mut self,
        file: u64,
        ty: AttributeType,
        name: &str,
    ) -> Result<Vec<u8>, I30Error>;

    /// Read part of an attribute's value starting at `offset`. Returns the
    /// number of bytes read, which is short only at end of value.
    fn read_attribute_at(
        &mut self,
        file: u64,
        ty: AttributeType,
        name: &str,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, I30Error>;

    /// Read one index block from the directory's index allocation stream at
    /// the given byte offset. `buf` is exactly one index block long and the
    /// returned image has had its update sequence verified and undone.
    fn read_index_block(
        &mut self,
        file: u64,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<(), I30Error>;

    /// Attach a new resident attribute with the given value.
    fn add_attribute(
        &mut self,
        file: u64,
        ty: AttributeType,
        name: &str,
        value: &[u8],
    ) -> Result<(), I30Error>;

    /// Detach an attribute by (type, name).
    fn remove_attribute(
        &mut self,
        file: u64,
        ty: AttributeType,
        name: &str,
    ) -> Result<(), I30Error>;

    /// All FILE_NAME attribute instances of a record, as (instance id, value)
    /// pairs in on-disk order.
    fn file_name_instances(&mut self, file: u64) -> Result<Vec<(u16, Vec<u8>)>, I30Error>;

    /// Detach one FILE_NAME instance by its instance id.
    fn remove_file_name_instance(&mut self, file: u64, instance: u16) -> Result<(), I30Error>;

    /// Insert a FILE_NAME key into a directory's index, growing or splitting
    /// pages as needed while preserving sort order and child-pointer
    /// invariants. A key that already collates equal to a live entry is
    /// `AlreadyExists`.
    fn index_insert(&mut self, dir: u64, key: &[u8], reference: MftRef)
        -> Result<(), I30Error>;

    /// Remove the entry whose key matches `key` exactly from a directory's
    /// index, rebalancing as needed. `NotFound` if no entry matches.
    fn index_remove(&mut self, dir: u64, key: &[u8]) -> Result<(), I30Error>;

    /// Refresh a record's timestamps.
    fn update_times(&mut self, file: u64, update: TimeUpdate) -> Result<(), I30Error>;
}
