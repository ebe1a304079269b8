// In-memory storage backend
// A miniature MFT behind the VolumeServices contract: records hold
// resident attributes, and each directory index is rebuilt flat on
// every mutation, resident while it fits and spilled into one level
// of allocation blocks once it does not. Drives the engine in tests
// and in the smoke tool.

use crate::collation::{collate_names, UpcaseTable};
use crate::structures::{
    build_end_entry, build_entry, now_filetime, standard_information, FileName,
    FileNameNamespace, COLLATION_FILENAME, FILE_ATTR_I30_INDEX_PRESENT,
    INDEX_BLOCK_HEADER_SIZE, INDEX_ENTRY_HEADER_SIZE, INDEX_HEADER_SIZE, INDEX_NODE,
    INDEX_ROOT_HEADER_SIZE, INDEX_STREAM_NAME, NTFS_BLOCK_SIZE,
};
use crate::volume::{Volume, VolumeParams};
use byteorder::{ByteOrder, LittleEndian};
use i30_core::{
    AttributeType, FileRecord, I30Error, MftRef, TimeUpdate, Vcn, VolumeServices,
    FILE_FIRST_USER, FILE_ROOT, RECORD_IN_USE, RECORD_IS_DIRECTORY,
};
use log::{debug, trace};
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::io;
use std::rc::Rc;

/// Operations a test can arm to fail exactly once with an I/O error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    AllocateRecord,
    AddAttribute,
    SaveRecord,
    IndexInsert,
    IndexRemove,
    RemoveFileNameInstance,
    FreeRecord,
}

/// Knobs for a fresh in-memory volume.
#[derive(Debug, Clone, Copy)]
pub struct MemVolumeOptions {
    pub mft_record_size: u32,
    pub cluster_size: u32,
    pub sector_size: u32,
    pub index_block_size: u32,
    pub case_sensitive: bool,
    /// Cap on live records above the reserved range; `None` is unlimited.
    pub record_limit: Option<usize>,
}

impl Default for MemVolumeOptions {
    fn default() -> Self {
        MemVolumeOptions {
            mft_record_size: 1024,
            cluster_size: 4096,
            sector_size: 512,
            index_block_size: 4096,
            case_sensitive: false,
            record_limit: None,
        }
    }
}

struct MemAttribute {
    ty: AttributeType,
    name: String,
    instance: u16,
    value: Vec<u8>,
}

struct MemRecord {
    sequence: u16,
    link_count: u16,
    flags: u16,
    file_attributes: u32,
    attributes: Vec<MemAttribute>,
    next_instance: u16,
    time_updates: usize,
}

/// One live index entry of a directory, kept beside its decoded name so
/// ordering never re-parses the key.
#[derive(Clone)]
struct IndexedName {
    key: Vec<u8>,
    name: Vec<u16>,
    reference: MftRef,
}

struct MemState {
    params: VolumeParams,
    case_sensitive: bool,
    upcase: UpcaseTable,
    record_limit: Option<usize>,
    next_number: u64,
    records: BTreeMap<u64, MemRecord>,
    indexes: BTreeMap<u64, Vec<IndexedName>>,
    armed: HashSet<FailPoint>,
}

/// Cloneable handle onto one shared in-memory volume. The clone handed
/// to `Volume` and the clone a test keeps see the same state.
#[derive(Clone)]
pub struct MemServices {
    state: Rc<RefCell<MemState>>,
}

/// Builds a volume over a fresh in-memory backend, its root directory
/// seeded with the self-referencing "." entry real volumes carry.
/// Returns the volume and a second handle onto the same backend.
pub fn mem_volume(options: MemVolumeOptions) -> Result<(Volume, MemServices), I30Error> {
    let params = VolumeParams {
        mft_record_size: options.mft_record_size,
        cluster_size: options.cluster_size,
        sector_size: options.sector_size,
        index_block_size: options.index_block_size,
    };
    params.validate()?;
    let services = MemServices {
        state: Rc::new(RefCell::new(MemState {
            params,
            case_sensitive: options.case_sensitive,
            upcase: UpcaseTable::default_table(),
            record_limit: options.record_limit,
            next_number: FILE_FIRST_USER,
            records: BTreeMap::new(),
            indexes: BTreeMap::new(),
            armed: HashSet::new(),
        })),
    };
    services.state.borrow_mut().seed_root()?;
    let volume = Volume::new(
        Box::new(services.clone()),
        params,
        UpcaseTable::default_table(),
        options.case_sensitive,
    )?;
    Ok((volume, services))
}

impl MemServices {
    /// The current value of an attribute, or `None` if the record or the
    /// attribute does not exist.
    pub fn attribute(&self, file: u64, ty: AttributeType, name: &str) -> Option<Vec<u8>> {
        let state = self.state.borrow();
        let record = state.records.get(&file)?;
        record
            .attributes
            .iter()
            .find(|a| a.ty == ty && a.name == name)
            .map(|a| a.value.clone())
    }

    /// Overwrites or creates an attribute value directly, bypassing the
    /// index maintenance that `VolumeServices` calls go through. Tests
    /// use this to plant corrupt images.
    pub fn set_attribute(&self, file: u64, ty: AttributeType, name: &str, value: Vec<u8>) {
        let mut state = self.state.borrow_mut();
        if let Some(record) = state.records.get_mut(&file) {
            if let Some(attr) = record
                .attributes
                .iter_mut()
                .find(|a| a.ty == ty && a.name == name)
            {
                attr.value = value;
            } else {
                let instance = record.next_instance;
                record.next_instance += 1;
                record.attributes.push(MemAttribute {
                    ty,
                    name: name.to_string(),
                    instance,
                    value,
                });
            }
        }
    }

    /// Drops an attribute without the bookkeeping `remove_attribute`
    /// does. Companion of `set_attribute` for corruption fixtures.
    pub fn remove_attribute_raw(&self, file: u64, ty: AttributeType, name: &str) {
        let mut state = self.state.borrow_mut();
        if let Some(record) = state.records.get_mut(&file) {
            record
                .attributes
                .retain(|a| !(a.ty == ty && a.name == name));
        }
    }

    /// Number of live records, reserved ones included.
    pub fn record_count(&self) -> usize {
        self.state.borrow().records.len()
    }

    /// How many times the engine refreshed this record's timestamps.
    pub fn time_updates(&self, file: u64) -> usize {
        self.state
            .borrow()
            .records
            .get(&file)
            .map(|r| r.time_updates)
            .unwrap_or(0)
    }

    /// Arms an operation to fail once with an I/O error. Several points
    /// can be armed at the same time.
    pub fn inject_failure(&self, point: FailPoint) {
        self.state.borrow_mut().armed.insert(point);
    }
}

impl VolumeServices for MemServices {
    fn open_record(&mut self, number: u64) -> Result<FileRecord, I30Error> {
        self.state.borrow().open_record(number)
    }

    fn save_record(&mut self, record: &FileRecord) -> Result<(), I30Error> {
        self.state.borrow_mut().save_record(record)
    }

    fn allocate_record(&mut self) -> Result<FileRecord, I30Error> {
        self.state.borrow_mut().allocate_record()
    }

    fn free_record(&mut self, number: u64) -> Result<(), I30Error> {
        self.state.borrow_mut().free_record(number)
    }

    fn free_attribute_storage(&mut self, number: u64) -> Result<(), I30Error> {
        let state = self.state.borrow();
        if state.records.contains_key(&number) {
            Ok(())
        } else {
            Err(I30Error::NotFound)
        }
    }

    fn attribute_size(
        &mut self,
        file: u64,
        ty: AttributeType,
        name: &str,
    ) -> Result<Option<u64>, I30Error> {
        let state = self.state.borrow();
        let record = state.records.get(&file).ok_or(I30Error::NotFound)?;
        Ok(record
            .attributes
            .iter()
            .find(|a| a.ty == ty && a.name == name)
            .map(|a| a.value.len() as u64))
    }

    fn read_attribute(
        &mut self,
        file: u64,
        ty: AttributeType,
        name: &str,
    ) -> Result<Vec<u8>, I30Error> {
        let state = self.state.borrow();
        state
            .attribute_value(file, ty, name)
            .map(|value| value.to_vec())
    }

    fn read_attribute_at(
        &mut self,
        file: u64,
        ty: AttributeType,
        name: &str,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, I30Error> {
        let state = self.state.borrow();
        let value = state.attribute_value(file, ty, name)?;
        if offset >= value.len() as u64 {
            return Ok(0);
        }
        let start = offset as usize;
        let n = buf.len().min(value.len() - start);
        buf[..n].copy_from_slice(&value[start..start + n]);
        Ok(n)
    }

    fn read_index_block(
        &mut self,
        file: u64,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<(), I30Error> {
        let state = self.state.borrow();
        let value = state.attribute_value(file, AttributeType::IndexAllocation, INDEX_STREAM_NAME)?;
        let start = offset as usize;
        let end = start.checked_add(buf.len()).unwrap_or(usize::MAX);
        if end > value.len() {
            return Err(I30Error::IoError(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "index block read at {} past allocation of {} bytes",
                    offset,
                    value.len()
                ),
            )));
        }
        buf.copy_from_slice(&value[start..end]);
        Ok(())
    }

    fn add_attribute(
        &mut self,
        file: u64,
        ty: AttributeType,
        name: &str,
        value: &[u8],
    ) -> Result<(), I30Error> {
        let mut state = self.state.borrow_mut();
        state.trip(FailPoint::AddAttribute)?;
        let record = state.records.get_mut(&file).ok_or(I30Error::NotFound)?;
        let instance = record.next_instance;
        record.next_instance += 1;
        record.attributes.push(MemAttribute {
            ty,
            name: name.to_string(),
            instance,
            value: value.to_vec(),
        });
        Ok(())
    }

    fn remove_attribute(
        &mut self,
        file: u64,
        ty: AttributeType,
        name: &str,
    ) -> Result<(), I30Error> {
        let mut state = self.state.borrow_mut();
        let record = state.records.get_mut(&file).ok_or(I30Error::NotFound)?;
        let at = record
            .attributes
            .iter()
            .position(|a| a.ty == ty && a.name == name)
            .ok_or(I30Error::NotFound)?;
        record.attributes.remove(at);
        Ok(())
    }

    fn file_name_instances(&mut self, file: u64) -> Result<Vec<(u16, Vec<u8>)>, I30Error> {
        let state = self.state.borrow();
        let record = state.records.get(&file).ok_or(I30Error::NotFound)?;
        Ok(record
            .attributes
            .iter()
            .filter(|a| a.ty == AttributeType::FileName)
            .map(|a| (a.instance, a.value.clone()))
            .collect())
    }

    fn remove_file_name_instance(&mut self, file: u64, instance: u16) -> Result<(), I30Error> {
        let mut state = self.state.borrow_mut();
        state.trip(FailPoint::RemoveFileNameInstance)?;
        let record = state.records.get_mut(&file).ok_or(I30Error::NotFound)?;
        let at = record
            .attributes
            .iter()
            .position(|a| a.ty == AttributeType::FileName && a.instance == instance)
            .ok_or(I30Error::NotFound)?;
        record.attributes.remove(at);
        Ok(())
    }

    fn index_insert(
        &mut self,
        dir: u64,
        key: &[u8],
        reference: MftRef,
    ) -> Result<(), I30Error> {
        self.state.borrow_mut().index_insert(dir, key, reference)
    }

    fn index_remove(&mut self, dir: u64, key: &[u8]) -> Result<(), I30Error> {
        self.state.borrow_mut().index_remove(dir, key)
    }

    fn update_times(&mut self, file: u64, update: TimeUpdate) -> Result<(), I30Error> {
        self.state.borrow_mut().update_times(file, update)
    }
}

/// Sort order of the backing tree: the volume upcase fold first with the
/// exact comparison as tie-break, or exact alone on a case-sensitive
/// volume. Equality under this order is what makes a name a duplicate.
fn tree_order(
    upcase: &UpcaseTable,
    case_sensitive: bool,
    a: &[u16],
    b: &[u16],
) -> Ordering {
    if case_sensitive {
        return collate_names(a, b, false, upcase);
    }
    match collate_names(a, b, true, upcase) {
        Ordering::Equal => collate_names(a, b, false, upcase),
        other => other,
    }
}

impl MemState {
    fn trip(&mut self, point: FailPoint) -> Result<(), I30Error> {
        if self.armed.remove(&point) {
            return Err(I30Error::IoError(io::Error::new(
                io::ErrorKind::Other,
                format!("injected {:?} fault", point),
            )));
        }
        Ok(())
    }

    fn seed_root(&mut self) -> Result<(), I30Error> {
        let now = now_filetime();
        self.records.insert(
            FILE_ROOT,
            MemRecord {
                sequence: FILE_ROOT as u16,
                link_count: 1,
                flags: RECORD_IN_USE | RECORD_IS_DIRECTORY,
                file_attributes: 0,
                attributes: Vec::new(),
                next_instance: 0,
                time_updates: 0,
            },
        );
        let reference = MftRef::new(FILE_ROOT, FILE_ROOT as u16);
        let dot = FileName {
            parent: reference,
            creation_time: now,
            modification_time: now,
            mft_modification_time: now,
            access_time: now,
            allocated_size: 0,
            data_size: 0,
            file_attributes: FILE_ATTR_I30_INDEX_PRESENT,
            reparse_tag: 0,
            namespace: FileNameNamespace::Posix,
            name: vec!['.' as u16],
        };
        let key = dot.to_bytes();
        self.push_attribute(
            FILE_ROOT,
            AttributeType::StandardInformation,
            "",
            standard_information(now, 0).to_vec(),
        );
        self.push_attribute(FILE_ROOT, AttributeType::FileName, "", key.clone());
        self.indexes.insert(
            FILE_ROOT,
            vec![IndexedName {
                key,
                name: dot.name,
                reference,
            }],
        );
        self.rebuild_index(FILE_ROOT)
    }

    fn open_record(&self, number: u64) -> Result<FileRecord, I30Error> {
        let record = self.records.get(&number).ok_or(I30Error::NotFound)?;
        let data_size = record
            .attributes
            .iter()
            .find(|a| a.ty == AttributeType::Data && a.name.is_empty())
            .map(|a| a.value.len() as u64)
            .unwrap_or(0);
        Ok(FileRecord {
            number,
            sequence: record.sequence,
            link_count: record.link_count,
            flags: record.flags,
            file_attributes: record.file_attributes,
            data_size,
            allocated_size: data_size,
        })
    }

    fn save_record(&mut self, header: &FileRecord) -> Result<(), I30Error> {
        self.trip(FailPoint::SaveRecord)?;
        let record = self
            .records
            .get_mut(&header.number)
            .ok_or(I30Error::NotFound)?;
        record.link_count = header.link_count;
        record.flags = header.flags;
        record.file_attributes = header.file_attributes;
        Ok(())
    }

    fn allocate_record(&mut self) -> Result<FileRecord, I30Error> {
        self.trip(FailPoint::AllocateRecord)?;
        if let Some(limit) = self.record_limit {
            let live = self
                .records
                .keys()
                .filter(|n| **n >= FILE_FIRST_USER)
                .count();
            if live >= limit {
                return Err(I30Error::OutOfSpace(format!(
                    "record pool exhausted at {} records",
                    limit
                )));
            }
        }
        // Numbers are never reused, so a stale reference can only miss.
        let number = self.next_number;
        self.next_number += 1;
        self.records.insert(
            number,
            MemRecord {
                sequence: 1,
                link_count: 0,
                flags: RECORD_IN_USE,
                file_attributes: 0,
                attributes: Vec::new(),
                next_instance: 0,
                time_updates: 0,
            },
        );
        trace!("allocated record {}", number);
        self.open_record(number)
    }

    fn free_record(&mut self, number: u64) -> Result<(), I30Error> {
        self.trip(FailPoint::FreeRecord)?;
        if self.records.remove(&number).is_none() {
            return Err(I30Error::NotFound);
        }
        self.indexes.remove(&number);
        trace!("freed record {}", number);
        Ok(())
    }

    fn attribute_value(
        &self,
        file: u64,
        ty: AttributeType,
        name: &str,
    ) -> Result<&[u8], I30Error> {
        let record = self.records.get(&file).ok_or(I30Error::NotFound)?;
        record
            .attributes
            .iter()
            .find(|a| a.ty == ty && a.name == name)
            .map(|a| a.value.as_slice())
            .ok_or(I30Error::NotFound)
    }

    fn push_attribute(&mut self, file: u64, ty: AttributeType, name: &str, value: Vec<u8>) {
        if let Some(record) = self.records.get_mut(&file) {
            let instance = record.next_instance;
            record.next_instance += 1;
            record.attributes.push(MemAttribute {
                ty,
                name: name.to_string(),
                instance,
                value,
            });
        }
    }

    /// Replaces an attribute value in place, creating the attribute when
    /// the record has none. Index rebuilds come through here.
    fn put_attribute(&mut self, file: u64, ty: AttributeType, name: &str, value: Vec<u8>) {
        if let Some(record) = self.records.get_mut(&file) {
            if let Some(attr) = record
                .attributes
                .iter_mut()
                .find(|a| a.ty == ty && a.name == name)
            {
                attr.value = value;
                return;
            }
        }
        self.push_attribute(file, ty, name, value);
    }

    fn drop_attribute(&mut self, file: u64, ty: AttributeType, name: &str) {
        if let Some(record) = self.records.get_mut(&file) {
            record
                .attributes
                .retain(|a| !(a.ty == ty && a.name == name));
        }
    }

    fn index_insert(&mut self, dir: u64, key: &[u8], reference: MftRef) -> Result<(), I30Error> {
        self.trip(FailPoint::IndexInsert)?;
        if !self.records.contains_key(&dir) {
            return Err(I30Error::NotFound);
        }
        let file_name = FileName::parse(key)?;
        let entry = IndexedName {
            key: key.to_vec(),
            name: file_name.name,
            reference,
        };
        let upcase = &self.upcase;
        let case_sensitive = self.case_sensitive;
        let list = self.indexes.entry(dir).or_default();
        let at = match list
            .binary_search_by(|e| tree_order(upcase, case_sensitive, &e.name, &entry.name))
        {
            Ok(_) => {
                return Err(I30Error::AlreadyExists(
                    String::from_utf16_lossy(&entry.name),
                ))
            }
            Err(at) => at,
        };
        list.insert(at, entry);
        if let Err(err) = self.rebuild_index(dir) {
            // back the entry out so a failed grow leaves the index as it was
            if let Some(list) = self.indexes.get_mut(&dir) {
                list.remove(at);
            }
            return Err(err);
        }
        Ok(())
    }

    fn index_remove(&mut self, dir: u64, key: &[u8]) -> Result<(), I30Error> {
        self.trip(FailPoint::IndexRemove)?;
        let name = FileName::parse(key)?.name;
        let upcase = &self.upcase;
        let case_sensitive = self.case_sensitive;
        let list = self.indexes.get_mut(&dir).ok_or(I30Error::NotFound)?;
        let at = list
            .binary_search_by(|e| tree_order(upcase, case_sensitive, &e.name, &name))
            .map_err(|_| I30Error::NotFound)?;
        list.remove(at);
        self.rebuild_index(dir)
    }

    fn update_times(&mut self, file: u64, update: TimeUpdate) -> Result<(), I30Error> {
        let now = now_filetime();
        let record = self.records.get_mut(&file).ok_or(I30Error::NotFound)?;
        record.time_updates += 1;
        if let Some(attr) = record
            .attributes
            .iter_mut()
            .find(|a| a.ty == AttributeType::StandardInformation && a.name.is_empty())
        {
            if attr.value.len() >= 24 {
                if update == TimeUpdate::ModificationAndChangeTime {
                    LittleEndian::write_u64(&mut attr.value[8..], now);
                }
                LittleEndian::write_u64(&mut attr.value[16..], now);
            }
        }
        Ok(())
    }

    /// Block size and clusters-per-block a rebuild writes back: the
    /// values the directory's INDEX_ROOT already declares, or the volume
    /// defaults for a directory that has none yet.
    fn index_geometry(&self, dir: u64) -> (u32, u8) {
        if let Ok(value) = self.attribute_value(dir, AttributeType::IndexRoot, INDEX_STREAM_NAME)
        {
            if value.len() >= INDEX_ROOT_HEADER_SIZE {
                let block_size = LittleEndian::read_u32(&value[8..]);
                if block_size >= NTFS_BLOCK_SIZE && block_size.is_power_of_two() {
                    return (block_size, value[12]);
                }
            }
        }
        let block_size = self.params.index_block_size;
        (block_size, (block_size / self.vcn_unit(block_size)) as u8)
    }

    fn vcn_unit(&self, block_size: u32) -> u32 {
        if self.params.cluster_size <= block_size {
            self.params.cluster_size
        } else {
            self.params.sector_size
        }
    }

    /// Entry offsets inside the root page double as enumeration
    /// positions, so the page must stay well below the record size.
    fn root_page_budget(&self) -> usize {
        (self.params.mft_record_size / 2) as usize
    }

    /// Rewrites the directory's on-disk index from its entry list:
    /// everything in the root while it fits, otherwise leaf blocks of
    /// full entries under a root of separators.
    fn rebuild_index(&mut self, dir: u64) -> Result<(), I30Error> {
        let (block_size, clusters_per_block) = self.index_geometry(dir);
        let entries = self.indexes.get(&dir).cloned().unwrap_or_default();

        let bodies: Vec<Vec<u8>> = entries
            .iter()
            .map(|e| build_entry(&e.key, e.reference, None))
            .collect();
        let body_len: usize = bodies.iter().map(Vec::len).sum();
        let resident_len = INDEX_ROOT_HEADER_SIZE
            + INDEX_HEADER_SIZE
            + body_len
            + INDEX_ENTRY_HEADER_SIZE;
        if resident_len <= self.root_page_budget() {
            let value = root_value(block_size, clusters_per_block, &bodies, None);
            self.put_attribute(dir, AttributeType::IndexRoot, INDEX_STREAM_NAME, value);
            if self
                .attribute_value(dir, AttributeType::IndexAllocation, INDEX_STREAM_NAME)
                .is_ok()
            {
                debug!("index of directory {} back to resident", dir);
            }
            self.drop_attribute(dir, AttributeType::IndexAllocation, INDEX_STREAM_NAME);
            self.drop_attribute(dir, AttributeType::Bitmap, INDEX_STREAM_NAME);
            return Ok(());
        }

        // Spill: pack entries into leaves in order; the entry after a
        // full leaf becomes the root separator pointing down at it.
        let leaf_budget = block_size as usize
            - INDEX_BLOCK_HEADER_SIZE
            - INDEX_HEADER_SIZE
            - INDEX_ENTRY_HEADER_SIZE;
        let vcn_unit = self.vcn_unit(block_size) as u64;
        let mut leaves: Vec<Vec<Vec<u8>>> = vec![Vec::new()];
        let mut leaf_fill = 0usize;
        let mut separators: Vec<Vec<u8>> = Vec::new();
        for (entry, body) in entries.iter().zip(&bodies) {
            if body.len() > leaf_budget {
                return Err(I30Error::OutOfSpace(format!(
                    "index entry of {} bytes above the block capacity {}",
                    body.len(),
                    leaf_budget
                )));
            }
            if leaf_fill + body.len() > leaf_budget {
                let closed = leaves.len() - 1;
                let child = (closed as u64 * block_size as u64 / vcn_unit) as Vcn;
                separators.push(build_entry(&entry.key, entry.reference, Some(child)));
                leaves.push(Vec::new());
                leaf_fill = 0;
            } else if let Some(leaf) = leaves.last_mut() {
                leaf.push(body.clone());
                leaf_fill += body.len();
            }
        }

        let last = leaves.len() - 1;
        let end_child = (last as u64 * block_size as u64 / vcn_unit) as Vcn;
        let separator_len: usize = separators.iter().map(Vec::len).sum();
        let root_len = INDEX_ROOT_HEADER_SIZE
            + INDEX_HEADER_SIZE
            + separator_len
            + INDEX_ENTRY_HEADER_SIZE
            + 8;
        if root_len > self.root_page_budget() {
            return Err(I30Error::OutOfSpace(format!(
                "index of directory {} outgrew a two-level tree",
                dir
            )));
        }

        let mut allocation = Vec::with_capacity(leaves.len() * block_size as usize);
        for (i, leaf) in leaves.iter().enumerate() {
            let vcn = (i as u64 * block_size as u64 / vcn_unit) as Vcn;
            allocation.extend_from_slice(&leaf_block(block_size, vcn, leaf));
        }
        let mut bitmap = vec![0u8; ((leaves.len() + 63) / 64) * 8];
        for i in 0..leaves.len() {
            bitmap[i / 8] |= 1 << (i % 8);
        }
        let value = root_value(block_size, clusters_per_block, &separators, Some(end_child));
        debug!(
            "index of directory {} spilled into {} blocks",
            dir,
            leaves.len()
        );
        self.put_attribute(dir, AttributeType::IndexRoot, INDEX_STREAM_NAME, value);
        self.put_attribute(
            dir,
            AttributeType::IndexAllocation,
            INDEX_STREAM_NAME,
            allocation,
        );
        self.put_attribute(dir, AttributeType::Bitmap, INDEX_STREAM_NAME, bitmap);
        Ok(())
    }
}

/// Serializes an INDEX_ROOT value holding the given entry bodies. A
/// terminal child makes it the root of a two-level tree.
fn root_value(
    block_size: u32,
    clusters_per_block: u8,
    bodies: &[Vec<u8>],
    end_child: Option<Vcn>,
) -> Vec<u8> {
    let end = build_end_entry(end_child);
    let body_len: usize = bodies.iter().map(Vec::len).sum();
    let index_length = INDEX_HEADER_SIZE + body_len + end.len();
    let mut out = vec![0u8; INDEX_ROOT_HEADER_SIZE + INDEX_HEADER_SIZE];
    LittleEndian::write_u32(&mut out[0..], AttributeType::FileName.as_u32());
    LittleEndian::write_u32(&mut out[4..], COLLATION_FILENAME);
    LittleEndian::write_u32(&mut out[8..], block_size);
    out[12] = clusters_per_block;
    LittleEndian::write_u32(&mut out[16..], INDEX_HEADER_SIZE as u32);
    LittleEndian::write_u32(&mut out[20..], index_length as u32);
    LittleEndian::write_u32(&mut out[24..], index_length as u32);
    if end_child.is_some() {
        out[28] = INDEX_NODE;
    }
    for body in bodies {
        out.extend_from_slice(body);
    }
    out.extend_from_slice(&end);
    out
}

/// Serializes one leaf block image, zero-padded to the block size. The
/// backend applies no update sequence, so images read back verbatim.
fn leaf_block(block_size: u32, vcn: Vcn, bodies: &[Vec<u8>]) -> Vec<u8> {
    let end = build_end_entry(None);
    let body_len: usize = bodies.iter().map(Vec::len).sum();
    let index_length = INDEX_HEADER_SIZE + body_len + end.len();
    let mut out = vec![0u8; block_size as usize];
    out[0..4].copy_from_slice(b"INDX");
    LittleEndian::write_i64(&mut out[16..], vcn);
    LittleEndian::write_u32(&mut out[24..], INDEX_HEADER_SIZE as u32);
    LittleEndian::write_u32(&mut out[28..], index_length as u32);
    LittleEndian::write_u32(&mut out[32..], block_size - INDEX_BLOCK_HEADER_SIZE as u32);
    let mut at = INDEX_BLOCK_HEADER_SIZE + INDEX_HEADER_SIZE;
    for body in bodies {
        out[at..at + body.len()].copy_from_slice(body);
        at += body.len();
    }
    out[at..at + end.len()].copy_from_slice(&end);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structures::EMPTY_INDEX_ROOT_SIZE;

    fn key_for(name: &str) -> Vec<u8> {
        FileName {
            parent: MftRef::new(FILE_ROOT, FILE_ROOT as u16),
            creation_time: 0,
            modification_time: 0,
            mft_modification_time: 0,
            access_time: 0,
            allocated_size: 0,
            data_size: 0,
            file_attributes: 0,
            reparse_tag: 0,
            namespace: FileNameNamespace::Posix,
            name: name.encode_utf16().collect(),
        }
        .to_bytes()
    }

    #[test]
    fn test_seeded_root_record() {
        let (mut vol, mem) = mem_volume(MemVolumeOptions::default()).unwrap();
        let root = vol.open_record(FILE_ROOT).expect("root record");
        assert!(root.is_in_use());
        assert!(root.is_directory());
        assert_eq!(root.link_count, 1);
        assert_eq!(root.reference(), MftRef::new(FILE_ROOT, 5));

        // resident index holding only the self entry; no allocation yet
        assert!(mem
            .attribute(FILE_ROOT, AttributeType::IndexRoot, INDEX_STREAM_NAME)
            .is_some());
        assert!(mem
            .attribute(FILE_ROOT, AttributeType::IndexAllocation, INDEX_STREAM_NAME)
            .is_none());
        assert!(mem
            .attribute(FILE_ROOT, AttributeType::Bitmap, INDEX_STREAM_NAME)
            .is_none());
        let dot = mem
            .attribute(FILE_ROOT, AttributeType::FileName, "")
            .expect("dot name");
        assert_eq!(FileName::parse(&dot).unwrap().name_string(), ".");
    }

    #[test]
    fn test_record_numbers_never_reused() {
        let (_vol, mut mem) = mem_volume(MemVolumeOptions::default()).unwrap();
        let first = mem.allocate_record().unwrap();
        assert_eq!(first.number, FILE_FIRST_USER);
        assert_eq!(first.link_count, 0);
        mem.free_record(first.number).unwrap();
        assert!(matches!(
            mem.open_record(first.number),
            Err(I30Error::NotFound)
        ));
        let second = mem.allocate_record().unwrap();
        assert_eq!(second.number, FILE_FIRST_USER + 1);
    }

    #[test]
    fn test_record_limit_counts_live_records() {
        let opts = MemVolumeOptions {
            record_limit: Some(1),
            ..MemVolumeOptions::default()
        };
        let (_vol, mut mem) = mem_volume(opts).unwrap();
        let only = mem.allocate_record().unwrap();
        assert!(matches!(
            mem.allocate_record(),
            Err(I30Error::OutOfSpace(_))
        ));
        mem.free_record(only.number).unwrap();
        let next = mem.allocate_record().expect("slot free again");
        assert_eq!(next.number, only.number + 1);
    }

    #[test]
    fn test_file_name_instances_by_id() {
        let (_vol, mut mem) = mem_volume(MemVolumeOptions::default()).unwrap();
        let record = mem.allocate_record().unwrap();
        mem.add_attribute(record.number, AttributeType::FileName, "", &key_for("one"))
            .unwrap();
        mem.add_attribute(record.number, AttributeType::FileName, "", &key_for("two"))
            .unwrap();
        let instances = mem.file_name_instances(record.number).unwrap();
        assert_eq!(instances.len(), 2);
        assert_ne!(instances[0].0, instances[1].0);

        mem.remove_file_name_instance(record.number, instances[0].0)
            .unwrap();
        let left = mem.file_name_instances(record.number).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].0, instances[1].0);
        assert!(matches!(
            mem.remove_file_name_instance(record.number, instances[0].0),
            Err(I30Error::NotFound)
        ));
    }

    #[test]
    fn test_index_insert_rejects_exact_duplicate_only() {
        let (_vol, mut mem) = mem_volume(MemVolumeOptions::default()).unwrap();
        mem.index_insert(FILE_ROOT, &key_for("name"), MftRef::new(30, 1))
            .unwrap();
        assert!(matches!(
            mem.index_insert(FILE_ROOT, &key_for("name"), MftRef::new(31, 1)),
            Err(I30Error::AlreadyExists(_))
        ));
        // a case variant is its own entry at this layer
        mem.index_insert(FILE_ROOT, &key_for("NAME"), MftRef::new(32, 1))
            .expect("case variant is its own entry");
    }

    #[test]
    fn test_index_spills_and_shrinks_back() {
        let (_vol, mut mem) = mem_volume(MemVolumeOptions::default()).unwrap();
        for i in 0..60u64 {
            mem.index_insert(
                FILE_ROOT,
                &key_for(&format!("entry-{:03}", i)),
                MftRef::new(100 + i, 1),
            )
            .unwrap();
        }
        let root = mem
            .attribute(FILE_ROOT, AttributeType::IndexRoot, INDEX_STREAM_NAME)
            .unwrap();
        assert_eq!(root[28] & INDEX_NODE, INDEX_NODE, "root must declare children");
        let allocation = mem
            .attribute(FILE_ROOT, AttributeType::IndexAllocation, INDEX_STREAM_NAME)
            .expect("allocation stream");
        assert_eq!(allocation.len() % 4096, 0);
        assert!(mem
            .attribute(FILE_ROOT, AttributeType::Bitmap, INDEX_STREAM_NAME)
            .is_some());

        for i in 0..60u64 {
            mem.index_remove(FILE_ROOT, &key_for(&format!("entry-{:03}", i)))
                .unwrap();
        }
        assert!(mem
            .attribute(FILE_ROOT, AttributeType::IndexAllocation, INDEX_STREAM_NAME)
            .is_none());
        assert!(mem
            .attribute(FILE_ROOT, AttributeType::Bitmap, INDEX_STREAM_NAME)
            .is_none());
    }

    #[test]
    fn test_emptied_directory_is_the_empty_root() {
        let (_vol, mut mem) = mem_volume(MemVolumeOptions::default()).unwrap();
        let dir = mem.allocate_record().unwrap();
        mem.add_attribute(
            dir.number,
            AttributeType::IndexRoot,
            INDEX_STREAM_NAME,
            &crate::structures::empty_index_root(4096, 1),
        )
        .unwrap();
        mem.index_insert(dir.number, &key_for("a"), MftRef::new(30, 1))
            .unwrap();
        mem.index_remove(dir.number, &key_for("a")).unwrap();
        let value = mem
            .attribute(dir.number, AttributeType::IndexRoot, INDEX_STREAM_NAME)
            .unwrap();
        assert_eq!(value.len(), EMPTY_INDEX_ROOT_SIZE);
    }

    #[test]
    fn test_fault_injection_is_one_shot() {
        let (_vol, mut mem) = mem_volume(MemVolumeOptions::default()).unwrap();
        mem.inject_failure(FailPoint::AllocateRecord);
        assert!(matches!(
            mem.allocate_record(),
            Err(I30Error::IoError(_))
        ));
        mem.allocate_record().expect("fault does not persist");
    }

    #[test]
    fn test_read_attribute_at_clamps_to_value() {
        let (_vol, mut mem) = mem_volume(MemVolumeOptions::default()).unwrap();
        let record = mem.allocate_record().unwrap();
        let value: Vec<u8> = (0..100u8).collect();
        mem.add_attribute(record.number, AttributeType::Data, "", &value)
            .unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(
            mem.read_attribute_at(record.number, AttributeType::Data, "", 0, &mut buf)
                .unwrap(),
            64
        );
        assert_eq!(buf[63], 63);
        assert_eq!(
            mem.read_attribute_at(record.number, AttributeType::Data, "", 64, &mut buf)
                .unwrap(),
            36
        );
        assert_eq!(buf[0], 64);
        assert_eq!(
            mem.read_attribute_at(record.number, AttributeType::Data, "", 100, &mut buf)
                .unwrap(),
            0
        );
    }

    #[test]
    fn test_update_times_touches_standard_information() {
        let (_vol, mut mem) = mem_volume(MemVolumeOptions::default()).unwrap();
        assert_eq!(mem.time_updates(FILE_ROOT), 0);
        mem.update_times(FILE_ROOT, TimeUpdate::ChangeTime).unwrap();
        mem.update_times(FILE_ROOT, TimeUpdate::ModificationAndChangeTime)
            .unwrap();
        assert_eq!(mem.time_updates(FILE_ROOT), 2);
        assert!(matches!(
            mem.update_times(9999, TimeUpdate::ChangeTime),
            Err(I30Error::NotFound)
        ));
    }
}
