// Index page reading and validation
// Owns one page buffer at a time (INDEX_ROOT value or one allocation
// block) and walks its entry list with bounds checks at every step

use crate::structures::{
    FileName, INDEX_BLOCK_HEADER_SIZE, INDEX_ENTRY_END, INDEX_ENTRY_HEADER_SIZE,
    INDEX_ENTRY_NODE, INDEX_HEADER_SIZE, INDEX_NODE, INDEX_ROOT_HEADER_SIZE, INDEX_STREAM_NAME,
    NTFS_BLOCK_SIZE,
};
use crate::volume::Volume;
use byteorder::{ByteOrder, LittleEndian};
use i30_core::{AttributeType, I30Error, MftRef, Vcn};
use std::iter::FusedIterator;

/// One entry borrowed from a page buffer. `offset` is the entry's byte
/// offset within the page's underlying buffer, which is what enumeration
/// positions are made of.
#[derive(Clone, Copy)]
pub struct IndexEntry<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> IndexEntry<'a> {
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn file_reference(&self) -> MftRef {
        MftRef::from_u64(LittleEndian::read_u64(&self.data[0..]))
    }

    pub fn length(&self) -> usize {
        LittleEndian::read_u16(&self.data[8..]) as usize
    }

    pub fn key_length(&self) -> usize {
        LittleEndian::read_u16(&self.data[10..]) as usize
    }

    pub fn flags(&self) -> u16 {
        LittleEndian::read_u16(&self.data[12..])
    }

    pub fn is_last(&self) -> bool {
        self.flags() & INDEX_ENTRY_END != 0
    }

    pub fn has_subnode(&self) -> bool {
        self.flags() & INDEX_ENTRY_NODE != 0
    }

    /// The raw FILE_NAME key, absent on terminal entries.
    pub fn key(&self) -> Option<&'a [u8]> {
        if self.is_last() || self.key_length() == 0 {
            return None;
        }
        Some(&self.data[INDEX_ENTRY_HEADER_SIZE..INDEX_ENTRY_HEADER_SIZE + self.key_length()])
    }

    pub fn file_name(&self) -> Result<FileName, I30Error> {
        match self.key() {
            Some(key) => FileName::parse(key),
            None => Err(I30Error::Corrupt(format!(
                "index entry at offset {} has no key",
                self.offset
            ))),
        }
    }

    /// Child block VCN, stored in the last 8 bytes of node entries.
    pub fn subnode_vcn(&self) -> Option<Vcn> {
        if !self.has_subnode() {
            return None;
        }
        let len = self.data.len();
        Some(LittleEndian::read_i64(&self.data[len - 8..]))
    }
}

/// Walks a page's entry list, yielding each entry including the terminal
/// one, then fusing. Structural damage surfaces as `Corrupt` instead of
/// running off the buffer.
pub struct EntryWalker<'a> {
    data: &'a [u8],
    pos: usize,
    end: usize,
    done: bool,
}

impl<'a> EntryWalker<'a> {
    fn new(data: &'a [u8], start: usize, end: usize) -> Self {
        EntryWalker {
            data,
            pos: start,
            end,
            done: false,
        }
    }
}

impl<'a> Iterator for EntryWalker<'a> {
    type Item = Result<IndexEntry<'a>, I30Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.pos + INDEX_ENTRY_HEADER_SIZE > self.end {
            self.done = true;
            return Some(Err(I30Error::Corrupt(format!(
                "no terminal entry before page end (offset {})",
                self.pos
            ))));
        }
        let head = &self.data[self.pos..];
        let length = LittleEndian::read_u16(&head[8..]) as usize;
        let key_length = LittleEndian::read_u16(&head[10..]) as usize;
        let flags = LittleEndian::read_u16(&head[12..]);
        if length < INDEX_ENTRY_HEADER_SIZE {
            self.done = true;
            return Some(Err(I30Error::Corrupt(format!(
                "index entry at offset {} too short for an entry header ({} bytes)",
                self.pos, length
            ))));
        }
        if self.pos + length > self.end {
            self.done = true;
            return Some(Err(I30Error::Corrupt(format!(
                "index entry at offset {} extends past page end",
                self.pos
            ))));
        }
        if flags & INDEX_ENTRY_END == 0 && INDEX_ENTRY_HEADER_SIZE + key_length > length {
            self.done = true;
            return Some(Err(I30Error::Corrupt(format!(
                "index entry key at offset {} extends past the entry",
                self.pos
            ))));
        }
        if flags & INDEX_ENTRY_NODE != 0 && length < INDEX_ENTRY_HEADER_SIZE + 8 {
            self.done = true;
            return Some(Err(I30Error::Corrupt(format!(
                "index entry at offset {} too short for a child pointer",
                self.pos
            ))));
        }
        let entry = IndexEntry {
            data: &self.data[self.pos..self.pos + length],
            offset: self.pos,
        };
        if flags & INDEX_ENTRY_END != 0 {
            self.done = true;
        } else {
            self.pos += length;
        }
        Some(Ok(entry))
    }
}

impl<'a> FusedIterator for EntryWalker<'a> {}

/// The parsed INDEX_ROOT value of a directory.
pub struct IndexRoot {
    data: Vec<u8>,
    index_block_size: u32,
    clusters_per_block: u8,
    entries_start: usize,
    entries_end: usize,
    flags: u8,
}

impl IndexRoot {
    pub fn parse(data: Vec<u8>) -> Result<IndexRoot, I30Error> {
        if data.len() < INDEX_ROOT_HEADER_SIZE + INDEX_HEADER_SIZE {
            return Err(I30Error::Corrupt(format!(
                "INDEX_ROOT value too small: {} bytes",
                data.len()
            )));
        }
        let index_block_size = LittleEndian::read_u32(&data[8..]);
        if index_block_size < NTFS_BLOCK_SIZE || !index_block_size.is_power_of_two() {
            return Err(I30Error::Corrupt(format!(
                "invalid index block size {}",
                index_block_size
            )));
        }
        let clusters_per_block = data[12];
        let entries_offset = LittleEndian::read_u32(&data[16..]) as usize;
        let index_length = LittleEndian::read_u32(&data[20..]) as usize;
        let entries_start = INDEX_ROOT_HEADER_SIZE + entries_offset;
        let entries_end = INDEX_ROOT_HEADER_SIZE + index_length;
        if entries_start < INDEX_ROOT_HEADER_SIZE + INDEX_HEADER_SIZE
            || entries_start > entries_end
            || entries_end > data.len()
        {
            return Err(I30Error::Corrupt(format!(
                "INDEX_ROOT entry bounds {}..{} outside value of {} bytes",
                entries_start,
                entries_end,
                data.len()
            )));
        }
        let flags = data[28];
        Ok(IndexRoot {
            data,
            index_block_size,
            clusters_per_block,
            entries_start,
            entries_end,
            flags,
        })
    }

    pub fn index_block_size(&self) -> u32 {
        self.index_block_size
    }

    pub fn clusters_per_block(&self) -> u8 {
        self.clusters_per_block
    }
}

/// One INDEX_ALLOCATION block, update-sequence already undone by the
/// backend, validated against its read position and the directory's
/// declared block size.
pub struct IndexBlock {
    data: Vec<u8>,
    vcn: Vcn,
    entries_start: usize,
    entries_end: usize,
    flags: u8,
}

impl IndexBlock {
    pub fn parse(data: Vec<u8>, expected_vcn: Vcn, block_size: u32) -> Result<IndexBlock, I30Error> {
        if data.len() < INDEX_BLOCK_HEADER_SIZE + INDEX_HEADER_SIZE {
            return Err(I30Error::Corrupt(format!(
                "index block too small: {} bytes",
                data.len()
            )));
        }
        if &data[0..4] != b"INDX" {
            return Err(I30Error::Corrupt("index block magic missing".to_string()));
        }
        let vcn = LittleEndian::read_i64(&data[16..]);
        if vcn != expected_vcn {
            return Err(I30Error::Corrupt(format!(
                "index block VCN {:#x} differs from expected VCN {:#x}",
                vcn, expected_vcn
            )));
        }
        let entries_offset = LittleEndian::read_u32(&data[24..]) as usize;
        let index_length = LittleEndian::read_u32(&data[28..]) as usize;
        let allocated_size = LittleEndian::read_u32(&data[32..]) as usize;
        if allocated_size + INDEX_BLOCK_HEADER_SIZE != block_size as usize {
            return Err(I30Error::Corrupt(format!(
                "index block VCN {:#x} allocated size {} differs from declared block size {}",
                vcn, allocated_size, block_size
            )));
        }
        let entries_start = INDEX_BLOCK_HEADER_SIZE + entries_offset;
        let entries_end = INDEX_BLOCK_HEADER_SIZE + index_length;
        if entries_start > entries_end || entries_end > data.len() {
            return Err(I30Error::Corrupt(format!(
                "index block VCN {:#x} entry bounds {}..{} outside block of {} bytes",
                vcn,
                entries_start,
                entries_end,
                data.len()
            )));
        }
        let flags = data[36];
        Ok(IndexBlock {
            data,
            vcn,
            entries_start,
            entries_end,
            flags,
        })
    }

    pub fn vcn(&self) -> Vcn {
        self.vcn
    }
}

/// An index page of either kind with one shared entry accessor.
pub enum IndexNode {
    Root(IndexRoot),
    Block(IndexBlock),
}

impl IndexNode {
    pub fn entries(&self) -> EntryWalker<'_> {
        match self {
            IndexNode::Root(root) => {
                EntryWalker::new(&root.data, root.entries_start, root.entries_end)
            }
            IndexNode::Block(block) => {
                EntryWalker::new(&block.data, block.entries_start, block.entries_end)
            }
        }
    }

    /// Whether this page's header declares children below it.
    pub fn has_children(&self) -> bool {
        let flags = match self {
            IndexNode::Root(root) => root.flags,
            IndexNode::Block(block) => block.flags,
        };
        flags & INDEX_NODE != 0
    }
}

/// Fetches and parses a directory's INDEX_ROOT. Directories always have
/// one, so a missing attribute is corruption, not absence.
pub fn read_index_root(vol: &mut Volume, dir: u64) -> Result<IndexRoot, I30Error> {
    let value = match vol
        .services()
        .read_attribute(dir, AttributeType::IndexRoot, INDEX_STREAM_NAME)
    {
        Ok(value) => value,
        Err(I30Error::NotFound) => {
            return Err(I30Error::Corrupt(format!(
                "directory {} has no INDEX_ROOT attribute",
                dir
            )))
        }
        Err(err) => return Err(err),
    };
    IndexRoot::parse(value)
}

/// Reads and validates the allocation block at `byte_offset` of the
/// directory's index stream.
pub fn read_index_block(
    vol: &mut Volume,
    dir: u64,
    byte_offset: u64,
    block_size: u32,
) -> Result<IndexBlock, I30Error> {
    let vcn_size = vol.index_vcn_size(block_size) as u64;
    let mut buf = vec![0u8; block_size as usize];
    vol.services().read_index_block(dir, byte_offset, &mut buf)?;
    IndexBlock::parse(buf, (byte_offset / vcn_size) as Vcn, block_size)
}
